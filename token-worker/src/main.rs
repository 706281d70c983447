use anyhow::{bail, Context, Result};
use std::sync::Arc;
use token_worker::api::{create_router, ApiState};
use token_worker::{ReconciliationJob, RefreshJob};
use tokenkeeper::config::load_config;
use tokenkeeper::credentials::Cipher;
use tokenkeeper::events::{EventSink, TracingSink};
use tokenkeeper::provider::GoogleProvider;
use tokenkeeper::users::SqliteUserDirectory;
use tokenkeeper::{
    CredentialService, CredentialStore, KeeperConfig, RefreshCoordinator, RetryPolicy,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_worker=info,tokenkeeper=info".into()),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    // Needs no config or key, so it runs before either is loaded
    if mode == "generate-key" {
        println!("{}", Cipher::generate_key());
        return Ok(());
    }

    info!(mode = %mode, "Token worker starting...");

    let mut config = match std::env::var("TOKENKEEPER_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => KeeperConfig::default(),
    };
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    info!(
        database = %config.database.path,
        provider = %config.provider.name,
        refresh_interval_min = config.scheduler.interval_minutes,
        reconcile_interval_h = config.reconciliation.interval_hours,
        "Configuration loaded"
    );

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    // A missing or malformed key stops the worker before it touches any row
    let encryption_key = config
        .encryption
        .load_key()
        .context("Encryption key is required (base64-encoded 32-byte key)")?;
    let store = Arc::new(
        CredentialStore::open(&config.database.path, &encryption_key, events.clone())
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let provider = GoogleProvider::new(config.provider.clone())
        .context("Failed to initialize token provider")?;
    let coordinator = Arc::new(
        RefreshCoordinator::new(
            store,
            RetryPolicy::from_config(&config.refresh),
            config.refresh.timeout(),
            events.clone(),
        )
        .with_provider(Arc::new(provider)),
    );

    let users = Arc::new(
        SqliteUserDirectory::open(&config.database.path)
            .context("Failed to initialize user directory")?,
    );

    let service = Arc::new(CredentialService::new(
        coordinator,
        users,
        events,
        config.refresh.buffer(),
    ));

    let health = service.health_check();
    if !health.healthy {
        bail!(
            "Dependency check failed: {}",
            health.error.unwrap_or_else(|| "encryption self-test failed".to_string())
        );
    }

    let threshold = config.refresh.failure_threshold;
    let refresh_job = Arc::new(RefreshJob::new(
        service.clone(),
        config.scheduler.clone(),
        threshold,
    ));
    let reconcile_job = Arc::new(ReconciliationJob::new(
        service.clone(),
        config.reconciliation.clone(),
        threshold,
    ));

    match mode.as_str() {
        "refresh-once" => {
            let summary = refresh_job.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        "reconcile-once" => {
            let report = reconcile_job.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "serve" => serve(&config, service, refresh_job, reconcile_job).await,
        other => bail!(
            "Unknown mode '{other}' (expected serve, refresh-once, reconcile-once or generate-key)"
        ),
    }
}

async fn serve(
    config: &KeeperConfig,
    service: Arc<CredentialService>,
    refresh_job: Arc<RefreshJob>,
    reconcile_job: Arc<ReconciliationJob>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.scheduler.enabled {
        tasks.push(tokio::spawn(
            refresh_job.clone().run_forever(shutdown_rx.clone()),
        ));
    } else {
        info!("Refresh scheduler disabled");
    }
    if config.reconciliation.enabled {
        tasks.push(tokio::spawn(
            reconcile_job.clone().run_forever(shutdown_rx.clone()),
        ));
    } else {
        info!("Reconciliation disabled");
    }

    let router = create_router(ApiState {
        service,
        refresh_job,
        reconcile_job,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "Worker API listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Worker API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    let _ = server.await;
    info!("Token worker stopped");

    Ok(())
}
