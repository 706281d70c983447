pub mod env;

use crate::error::CryptoError;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete tokenkeeper configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeeperConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "tokenkeeper.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Encryption configuration. The key itself never lives in the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncryptionConfig {
    /// Name of the env var holding the base64 master key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_key_env() -> String {
    "TOKENKEEPER_ENCRYPTION_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

impl EncryptionConfig {
    /// Reads the master key from the environment.
    pub fn load_key(&self) -> Result<String, CryptoError> {
        match std::env::var(&self.key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(CryptoError::Configuration(format!(
                "{} is not set",
                self.key_env
            ))),
        }
    }
}

/// OAuth provider endpoints and client credentials
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_revoke_url")]
    pub revoke_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_provider_name() -> String {
    "google".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_revoke_url() -> String {
    "https://oauth2.googleapis.com/revoke".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// On-demand refresh behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Refresh when a token expires within this many minutes
    #[serde(default = "default_buffer_minutes")]
    pub buffer_minutes: i64,
    /// Consecutive failures after which the background job stops trying
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Hard bound on one refresh, retries included
    #[serde(default = "default_refresh_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub retry_jitter: bool,
}

fn default_buffer_minutes() -> i64 {
    15
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    8000
}

fn default_true() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: default_buffer_minutes(),
            failure_threshold: default_failure_threshold(),
            timeout_seconds: default_refresh_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter: default_true(),
        }
    }
}

impl RefreshConfig {
    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Background refresh job
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval")]
    pub interval_minutes: u64,
    #[serde(default = "default_buffer_minutes")]
    pub buffer_minutes: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on in-flight provider calls
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_user_timeout")]
    pub user_timeout_seconds: u64,
    #[serde(default = "default_batch_pause")]
    pub batch_pause_ms: u64,
    /// Overall deadline for one run
    #[serde(default = "default_scheduler_max_run")]
    pub max_run_minutes: u64,
}

fn default_scheduler_interval() -> u64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_max_concurrent() -> usize {
    10
}

fn default_user_timeout() -> u64 {
    30
}

fn default_batch_pause() -> u64 {
    1000
}

fn default_scheduler_max_run() -> u64 {
    8
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_minutes: default_scheduler_interval(),
            buffer_minutes: default_buffer_minutes(),
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            user_timeout_seconds: default_user_timeout(),
            batch_pause_ms: default_batch_pause(),
            max_run_minutes: default_scheduler_max_run(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes)
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_seconds)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_minutes * 60)
    }
}

/// Reconciliation job
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval_hours: u64,
    #[serde(default = "default_reconcile_max_run")]
    pub max_run_minutes: u64,
    /// Credentials written more recently than this are left alone
    #[serde(default = "default_grace_period")]
    pub grace_period_minutes: i64,
    #[serde(default = "default_expiring_soon")]
    pub expiring_soon_minutes: i64,
    /// Failures only count as terminal once the last attempt is this old
    #[serde(default = "default_stale_failure")]
    pub stale_failure_minutes: i64,
    /// Force-refresh expired-but-refreshable credentials during the run
    #[serde(default)]
    pub remediate_expired: bool,
}

fn default_reconcile_interval() -> u64 {
    6
}

fn default_reconcile_max_run() -> u64 {
    30
}

fn default_grace_period() -> i64 {
    5
}

fn default_expiring_soon() -> i64 {
    60
}

fn default_stale_failure() -> i64 {
    60
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_hours: default_reconcile_interval(),
            max_run_minutes: default_reconcile_max_run(),
            grace_period_minutes: default_grace_period(),
            expiring_soon_minutes: default_expiring_soon(),
            stale_failure_minutes: default_stale_failure(),
            remediate_expired: false,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_minutes * 60)
    }
}

/// Worker status API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8095".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl KeeperConfig {
    /// Rejects values the periodic jobs cannot run with. Call after env
    /// overrides are applied.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("scheduler.interval_minutes", self.scheduler.interval_minutes),
            ("scheduler.max_run_minutes", self.scheduler.max_run_minutes),
            ("reconciliation.interval_hours", self.reconciliation.interval_hours),
            ("reconciliation.max_run_minutes", self.reconciliation.max_run_minutes),
        ];
        for (name, value) in checks {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<KeeperConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {path}"))?;
    let config: KeeperConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {path}"))?;
    Ok(config)
}
