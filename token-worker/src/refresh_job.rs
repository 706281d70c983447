//! Background refresh scheduler.
//!
//! Every interval: find credentials expiring within the buffer window, split
//! them into fixed-size batches, and refresh each batch with at most
//! `max_concurrent` provider calls in flight. One user's failure never aborts
//! its siblings; outcomes are folded into a [`RefreshRunSummary`].

use crate::job::{JobError, JobHealth, JobStatus, JobTracker};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokenkeeper::config::SchedulerConfig;
use tokenkeeper::events::CredentialEvent;
use tokenkeeper::{CredentialService, FailureKind, RefreshOutcome};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_REPORTED_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub candidates: usize,
    pub batches: usize,
    pub users_processed: usize,
    pub tokens_refreshed: usize,
    pub refresh_failures: usize,
    pub users_disconnected: usize,
    /// Per-user timeouts and store errors
    pub processing_errors: usize,
    pub errors: Vec<String>,
    pub success_rate: f64,
}

impl RefreshRunSummary {
    fn new(candidates: usize) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            candidates,
            batches: 0,
            users_processed: 0,
            tokens_refreshed: 0,
            refresh_failures: 0,
            users_disconnected: 0,
            processing_errors: 0,
            errors: Vec::new(),
            success_rate: 0.0,
        }
    }

    fn record(&mut self, outcome: UserOutcome) {
        self.users_processed += 1;
        match outcome {
            UserOutcome::Refreshed => self.tokens_refreshed += 1,
            UserOutcome::Skipped => {}
            UserOutcome::Failed {
                user_id,
                reason,
                kind,
                disconnected,
            } => {
                self.refresh_failures += 1;
                if disconnected {
                    self.users_disconnected += 1;
                }
                self.push_error(format!("{user_id}: {reason} ({kind:?})"));
            }
            UserOutcome::TimedOut { user_id } => {
                self.processing_errors += 1;
                self.push_error(format!("{user_id}: per-user timeout"));
            }
        }
    }

    fn push_error(&mut self, message: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        let attempted = self.tokens_refreshed + self.refresh_failures + self.processing_errors;
        self.success_rate = if attempted == 0 {
            1.0
        } else {
            self.tokens_refreshed as f64 / attempted as f64
        };
    }
}

enum UserOutcome {
    Refreshed,
    /// Refreshed concurrently elsewhere, or removed since the query
    Skipped,
    Failed {
        user_id: String,
        reason: String,
        kind: FailureKind,
        disconnected: bool,
    },
    TimedOut {
        user_id: String,
    },
}

pub struct RefreshJob {
    service: Arc<CredentialService>,
    config: SchedulerConfig,
    failure_threshold: u32,
    /// Never shorter than the coordinator's own timeout, so a slow refresh
    /// still reaches `record_failure` before the job gives up on the user
    user_timeout: Duration,
    tracker: JobTracker,
}

impl RefreshJob {
    pub const NAME: &'static str = "refresh";

    /// # Arguments
    /// * `failure_threshold` - Credentials at or above this many consecutive
    ///   failures are left to reconciliation
    pub fn new(service: Arc<CredentialService>, config: SchedulerConfig, failure_threshold: u32) -> Self {
        let tracker = JobTracker::new(Self::NAME, config.interval());
        let refresh_timeout = service.coordinator().timeout();
        let user_timeout = config.user_timeout().max(refresh_timeout);
        if user_timeout > config.user_timeout() {
            warn!(
                user_timeout_secs = config.user_timeout_seconds,
                refresh_timeout_secs = refresh_timeout.as_secs(),
                "Per-user timeout raised to the refresh timeout"
            );
        }
        Self {
            service,
            config,
            failure_threshold,
            user_timeout,
            tracker,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.tracker.status()
    }

    pub fn health(&self) -> JobHealth {
        self.tracker.health(Utc::now())
    }

    /// Runs one refresh cycle.
    ///
    /// # Returns
    /// * `Ok(summary)` - Run completed; per-user failures are inside the summary
    /// * `Err(AlreadyRunning)` - A previous run is still in progress
    /// * `Err(Timeout)` - The run exceeded `max_run_minutes` and was abandoned
    pub async fn run_cycle(&self) -> Result<RefreshRunSummary, JobError> {
        let _guard = self.tracker.try_start()?;
        let deadline = self.config.max_run();

        let result = match time::timeout(deadline, self.run_batches()).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                job: Self::NAME,
                after: deadline,
            }),
        };

        match &result {
            Ok(summary) => {
                info!(
                    run_id = %summary.run_id,
                    candidates = summary.candidates,
                    refreshed = summary.tokens_refreshed,
                    failures = summary.refresh_failures,
                    disconnected = summary.users_disconnected,
                    processing_errors = summary.processing_errors,
                    duration_ms = summary.duration_ms,
                    "Refresh run completed"
                );
                if let Ok(value) = serde_json::to_value(summary) {
                    self.service.events().emit(CredentialEvent::JobCompleted {
                        job: Self::NAME.to_string(),
                        summary: value,
                    });
                }
            }
            Err(e) => error!(error = %e, "Refresh run failed"),
        }
        self.tracker.finish(result.as_ref());
        result
    }

    async fn run_batches(&self) -> Result<RefreshRunSummary, JobError> {
        let candidates = self
            .service
            .store()
            .expiring_within(self.config.buffer(), self.failure_threshold)?;

        let mut summary = RefreshRunSummary::new(candidates.len());
        if candidates.is_empty() {
            debug!("No credentials due for refresh");
            summary.finish();
            return Ok(summary);
        }

        info!(
            run_id = %summary.run_id,
            candidates = candidates.len(),
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "Starting refresh run"
        );

        for (index, batch) in candidates.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                time::sleep(self.config.batch_pause()).await;
            }

            let outcomes: Vec<UserOutcome> = stream::iter(
                batch
                    .iter()
                    .map(|record| self.refresh_one(&record.user_id, &record.provider))
                    .collect::<Vec<_>>(),
            )
                .buffer_unordered(self.config.max_concurrent.max(1))
                .collect()
                .await;

            summary.batches += 1;
            for outcome in outcomes {
                summary.record(outcome);
            }
            debug!(batch = index + 1, size = batch.len(), "Refresh batch finished");
        }

        summary.finish();
        Ok(summary)
    }

    async fn refresh_one(&self, user_id: &str, provider: &str) -> UserOutcome {
        let refresh = self
            .service
            .coordinator()
            .refresh_if_needed(user_id, provider, self.config.buffer());

        match time::timeout(self.user_timeout, refresh).await {
            Ok(Ok(RefreshOutcome::Refreshed(_))) => UserOutcome::Refreshed,
            Ok(Ok(_)) => UserOutcome::Skipped,
            Ok(Err(err)) => {
                let disconnected = if err.disconnects_user() {
                    self.service
                        .disconnect_user(user_id, &err.to_string())
                        .await
                } else {
                    false
                };
                UserOutcome::Failed {
                    user_id: user_id.to_string(),
                    reason: err.to_string(),
                    kind: err.kind(),
                    disconnected,
                }
            }
            Err(_) => {
                warn!(user_id = %user_id, provider = %provider, "Refresh exceeded per-user timeout");
                UserOutcome::TimedOut {
                    user_id: user_id.to_string(),
                }
            }
        }
    }

    /// Runs a cycle every interval until `shutdown` flips to true.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval().as_secs(),
            "Starting refresh scheduler"
        );
        let mut interval = time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Refresh cycle did not complete");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Refresh scheduler stopped");
    }
}
