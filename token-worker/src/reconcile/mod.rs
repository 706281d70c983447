//! Periodic reconciliation of stored credentials.
//!
//! ```text
//!   list_records ──► assess ──► classify ──┬─ terminal ──► re-read ──► re-classify
//!                                          │                              │
//!                                          │              still terminal? ├─ no ──► near miss
//!                                          │                              │
//!                                          │              delete_if_unchanged(revision)
//!                                          │
//!                                          └─ expired_refreshable ──► force_refresh (optional)
//!
//!   connected_users ──► no credential left? ──► set_connected(false)
//! ```
//!
//! Deletion is double-checked: the credential is re-read and re-classified
//! immediately before it is removed, and the delete itself is guarded by the
//! revision seen on the re-read. A refresh that lands in between wins.

pub mod classify;
pub mod report;

pub use classify::{classify, ClassifyPolicy, CredentialHealth};
pub use report::{HealthCounts, HealthReport};

use crate::job::{JobError, JobHealth, JobStatus, JobTracker};
use chrono::Utc;
use std::sync::Arc;
use tokenkeeper::config::ReconciliationConfig;
use tokenkeeper::events::CredentialEvent;
use tokenkeeper::{CredentialRecord, CredentialService, StoreError};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct ReconciliationJob {
    service: Arc<CredentialService>,
    config: ReconciliationConfig,
    policy: ClassifyPolicy,
    tracker: JobTracker,
}

impl ReconciliationJob {
    pub const NAME: &'static str = "reconcile";

    pub fn new(
        service: Arc<CredentialService>,
        config: ReconciliationConfig,
        failure_threshold: u32,
    ) -> Self {
        let policy = ClassifyPolicy::from_config(&config, failure_threshold);
        let tracker = JobTracker::new(Self::NAME, config.interval());
        Self {
            service,
            config,
            policy,
            tracker,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.tracker.status()
    }

    pub fn health(&self) -> JobHealth {
        self.tracker.health(Utc::now())
    }

    /// Runs one reconciliation pass under the overall deadline.
    ///
    /// A pass that exceeds `max_run_minutes` is dropped at its next await
    /// point. Every mutation it already made was a complete, guarded store
    /// operation, so nothing is left half-applied.
    pub async fn run_cycle(&self) -> Result<HealthReport, JobError> {
        let _guard = self.tracker.try_start()?;
        let deadline = self.config.max_run();

        let result = match time::timeout(deadline, self.reconcile()).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                job: Self::NAME,
                after: deadline,
            }),
        };

        match &result {
            Ok(report) => {
                info!(
                    run_id = %report.run_id,
                    checked = report.total_checked,
                    removed = report.removed,
                    near_misses = report.near_misses,
                    users_repaired = report.users_repaired,
                    remediated = report.remediated,
                    duration_ms = report.duration_ms,
                    "Reconciliation completed"
                );
                if let Ok(value) = serde_json::to_value(report) {
                    self.service.events().emit(CredentialEvent::JobCompleted {
                        job: Self::NAME.to_string(),
                        summary: value,
                    });
                }
            }
            Err(e) => error!(error = %e, "Reconciliation failed"),
        }
        self.tracker.finish(result.as_ref());
        result
    }

    async fn reconcile(&self) -> Result<HealthReport, JobError> {
        let mut report = HealthReport::new();
        let store = self.service.store();

        for record in store.list_records()? {
            report.total_checked += 1;
            let health = self.assess(&record).await;
            report.classifications.increment(health);
            debug!(
                user_id = %record.user_id,
                provider = %record.provider,
                health = ?health,
                "Credential classified"
            );

            if health.is_terminal() {
                self.remove_terminal(&record, &mut report).await;
            } else if health == CredentialHealth::ExpiredRefreshable && self.config.remediate_expired {
                self.remediate(&record, &mut report).await;
            }
        }

        self.repair_connection_flags(&mut report).await;

        match store.statistics() {
            Ok(stats) => report.statistics = Some(stats),
            Err(e) => report.push_error(format!("statistics: {e}")),
        }
        report.dependencies = Some(self.service.health_check());

        report.finish();
        Ok(report)
    }

    async fn assess(&self, record: &CredentialRecord) -> CredentialHealth {
        let integrity = self.service.store().verify_secrets(record);
        let user_exists = self.user_exists(&record.user_id).await;
        classify(record, integrity, user_exists, &self.policy, Utc::now())
    }

    /// A lookup failure is not evidence that the user is gone.
    async fn user_exists(&self, user_id: &str) -> bool {
        match self.service.users().user_exists(user_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "User lookup failed, assuming user exists");
                true
            }
        }
    }

    async fn remove_terminal(&self, record: &CredentialRecord, report: &mut HealthReport) {
        match self.try_remove(record).await {
            Ok(true) => report.removed += 1,
            Ok(false) => report.near_misses += 1,
            Err(e) => report.push_error(format!(
                "{}/{}: delete failed: {e}",
                record.user_id, record.provider
            )),
        }
    }

    /// # Returns
    /// * `Ok(true)` - Removed after re-verification
    /// * `Ok(false)` - Near miss; the fresh read no longer warrants deletion
    async fn try_remove(&self, record: &CredentialRecord) -> Result<bool, StoreError> {
        let store = self.service.store();
        let (user_id, provider) = (record.user_id.as_str(), record.provider.as_str());

        let Some(fresh) = store.get_record(user_id, provider)? else {
            debug!(user_id = %user_id, provider = %provider, "Credential gone before re-check");
            return Ok(false);
        };

        let recheck = self.assess(&fresh).await;
        if !recheck.is_terminal() {
            info!(
                user_id = %user_id,
                provider = %provider,
                now = ?recheck,
                "Near miss: credential recovered before deletion"
            );
            return Ok(false);
        }

        if !store.delete_if_unchanged(user_id, provider, fresh.revision)? {
            info!(
                user_id = %user_id,
                provider = %provider,
                "Near miss: credential rewritten during re-check"
            );
            return Ok(false);
        }

        warn!(
            user_id = %user_id,
            provider = %provider,
            health = ?recheck,
            failure_count = fresh.refresh_failure_count,
            "Removed unrecoverable credential"
        );

        if store.list_by_user(user_id)?.is_empty() {
            self.service
                .disconnect_user(user_id, &format!("credential removed ({recheck:?})"))
                .await;
        }
        Ok(true)
    }

    async fn remediate(&self, record: &CredentialRecord, report: &mut HealthReport) {
        match self
            .service
            .force_refresh(&record.user_id, &record.provider)
            .await
        {
            Ok(outcome) if outcome.was_refreshed() => report.remediated += 1,
            Ok(_) => {}
            Err(e) => {
                report.remediation_failures += 1;
                report.push_error(format!(
                    "{}/{}: remediation failed: {e}",
                    record.user_id, record.provider
                ));
            }
        }
    }

    /// Clears the connected flag for users that have no credential at all.
    async fn repair_connection_flags(&self, report: &mut HealthReport) {
        let users = match self.service.users().connected_users().await {
            Ok(users) => users,
            Err(e) => {
                report.push_error(format!("connected users: {e}"));
                return;
            }
        };

        for user_id in users {
            match self.service.store().list_by_user(&user_id) {
                Ok(providers) if providers.is_empty() => {
                    match self.service.users().set_connected(&user_id, false).await {
                        Ok(()) => {
                            info!(user_id = %user_id, "Repaired connected flag without credential");
                            report.users_repaired += 1;
                        }
                        Err(e) => report.push_error(format!("{user_id}: flag repair failed: {e}")),
                    }
                }
                Ok(_) => {}
                Err(e) => report.push_error(format!("{user_id}: {e}")),
            }
        }
    }

    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval().as_secs(),
            "Starting reconciliation scheduler"
        );
        let mut interval = time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Reconciliation cycle did not complete");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Reconciliation scheduler stopped");
    }
}
