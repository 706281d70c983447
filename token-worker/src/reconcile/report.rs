use super::classify::CredentialHealth;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokenkeeper::credentials::TokenStatistics;
use tokenkeeper::service::ServiceHealth;
use uuid::Uuid;

const MAX_REPORTED_ERRORS: usize = 50;

/// Per-class counts from one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub expiring_soon: usize,
    pub expired_refreshable: usize,
    pub expired_dead: usize,
    pub corrupted: usize,
    pub orphaned: usize,
}

impl HealthCounts {
    pub fn increment(&mut self, health: CredentialHealth) {
        let slot = match health {
            CredentialHealth::Healthy => &mut self.healthy,
            CredentialHealth::ExpiringSoon => &mut self.expiring_soon,
            CredentialHealth::ExpiredRefreshable => &mut self.expired_refreshable,
            CredentialHealth::ExpiredDead => &mut self.expired_dead,
            CredentialHealth::Corrupted => &mut self.corrupted,
            CredentialHealth::Orphaned => &mut self.orphaned,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub total_checked: usize,
    pub classifications: HealthCounts,
    pub removed: usize,
    /// Terminal on first read, not on the re-read before deletion
    pub near_misses: usize,
    pub remediated: usize,
    pub remediation_failures: usize,
    /// Users flagged connected without any credential, flag cleared
    pub users_repaired: usize,
    pub statistics: Option<TokenStatistics>,
    pub dependencies: Option<ServiceHealth>,
    pub errors: Vec<String>,
}

impl HealthReport {
    pub(crate) fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            total_checked: 0,
            classifications: HealthCounts::default(),
            removed: 0,
            near_misses: 0,
            remediated: 0,
            remediation_failures: 0,
            users_repaired: 0,
            statistics: None,
            dependencies: None,
            errors: Vec::new(),
        }
    }

    pub(crate) fn push_error(&mut self, message: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }

    pub(crate) fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }

    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
            && self
                .dependencies
                .as_ref()
                .map(|d| d.healthy)
                .unwrap_or(false)
    }
}
