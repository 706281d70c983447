//! Health classification for a single stored credential.
//!
//! Pure function of the raw record, its decryptability, the owner's status
//! and the clock, so the double-check before deletion can re-run it on a
//! fresh read without side effects.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokenkeeper::config::ReconciliationConfig;
use tokenkeeper::credentials::SecretIntegrity;
use tokenkeeper::CredentialRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialHealth {
    Healthy,
    ExpiringSoon,
    ExpiredRefreshable,
    ExpiredDead,
    Corrupted,
    Orphaned,
}

impl CredentialHealth {
    /// States the job deletes after re-verification.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CredentialHealth::ExpiredDead | CredentialHealth::Corrupted | CredentialHealth::Orphaned
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifyPolicy {
    pub grace_period: Duration,
    pub expiring_soon: Duration,
    pub stale_failure: Duration,
    pub failure_threshold: u32,
}

impl ClassifyPolicy {
    pub fn from_config(config: &ReconciliationConfig, failure_threshold: u32) -> Self {
        Self {
            grace_period: Duration::minutes(config.grace_period_minutes),
            expiring_soon: Duration::minutes(config.expiring_soon_minutes),
            stale_failure: Duration::minutes(config.stale_failure_minutes),
            failure_threshold,
        }
    }
}

pub fn classify(
    record: &CredentialRecord,
    integrity: SecretIntegrity,
    user_exists: bool,
    policy: &ClassifyPolicy,
    now: DateTime<Utc>,
) -> CredentialHealth {
    // Just written, possibly mid-issuance
    if now - record.updated_at < policy.grace_period {
        return CredentialHealth::Healthy;
    }
    if matches!(record.grace_period_until, Some(until) if until > now) {
        return CredentialHealth::Healthy;
    }

    if integrity.all_corrupted() {
        return CredentialHealth::Corrupted;
    }

    // An unreadable access token is as good as an expired one
    let expired = record.is_expired(now) || !integrity.access_usable();
    if expired {
        if !integrity.refresh_usable() {
            return CredentialHealth::ExpiredDead;
        }
        if record.refresh_failure_count >= policy.failure_threshold {
            let stale = match record.last_refresh_attempt {
                Some(at) => now - at >= policy.stale_failure,
                None => true,
            };
            if stale {
                return CredentialHealth::ExpiredDead;
            }
        }
    }

    if !user_exists {
        return CredentialHealth::Orphaned;
    }

    if expired {
        return CredentialHealth::ExpiredRefreshable;
    }

    match record.expires_at {
        Some(at) if at - now <= policy.expiring_soon => CredentialHealth::ExpiringSoon,
        _ => CredentialHealth::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenkeeper::credentials::SecretState;

    const READABLE: SecretIntegrity = SecretIntegrity {
        access: SecretState::Readable,
        refresh: SecretState::Readable,
    };

    fn policy() -> ClassifyPolicy {
        ClassifyPolicy {
            grace_period: Duration::minutes(5),
            expiring_soon: Duration::minutes(60),
            stale_failure: Duration::minutes(60),
            failure_threshold: 3,
        }
    }

    fn record(now: DateTime<Utc>, expires_in: Option<Duration>) -> CredentialRecord {
        CredentialRecord {
            user_id: "u1".to_string(),
            provider: "google".to_string(),
            access_token_ciphertext: "ct".to_string(),
            refresh_token_ciphertext: Some("ct".to_string()),
            scope: "email".to_string(),
            expires_at: expires_in.map(|d| now + d),
            created_at: now - Duration::days(1),
            updated_at: now - Duration::hours(2),
            last_refresh_attempt: None,
            refresh_failure_count: 0,
            last_used_at: None,
            revision: 1,
            deleted_at: None,
            grace_period_until: None,
        }
    }

    #[test]
    fn test_healthy_and_expiring_soon() {
        let now = Utc::now();
        let p = policy();
        assert_eq!(
            classify(&record(now, Some(Duration::hours(3))), READABLE, true, &p, now),
            CredentialHealth::Healthy
        );
        assert_eq!(
            classify(&record(now, None), READABLE, true, &p, now),
            CredentialHealth::Healthy
        );
        assert_eq!(
            classify(&record(now, Some(Duration::minutes(30))), READABLE, true, &p, now),
            CredentialHealth::ExpiringSoon
        );
    }

    #[test]
    fn test_grace_period_wins_over_everything() {
        let now = Utc::now();
        let mut r = record(now, Some(Duration::hours(-1)));
        r.updated_at = now - Duration::minutes(1);
        r.refresh_token_ciphertext = None;
        let corrupted = SecretIntegrity {
            access: SecretState::Corrupted,
            refresh: SecretState::Absent,
        };
        assert_eq!(classify(&r, corrupted, false, &policy(), now), CredentialHealth::Healthy);
    }

    #[test]
    fn test_soft_delete_grace_is_respected() {
        let now = Utc::now();
        let mut r = record(now, Some(Duration::hours(-1)));
        r.grace_period_until = Some(now + Duration::days(3));
        assert_eq!(classify(&r, READABLE, false, &policy(), now), CredentialHealth::Healthy);
    }

    #[test]
    fn test_corrupted_only_when_every_present_secret_fails() {
        let now = Utc::now();
        let r = record(now, Some(Duration::hours(3)));
        let both = SecretIntegrity {
            access: SecretState::Corrupted,
            refresh: SecretState::Corrupted,
        };
        assert_eq!(classify(&r, both, true, &policy(), now), CredentialHealth::Corrupted);

        // Readable refresh token can still mint a new access token
        let access_only = SecretIntegrity {
            access: SecretState::Corrupted,
            refresh: SecretState::Readable,
        };
        assert_eq!(
            classify(&r, access_only, true, &policy(), now),
            CredentialHealth::ExpiredRefreshable
        );
    }

    #[test]
    fn test_expired_without_refresh_token_is_dead() {
        let now = Utc::now();
        let mut r = record(now, Some(Duration::minutes(-10)));
        r.refresh_token_ciphertext = None;
        let integrity = SecretIntegrity {
            access: SecretState::Readable,
            refresh: SecretState::Absent,
        };
        assert_eq!(classify(&r, integrity, true, &policy(), now), CredentialHealth::ExpiredDead);
    }

    #[test]
    fn test_failures_below_threshold_stay_refreshable() {
        let now = Utc::now();
        let mut r = record(now, Some(Duration::minutes(-10)));
        r.refresh_failure_count = 2;
        assert_eq!(
            classify(&r, READABLE, true, &policy(), now),
            CredentialHealth::ExpiredRefreshable
        );
    }

    #[test]
    fn test_failures_over_threshold_need_stale_attempt() {
        let now = Utc::now();
        let mut r = record(now, Some(Duration::minutes(-10)));
        r.refresh_failure_count = 5;

        r.last_refresh_attempt = Some(now - Duration::minutes(5));
        assert_eq!(
            classify(&r, READABLE, true, &policy(), now),
            CredentialHealth::ExpiredRefreshable
        );

        r.last_refresh_attempt = Some(now - Duration::hours(2));
        assert_eq!(classify(&r, READABLE, true, &policy(), now), CredentialHealth::ExpiredDead);
    }

    #[test]
    fn test_missing_user_is_orphaned() {
        let now = Utc::now();
        let r = record(now, Some(Duration::hours(3)));
        assert_eq!(classify(&r, READABLE, false, &policy(), now), CredentialHealth::Orphaned);
    }

    #[test]
    fn test_terminal_states() {
        assert!(CredentialHealth::ExpiredDead.is_terminal());
        assert!(CredentialHealth::Corrupted.is_terminal());
        assert!(CredentialHealth::Orphaned.is_terminal());
        assert!(!CredentialHealth::ExpiredRefreshable.is_terminal());
        assert!(!CredentialHealth::ExpiringSoon.is_terminal());
        assert!(!CredentialHealth::Healthy.is_terminal());
    }
}
