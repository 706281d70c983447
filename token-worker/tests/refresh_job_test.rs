// Integration tests for the background refresh job

mod common;

use chrono::Duration as ChronoDuration;
use common::{bundle, harness, CountingProvider, TestUsers};
use std::sync::Arc;
use std::time::Duration;
use token_worker::{JobError, RefreshJob};
use tokenkeeper::config::SchedulerConfig;
use tokenkeeper::events::CredentialEvent;
use tokenkeeper::UserDirectory;

fn scheduler(batch_size: usize, max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        batch_size,
        max_concurrent,
        batch_pause_ms: 1000,
        ..SchedulerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_holds_across_500_credentials() {
    let delay = Duration::from_millis(100);
    let provider = CountingProvider::new(delay);
    let h = harness(provider.clone(), TestUsers::new());

    for i in 0..500 {
        let refresh = format!("rt-{i}");
        h.store
            .store(
                &format!("user-{i}"),
                "google",
                &bundle("old", Some(&refresh), ChronoDuration::minutes(5)),
            )
            .unwrap();
    }

    let job = RefreshJob::new(h.service.clone(), scheduler(50, 10), 3);
    let started = tokio::time::Instant::now();
    let summary = job.run_cycle().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.candidates, 500);
    assert_eq!(summary.batches, 10);
    assert_eq!(summary.tokens_refreshed, 500);
    assert_eq!(summary.refresh_failures, 0);
    assert_eq!(provider.calls(), 500);
    assert!(provider.max_in_flight() <= 10);
    assert_eq!(provider.max_in_flight(), 10);
    // At least ceil(500 / 10) sequential waves
    assert!(elapsed >= delay * 50);
    assert_eq!(summary.success_rate, 1.0);

    let credential = h.store.get("user-42", "google").unwrap().unwrap();
    assert_eq!(credential.access_token, "refreshed-access");
    assert_eq!(credential.refresh_token.as_deref(), Some("rt-42"));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_run_is_refused() {
    let provider = CountingProvider::new(Duration::from_secs(1));
    let h = harness(provider.clone(), TestUsers::new());
    h.store
        .store("u1", "google", &bundle("old", Some("rt"), ChronoDuration::minutes(5)))
        .unwrap();

    let job = RefreshJob::new(h.service.clone(), scheduler(50, 10), 3);
    let (first, second) = tokio::join!(job.run_cycle(), job.run_cycle());

    assert_eq!(first.unwrap().tokens_refreshed, 1);
    assert!(matches!(second, Err(JobError::AlreadyRunning("refresh"))));
    assert_eq!(provider.calls(), 1);

    // The guard is released once the run ends
    assert!(!job.status().is_running);
    assert!(job.run_cycle().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_failure_disconnects_without_aborting_batch() {
    let provider = CountingProvider::rejecting(Duration::from_millis(50), &["rt-bad"]);
    let h = harness(provider.clone(), TestUsers::new());

    for (user, refresh) in [("alice", "rt-a"), ("bob", "rt-bad"), ("carol", "rt-c")] {
        h.store
            .store(user, "google", &bundle("old", Some(refresh), ChronoDuration::minutes(5)))
            .unwrap();
        h.users.set_connected(user, true).await.unwrap();
    }

    let job = RefreshJob::new(h.service.clone(), scheduler(50, 10), 3);
    let summary = job.run_cycle().await.unwrap();

    assert_eq!(summary.users_processed, 3);
    assert_eq!(summary.tokens_refreshed, 2);
    assert_eq!(summary.refresh_failures, 1);
    assert_eq!(summary.users_disconnected, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("bob"));

    assert!(!h.users.is_connected("bob"));
    assert!(h.users.is_connected("alice"));
    assert!(h.users.is_connected("carol"));

    // Kept for reconciliation, failure counted
    let bob = h.store.get("bob", "google").unwrap().unwrap();
    assert_eq!(bob.refresh_failure_count, 1);
    assert_eq!(bob.access_token, "old");
}

#[tokio::test(start_paused = true)]
async fn test_credentials_at_failure_threshold_are_skipped() {
    let provider = CountingProvider::new(Duration::from_millis(10));
    let h = harness(provider.clone(), TestUsers::new());

    let stored = h
        .store
        .store("u1", "google", &bundle("old", Some("rt"), ChronoDuration::minutes(5)))
        .unwrap();
    for _ in 0..3 {
        h.store.record_failure("u1", "google", stored.revision).unwrap();
    }
    h.store
        .store("u2", "google", &bundle("old", Some("rt2"), ChronoDuration::hours(3)))
        .unwrap();

    let job = RefreshJob::new(h.service.clone(), scheduler(50, 10), 3);
    let summary = job.run_cycle().await.unwrap();

    assert_eq!(summary.candidates, 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_user_timeout_still_records_failure() {
    let provider = CountingProvider::new(Duration::from_secs(60));
    let h = harness(provider.clone(), TestUsers::new());
    h.store
        .store("u1", "google", &bundle("old", Some("rt"), ChronoDuration::minutes(5)))
        .unwrap();

    // Shorter than the coordinator's 10s refresh timeout
    let config = SchedulerConfig {
        user_timeout_seconds: 5,
        ..scheduler(50, 10)
    };
    let job = RefreshJob::new(h.service.clone(), config, 3);
    let summary = job.run_cycle().await.unwrap();

    assert_eq!(summary.refresh_failures, 1);
    assert_eq!(summary.processing_errors, 0);
    assert_eq!(summary.tokens_refreshed, 0);
    assert_eq!(summary.success_rate, 0.0);

    let credential = h.store.get("u1", "google").unwrap().unwrap();
    assert_eq!(credential.refresh_failure_count, 1);
    assert!(credential.last_refresh_attempt.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_run_completion_is_recorded() {
    let provider = CountingProvider::new(Duration::from_millis(10));
    let h = harness(provider, TestUsers::new());
    h.store
        .store("u1", "google", &bundle("old", Some("rt"), ChronoDuration::minutes(5)))
        .unwrap();

    let job = Arc::new(RefreshJob::new(h.service.clone(), scheduler(50, 10), 3));
    let summary = job.run_cycle().await.unwrap();

    let status = job.status();
    assert_eq!(status.runs, 1);
    assert!(status.last_error.is_none());
    assert_eq!(
        status.last_summary.unwrap()["run_id"],
        summary.run_id.to_string()
    );
    assert!(job.health().healthy);

    assert!(h.events.events().iter().any(|e| matches!(
        e,
        CredentialEvent::JobCompleted { job, .. } if job == "refresh"
    )));
}
