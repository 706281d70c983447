//! Shared plumbing for periodic jobs: re-entrancy guard, run status and
//! the job-level error type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokenkeeper::StoreError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0} job is already running")]
    AlreadyRunning(&'static str),

    /// The run exceeded its overall deadline and was abandoned.
    #[error("{job} job exceeded its {after:?} deadline")]
    Timeout { job: &'static str, after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Clears the running flag when the run ends, however it ends.
pub struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: &'static str,
    pub is_running: bool,
    pub interval_seconds: u64,
    pub runs: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHealth {
    pub job: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    runs: u64,
    last_started: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_summary: Option<serde_json::Value>,
}

/// Running flag plus bookkeeping for one job.
///
/// The flag only prevents overlapping runs of the *same* job. Different jobs
/// and on-demand refreshes are not excluded.
#[derive(Debug)]
pub struct JobTracker {
    job: &'static str,
    interval: Duration,
    running: AtomicBool,
    state: Mutex<TrackerState>,
}

impl JobTracker {
    pub fn new(job: &'static str, interval: Duration) -> Self {
        Self {
            job,
            interval,
            running: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn job(&self) -> &'static str {
        self.job
    }

    /// Claims the running flag, or refuses if a run is in progress.
    pub fn try_start(&self) -> Result<RunGuard<'_>, JobError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| JobError::AlreadyRunning(self.job))?;

        self.with_state(|state| {
            state.runs += 1;
            state.last_started = Some(Utc::now());
        });
        Ok(RunGuard {
            running: &self.running,
        })
    }

    pub fn finish<S: Serialize>(&self, outcome: Result<&S, &JobError>) {
        let summary = outcome.ok().and_then(|s| serde_json::to_value(s).ok());
        let error = outcome.err().map(|e| e.to_string());
        self.with_state(|state| {
            state.last_finished = Some(Utc::now());
            state.last_error = error;
            if summary.is_some() {
                state.last_summary = summary;
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> JobStatus {
        let mut status = JobStatus {
            job: self.job,
            is_running: self.is_running(),
            interval_seconds: self.interval.as_secs(),
            runs: 0,
            last_started: None,
            last_finished: None,
            last_error: None,
            last_summary: None,
        };
        self.with_state(|state| {
            status.runs = state.runs;
            status.last_started = state.last_started;
            status.last_finished = state.last_finished;
            status.last_error = state.last_error.clone();
            status.last_summary = state.last_summary.clone();
        });
        status
    }

    /// Unhealthy when the last run finished more than two intervals ago, or
    /// the last run failed.
    pub fn health(&self, now: DateTime<Utc>) -> JobHealth {
        let status = self.status();
        let overdue_after = chrono::Duration::from_std(self.interval * 2)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        let reason = match (status.last_finished, &status.last_error) {
            (_, Some(err)) => Some(format!("last run failed: {err}")),
            (Some(finished), None) if now - finished > overdue_after => {
                Some(format!("last run finished at {finished}, overdue"))
            }
            _ => None,
        };

        JobHealth {
            job: self.job,
            healthy: reason.is_none(),
            reason,
        }
    }

    fn with_state<F: FnOnce(&mut TrackerState)>(&self, f: F) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Summary {
        processed: u32,
    }

    #[test]
    fn test_second_start_is_refused_until_guard_drops() {
        let tracker = JobTracker::new("refresh", Duration::from_secs(600));

        let guard = tracker.try_start().unwrap();
        assert!(tracker.is_running());
        assert!(matches!(
            tracker.try_start(),
            Err(JobError::AlreadyRunning("refresh"))
        ));

        drop(guard);
        assert!(!tracker.is_running());
        assert!(tracker.try_start().is_ok());
        assert_eq!(tracker.status().runs, 2);
    }

    #[test]
    fn test_finish_records_summary_and_error() {
        let tracker = JobTracker::new("refresh", Duration::from_secs(600));
        {
            let _guard = tracker.try_start().unwrap();
            tracker.finish(Ok(&Summary { processed: 7 }));
        }
        let status = tracker.status();
        assert_eq!(status.last_summary.unwrap()["processed"], 7);
        assert!(status.last_error.is_none());

        let err = JobError::Timeout {
            job: "refresh",
            after: Duration::from_secs(1),
        };
        tracker.finish::<Summary>(Err(&err));
        let status = tracker.status();
        assert!(status.last_error.unwrap().contains("deadline"));
        // Previous summary is kept for inspection.
        assert!(status.last_summary.is_some());
    }

    #[test]
    fn test_health_overdue_after_two_intervals() {
        let tracker = JobTracker::new("reconciliation", Duration::from_secs(60));
        assert!(tracker.health(Utc::now()).healthy);

        tracker.finish(Ok(&Summary { processed: 1 }));
        let now = Utc::now();
        assert!(tracker.health(now + chrono::Duration::seconds(90)).healthy);
        assert!(!tracker.health(now + chrono::Duration::seconds(150)).healthy);
    }
}
