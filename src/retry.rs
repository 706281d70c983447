//! Explicit retry policy.
//!
//! Callers invoke [`RetryPolicy::retry`] with the operation and a predicate
//! that decides which errors are worth another attempt. The backoff schedule
//! is a plain value that can be inspected ([`RetryPolicy::schedule`]).

use crate::config::RefreshConfig;
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: config.retry_jitter,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff doubling from `base_delay`, capped at `max_delay`.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Delay before each retry, jitter excluded.
    pub fn schedule(&self) -> Vec<Duration> {
        Self {
            jitter: false,
            ..*self
        }
        .backoff()
        .build()
        .collect()
    }

    /// Runs `op`, retrying while `retryable` says so and attempts remain.
    ///
    /// The last error is returned unchanged once attempts run out or the
    /// predicate rejects it.
    pub async fn retry<T, E, F, Fut, P>(&self, op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: Display,
    {
        op.retry(self.backoff())
            .when(retryable)
            .notify(|err: &E, delay: Duration| {
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after recoverable error"
                );
            })
            .await
    }
}
