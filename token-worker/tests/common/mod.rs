// Shared fixtures for the worker integration tests

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenkeeper::events::{EventSink, MemorySink};
use tokenkeeper::{
    CredentialService, CredentialStore, ProviderError, RefreshCoordinator, RetryPolicy,
    TokenBundle, TokenProvider, UserDirectory,
};

pub fn key(byte: u8) -> String {
    BASE64.encode([byte; 32])
}

pub fn bundle(access: &str, refresh: Option<&str>, expires_in: ChronoDuration) -> TokenBundle {
    TokenBundle {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        scope: "gmail.readonly".to_string(),
        expires_at: Some(Utc::now() + expires_in),
    }
}

pub fn invalid_grant() -> ProviderError {
    ProviderError::Rejected {
        code: "invalid_grant".to_string(),
    }
}

/// Provider that tracks concurrent refresh calls.
///
/// Each refresh sleeps for `delay`, then answers `invalid_grant` for tokens
/// listed in `rejected` and a fresh one-hour token otherwise.
pub struct CountingProvider {
    delay: Duration,
    rejected: HashSet<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingProvider {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::rejecting(delay, &[])
    }

    pub fn rejecting(delay: Duration, refresh_tokens: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delay,
            rejected: refresh_tokens.iter().map(|t| t.to_string()).collect(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenBundle, ProviderError> {
        Err(ProviderError::Transport("not supported".to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.rejected.contains(refresh_token) {
            return Err(invalid_grant());
        }
        Ok(bundle("refreshed-access", None, ChronoDuration::hours(1)))
    }

    async fn revoke(&self, _token: &str) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

/// In-memory user directory with scriptable existence answers.
///
/// `user_exists` pops the next scripted answer; once the script is empty,
/// users in `missing` are reported gone and everyone else exists.
#[derive(Default)]
pub struct TestUsers {
    answers: Mutex<VecDeque<Result<bool>>>,
    missing: Mutex<HashSet<String>>,
    connected: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl TestUsers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn script(&self, answers: Vec<Result<bool>>) {
        self.answers.lock().unwrap().extend(answers);
    }

    pub fn remove_user(&self, user_id: &str) {
        self.missing.lock().unwrap().insert(user_id.to_string());
    }

    pub fn failing_lookup() -> Result<bool> {
        Err(anyhow!("user database unavailable"))
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connected.lock().unwrap().contains(user_id)
    }
}

#[async_trait]
impl UserDirectory for TestUsers {
    async fn set_connected(&self, user_id: &str, connected: bool) -> Result<()> {
        let mut set = self.connected.lock().unwrap();
        if connected {
            set.insert(user_id.to_string());
        } else {
            set.remove(user_id);
        }
        Ok(())
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(answer) = self.answers.lock().unwrap().pop_front() {
            return answer;
        }
        Ok(!self.missing.lock().unwrap().contains(user_id))
    }

    async fn connected_users(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self.connected.lock().unwrap().iter().cloned().collect();
        users.sort();
        Ok(users)
    }
}

pub struct Harness {
    pub service: Arc<CredentialService>,
    pub store: Arc<CredentialStore>,
    pub users: Arc<TestUsers>,
    pub events: Arc<MemorySink>,
}

pub fn harness(provider: Arc<dyn TokenProvider>, users: Arc<TestUsers>) -> Harness {
    let events = Arc::new(MemorySink::new());
    let sink: Arc<dyn EventSink> = events.clone();
    let store = Arc::new(CredentialStore::open(":memory:", &key(7), sink.clone()).unwrap());
    build(store, provider, users, events)
}

pub fn harness_at(
    path: &Path,
    provider: Arc<dyn TokenProvider>,
    users: Arc<TestUsers>,
) -> Harness {
    let events = Arc::new(MemorySink::new());
    let sink: Arc<dyn EventSink> = events.clone();
    let store = Arc::new(CredentialStore::open(path, &key(7), sink.clone()).unwrap());
    build(store, provider, users, events)
}

fn build(
    store: Arc<CredentialStore>,
    provider: Arc<dyn TokenProvider>,
    users: Arc<TestUsers>,
    events: Arc<MemorySink>,
) -> Harness {
    let sink: Arc<dyn EventSink> = events.clone();
    let coordinator = Arc::new(
        RefreshCoordinator::new(
            store.clone(),
            RetryPolicy::none(),
            Duration::from_secs(10),
            sink.clone(),
        )
        .with_provider(provider),
    );
    let service = Arc::new(CredentialService::new(
        coordinator,
        users.clone(),
        sink,
        ChronoDuration::minutes(15),
    ));
    Harness {
        service,
        store,
        users,
        events,
    }
}
