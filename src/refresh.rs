//! Refresh-or-fail decisions for a single credential.
//!
//! The coordinator is the only code path that calls the provider's refresh
//! endpoint. The flow for one credential:
//!
//! ```text
//! get ──► absent ───────────────────────────► NotFound
//!  │
//!  ├──► not due (and not forced) ───────────► Unchanged
//!  │
//!  ├──► no refresh token ───────────────────► Unrecoverable (no remote call)
//!  │
//!  └──► record_attempt ─► provider.refresh (retry + timeout)
//!                           │
//!                           ├── ok ──► store_refreshed(observed revision) ─► Refreshed
//!                           │            └─ row gone or re-stored ─► NotFound / Unchanged
//!                           └── err ─► record_failure(observed revision) ─► Err
//! ```
//!
//! No lock is held while the provider is called. The store's mutex is taken
//! and released inside each synchronous store call.

use crate::credentials::{Credential, CredentialStore};
use crate::error::{ProviderError, RefreshError};
use crate::events::{CredentialEvent, EventSink};
use crate::provider::TokenProvider;
use crate::retry::RetryPolicy;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};


/// Successful result of a refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing stored for this pair
    NotFound,
    /// Not due for refresh, or re-stored by another writer while the
    /// provider call was in flight; returned as stored
    Unchanged(Credential),
    Refreshed(Credential),
}

impl RefreshOutcome {
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            RefreshOutcome::NotFound => None,
            RefreshOutcome::Unchanged(c) | RefreshOutcome::Refreshed(c) => Some(c),
        }
    }

    pub fn was_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_))
    }
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    providers: HashMap<String, Arc<dyn TokenProvider>>,
    policy: RetryPolicy,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl RefreshCoordinator {
    /// # Arguments
    /// * `policy` - Retry schedule applied to recoverable provider errors
    /// * `timeout` - Hard bound on one refresh, retries included
    pub fn new(
        store: Arc<CredentialStore>,
        policy: RetryPolicy,
        timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            providers: HashMap::new(),
            policy,
            timeout,
            events,
        }
    }

    /// Registers a provider under its own name.
    pub fn with_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Hard bound on one refresh, retries included.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn TokenProvider>> {
        self.providers.get(name).cloned()
    }

    /// Refreshes the credential if it expires within `buffer`.
    ///
    /// # Returns
    /// * `Ok(NotFound)` - Nothing to refresh
    /// * `Ok(Unchanged)` - Non-expiring, or expiry is further out than `buffer`
    /// * `Ok(Refreshed)` - New token stored
    /// * `Err(RefreshError)` - Typed failure; see [`RefreshError::kind`]
    pub async fn refresh_if_needed(
        &self,
        user_id: &str,
        provider: &str,
        buffer: ChronoDuration,
    ) -> Result<RefreshOutcome, RefreshError> {
        let Some(current) = self.store.get(user_id, provider)? else {
            return Ok(RefreshOutcome::NotFound);
        };

        if !current.needs_refresh(Utc::now(), buffer) {
            debug!(
                user_id = %user_id,
                provider = %provider,
                expires_at = ?current.expires_at,
                "Credential not due for refresh"
            );
            return Ok(RefreshOutcome::Unchanged(current));
        }

        self.refresh_credential(current).await
    }

    /// Refreshes regardless of expiry.
    pub async fn force_refresh(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        let Some(current) = self.store.get(user_id, provider)? else {
            return Ok(RefreshOutcome::NotFound);
        };

        self.refresh_credential(current).await
    }

    async fn refresh_credential(&self, current: Credential) -> Result<RefreshOutcome, RefreshError> {
        let user_id = current.user_id.clone();
        let provider_name = current.provider.clone();

        let Some(refresh_token) = current.refresh_token.clone() else {
            let err = RefreshError::no_refresh_token();
            warn!(
                user_id = %user_id,
                provider = %provider_name,
                "Credential needs refresh but has no refresh token"
            );
            self.emit_failure(&user_id, &provider_name, &err);
            return Err(err);
        };

        let provider = self
            .provider(&provider_name)
            .ok_or_else(|| RefreshError::UnknownProvider(provider_name.clone()))?;

        self.store.record_attempt(&user_id, &provider_name)?;

        info!(
            user_id = %user_id,
            provider = %provider_name,
            failure_count = current.refresh_failure_count,
            "Refreshing OAuth token"
        );

        let attempt = self.policy.retry(
            || provider.refresh(&refresh_token),
            ProviderError::is_retryable,
        );
        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(bundle)) => Ok(bundle),
            Ok(Err(e)) => Err(RefreshError::from(e)),
            Err(_) => Err(RefreshError::Timeout(self.timeout)),
        };

        match result {
            Ok(bundle) => {
                let bundle = bundle.or_keep_refresh_token(current.refresh_token);
                let Some(refreshed) = self.store.store_refreshed(
                    &user_id,
                    &provider_name,
                    &bundle,
                    current.revision,
                )?
                else {
                    return self.superseded(&user_id, &provider_name);
                };

                info!(
                    user_id = %user_id,
                    provider = %provider_name,
                    expires_at = ?refreshed.expires_at,
                    "OAuth token refreshed successfully"
                );
                self.events.emit(CredentialEvent::Refreshed {
                    user_id,
                    provider: provider_name,
                });
                Ok(RefreshOutcome::Refreshed(refreshed))
            }
            Err(err) => {
                match self
                    .store
                    .record_failure(&user_id, &provider_name, current.revision)
                {
                    Ok(Some(count)) => warn!(
                        user_id = %user_id,
                        provider = %provider_name,
                        failure_count = count,
                        kind = ?err.kind(),
                        error = %err,
                        "Token refresh failed"
                    ),
                    Ok(None) => debug!(
                        user_id = %user_id,
                        provider = %provider_name,
                        "Refresh failure superseded by a newer store"
                    ),
                    Err(e) => warn!(
                        user_id = %user_id,
                        provider = %provider_name,
                        error = %e,
                        "Failed to record refresh failure"
                    ),
                }
                self.emit_failure(&user_id, &provider_name, &err);
                Err(err)
            }
        }
    }

    /// The row changed under the provider call; whatever is stored now wins.
    fn superseded(&self, user_id: &str, provider: &str) -> Result<RefreshOutcome, RefreshError> {
        info!(
            user_id = %user_id,
            provider = %provider,
            "Credential changed during refresh, discarding refreshed token"
        );
        self.events.emit(CredentialEvent::RefreshSuperseded {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        });
        Ok(match self.store.get(user_id, provider)? {
            Some(credential) => RefreshOutcome::Unchanged(credential),
            None => RefreshOutcome::NotFound,
        })
    }

    fn emit_failure(&self, user_id: &str, provider: &str, err: &RefreshError) {
        self.events.emit(CredentialEvent::RefreshFailed {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            kind: err.kind(),
            reason: err.to_string(),
        });
    }
}
