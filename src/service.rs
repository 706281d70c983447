//! Public surface of the credential lifecycle.
//!
//! Request handlers and disconnect flows talk to [`CredentialService`]; the
//! background jobs use it for the same operations so that user-status side
//! effects happen in exactly one place.

use crate::credentials::{Credential, CredentialStore};
use crate::error::{ConnectError, RefreshError, StoreError};
use crate::events::{CredentialEvent, EventSink};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::users::UserDirectory;
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Dependency health as reported by [`CredentialService::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub store_ok: bool,
    pub encryption_ok: bool,
    pub credential_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CredentialService {
    coordinator: Arc<RefreshCoordinator>,
    users: Arc<dyn UserDirectory>,
    events: Arc<dyn EventSink>,
    refresh_buffer: ChronoDuration,
}

impl CredentialService {
    pub fn new(
        coordinator: Arc<RefreshCoordinator>,
        users: Arc<dyn UserDirectory>,
        events: Arc<dyn EventSink>,
        refresh_buffer: ChronoDuration,
    ) -> Self {
        Self {
            coordinator,
            users,
            events,
            refresh_buffer,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.users
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Exchanges an authorization code, stores the result and marks the
    /// user connected.
    pub async fn connect(
        &self,
        user_id: &str,
        provider: &str,
        code: &str,
    ) -> Result<Credential, ConnectError> {
        let remote = self
            .coordinator
            .provider(provider)
            .ok_or_else(|| ConnectError::UnknownProvider(provider.to_string()))?;

        let bundle = remote.exchange_code(code).await?;
        let credential = self.store().store(user_id, provider, &bundle)?;

        if let Err(e) = self.users.set_connected(user_id, true).await {
            warn!(user_id = %user_id, error = %e, "Failed to mark user connected");
        }
        info!(user_id = %user_id, provider = %provider, "Provider connected");
        Ok(credential)
    }

    /// Decrypted credential, or `None`.
    pub fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>, StoreError> {
        self.store().get(user_id, provider)
    }

    /// Records that the caller used the access token for an API call.
    pub fn mark_used(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        self.store().touch_last_used(user_id, provider)
    }

    /// Refreshes if the credential expires within `buffer`.
    ///
    /// An unrecoverable failure marks the user disconnected before the error
    /// is returned. The credential itself stays for reconciliation.
    pub async fn refresh_if_needed(
        &self,
        user_id: &str,
        provider: &str,
        buffer: ChronoDuration,
    ) -> Result<RefreshOutcome, RefreshError> {
        let result = self
            .coordinator
            .refresh_if_needed(user_id, provider, buffer)
            .await;
        self.after_refresh(user_id, result).await
    }

    /// Same as [`Self::refresh_if_needed`] with the configured buffer.
    pub async fn valid_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.refresh_if_needed(user_id, provider, self.refresh_buffer)
            .await
    }

    pub async fn force_refresh(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        let result = self.coordinator.force_refresh(user_id, provider).await;
        self.after_refresh(user_id, result).await
    }

    async fn after_refresh(
        &self,
        user_id: &str,
        result: Result<RefreshOutcome, RefreshError>,
    ) -> Result<RefreshOutcome, RefreshError> {
        if let Err(err) = &result {
            if err.disconnects_user() {
                self.disconnect_user(user_id, &err.to_string()).await;
            }
        }
        result
    }

    /// Flips the user's connected flag off. Best effort: failures are logged.
    pub async fn disconnect_user(&self, user_id: &str, reason: &str) -> bool {
        match self.users.set_connected(user_id, false).await {
            Ok(()) => {
                info!(user_id = %user_id, reason = %reason, "User disconnected");
                self.events.emit(CredentialEvent::Disconnected {
                    user_id: user_id.to_string(),
                    reason: reason.to_string(),
                });
                true
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to mark user disconnected");
                false
            }
        }
    }

    /// Hard delete. The user is marked disconnected once no credential remains.
    pub async fn delete(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        let removed = self.store().delete(user_id, provider)?;
        if self.store().list_by_user(user_id)?.is_empty() {
            self.disconnect_user(user_id, "credential deleted").await;
        }
        Ok(removed)
    }

    /// Revokes remotely (best effort), then deletes locally regardless.
    ///
    /// The refresh token is revoked when present since that ends the whole
    /// grant; otherwise the access token. A corrupted credential cannot be
    /// revoked and is simply deleted.
    pub async fn revoke_and_delete(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        match self.store().get(user_id, provider) {
            Ok(Some(credential)) => {
                let token = credential
                    .refresh_token
                    .as_deref()
                    .unwrap_or(&credential.access_token);
                match self.coordinator.provider(provider) {
                    Some(remote) => match remote.revoke(token).await {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            user_id = %user_id,
                            provider = %provider,
                            "Provider did not confirm revocation, deleting anyway"
                        ),
                        Err(e) => warn!(
                            user_id = %user_id,
                            provider = %provider,
                            error = %e,
                            "Token revocation failed, deleting anyway"
                        ),
                    },
                    None => warn!(provider = %provider, "No provider registered, skipping revocation"),
                }
            }
            Ok(None) => {}
            Err(StoreError::DecryptionFailed { .. }) => warn!(
                user_id = %user_id,
                provider = %provider,
                "Credential is corrupted, skipping revocation"
            ),
            Err(e) => return Err(e),
        }

        self.delete(user_id, provider).await
    }

    /// Store reachability and an encryption round trip.
    pub fn health_check(&self) -> ServiceHealth {
        let encryption_ok = self.store().cipher().self_test().is_ok();
        match self.store().count() {
            Ok(count) => ServiceHealth {
                healthy: encryption_ok,
                store_ok: true,
                encryption_ok,
                credential_count: Some(count),
                error: None,
            },
            Err(e) => ServiceHealth {
                healthy: false,
                store_ok: false,
                encryption_ok,
                credential_count: None,
                error: Some(e.to_string()),
            },
        }
    }
}
