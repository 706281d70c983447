//! Encrypted credential storage for OAuth tokens.
//!
//! One credential per (user, provider). Secrets are encrypted with AES-256-GCM
//! before they reach SQLite and are only decrypted in memory for the duration
//! of a single operation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - Upsert / get / delete                 │
//! │  - Refresh bookkeeping (attempt/failure) │
//! │  - Revision-guarded writes               │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Cipher                             │
//! │  - AES-256-GCM, nonce per value          │
//! │  - Self-tested at construction           │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (oauth_credentials)         │
//! │  - Ciphertext only                       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tokenkeeper::credentials::{CredentialStore, TokenBundle};
//! use tokenkeeper::events::TracingSink;
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("TOKENKEEPER_ENCRYPTION_KEY")?;
//! let store = CredentialStore::open("credentials.db", &key, Arc::new(TracingSink))?;
//!
//! let bundle = TokenBundle {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     scope: "https://www.googleapis.com/auth/gmail.readonly".to_string(),
//!     expires_at: Some(Utc::now() + Duration::hours(1)),
//! };
//! store.store("user1", "google", &bundle)?;
//!
//! if let Some(credential) = store.get("user1", "google")? {
//!     println!("expires at {:?}", credential.expires_at);
//! }
//!
//! store.delete("user1", "google")?;
//! # Ok(())
//! # }
//! ```

pub mod encryption;
pub mod storage;

pub use encryption::Cipher;
pub use storage::{CredentialStore, TokenStatistics};

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Token material as issued by a provider, ready to be stored.
///
/// `expires_at` is absolute: it is computed once from the provider's
/// `expires_in` when the response arrives, so storing the same bundle twice
/// produces the same row.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Space-delimited granted scopes
    pub scope: String,
    /// `None` means the token does not expire
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenBundle {
    /// Providers may omit the refresh token on refresh. Keep the one we had.
    pub fn or_keep_refresh_token(mut self, existing: Option<String>) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = existing;
        }
        self
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A decrypted credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful write (issuance or refresh)
    pub updated_at: DateTime<Utc>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    /// Consecutive refresh failures since the last successful store
    pub refresh_failure_count: u32,
    /// Bumped by every successful store
    pub revision: i64,
}

impl Credential {
    /// Non-expiring credentials are never expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// True when the credential expires within `buffer` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        matches!(self.expires_at, Some(at) if at <= now + buffer)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .field("refresh_failure_count", &self.refresh_failure_count)
            .field("revision", &self.revision)
            .finish()
    }
}

/// A stored row as-is: ciphertext plus bookkeeping, nothing decrypted.
///
/// Reconciliation works on records so that a corrupted secret does not hide
/// the rest of the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub user_id: String,
    pub provider: String,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: Option<String>,
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub refresh_failure_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revision: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub grace_period_until: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token_ciphertext.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretState {
    Absent,
    Readable,
    Corrupted,
}

/// Decryptability of both secrets of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretIntegrity {
    pub access: SecretState,
    pub refresh: SecretState,
}

impl SecretIntegrity {
    /// Every secret that is present failed to decrypt.
    pub fn all_corrupted(&self) -> bool {
        let present = [self.access, self.refresh]
            .into_iter()
            .filter(|s| *s != SecretState::Absent);
        let mut any = false;
        for state in present {
            if state != SecretState::Corrupted {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn refresh_usable(&self) -> bool {
        self.refresh == SecretState::Readable
    }

    pub fn access_usable(&self) -> bool {
        self.access == SecretState::Readable
    }
}
