//! Error taxonomy for the credential lifecycle.
//!
//! Each layer has its own error type so callers can branch on data rather
//! than on message text:
//!
//! - [`CryptoError`] - encryption boundary (configuration vs corrupted value)
//! - [`StoreError`] - credential store (decryption failures are distinct from
//!   "not found", which is `Ok(None)`)
//! - [`ProviderError`] - remote token endpoint, classified by retryability
//! - [`RefreshError`] - what the request layer sees, carrying a [`FailureKind`]
//! - [`ConnectError`] - first-time code exchange

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Missing, malformed or unusable key. Fatal at startup.
    #[error("encryption configuration error: {0}")]
    Configuration(String),

    /// A single stored value failed to authenticate or decode.
    #[error("stored secret could not be decrypted")]
    CorruptedSecret,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential for user {user_id} ({provider}) could not be decrypted")]
    DecryptionFailed { user_id: String, provider: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("credential store lock poisoned")]
    LockPoisoned,
}

/// Whether a failure is worth retrying later without user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Recoverable,
    Unrecoverable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The grant was revoked or is otherwise invalid (`invalid_grant` and friends).
    #[error("provider rejected the grant: {code}")]
    Rejected { code: String },

    /// Our client credentials are wrong. Nothing the user can fix, and
    /// retrying immediately will not help either.
    #[error("provider rejected client configuration: {code}")]
    ClientConfiguration { code: String },

    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<u64> },

    #[error("provider unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    #[error("provider request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected provider response (HTTP {status})")]
    UnexpectedStatus { status: u16, code: Option<String> },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Codes that mean the user must re-authenticate.
    pub const UNRECOVERABLE_CODES: &'static [&'static str] = &[
        "invalid_grant",
        "unauthorized_client",
        "access_denied",
        "invalid_scope",
    ];

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Unavailable { .. }
                | ProviderError::Timeout
                | ProviderError::Transport(_)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::Rejected { .. } => FailureKind::Unrecoverable,
            _ => FailureKind::Recoverable,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::MalformedResponse(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("unrecoverable refresh failure: {reason}")]
    Unrecoverable { reason: String },

    #[error("recoverable refresh failure: {reason}")]
    Recoverable { reason: String },

    #[error("refresh did not finish within {0:?}")]
    Timeout(Duration),

    /// Stored secrets could not be decrypted. Left for reconciliation.
    #[error("stored credential is corrupted")]
    Corrupted,

    #[error("no token provider registered for {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Store(StoreError),
}

impl RefreshError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RefreshError::Unrecoverable { .. }
            | RefreshError::Corrupted
            | RefreshError::UnknownProvider(_) => FailureKind::Unrecoverable,
            RefreshError::Recoverable { .. } | RefreshError::Timeout(_) | RefreshError::Store(_) => {
                FailureKind::Recoverable
            }
        }
    }

    /// True when the user's integration should be marked disconnected.
    ///
    /// Only an explicit rejection (or a credential that can never be
    /// refreshed) qualifies. Corruption and misconfiguration are repaired
    /// elsewhere and must not flip user-visible state.
    pub fn disconnects_user(&self) -> bool {
        matches!(self, RefreshError::Unrecoverable { .. })
    }

    pub(crate) fn no_refresh_token() -> Self {
        RefreshError::Unrecoverable {
            reason: "no refresh token".to_string(),
        }
    }
}

/// Failure to establish a new connection from an authorization code.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no token provider registered for {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DecryptionFailed { .. } => RefreshError::Corrupted,
            other => RefreshError::Store(other),
        }
    }
}

impl From<ProviderError> for RefreshError {
    fn from(e: ProviderError) -> Self {
        match e.failure_kind() {
            FailureKind::Unrecoverable => RefreshError::Unrecoverable {
                reason: e.to_string(),
            },
            FailureKind::Recoverable => RefreshError::Recoverable {
                reason: e.to_string(),
            },
        }
    }
}
