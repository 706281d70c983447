//! Remote OAuth provider interface.
//!
//! The refresh path only depends on [`TokenProvider`]; [`google::GoogleProvider`]
//! is the HTTP implementation against a standard OAuth 2.0 token endpoint.

pub mod google;

pub use google::GoogleProvider;

use crate::credentials::TokenBundle;
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// A remote authority that issues, refreshes and revokes tokens.
///
/// Implementations must classify failures into [`ProviderError`] variants:
/// explicit grant rejection is [`ProviderError::Rejected`] and must never be
/// reported as a transient error, or the user is left with a credential that
/// can never work and is never told to reconnect.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Provider name as stored in the `provider` column (e.g. "google").
    fn name(&self) -> &str;

    /// Exchanges an authorization code for a first token bundle.
    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError>;

    /// Trades a refresh token for a new access token.
    ///
    /// The returned bundle may have no refresh token; callers keep the old one.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, ProviderError>;

    /// Revokes an access or refresh token.
    ///
    /// # Returns
    /// * `Ok(true)` - Provider confirmed revocation
    /// * `Ok(false)` - Provider answered but did not revoke
    async fn revoke(&self, token: &str) -> Result<bool, ProviderError>;
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Converts relative `expires_in` into an absolute expiry at `issued_at`.
    ///
    /// # Returns
    /// * `Err(ProviderError::MalformedResponse)` - `expires_in` is out of range
    pub fn into_bundle(self, issued_at: DateTime<Utc>) -> Result<TokenBundle, ProviderError> {
        let expires_at = match self.expires_in {
            Some(seconds) => Some(
                Duration::try_seconds(seconds)
                    .and_then(|d| issued_at.checked_add_signed(d))
                    .ok_or_else(|| {
                        ProviderError::MalformedResponse(format!(
                            "expires_in out of range: {seconds}"
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(TokenBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            scope: self.scope.unwrap_or_default(),
            expires_at,
        })
    }
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`)
#[derive(Deserialize, Debug)]
struct ErrorBody {
    error: String,
}

/// Maps a non-success token endpoint response onto a [`ProviderError`].
pub fn classify_error_response(status: u16, body: &str, retry_after: Option<u64>) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited { retry_after };
    }
    if status >= 500 {
        return ProviderError::Unavailable { status };
    }

    let code = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    match code.as_deref() {
        Some(c) if ProviderError::UNRECOVERABLE_CODES.contains(&c) => ProviderError::Rejected {
            code: c.to_string(),
        },
        Some("invalid_client") => ProviderError::ClientConfiguration {
            code: "invalid_client".to_string(),
        },
        _ => ProviderError::UnexpectedStatus { status, code },
    }
}
