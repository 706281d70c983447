//! HTTP token provider for Google's OAuth 2.0 endpoints.
//!
//! Works against any standard token endpoint; the URLs come from
//! [`ProviderConfig`], which is how tests point it at a mock server.

use super::{classify_error_response, TokenProvider, TokenResponse};
use crate::config::ProviderConfig;
use crate::credentials::TokenBundle;
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct GoogleProvider {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// POSTs a form to the token endpoint and parses the token response.
    async fn post_token_form(
        &self,
        form: HashMap<&str, &str>,
        operation: &str,
    ) -> Result<TokenBundle, ProviderError> {
        debug!(
            provider = %self.config.name,
            operation = operation,
            "Calling token endpoint"
        );

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            let err = classify_error_response(status.as_u16(), &body, retry_after);
            warn!(
                provider = %self.config.name,
                operation = operation,
                status = status.as_u16(),
                error = %err,
                "Token endpoint returned an error"
            );
            return Err(err);
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        debug!(
            provider = %self.config.name,
            operation = operation,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint call succeeded"
        );

        token_response.into_bundle(Utc::now())
    }
}

#[async_trait]
impl TokenProvider for GoogleProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.config.redirect_uri.as_str());
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());
        self.post_token_form(form, "code_exchange").await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, ProviderError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());
        self.post_token_form(form, "token_refresh").await
    }

    async fn revoke(&self, token: &str) -> Result<bool, ProviderError> {
        let response = self
            .http_client
            .post(&self.config.revoke_url)
            .form(&[("token", token)])
            .send()
            .await?;

        let revoked = response.status().as_u16() == 200;
        if revoked {
            info!(provider = %self.config.name, "Token revoked");
        } else {
            warn!(
                provider = %self.config.name,
                status = response.status().as_u16(),
                "Token revocation was not confirmed"
            );
        }
        Ok(revoked)
    }
}
