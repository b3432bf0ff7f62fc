//! OAuth access token lifecycle for network transports
//!
//! Tokens are refreshed proactively when they expire within the refresh
//! buffer, and reactively (once) when the server rejects one with 401. The
//! credential state sits behind a single async lock that is held for the
//! whole refresh, so concurrent requests wait for one refresh instead of
//! racing several. New credentials are written back through the
//! [`ConfigurationStore`].

use crate::config::OAuthSettings;
use crate::error::{McpError, Result};
use crate::mcp::codec;
use crate::store::{ConfigurationStore, CredentialUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field(
                "access_token",
                &crate::utils::logging::obscure_credential(&self.access_token),
            )
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl From<&OAuthSettings> for OAuthCredentials {
    fn from(settings: &OAuthSettings) -> Self {
        Self {
            access_token: settings.access_token.clone(),
            refresh_token: settings.refresh_token.clone(),
            expires_at: settings.expires_at,
        }
    }
}

impl OAuthCredentials {
    /// True when the token expires within `buffer` from now
    pub fn expires_within(&self, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
                expires_at - buffer <= Utc::now()
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }
}

/// Exchanges a refresh token for a new credential set
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialUpdate>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// `grant_type=refresh_token` against the configured token endpoint
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client, settings: &OAuthSettings) -> Self {
        Self {
            client,
            token_endpoint: settings.token_endpoint.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialUpdate> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = self.client_id.as_deref() {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = self.client_secret.as_deref() {
            form.push(("client_secret", client_secret));
        }

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&form)
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| super::map_reqwest_error(e, REFRESH_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // invalid_grant and friends come back as 400
            if status.as_u16() == 400 {
                return Err(McpError::authentication(format!(
                    "Token refresh rejected: {}",
                    crate::utils::logging::truncate_for_log(body.trim(), 200)
                )));
            }
            return Err(codec::map_http_status(status.as_u16(), &body, None));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| McpError::authentication(format!("Invalid token response: {}", e)))?;

        Ok(CredentialUpdate {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

pub struct OAuthTokenManager {
    configuration_id: String,
    state: Mutex<OAuthCredentials>,
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn ConfigurationStore>,
    refresh_buffer: Duration,
}

impl fmt::Debug for OAuthTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenManager")
            .field("configuration_id", &self.configuration_id)
            .field("refresh_buffer", &self.refresh_buffer)
            .finish()
    }
}

impl OAuthTokenManager {
    pub fn new(
        configuration_id: impl Into<String>,
        credentials: OAuthCredentials,
        refresher: Arc<dyn TokenRefresher>,
        store: Arc<dyn ConfigurationStore>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            configuration_id: configuration_id.into(),
            state: Mutex::new(credentials),
            refresher,
            store,
            refresh_buffer,
        }
    }

    /// Current access token, refreshed first if it is about to expire
    pub async fn ensure_valid_token(&self) -> Result<String> {
        let mut credentials = self.state.lock().await;
        if credentials.expires_within(self.refresh_buffer) {
            debug!(
                configuration_id = %self.configuration_id,
                expires_at = ?credentials.expires_at,
                "Access token inside refresh window"
            );
            if let Err(error) = self.refresh_locked(&mut credentials).await {
                if credentials.is_expired() {
                    return Err(error);
                }
                warn!(
                    configuration_id = %self.configuration_id,
                    error = %error,
                    "Proactive token refresh failed, using current token"
                );
            }
        }
        Ok(credentials.access_token.clone())
    }

    /// Refresh after the server rejected `rejected_token`
    ///
    /// If another request already replaced that token, the newer one is
    /// returned without refreshing again.
    pub async fn force_refresh(&self, rejected_token: Option<&str>) -> Result<String> {
        let mut credentials = self.state.lock().await;
        if let Some(rejected) = rejected_token {
            if credentials.access_token != rejected {
                return Ok(credentials.access_token.clone());
            }
        }
        self.refresh_locked(&mut credentials).await?;
        Ok(credentials.access_token.clone())
    }

    /// Non-blocking local check; a refresh in progress counts as authenticated
    pub fn is_authenticated(&self) -> bool {
        match self.state.try_lock() {
            Ok(credentials) => !credentials.access_token.is_empty() && !credentials.is_expired(),
            Err(_) => true,
        }
    }

    async fn refresh_locked(&self, credentials: &mut OAuthCredentials) -> Result<()> {
        let refresh_token = credentials.refresh_token.clone().ok_or_else(|| {
            McpError::authentication("Access token expired and no refresh token is available")
        })?;

        let update = self.refresher.refresh(&refresh_token).await?;
        *credentials = OAuthCredentials {
            access_token: update.access_token.clone(),
            refresh_token: update.refresh_token.clone(),
            expires_at: update.expires_at,
        };
        info!(
            configuration_id = %self.configuration_id,
            expires_at = ?update.expires_at,
            "OAuth token refreshed"
        );

        if let Err(e) = self.store.update_credentials(&self.configuration_id, &update).await {
            warn!(
                configuration_id = %self.configuration_id,
                error = %e,
                "Failed to persist refreshed credentials"
            );
        }
        Ok(())
    }
}
