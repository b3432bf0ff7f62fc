use super::oauth::{HttpTokenRefresher, OAuthCredentials, OAuthTokenManager};
use crate::config::{AuthConfig, ConduitConfig, ServerConfiguration};
use crate::error::{McpError, Result};
use crate::store::ConfigurationStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;

/// Credentials attached to network transport requests
#[derive(Clone)]
pub enum RequestAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    OAuth(Arc<OAuthTokenManager>),
}

impl fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
            Self::Basic { username, .. } => write!(f, "Basic({}:***)", username),
            Self::OAuth(manager) => f.debug_tuple("OAuth").field(manager).finish(),
        }
    }
}

impl RequestAuth {
    /// Derive request credentials from a configuration
    ///
    /// With `auth_type = none`, a token found under one of the configured
    /// `credential_key_fallbacks` metadata keys is sent as a bearer token.
    pub fn from_configuration(
        configuration: &ServerConfiguration,
        client: reqwest::Client,
        store: Arc<dyn ConfigurationStore>,
        config: &ConduitConfig,
    ) -> Self {
        match &configuration.auth {
            AuthConfig::None => match configuration.fallback_token() {
                Some(token) => Self::Bearer(token.to_string()),
                None => Self::None,
            },
            AuthConfig::Bearer { token } => Self::Bearer(token.clone()),
            AuthConfig::Basic { username, password } => Self::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            AuthConfig::OAuth(settings) => Self::OAuth(Arc::new(OAuthTokenManager::new(
                configuration.id.clone(),
                OAuthCredentials::from(settings),
                Arc::new(HttpTokenRefresher::new(client, settings)),
                store,
                config.oauth.refresh_buffer,
            ))),
        }
    }

    /// `Authorization` header value, refreshing OAuth tokens as needed
    pub async fn authorization_header(&self) -> Result<Option<String>> {
        match self {
            Self::None => Ok(None),
            Self::Bearer(token) => Ok(Some(format!("Bearer {}", token))),
            Self::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password));
                Ok(Some(format!("Basic {}", encoded)))
            }
            Self::OAuth(manager) => {
                let token = manager.ensure_valid_token().await?;
                Ok(Some(format!("Bearer {}", token)))
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        match self {
            Self::None => true,
            Self::Bearer(token) => !token.trim().is_empty(),
            Self::Basic { username, .. } => !username.is_empty(),
            Self::OAuth(manager) => manager.is_authenticated(),
        }
    }

    /// Whether a 401 can be answered with a credential refresh
    pub fn can_refresh(&self) -> bool {
        matches!(self, Self::OAuth(_))
    }

    /// Refresh after the server rejected the `Authorization` header we sent
    pub async fn refresh_rejected(&self, rejected_header: Option<&str>) -> Result<()> {
        match self {
            Self::OAuth(manager) => {
                let rejected = rejected_header.and_then(|h| h.strip_prefix("Bearer "));
                manager.force_refresh(rejected).await.map(|_| ())
            }
            _ => Err(McpError::authentication("Credentials were rejected")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpSettings, TransportSettings};
    use crate::store::MemoryConfigurationStore;
    use serde_json::json;

    fn configuration(auth: AuthConfig) -> ServerConfiguration {
        ServerConfiguration::new(
            "cfg",
            "owner",
            "remote",
            TransportSettings::Http(HttpSettings {
                endpoint: "https://tools.example.com/mcp".to_string(),
                headers: Default::default(),
            }),
        )
        .with_auth(auth)
    }

    fn auth_for(configuration: &ServerConfiguration) -> RequestAuth {
        RequestAuth::from_configuration(
            configuration,
            reqwest::Client::new(),
            Arc::new(MemoryConfigurationStore::new()),
            &ConduitConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_basic_header_encoding() {
        let auth = auth_for(&configuration(AuthConfig::Basic {
            username: "aladdin".to_string(),
            password: "opensesame".to_string(),
        }));
        assert_eq!(
            auth.authorization_header().await.unwrap().as_deref(),
            Some("Basic YWxhZGRpbjpvcGVuc2VzYW1l")
        );
        assert!(!auth.can_refresh());
    }

    #[tokio::test]
    async fn test_fallback_token_used_without_auth() {
        let mut config = configuration(AuthConfig::None);
        config.credential_key_fallbacks = vec!["api_key".to_string(), "token".to_string()];
        config.metadata.insert("token".to_string(), json!("fallback-secret"));

        let auth = auth_for(&config);
        assert_eq!(
            auth.authorization_header().await.unwrap().as_deref(),
            Some("Bearer fallback-secret")
        );

        let plain = auth_for(&configuration(AuthConfig::None));
        assert_eq!(plain.authorization_header().await.unwrap(), None);
        assert!(plain.is_authenticated());
    }

    #[tokio::test]
    async fn test_non_oauth_rejection_is_authentication_error() {
        let auth = auth_for(&configuration(AuthConfig::Bearer {
            token: "abc".to_string(),
        }));
        let error = auth.refresh_rejected(Some("Bearer abc")).await.unwrap_err();
        assert!(error.is_authentication_error());
    }
}
