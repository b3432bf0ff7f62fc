//! Server configuration records
//!
//! A [`ServerConfiguration`] describes one external tool server: who owns it,
//! how to reach it and which credentials to present. The connection layer
//! treats it as an immutable value for the duration of an operation; credential
//! changes (OAuth refresh) are written back through
//! [`ConfigurationStore`](crate::store::ConfigurationStore).

use super::ConfigError;
use crate::utils::logging::obscure_credential;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is a valid regex")
});

/// Wire mechanism used to reach a tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Stdio,
    Http,
    Sse,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Stdio => "stdio",
            TransportType::Http => "http",
            TransportType::Sse => "sse",
            TransportType::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Subprocess launch settings for stdio servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioSettings {
    /// Command to execute
    pub command: String,
    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl StdioSettings {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human-readable command line for logs
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Endpoint settings shared by the HTTP and SSE transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketSettings {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Transport-specific settings, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSettings {
    Stdio(StdioSettings),
    Http(HttpSettings),
    Sse(HttpSettings),
    #[serde(rename = "websocket")]
    WebSocket(WebSocketSettings),
}

impl TransportSettings {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportSettings::Stdio(_) => TransportType::Stdio,
            TransportSettings::Http(_) => TransportType::Http,
            TransportSettings::Sse(_) => TransportType::Sse,
            TransportSettings::WebSocket(_) => TransportType::WebSocket,
        }
    }

    /// Endpoint or command line, for logs and status snapshots
    pub fn endpoint(&self) -> String {
        match self {
            TransportSettings::Stdio(stdio) => stdio.command_line(),
            TransportSettings::Http(http) | TransportSettings::Sse(http) => http.endpoint.clone(),
            TransportSettings::WebSocket(ws) => ws.url.clone(),
        }
    }
}

/// Credentials presented to network transports, tagged by `auth_type`
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "auth_type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(rename = "oauth")]
    OAuth(OAuthSettings),
}

/// OAuth 2.0 token set plus what is needed to refresh it
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Bearer { token } => f
                .debug_struct("Bearer")
                .field("token", &obscure_credential(token))
                .finish(),
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            AuthConfig::OAuth(settings) => f.debug_tuple("OAuth").field(settings).finish(),
        }
    }
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("access_token", &obscure_credential(&self.access_token))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::None => "none",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::OAuth(_) => "oauth",
        }
    }
}

/// One external tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// Stable configuration identifier
    pub id: String,
    /// Owner (tenant or user) the configuration belongs to
    pub owner_id: String,
    /// Display name
    pub name: String,
    pub transport: TransportSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form metadata, including last discovery results
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Metadata keys scanned, in order, for a bearer token when `auth` is `none`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_key_fallbacks: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfiguration {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        transport: TransportSettings,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            transport,
            auth: AuthConfig::None,
            enabled: true,
            metadata: serde_json::Map::new(),
            credential_key_fallbacks: Vec::new(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    /// Token found under the first configured fallback metadata key
    pub fn fallback_token(&self) -> Option<&str> {
        self.credential_key_fallbacks.iter().find_map(|key| {
            self.metadata
                .get(key)
                .and_then(|value| value.as_str())
                .filter(|token| !token.trim().is_empty())
        })
    }

    /// Check the configuration is usable before any connection attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Configuration id cannot be empty".to_string(),
            ));
        }
        if self.owner_id.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Configuration '{}' has no owner",
                self.id
            )));
        }

        match &self.transport {
            TransportSettings::Stdio(stdio) => {
                if stdio.command.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Configuration '{}': stdio command cannot be empty",
                        self.id
                    )));
                }
            }
            TransportSettings::Http(http) | TransportSettings::Sse(http) => {
                let url = parse_url(&self.id, &http.endpoint)?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConfigError::Validation(format!(
                        "Configuration '{}': endpoint must use http or https, got '{}'",
                        self.id,
                        url.scheme()
                    )));
                }
            }
            TransportSettings::WebSocket(ws) => {
                let url = parse_url(&self.id, &ws.url)?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(ConfigError::Validation(format!(
                        "Configuration '{}': websocket url must use ws or wss, got '{}'",
                        self.id,
                        url.scheme()
                    )));
                }
            }
        }

        if let AuthConfig::OAuth(oauth) = &self.auth {
            if matches!(self.transport, TransportSettings::Stdio(_)) {
                return Err(ConfigError::Validation(format!(
                    "Configuration '{}': oauth is not supported for stdio servers",
                    self.id
                )));
            }
            parse_url(&self.id, &oauth.token_endpoint)?;
        }

        Ok(())
    }

    /// Replace `${VAR}` placeholders in env values, headers and credentials
    pub fn resolve_placeholders(&self) -> Result<Self, ConfigError> {
        let mut resolved = self.clone();

        match &mut resolved.transport {
            TransportSettings::Stdio(stdio) => {
                for value in stdio.env.values_mut() {
                    *value = expand_env_placeholders(value)?;
                }
                for arg in stdio.args.iter_mut() {
                    *arg = expand_env_placeholders(arg)?;
                }
            }
            TransportSettings::Http(http) | TransportSettings::Sse(http) => {
                for value in http.headers.values_mut() {
                    *value = expand_env_placeholders(value)?;
                }
            }
            TransportSettings::WebSocket(ws) => {
                for value in ws.headers.values_mut() {
                    *value = expand_env_placeholders(value)?;
                }
            }
        }

        match &mut resolved.auth {
            AuthConfig::None => {}
            AuthConfig::Bearer { token } => *token = expand_env_placeholders(token)?,
            AuthConfig::Basic { username, password } => {
                *username = expand_env_placeholders(username)?;
                *password = expand_env_placeholders(password)?;
            }
            AuthConfig::OAuth(oauth) => {
                if let Some(secret) = oauth.client_secret.as_mut() {
                    *secret = expand_env_placeholders(secret)?;
                }
            }
        }

        Ok(resolved)
    }
}

fn parse_url(id: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| {
        ConfigError::Validation(format!("Configuration '{}': invalid url '{}': {}", id, raw, e))
    })
}

/// Expand `${VAR}` references from the process environment
pub fn expand_env_placeholders(value: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = PLACEHOLDER.replace_all(value, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(resolved) => resolved,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::EnvVarParse(format!(
            "placeholder ${{{}}} references an unset environment variable",
            name
        ))),
        None => Ok(expanded.into_owned()),
    }
}

/// A file of server configurations, as consumed by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSet {
    #[serde(default)]
    pub servers: Vec<ServerConfiguration>,
}

impl ServerSet {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        super::parse_file(path.as_ref())
    }

    /// Look a server up by id, falling back to display name
    pub fn find(&self, id_or_name: &str) -> Option<&ServerConfiguration> {
        self.servers
            .iter()
            .find(|server| server.id == id_or_name)
            .or_else(|| self.servers.iter().find(|server| server.name == id_or_name))
    }
}
