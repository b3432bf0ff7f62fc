//! Connection layer configuration
//!
//! Two kinds of configuration live here:
//!
//! - [`ServerConfiguration`] - one record per external tool server (transport,
//!   credentials, owner), normally persisted by the host application
//! - [`ConduitConfig`] - process-wide tunables for timeouts, retries, circuit
//!   breaking, pooling, process supervision and caching
//!
//! `ConduitConfig` can be loaded from TOML, YAML or JSON files and overridden
//! by `MCP_CONDUIT_*` environment variables:
//!
//! ```no_run
//! use mcp_conduit::config::ConduitConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConduitConfig::from_file("conduit.toml")?.merge_with_env()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

mod server;

pub use server::{
    expand_env_placeholders, AuthConfig, HttpSettings, OAuthSettings, ServerConfiguration,
    ServerSet, StdioSettings, TransportSettings, TransportType, WebSocketSettings,
};

use crate::error::McpError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for McpError {
    fn from(error: ConfigError) -> Self {
        McpError::configuration(error.to_string())
    }
}

/// Process-wide tunables for the connection layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Hard timeout around every transport call
    #[serde(with = "duration_seconds", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub process: ProcessSettings,
    #[serde(default)]
    pub tools: ToolCacheSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub oauth: OAuthRefreshSettings,
    /// Name sent as `clientInfo.name` during the handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            pool: PoolSettings::default(),
            process: ProcessSettings::default(),
            tools: ToolCacheSettings::default(),
            health: HealthSettings::default(),
            oauth: OAuthRefreshSettings::default(),
            client_name: default_client_name(),
        }
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "duration_seconds", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_seconds", default = "default_max_backoff")]
    pub max_backoff: Duration,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(with = "duration_seconds", default = "default_cooldown")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections idle longer than this are disconnected and dropped
    #[serde(with = "duration_seconds", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// How often the background reaper runs
    #[serde(with = "duration_seconds", default = "default_reap_interval")]
    pub reap_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
        }
    }
}

/// Stdio process supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Idle threshold after which a process is considered stale
    #[serde(with = "duration_seconds", default = "default_stale_after")]
    pub stale_after: Duration,
    /// Wait between SIGTERM and SIGKILL
    #[serde(with = "duration_seconds", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            stale_after: default_stale_after(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCacheSettings {
    #[serde(with = "duration_seconds", default = "default_cache_ttl")]
    pub cache_ttl: Duration,
}

impl Default for ToolCacheSettings {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Consecutive connection failures before a configuration is unhealthy
    #[serde(default = "default_health_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_health_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthRefreshSettings {
    /// Refresh proactively when the token expires within this window
    #[serde(with = "duration_seconds", default = "default_refresh_buffer")]
    pub refresh_buffer: Duration,
}

impl Default for OAuthRefreshSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: default_refresh_buffer(),
        }
    }
}

pub(crate) fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path)?;
    let extension = path.extension().and_then(|s| s.to_str());

    match extension {
        Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
        }
        Some("json") => {
            serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
        }
        _ => Err(ConfigError::FileParse(
            "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
        )),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    env_parse::<u64>(name).map(|secs| secs.map(Duration::from_secs))
}

fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::EnvVarParse(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl ConduitConfig {
    /// Load configuration from a `.toml`, `.yaml`/`.yml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        parse_file(path.as_ref())
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_with_env()
    }

    /// Apply `MCP_CONDUIT_*` overrides; the environment takes precedence
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        if let Some(timeout) = env_secs("MCP_CONDUIT_REQUEST_TIMEOUT")? {
            self.request_timeout = timeout;
        }
        if let Some(client_name) = env::var("MCP_CONDUIT_CLIENT_NAME").ok() {
            self.client_name = client_name;
        }

        if let Some(max_retries) = env_parse("MCP_CONDUIT_MAX_RETRIES")? {
            self.retry.max_retries = max_retries;
        }
        if let Some(backoff) = env_secs("MCP_CONDUIT_INITIAL_BACKOFF")? {
            self.retry.initial_backoff = backoff;
        }
        if let Some(backoff) = env_secs("MCP_CONDUIT_MAX_BACKOFF")? {
            self.retry.max_backoff = backoff;
        }
        if let Ok(jitter) = env::var("MCP_CONDUIT_RETRY_JITTER") {
            self.retry.jitter = jitter == "true";
        }

        if let Some(threshold) = env_parse("MCP_CONDUIT_CIRCUIT_THRESHOLD")? {
            self.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(cooldown) = env_secs("MCP_CONDUIT_CIRCUIT_COOLDOWN")? {
            self.circuit_breaker.cooldown = cooldown;
        }

        if let Some(idle) = env_secs("MCP_CONDUIT_POOL_IDLE_TIMEOUT")? {
            self.pool.idle_timeout = idle;
        }
        if let Some(max_restarts) = env_parse("MCP_CONDUIT_MAX_RESTARTS")? {
            self.process.max_restarts = max_restarts;
        }
        if let Some(ttl) = env_secs("MCP_CONDUIT_TOOL_CACHE_TTL")? {
            self.tools.cache_ttl = ttl;
        }

        Ok(self)
    }

    /// Reject settings that would disable core guarantees
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Request timeout must be greater than 0".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::Validation(
                "Initial backoff cannot exceed max backoff".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "Circuit breaker failure threshold must be greater than 0".to_string(),
            ));
        }
        if self.pool.idle_timeout.is_zero() || self.pool.reap_interval.is_zero() {
            return Err(ConfigError::Validation(
                "Pool idle timeout and reap interval must be greater than 0".to_string(),
            ));
        }
        if self.tools.cache_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "Tool cache TTL must be greater than 0".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "Health failure threshold must be greater than 0".to_string(),
            ));
        }
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Client name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Custom serialization for Duration as seconds
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_client_name() -> String {
    "mcp-conduit".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_restarts() -> u32 {
    3
}

fn default_stale_after() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_health_threshold() -> u32 {
    3
}

fn default_refresh_buffer() -> Duration {
    Duration::from_secs(5 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(30));
        assert_eq!(config.process.max_restarts, 3);
        assert_eq!(config.process.stale_after, Duration::from_secs(300));
        assert_eq!(config.tools.cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.oauth.refresh_buffer, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ConduitConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.retry.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_config_loading() {
        let toml_content = r#"
request_timeout = 10

[retry]
max_retries = 5
initial_backoff = 2

[circuit_breaker]
failure_threshold = 2
cooldown = 15

[tools]
cache_ttl = 60
"#;

        let temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();

        let config = ConduitConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(15));
        assert_eq!(config.tools.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_yaml_server_set_loading() {
        let yaml = r#"
servers:
  - id: cfg-1
    owner_id: owner-1
    name: echo
    transport:
      type: stdio
      command: echo-mcp
      args: ["--verbose"]
  - id: cfg-2
    owner_id: owner-1
    name: remote
    transport:
      type: http
      endpoint: https://tools.example.com/mcp
    auth:
      auth_type: basic
      username: svc
      password: pw
"#;
        let temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        std::fs::write(temp_file.path(), yaml).unwrap();

        let set = ServerSet::from_file(temp_file.path()).unwrap();
        assert_eq!(set.servers.len(), 2);
        assert_eq!(set.servers[0].transport_type(), TransportType::Stdio);
        assert_eq!(set.servers[1].auth.kind(), "basic");
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_file = NamedTempFile::with_suffix(".ini").unwrap();
        std::fs::write(temp_file.path(), "x=1").unwrap();
        assert!(matches!(
            ConduitConfig::from_file(temp_file.path()),
            Err(ConfigError::FileParse(_))
        ));
    }

    #[test]
    fn test_env_var_loading() {
        env::set_var("MCP_CONDUIT_MAX_RESTARTS", "7");
        env::set_var("MCP_CONDUIT_CIRCUIT_COOLDOWN", "12");

        let config = ConduitConfig::from_env().unwrap();
        assert_eq!(config.process.max_restarts, 7);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(12));

        env::set_var("MCP_CONDUIT_MAX_RESTARTS", "many");
        assert!(matches!(
            ConduitConfig::from_env(),
            Err(ConfigError::EnvVarParse(_))
        ));

        env::remove_var("MCP_CONDUIT_MAX_RESTARTS");
        env::remove_var("MCP_CONDUIT_CIRCUIT_COOLDOWN");
    }

    #[test]
    fn test_config_error_conversion() {
        let error: McpError = ConfigError::Validation("bad".to_string()).into();
        assert!(matches!(error, McpError::Configuration { .. }));
    }
}
