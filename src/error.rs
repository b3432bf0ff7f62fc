//! Error taxonomy for MCP connection operations
//!
//! Every failure that can come out of a transport, the process supervisor, the
//! circuit breaker or the protocol codec is represented by [`McpError`]. The
//! variants are grouped the way callers need to react to them:
//!
//! - **Retryable** - [`McpError::Connection`], [`McpError::Timeout`] and
//!   [`McpError::RateLimit`] are retried locally by the retry policy
//! - **Fatal** - [`McpError::Authentication`], [`McpError::Protocol`] and
//!   everything else propagates immediately
//! - **Lifecycle** - [`McpError::ProcessSpawn`], [`McpError::ProcessCrash`] and
//!   [`McpError::InvalidStateTransition`] come from stdio process supervision
//!
//! # Boundary conversion
//!
//! Orchestrators that prefer values over errors convert a terminal error into
//! an [`ErrorResult`]:
//!
//! ```rust
//! use mcp_conduit::error::McpError;
//!
//! let error = McpError::rate_limit("slow down", None);
//! let result = error.to_error_result();
//! assert_eq!(result.kind, "rate_limit");
//! assert!(result.retryable);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpError>;

/// Primary error type for every MCP connection operation
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// Network endpoint or process unreachable, or the session dropped
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Bad, expired or insufficient credentials
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// The server asked us to slow down
    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// An operation exceeded its deadline
    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        duration: Option<Duration>,
    },

    /// Malformed or unexpected JSON-RPC traffic
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The stdio server command could not be started
    #[error("Process spawn failed: {command}: {message}")]
    ProcessSpawn { command: String, message: String },

    /// The stdio server exited and may not be restarted again
    #[error("Process crashed: exit status {}", exit_status.map_or("unknown".to_string(), |c| c.to_string()))]
    ProcessCrash {
        exit_status: Option<i32>,
        stderr: Option<String>,
    },

    /// The circuit breaker for this configuration is open
    #[error("Circuit open for {key}: {failure_count} consecutive failures, retry after {retry_after:?}")]
    CircuitOpen {
        key: String,
        retry_after: Duration,
        failure_count: u32,
    },

    /// `tools/list` returned something we could not use
    #[error("Tool discovery error: {message}")]
    ToolDiscovery { message: String },

    /// The server reported a failed tool invocation
    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    /// Invalid or unusable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Illegal process lifecycle transition
    #[error("Invalid process state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Local (de)serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl McpError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Local deadline expiry after `duration`
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            message: format!("operation timed out after {:?}", duration),
            duration: Some(duration),
        }
    }

    /// Timeout reported by the remote side, where no local duration applies
    pub fn remote_timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            duration: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn process_spawn(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn process_crash(exit_status: Option<i32>, stderr: Option<String>) -> Self {
        Self::ProcessCrash {
            exit_status,
            stderr,
        }
    }

    pub fn circuit_open(key: impl Into<String>, retry_after: Duration, failure_count: u32) -> Self {
        Self::CircuitOpen {
            key: key.into(),
            retry_after,
            failure_count,
        }
    }

    pub fn tool_discovery(message: impl Into<String>) -> Self {
        Self::ToolDiscovery {
            message: message.into(),
        }
    }

    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the retry policy may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::RateLimit { .. }
        )
    }

    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Failures that mean the server could not be reached at all
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ProcessSpawn { .. } | Self::ProcessCrash { .. }
        )
    }

    /// Server-supplied wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable snake_case label for logs, audit records and error results
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Authentication { .. } => "authentication",
            Self::RateLimit { .. } => "rate_limit",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::ProcessSpawn { .. } => "process_spawn",
            Self::ProcessCrash { .. } => "process_crash",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ToolDiscovery { .. } => "tool_discovery",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Configuration { .. } => "configuration",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Serialization { .. } => "serialization",
        }
    }

    /// Convert into the structured value handed back to orchestrators
    pub fn to_error_result(&self) -> ErrorResult {
        let failure_count = match self {
            Self::CircuitOpen { failure_count, .. } => Some(*failure_count),
            _ => None,
        };
        let exit_status = match self {
            Self::ProcessCrash { exit_status, .. } => *exit_status,
            _ => None,
        };

        ErrorResult {
            error: self.to_string(),
            kind: self.kind().to_string(),
            retryable: self.is_retryable(),
            retry_after_secs: self.retry_after().map(|d| d.as_secs()),
            failure_count,
            exit_status,
        }
    }
}

/// Structured error value returned at the orchestration boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    /// Human-readable message
    pub error: String,
    /// Error category, see [`McpError::kind`]
    pub kind: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl From<std::io::Error> for McpError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => Self::remote_timeout(error.to_string()),
            _ => Self::connection(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for McpError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match error {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                Self::authentication(format!(
                    "WebSocket upgrade rejected with status {}",
                    response.status()
                ))
            }
            other => Self::connection(format!("WebSocket error: {}", other)),
        }
    }
}
