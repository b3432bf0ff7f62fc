//! Structured logging setup
//!
//! The library only emits `tracing` events; binaries decide where they go.
//! [`init_logging`] installs a console layer on stderr and, when a log
//! directory is configured, a daily-rolling file layer written through a
//! non-blocking worker. Keep the returned [`LoggingGuard`] alive for the life
//! of the process or buffered file output is lost.

use crate::error::McpError;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Configuration for console and file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rolling log files; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Log level for file output
    pub file_log_level: String,
    /// Log level for console output
    pub console_log_level: String,
    /// Whether to log to stderr
    pub console_enabled: bool,
    /// Whether file output is JSON
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_log_level: "info".to_string(),
            console_log_level: "warn".to_string(),
            console_enabled: true,
            json_format: true,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(log_dir) = std::env::var("MCP_CONDUIT_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(log_dir));
        }
        if let Ok(level) = std::env::var("MCP_CONDUIT_LOG_LEVEL") {
            config.file_log_level = level;
        }
        if let Ok(level) = std::env::var("MCP_CONDUIT_CONSOLE_LOG_LEVEL") {
            config.console_log_level = level;
        }
        if let Ok(enabled) = std::env::var("MCP_CONDUIT_CONSOLE_LOGGING") {
            config.console_enabled = enabled.parse().unwrap_or(true);
        }
        if let Ok(json) = std::env::var("MCP_CONDUIT_JSON_LOGS") {
            config.json_format = json.parse().unwrap_or(true);
        }

        config
    }

    pub fn with_console_level(mut self, level: impl Into<String>) -> Self {
        self.console_log_level = level.into();
        self
    }
}

/// Guard that must be kept alive for the duration of the application
/// to ensure proper log flushing
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build a filter from `level`, quietening the HTTP and runtime crates
fn build_filter(level: &str, fallback: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(fallback));
    for directive in ["tokio=warn", "hyper=warn", "h2=warn", "reqwest=warn", "tungstenite=warn"] {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    filter
}

/// Install the global tracing subscriber
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, McpError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if let Some(log_dir) = config.log_dir.as_ref() {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            McpError::configuration(format!("Failed to create log directory: {}", e))
        })?;

        let file_appender = tracing_appender::rolling::daily(log_dir, "mcp-conduit.log");
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        file_guard = Some(guard);

        let file_filter = build_filter(&config.file_log_level, "info");
        let base = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::new(
                "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
            ))
            .with_file(true)
            .with_line_number(true)
            .with_target(true);

        if config.json_format {
            layers.push(base.json().with_current_span(true).with_filter(file_filter).boxed());
        } else {
            layers.push(base.with_filter(file_filter).boxed());
        }
    }

    if config.console_enabled {
        let console_filter = build_filter(&config.console_log_level, "warn");
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_filter(console_filter)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| McpError::configuration(format!("Failed to install logger: {}", e)))?;

    info!(
        log_dir = ?config.log_dir,
        json_format = config.json_format,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.log_dir.is_none());
        assert!(config.console_enabled);
        assert_eq!(config.console_log_level, "warn");
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = build_filter("not a level !!", "info");
        assert!(filter.to_string().contains("info"));
    }
}
