//! Connect to Model Context Protocol servers over any transport and call
//! their tools reliably.
//!
//! mcp-conduit is the connection layer between an orchestrator and external
//! MCP tool servers. It speaks JSON-RPC 2.0 over stdio subprocesses, HTTP,
//! Server-Sent Events and WebSockets, and wraps every operation in bounded
//! retries, per-configuration circuit breaking and an exclusive connection
//! pool.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_conduit::config::{ServerConfiguration, StdioSettings, TransportSettings};
//! use mcp_conduit::McpManager;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = McpManager::builder().build()?;
//!     manager.start_background_tasks();
//!
//!     let filesystem = ServerConfiguration::new(
//!         "fs",
//!         "team-42",
//!         "filesystem",
//!         TransportSettings::Stdio(
//!             StdioSettings::new("npx").with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]),
//!         ),
//!     );
//!
//!     for tool in manager.try_discover_tools(&filesystem, false).await? {
//!         println!("{}: {}", tool.name, tool.description.unwrap_or_default());
//!     }
//!
//!     // Failures come back as values at this boundary
//!     let outcome = manager
//!         .call_tool(&filesystem, "list_directory", json!({"path": "/tmp"}))
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&outcome)?);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture Overview
//!
//! ```text
//! McpManager ─┬─ CircuitBreakerRegistry   fail fast per (owner, configuration)
//!             ├─ ConnectionPool           one exclusive connection per key
//!             │    └─ ConnectionFactory → Stdio | Http | Sse | WebSocket
//!             │                              └─ ProcessSupervisor (stdio)
//!             ├─ RetryPolicy              exponential backoff on transient errors
//!             ├─ ToolRegistry             TTL cache of tools/list
//!             ├─ HealthTracker            configuration status write-back
//!             └─ AuditSink                per-call side channel
//! ```
//!
//! # Module Organization
//!
//! - [`manager`] - inbound API: `call_tool`, `discover_tools`, `test_connection`
//! - [`mcp`] - JSON-RPC types, codec, SSE parsing and the transports
//! - [`pool`] - connection pool keyed by owner and configuration
//! - [`process`] - stdio server process lifecycle and restart policy
//! - [`error_recovery`] - retry policy and circuit breakers
//! - [`tools`] - discovered tool cache
//! - [`health`] - configuration health tracking
//! - [`store`] - credential, status and metadata write-back interface
//! - [`audit`] - tool call audit records
//! - [`config`] - server configurations and tunables
//! - [`error`] - error taxonomy and boundary conversion
//! - [`telemetry`] - tracing subscriber setup

pub mod audit;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod health;
pub mod manager;
pub mod mcp;
pub mod pool;
pub mod process;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod utils;

pub use error::{ErrorResult, McpError, Result};
pub use manager::{McpManager, McpManagerBuilder, Outcome};
