//! Transport layer for MCP connections
//!
//! Every transport implements [`Connection`]: an exclusive, stateful session
//! that can send one JSON-RPC request and return its response. The tool-level
//! operations ([`discover_tools`], [`call_tool`], [`ping`]) are written once
//! against the trait and routed through the shared [`RetryPolicy`].
//!
//! Supported transports:
//! - **Stdio**: a supervised child process speaking newline-delimited JSON
//! - **HTTP**: one POST per request, JSON or event-stream replies
//! - **SSE**: a fresh event stream per request, no persistent socket
//! - **WebSocket**: JSON-RPC text frames over a persistent socket

mod auth;
mod http;
mod oauth;
mod sse;
mod stdio;
mod websocket;

pub use auth::RequestAuth;
pub use http::HttpConnection;
pub use oauth::{HttpTokenRefresher, OAuthCredentials, OAuthTokenManager, TokenRefresher};
pub use sse::SseConnection;
pub use stdio::StdioConnection;
pub use websocket::WebSocketConnection;

use crate::config::{ConduitConfig, ServerConfiguration, TransportSettings, TransportType};
use crate::error::{McpError, Result};
use crate::error_recovery::RetryPolicy;
use crate::mcp::codec;
use crate::mcp::types::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolDescriptor,
};
use crate::store::ConfigurationStore;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Version reported as `clientInfo.version`
pub(crate) const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on `tools/list` pages, guarding against cursor loops
const MAX_TOOL_PAGES: usize = 100;

/// A live session with one MCP server
///
/// A connection is owned by exactly one caller at a time (the pool enforces
/// this), so every operation takes `&mut self`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the session: spawn the process, open the socket or validate
    /// the credential, and perform the protocol handshake where the
    /// transport has one
    async fn connect(&mut self) -> Result<()>;

    /// Idempotent teardown; never fails
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Cheap local credential check, no network traffic
    fn is_authenticated(&self) -> bool;

    /// Send one request and wait for the response with the same id
    async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse>;

    async fn send_notification(&mut self, _notification: &JsonRpcNotification) -> Result<()> {
        Ok(())
    }

    fn transport_info(&self) -> TransportInfo;

    /// Server identity from the handshake, when the transport performs one
    fn session(&self) -> Option<&SessionInfo> {
        None
    }

    /// Whether the pool should recycle this connection before reuse
    fn is_stale(&self) -> bool {
        false
    }

    /// Remember the most recently discovered tools
    fn record_tools(&mut self, _tools: &[ToolDescriptor]) {}
}

/// Transport information for debugging and monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportInfo {
    pub transport_type: TransportType,
    /// Endpoint or command line
    pub endpoint: String,
    pub supports_reconnection: bool,
}

/// What the server told us about itself during `initialize`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: Value,
}

impl From<InitializeResult> for SessionInfo {
    fn from(result: InitializeResult) -> Self {
        let (server_name, server_version) = match result.server_info {
            Some(info) => (Some(info.name), info.version),
            None => (None, None),
        };
        Self {
            server_name,
            server_version,
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
        }
    }
}

/// Connect if needed, send, and unwrap the JSON-RPC result
async fn exchange(connection: &mut dyn Connection, request: &JsonRpcRequest) -> Result<Value> {
    if !connection.is_connected() {
        connection.connect().await?;
    }
    let response = connection.send_request(request).await?;
    codec::into_result(response)
}

/// List every tool the server exposes, following `nextCursor` pagination
pub async fn discover_tools(connection: &mut dyn Connection, retry: &RetryPolicy) -> Result<Vec<ToolDescriptor>> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for page in 0..MAX_TOOL_PAGES {
        let page_cursor = cursor.clone();
        let result = retry
            .execute("tools/list", connection, |connection| {
                let request = codec::list_tools_request(page_cursor.as_deref());
                Box::pin(async move { exchange(connection, &request).await })
            })
            .await?;

        let (page_tools, next_cursor) = codec::parse_tools_page(result)?;
        debug!(page, count = page_tools.len(), "Received tools page");
        tools.extend(page_tools);

        match next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => {
                connection.record_tools(&tools);
                return Ok(tools);
            }
        }
    }

    Err(McpError::tool_discovery(format!(
        "tools/list did not finish within {} pages",
        MAX_TOOL_PAGES
    )))
}

/// Invoke one tool; a result flagged `isError` becomes [`McpError::ToolExecution`]
pub async fn call_tool(
    connection: &mut dyn Connection,
    retry: &RetryPolicy,
    name: &str,
    arguments: &Value,
) -> Result<ToolCallResult> {
    let result = retry
        .execute("tools/call", connection, |connection| {
            let request = codec::call_tool_request(name, arguments);
            Box::pin(async move { exchange(connection, &request).await })
        })
        .await?;
    codec::parse_call_result(name, result)
}

/// Liveness round trip
pub async fn ping(connection: &mut dyn Connection, retry: &RetryPolicy) -> Result<()> {
    retry
        .execute("ping", connection, |connection| {
            let request = codec::ping_request();
            Box::pin(async move { exchange(connection, &request).await })
        })
        .await
        .map(|_| ())
}

pub(crate) fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> McpError {
    if error.is_timeout() {
        McpError::timeout(timeout)
    } else if let Some(status) = error.status() {
        codec::map_http_status(status.as_u16(), "", None)
    } else {
        McpError::connection(format!("HTTP request failed: {}", error))
    }
}

/// Builds the transport-specific connection for a configuration
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, configuration: &ServerConfiguration) -> Result<Box<dyn Connection>>;
}

/// Factory for the built-in transports
pub struct DefaultConnectionFactory {
    config: Arc<ConduitConfig>,
    store: Arc<dyn ConfigurationStore>,
    client: reqwest::Client,
}

impl DefaultConnectionFactory {
    pub fn new(config: Arc<ConduitConfig>, store: Arc<dyn ConfigurationStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", config.client_name, CLIENT_VERSION))
            .build()
            .map_err(|e| McpError::configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, store, client })
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, configuration: &ServerConfiguration) -> Result<Box<dyn Connection>> {
        let configuration = configuration.resolve_placeholders()?;
        configuration.validate()?;

        let auth = || {
            RequestAuth::from_configuration(
                &configuration,
                self.client.clone(),
                self.store.clone(),
                &self.config,
            )
        };

        let connection: Box<dyn Connection> = match &configuration.transport {
            TransportSettings::Stdio(settings) => Box::new(StdioConnection::new(
                &configuration.id,
                settings.clone(),
                &self.config,
            )),
            TransportSettings::Http(settings) => Box::new(HttpConnection::new(
                &configuration.id,
                settings,
                auth(),
                self.client.clone(),
                &self.config,
            )),
            TransportSettings::Sse(settings) => Box::new(SseConnection::new(
                &configuration.id,
                settings,
                auth(),
                self.client.clone(),
                &self.config,
            )),
            TransportSettings::WebSocket(settings) => Box::new(WebSocketConnection::new(
                &configuration.id,
                settings,
                auth(),
                &self.config,
            )),
        };

        debug!(
            configuration_id = %configuration.id,
            transport = %configuration.transport_type(),
            "Created connection"
        );
        Ok(connection)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedConnection;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_discover_follows_cursor() {
        let mut connection = ScriptedConnection::new(vec![
            Ok(json!({"tools": [{"name": "a"}], "nextCursor": "2"})),
            Ok(json!({"tools": [{"name": "b"}, {"name": "c"}]})),
        ]);
        let requests = connection.requests.clone();

        let tools = discover_tools(&mut connection, &RetryPolicy::disabled()).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].params, None);
        assert_eq!(requests[1].params, Some(json!({"cursor": "2"})));
        assert_eq!(connection.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_tool_reconnects_between_retries() {
        let mut connection = ScriptedConnection::new(vec![
            Err(McpError::connection("broken pipe")),
            Ok(json!({"content": [{"type": "text", "text": "hi"}]})),
        ]);

        let result = call_tool(&mut connection, &RetryPolicy::default(), "echo", &json!({"text": "hi"}))
            .await
            .unwrap();

        assert_eq!(result.text(), "hi");
        assert_eq!(connection.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let mut connection = ScriptedConnection::new(vec![Err(McpError::protocol("unknown method"))]);
        let requests = connection.requests.clone();

        let error = ping(&mut connection, &RetryPolicy::default()).await.unwrap_err();
        assert!(matches!(error, McpError::Protocol { .. }));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_session_info_from_initialize() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "echo", "version": "1.2.0"}
        }))
        .unwrap();
        let session = SessionInfo::from(result);
        assert_eq!(session.server_name.as_deref(), Some("echo"));
        assert_eq!(session.server_version.as_deref(), Some("1.2.0"));
        assert_eq!(session.capabilities, json!({"tools": {}}));
    }

    #[test]
    fn test_factory_rejects_invalid_configuration() {
        let factory = DefaultConnectionFactory::new(
            Arc::new(ConduitConfig::default()),
            Arc::new(crate::store::MemoryConfigurationStore::new()),
        )
        .unwrap();
        let configuration = ServerConfiguration::new(
            "cfg",
            "owner",
            "broken",
            TransportSettings::WebSocket(crate::config::WebSocketSettings {
                url: "http://not-a-websocket".to_string(),
                headers: Default::default(),
            }),
        );

        let error = factory.create(&configuration).err().unwrap();
        assert!(matches!(error, McpError::Configuration { .. }));
    }
}
