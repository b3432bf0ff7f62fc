use super::{Connection, RequestAuth, SessionInfo, TransportInfo, CLIENT_VERSION};
use crate::config::{ConduitConfig, TransportType, WebSocketSettings};
use crate::error::{McpError, Result};
use crate::mcp::codec;
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON-RPC text frames over a persistent WebSocket
pub struct WebSocketConnection {
    configuration_id: String,
    url: String,
    headers: HashMap<String, String>,
    auth: RequestAuth,
    request_timeout: Duration,
    client_name: String,
    stream: Option<WsStream>,
    session: Option<SessionInfo>,
}

impl WebSocketConnection {
    pub fn new(
        configuration_id: &str,
        settings: &WebSocketSettings,
        auth: RequestAuth,
        config: &ConduitConfig,
    ) -> Self {
        Self {
            configuration_id: configuration_id.to_string(),
            url: settings.url.clone(),
            headers: settings.headers.clone(),
            auth,
            request_timeout: config.request_timeout,
            client_name: config.client_name.clone(),
            stream: None,
            session: None,
        }
    }

    async fn open(&mut self) -> Result<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        let mut extra = self.headers.clone();
        if let Some(authorization) = self.auth.authorization_header().await? {
            extra.insert("Authorization".to_string(), authorization);
        }
        for (name, value) in extra {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::configuration(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| McpError::configuration(format!("Invalid header value for '{}': {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = timeout(self.request_timeout, connect_async(request))
            .await
            .map_err(|_| McpError::timeout(self.request_timeout))??;
        Ok(stream)
    }

    async fn round_trip(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| McpError::connection("WebSocket is not connected"))?;

        stream.send(WsMessage::Text(serde_json::to_string(request)?)).await?;

        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(response) = codec::decode_message(&text)? {
                        if response.id == request.id {
                            return Ok(response);
                        }
                        debug!(id = %response.id, "Ignoring response for another request");
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(McpError::connection("WebSocket closed by remote"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn exchange(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let deadline = self.request_timeout;
        let outcome = match timeout(deadline, self.round_trip(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::timeout(deadline)),
        };
        // A timed-out or broken socket may still deliver a stale reply
        if matches!(&outcome, Err(e) if e.is_retryable()) {
            self.stream = None;
        }
        outcome
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn connect(&mut self) -> Result<()> {
        self.stream = Some(self.open().await?);

        let request = codec::initialize_request(&self.client_name, CLIENT_VERSION);
        let handshake = async {
            let response = self.exchange(&request).await?;
            codec::parse_initialize(codec::into_result(response)?)
        };
        match handshake.await {
            Ok(result) => {
                self.session = Some(SessionInfo::from(result));
                self.send_notification(&codec::initialized_notification()).await?;
                info!(
                    configuration_id = %self.configuration_id,
                    url = %self.url,
                    "WebSocket MCP connection established"
                );
                Ok(())
            }
            Err(error) => {
                self.disconnect().await;
                Err(error)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(configuration_id = %self.configuration_id, error = %e, "WebSocket close failed");
            }
        }
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.exchange(request).await
    }

    async fn send_notification(&mut self, notification: &JsonRpcNotification) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| McpError::connection("WebSocket is not connected"))?;
        stream
            .send(WsMessage::Text(serde_json::to_string(notification)?))
            .await?;
        Ok(())
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::WebSocket,
            endpoint: self.url.clone(),
            supports_reconnection: true,
        }
    }

    fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::RetryPolicy;
    use crate::mcp::transport::call_tool;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    /// Accepts one client and answers MCP requests by method
    async fn serve_once() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let WsMessage::Text(text) = message else { continue };
                let request: Value = serde_json::from_str(&text).unwrap();
                let Some(id) = request.get("id").cloned() else { continue };
                let result = match request["method"].as_str() {
                    Some("initialize") => json!({"capabilities": {"tools": {}}, "serverInfo": {"name": "ws-echo"}}),
                    Some("tools/call") => json!({"content": [{"type": "text", "text": request["params"]["arguments"]["text"]}]}),
                    _ => json!({}),
                };
                // An unrelated notification first, then the answer
                ws.send(WsMessage::Text(json!({"jsonrpc": "2.0", "method": "notifications/message"}).to_string()))
                    .await
                    .unwrap();
                ws.send(WsMessage::Text(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()))
                    .await
                    .unwrap();
            }
        });
        format!("ws://{}", addr)
    }

    fn connection(url: String) -> WebSocketConnection {
        WebSocketConnection::new(
            "cfg-ws",
            &WebSocketSettings {
                url,
                headers: HashMap::from([("X-Tenant".to_string(), "acme".to_string())]),
            },
            RequestAuth::Bearer("ws-token".to_string()),
            &ConduitConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_tool_call() {
        let mut connection = connection(serve_once().await);
        connection.connect().await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(
            connection.session().unwrap().server_name.as_deref(),
            Some("ws-echo")
        );

        let result = call_tool(
            &mut connection,
            &RetryPolicy::disabled(),
            "echo",
            &json!({"text": "over the wire"}),
        )
        .await
        .unwrap();
        assert_eq!(result.text(), "over the wire");

        connection.disconnect().await;
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connection = connection(format!("ws://{}", addr));
        let error = connection.connect().await.unwrap_err();
        assert!(matches!(error, McpError::Connection { .. }));
        assert!(error.is_retryable());
    }
}
