use super::http::{error_for_status, is_event_stream, HttpEndpoint};
use super::{map_reqwest_error, Connection, RequestAuth, TransportInfo};
use crate::config::{ConduitConfig, HttpSettings, TransportType};
use crate::error::{McpError, Result};
use crate::mcp::codec;
use crate::mcp::sse::{SseEvent, SseParser};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::time::timeout;
use tracing::{debug, info};

const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// One event stream per request; no socket is held between calls
pub struct SseConnection {
    configuration_id: String,
    endpoint: HttpEndpoint,
    connected: bool,
    last_event_id: Option<String>,
}

impl SseConnection {
    pub fn new(
        configuration_id: &str,
        settings: &HttpSettings,
        auth: RequestAuth,
        client: reqwest::Client,
        config: &ConduitConfig,
    ) -> Self {
        Self {
            configuration_id: configuration_id.to_string(),
            endpoint: HttpEndpoint {
                client,
                url: settings.endpoint.clone(),
                headers: settings.headers.clone(),
                auth,
                timeout: config.request_timeout,
            },
            connected: false,
            last_event_id: None,
        }
    }

    /// Id of the last event received, replayed as `Last-Event-ID`
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn remember_event_id(&mut self, parser: &SseParser) {
        if let Some(id) = parser.last_event_id() {
            self.last_event_id = Some(id.to_string());
        }
    }

    async fn stream_response(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let last_event_id = self.last_event_id.clone();
        let response = self
            .endpoint
            .post(request, |builder| {
                let builder = builder
                    .header(ACCEPT, "text/event-stream")
                    .header(CACHE_CONTROL, "no-cache");
                match last_event_id.as_deref() {
                    Some(id) => builder.header(LAST_EVENT_ID_HEADER, id),
                    None => builder,
                }
            })
            .await?;
        let response = error_for_status(response).await?;

        // Some servers answer a single request with plain JSON
        if !is_event_stream(&response) {
            let body = response
                .text()
                .await
                .map_err(|e| map_reqwest_error(e, self.endpoint.timeout))?;
            return match codec::decode_message(&body)? {
                Some(response) if response.id == request.id => Ok(response),
                _ => Err(McpError::protocol("non-stream reply did not contain the response")),
            };
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let events = parser.feed(&chunk);
                    // The caller's timeout may drop this future between chunks
                    self.remember_event_id(&parser);
                    if let Some(outcome) = scan(events, &request.id) {
                        break outcome;
                    }
                }
                Some(Err(e)) => break Err(map_reqwest_error(e, self.endpoint.timeout)),
                None => {
                    let trailing = parser.finish();
                    self.remember_event_id(&parser);
                    break scan(trailing.into_iter().collect(), &request.id).unwrap_or_else(|| {
                        Err(McpError::connection(
                            "event stream ended before the response arrived",
                        ))
                    })
                }
            }
        }
    }
}

/// Look through completed events for our response or a terminal event
fn scan(events: Vec<SseEvent>, id: &RequestId) -> Option<Result<JsonRpcResponse>> {
    for event in events {
        match event.event_type.as_str() {
            "error" => match codec::decode_message(&event.data) {
                Ok(Some(response)) if &response.id == id => return Some(Ok(response)),
                Ok(Some(response)) if response.id.is_null() => {
                    let error = codec::into_result(response)
                        .err()
                        .unwrap_or_else(|| McpError::protocol("error event carried a result"));
                    return Some(Err(error));
                }
                Ok(Some(response)) => {
                    debug!(id = %response.id, "Ignoring error event for another request");
                }
                _ => {
                    if let Ok(error) = serde_json::from_str::<JsonRpcError>(&event.data) {
                        return Some(Err(codec::map_rpc_error(&error)));
                    }
                    return Some(Err(McpError::connection(format!(
                        "server sent error event: {}",
                        event.data
                    ))));
                }
            },
            "done" => {
                return Some(Err(McpError::protocol(
                    "stream finished without a response",
                )))
            }
            _ => match codec::decode_message(&event.data) {
                Ok(Some(response)) if &response.id == id => return Some(Ok(response)),
                Ok(_) => {}
                Err(error) => {
                    debug!(error = %error, "Skipping undecodable event");
                }
            },
        }
    }
    None
}

#[async_trait]
impl Connection for SseConnection {
    async fn connect(&mut self) -> Result<()> {
        // Validates, and if needed refreshes, the credential
        self.endpoint.auth.authorization_header().await?;
        self.connected = true;
        info!(
            configuration_id = %self.configuration_id,
            endpoint = %self.endpoint.url,
            "SSE MCP connection ready"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_authenticated(&self) -> bool {
        self.endpoint.is_authenticated()
    }

    async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.connected {
            return Err(McpError::connection("SSE connection is not established"));
        }
        let deadline = self.endpoint.timeout;
        timeout(deadline, self.stream_response(request))
            .await
            .map_err(|_| McpError::timeout(deadline))?
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Sse,
            endpoint: self.endpoint.url.clone(),
            supports_reconnection: true,
        }
    }
}
