use super::{map_reqwest_error, Connection, RequestAuth, SessionInfo, TransportInfo, CLIENT_VERSION};
use crate::config::{ConduitConfig, HttpSettings, TransportType};
use crate::error::{McpError, Result};
use crate::mcp::codec;
use crate::mcp::sse::parse_events;
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::utils::logging::{obscure_authorization, truncate_for_log};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Shared POST plumbing for the HTTP and SSE transports
pub(crate) struct HttpEndpoint {
    pub client: reqwest::Client,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub auth: RequestAuth,
    pub timeout: Duration,
}

impl HttpEndpoint {
    /// POST `body` with configured headers and credentials
    ///
    /// A 401 answered by a successful credential refresh is retried exactly
    /// once; any other status is returned to the caller unchanged.
    pub async fn post<B, F>(&self, body: &B, decorate: F) -> Result<Response>
    where
        B: Serialize + ?Sized,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let authorization = self.auth.authorization_header().await?;

            let mut builder = self.client.post(&self.url).timeout(self.timeout).json(body);
            for (name, value) in &self.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(ref authorization) = authorization {
                debug!(authorization = %obscure_authorization(authorization), "Attaching credentials");
                builder = builder.header(AUTHORIZATION, authorization.as_str());
            }

            let response = decorate(builder)
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, self.timeout))?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed && self.auth.can_refresh() {
                info!(url = %self.url, "Server rejected access token, refreshing once");
                refreshed = true;
                self.auth.refresh_rejected(authorization.as_deref()).await?;
                continue;
            }

            return Ok(response);
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }
}

/// Map a non-2xx response onto the error taxonomy
pub(crate) async fn error_for_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = codec::parse_retry_after(
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok()),
    );
    let body = response.text().await.unwrap_or_default();
    Err(codec::map_http_status(status.as_u16(), &body, retry_after))
}

pub(crate) fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("text/event-stream"))
}

/// Find the response for `id` in a JSON or event-stream body
fn decode_body(body: &str, event_stream: bool, id: &RequestId) -> Result<JsonRpcResponse> {
    if event_stream {
        for event in parse_events(body.as_bytes()) {
            if let Some(response) = codec::decode_message(&event.data)? {
                if &response.id == id {
                    return Ok(response);
                }
            }
        }
        return Err(McpError::protocol(format!(
            "event stream contained no response for request {}",
            id
        )));
    }

    match codec::decode_message(body)? {
        Some(response) if &response.id == id => Ok(response),
        Some(response) => Err(McpError::protocol(format!(
            "response id {} does not match request id {}",
            response.id, id
        ))),
        None => Err(McpError::protocol("empty response body")),
    }
}

/// JSON-RPC over plain HTTP POST
pub struct HttpConnection {
    configuration_id: String,
    endpoint: HttpEndpoint,
    client_name: String,
    connected: bool,
    session_id: Option<String>,
    session: Option<SessionInfo>,
}

impl HttpConnection {
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
            client_name: config.client_name.clone(),
            connected: false,
            session_id: None,
            session: None,
        }
    }

    /// Server-assigned session id, once the handshake has produced one
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn post_envelope<B: Serialize + ?Sized>(&mut self, body: &B) -> Result<Response> {
        let session_id = self.session_id.clone();
        let response = self
            .endpoint
            .post(body, |builder| {
                let builder = builder.header(ACCEPT, "application/json, text/event-stream");
                match session_id.as_deref() {
                    Some(id) => builder.header(SESSION_HEADER, id),
                    None => builder,
                }
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND && self.session_id.is_some() {
            warn!(configuration_id = %self.configuration_id, "HTTP session expired");
            self.session_id = None;
            self.connected = false;
            return Err(McpError::connection("MCP session expired"));
        }

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if self.session_id.as_deref() != Some(id) {
                debug!(configuration_id = %self.configuration_id, "Captured MCP session id");
                self.session_id = Some(id.to_string());
            }
        }

        error_for_status(response).await
    }

    async fn request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self.post_envelope(request).await?;
        let event_stream = is_event_stream(&response);
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, self.endpoint.timeout))?;
        debug!(
            configuration_id = %self.configuration_id,
            body = %truncate_for_log(&body, 1000),
            "HTTP response"
        );
        decode_body(&body, event_stream, &request.id)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn connect(&mut self) -> Result<()> {
        let request = codec::initialize_request(&self.client_name, CLIENT_VERSION);
        match self.request(&request).await.and_then(codec::into_result) {
            Ok(result) => {
                let result = codec::parse_initialize(result)?;
                self.session = Some(SessionInfo::from(result));
                self.connected = true;
                self.send_notification(&codec::initialized_notification()).await?;
            }
            // Plain JSON-RPC endpoints without the MCP handshake
            Err(McpError::Protocol { message }) => {
                debug!(
                    configuration_id = %self.configuration_id,
                    %message,
                    "Server does not support initialize, continuing without session"
                );
                self.connected = true;
            }
            Err(error) => return Err(error),
        }

        info!(
            configuration_id = %self.configuration_id,
            endpoint = %self.endpoint.url,
            "HTTP MCP connection established"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let result = self
                .endpoint
                .client
                .delete(&self.endpoint.url)
                .header(SESSION_HEADER, session_id)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if let Err(e) = result {
                debug!(configuration_id = %self.configuration_id, error = %e, "Session teardown failed");
            }
        }
        self.connected = false;
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_authenticated(&self) -> bool {
        self.endpoint.is_authenticated()
    }

    async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.connected {
            return Err(McpError::connection("HTTP connection is not established"));
        }
        self.request(request).await
    }

    async fn send_notification(&mut self, notification: &JsonRpcNotification) -> Result<()> {
        self.post_envelope(notification).await.map(|_| ())
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Http,
            endpoint: self.endpoint.url.clone(),
            supports_reconnection: true,
        }
    }

    fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }
}
