//! JSON-RPC envelope construction and response decoding
//!
//! Builders for the handful of methods the connection layer speaks
//! (`initialize`, `tools/list`, `tools/call`, `ping`) plus the mapping from
//! wire-level error codes and HTTP statuses onto [`McpError`].
//!
//! | code | error |
//! | --- | --- |
//! | -32700, -32600..=-32603 | [`McpError::Protocol`] |
//! | 401, 403 | [`McpError::Authentication`] |
//! | 429 | [`McpError::RateLimit`] |
//! | 408, 504 | [`McpError::Timeout`] |
//! | anything else | [`McpError::Connection`] |

use crate::error::{McpError, Result};
use crate::mcp::types::{
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ResponsePayload, ToolCallResult, ToolDescriptor,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// MCP protocol revision sent during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Process-unique request id
pub fn next_request_id() -> Value {
    json!(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn initialize_request(client_name: &str, client_version: &str) -> JsonRpcRequest {
    JsonRpcRequest::new(
        next_request_id(),
        METHOD_INITIALIZE,
        Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_name,
                "version": client_version
            }
        })),
    )
}

pub fn initialized_notification() -> JsonRpcNotification {
    JsonRpcNotification::new(METHOD_INITIALIZED, None)
}

pub fn list_tools_request(cursor: Option<&str>) -> JsonRpcRequest {
    let params = cursor.map(|cursor| json!({ "cursor": cursor }));
    JsonRpcRequest::new(next_request_id(), METHOD_TOOLS_LIST, params)
}

pub fn call_tool_request(name: &str, arguments: &Value) -> JsonRpcRequest {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    JsonRpcRequest::new(
        next_request_id(),
        METHOD_TOOLS_CALL,
        Some(json!({ "name": name, "arguments": arguments })),
    )
}

pub fn ping_request() -> JsonRpcRequest {
    JsonRpcRequest::new(next_request_id(), METHOD_PING, None)
}

/// Parse one response envelope
pub fn parse_response(body: &str) -> Result<JsonRpcResponse> {
    serde_json::from_str(body.trim())
        .map_err(|e| McpError::protocol(format!("Invalid JSON-RPC response: {}", e)))
}

/// Decode one line or frame of server output
///
/// Server-initiated requests and notifications (anything with a `method`) are
/// not responses to us and yield `None`.
pub fn decode_message(raw: &str) -> Result<Option<JsonRpcResponse>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| McpError::protocol(format!("Invalid JSON from server: {}", e)))?;
    if value.get("method").is_some() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| McpError::protocol(format!("Invalid JSON-RPC response: {}", e)))
}

/// Unwrap a response into its `result`, mapping error payloads
pub fn into_result(response: JsonRpcResponse) -> Result<Value> {
    match response.payload {
        ResponsePayload::Success { result } => Ok(result),
        ResponsePayload::Error { error } => Err(map_rpc_error(&error)),
    }
}

/// Map a JSON-RPC error object onto the error taxonomy
pub fn map_rpc_error(error: &JsonRpcError) -> McpError {
    match error.code {
        JsonRpcError::PARSE_ERROR
        | JsonRpcError::INVALID_REQUEST
        | JsonRpcError::METHOD_NOT_FOUND
        | JsonRpcError::INVALID_PARAMS
        | JsonRpcError::INTERNAL_ERROR => McpError::protocol(format!(
            "{} (code {})",
            error.message, error.code
        )),
        401 | 403 => McpError::authentication(error.message.clone()),
        429 => McpError::rate_limit(error.message.clone(), retry_after_from_data(error.data.as_ref())),
        408 | 504 => McpError::remote_timeout(error.message.clone()),
        code => McpError::connection(format!("Server error {}: {}", code, error.message)),
    }
}

fn retry_after_from_data(data: Option<&Value>) -> Option<Duration> {
    let data = data?;
    data.get("retry_after")
        .or_else(|| data.get("retryAfter"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn map_http_status(status: u16, body: &str, retry_after: Option<Duration>) -> McpError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, crate::utils::logging::truncate_for_log(body.trim(), 500))
    };

    match status {
        401 | 403 => McpError::authentication(detail),
        429 => McpError::rate_limit(detail, retry_after),
        408 | 504 => McpError::remote_timeout(detail),
        _ => McpError::connection(detail),
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub fn parse_initialize(result: Value) -> Result<InitializeResult> {
    serde_json::from_value(result)
        .map_err(|e| McpError::protocol(format!("Invalid initialize result: {}", e)))
}

/// Parse a `tools/list` page into its tools and the next cursor
pub fn parse_tools_page(result: Value) -> Result<(Vec<ToolDescriptor>, Option<String>)> {
    let next_cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| McpError::tool_discovery("tools/list result has no 'tools' field"))?;
    let tools: Vec<ToolDescriptor> = serde_json::from_value(tools)
        .map_err(|e| McpError::tool_discovery(format!("Failed to parse tools: {}", e)))?;
    Ok((tools, next_cursor))
}

/// Parse a `tools/call` result; `isError` results become [`McpError::ToolExecution`]
pub fn parse_call_result(tool_name: &str, result: Value) -> Result<ToolCallResult> {
    let parsed: ToolCallResult = serde_json::from_value(result).map_err(|e| {
        McpError::protocol(format!("Failed to parse result of '{}': {}", tool_name, e))
    })?;

    if parsed.is_error {
        let message = parsed.text();
        return Err(McpError::tool_execution(
            tool_name,
            if message.is_empty() {
                "tool reported an error".to_string()
            } else {
                message
            },
        ));
    }
    Ok(parsed)
}
