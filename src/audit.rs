//! Side-channel audit trail for tool calls
//!
//! Every `call_tool` that reaches the pool produces one [`AuditRecord`] which
//! is handed to the configured [`AuditSink`]. Sink failures are logged and
//! never fail the call itself.

use crate::error::{McpError, Result};
use crate::utils::logging::truncate_for_log;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
}

/// One tool invocation as seen by the connection layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub configuration_id: String,
    pub tool_name: String,
    pub request: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn success(
        owner_id: &str,
        configuration_id: &str,
        tool_name: &str,
        request: Value,
        response: Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            configuration_id: configuration_id.to_string(),
            tool_name: tool_name.to_string(),
            request,
            response: Some(response),
            status: AuditStatus::Success,
            error: None,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        owner_id: &str,
        configuration_id: &str,
        tool_name: &str,
        request: Value,
        error: &McpError,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            configuration_id: configuration_id.to_string(),
            tool_name: tool_name.to_string(),
            request,
            response: None,
            status: AuditStatus::Error,
            error: Some(error.to_string()),
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Discards every record
#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Emits records as structured `tracing` events on the `mcp_conduit::audit` target
#[derive(Debug)]
pub struct TracingAuditSink {
    max_payload_len: usize,
}

impl TracingAuditSink {
    pub fn new(max_payload_len: usize) -> Self {
        Self { max_payload_len }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let request = truncate_for_log(&record.request.to_string(), self.max_payload_len);
        let response = record
            .response
            .as_ref()
            .map(|r| truncate_for_log(&r.to_string(), self.max_payload_len))
            .unwrap_or_default();
        info!(
            target: "mcp_conduit::audit",
            audit_id = %record.id,
            owner_id = %record.owner_id,
            configuration_id = %record.configuration_id,
            tool_name = %record.tool_name,
            status = ?record.status,
            duration_ms = record.duration_ms,
            error = record.error.as_deref().unwrap_or(""),
            request = %request,
            response = %response,
            "Tool call"
        );
        Ok(())
    }
}

/// Keeps records in memory, for tests and embedding hosts that batch writes
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| McpError::serialization("audit record buffer poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_keeps_records() {
        let sink = MemoryAuditSink::new();
        let ok = AuditRecord::success("owner", "cfg", "echo", json!({"text": "hi"}), json!("hi"), 12);
        let failed = AuditRecord::failure(
            "owner",
            "cfg",
            "echo",
            json!({}),
            &McpError::tool_execution("echo", "boom"),
            3,
        );

        sink.record(&ok).await.unwrap();
        sink.record(&failed).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AuditStatus::Success);
        assert_eq!(records[1].error.as_deref(), Some("Tool execution error: echo: boom"));
        assert_ne!(records[0].id, records[1].id);
    }

    #[test]
    fn test_record_serialization() {
        let record = AuditRecord::success("owner", "cfg", "echo", json!({}), json!({"ok": true}), 40);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["duration_ms"], 40);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_tracing_and_noop_sinks_accept_records() {
        let record = AuditRecord::success("owner", "cfg", "echo", json!({}), json!("x".repeat(5000)), 1);
        TracingAuditSink::default().record(&record).await.unwrap();
        NoopAuditSink.record(&record).await.unwrap();
    }
}
