//! End-to-end tests of the stdio path against a shell-script MCP server
//!
//! The fixture in `tests/fixtures/echo_mcp.sh` logs every start to a file so
//! the tests can count spawned processes.

#![cfg(unix)]

use mcp_conduit::audit::{AuditStatus, MemoryAuditSink};
use mcp_conduit::config::{ConduitConfig, RetrySettings, ServerConfiguration, StdioSettings, TransportSettings};
use mcp_conduit::health::HealthStatus;
use mcp_conduit::store::MemoryConfigurationStore;
use mcp_conduit::{McpError, McpManager};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    manager: McpManager,
    store: Arc<MemoryConfigurationStore>,
    audit: MemoryAuditSink,
    spawn_log: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let spawn_log = dir.path().join("spawns.log");
        let config = ConduitConfig {
            request_timeout: Duration::from_secs(10),
            retry: RetrySettings {
                initial_backoff: Duration::from_millis(20),
                ..RetrySettings::default()
            },
            ..ConduitConfig::default()
        };
        let store = Arc::new(MemoryConfigurationStore::new());
        let audit = MemoryAuditSink::new();
        let manager = McpManager::builder()
            .config(config)
            .store(store.clone())
            .audit_sink(Arc::new(audit.clone()))
            .build()
            .unwrap();

        Self {
            manager,
            store,
            audit,
            spawn_log,
            _dir: dir,
        }
    }

    fn configuration(&self, id: &str) -> ServerConfiguration {
        let script = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/echo_mcp.sh");
        ServerConfiguration::new(
            id,
            "owner-1",
            "echo-mcp",
            TransportSettings::Stdio(
                StdioSettings::new("sh")
                    .with_args([script.to_string_lossy().to_string()])
                    .with_env("ECHO_MCP_SPAWN_LOG", self.spawn_log.to_string_lossy()),
            ),
        )
    }

    fn spawn_count(&self) -> usize {
        std::fs::read_to_string(&self.spawn_log)
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn test_discovery_is_cached_within_ttl_and_refreshed_on_force() {
    let fixture = Fixture::new();
    let configuration = fixture.configuration("cfg-discover");

    let first = fixture.manager.try_discover_tools(&configuration, false).await.unwrap();
    let names: Vec<_> = first.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["echo", "fail", "crash"]);
    assert_eq!(first[0].description.as_deref(), Some("listing 1"));
    assert_eq!(fixture.spawn_count(), 1);

    let cached = fixture.manager.try_discover_tools(&configuration, false).await.unwrap();
    assert_eq!(cached, first);
    assert_eq!(fixture.spawn_count(), 1);

    let refreshed = fixture.manager.try_discover_tools(&configuration, true).await.unwrap();
    assert_eq!(refreshed[0].description.as_deref(), Some("listing 2"));
    assert_eq!(fixture.spawn_count(), 1);

    let metadata = fixture.store.metadata("cfg-discover").await;
    assert_eq!(metadata["tool_count"], json!(3));

    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_tool_calls_share_one_process_and_are_audited() {
    let fixture = Fixture::new();
    let configuration = fixture.configuration("cfg-call");

    let result = fixture
        .manager
        .try_call_tool(&configuration, "echo", json!({"text": "ping"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "pong");

    let outcome = fixture.manager.call_tool(&configuration, "fail", json!({})).await;
    let error = outcome.error().unwrap();
    assert_eq!(error.kind, "tool_execution");
    assert!(error.error.contains("deliberate failure"));

    assert_eq!(fixture.spawn_count(), 1);
    let records = fixture.audit.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, AuditStatus::Success);
    assert_eq!(records[1].status, AuditStatus::Error);
    assert_eq!(fixture.manager.health(&configuration).await.unwrap().status, HealthStatus::Healthy);

    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_connection_report_includes_server_identity() {
    let fixture = Fixture::new();
    let report = fixture
        .manager
        .try_test_connection(&fixture.configuration("cfg-test"))
        .await
        .unwrap();

    assert!(report.ping_supported);
    let session = report.session.unwrap();
    assert_eq!(session.server_name.as_deref(), Some("echo-mcp"));
    assert_eq!(session.protocol_version.as_deref(), Some("2024-11-05"));

    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_crashing_server_stops_restarting_at_the_ceiling() {
    let fixture = Fixture::new();
    let configuration = fixture.configuration("cfg-crash");

    // Four attempts: the first process and three restarts all crash
    let error = fixture
        .manager
        .try_call_tool(&configuration, "crash", json!({}))
        .await
        .unwrap_err();
    assert!(error.is_connection_failure(), "unexpected error: {:?}", error);
    assert_eq!(fixture.spawn_count(), 4);

    let error = fixture
        .manager
        .try_call_tool(&configuration, "echo", json!({}))
        .await
        .unwrap_err();
    match error {
        McpError::ProcessCrash { exit_status, .. } => assert_eq!(exit_status, Some(3)),
        other => panic!("expected a process crash, got {:?}", other),
    }
    assert_eq!(fixture.spawn_count(), 4);
    assert_eq!(
        fixture.manager.health(&configuration).await.unwrap().status,
        HealthStatus::Degraded
    );

    fixture.manager.shutdown().await;
}
