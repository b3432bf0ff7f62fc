//! Inbound API of the connection layer
//!
//! [`McpManager`] is the composition root: it owns the connection pool, the
//! circuit breakers, the tool cache, the health tracker and the audit sink,
//! and exposes the three operations an orchestrator needs:
//!
//! - `call_tool(configuration, tool_name, arguments)`
//! - `discover_tools(configuration, force)`
//! - `test_connection(configuration)`
//!
//! Each comes in two flavours. The `try_*` methods return
//! [`Result`](crate::Result) for programmatic callers; the plain methods
//! convert terminal errors into an [`Outcome::Failure`] so the orchestrator
//! always receives a value.
//!
//! # Call flow
//!
//! ```text
//! call_tool → enabled? → circuit breaker → pool.acquire → retry(tools/call)
//!           → breaker + health bookkeeping → audit record → result
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_conduit::config::{ServerConfiguration, StdioSettings, TransportSettings};
//! use mcp_conduit::McpManager;
//! use serde_json::json;
//!
//! # async fn example() -> mcp_conduit::Result<()> {
//! let manager = McpManager::builder().build()?;
//! let configuration = ServerConfiguration::new(
//!     "cfg-1",
//!     "owner-1",
//!     "echo",
//!     TransportSettings::Stdio(StdioSettings::new("echo-mcp")),
//! );
//!
//! let tools = manager.try_discover_tools(&configuration, false).await?;
//! let result = manager
//!     .try_call_tool(&configuration, &tools[0].name, json!({"text": "hi"}))
//!     .await?;
//! println!("{}", result.text());
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditRecord, AuditSink, TracingAuditSink};
use crate::config::{ConduitConfig, ServerConfiguration};
use crate::error::{ErrorResult, McpError, Result};
use crate::error_recovery::{CircuitBreakerRegistry, CircuitPermit, CircuitSnapshot, RetryPolicy};
use crate::health::{ConfigurationHealth, HealthStatus, HealthTracker};
use crate::mcp::transport::{self, ConnectionFactory, DefaultConnectionFactory, SessionInfo, TransportInfo};
use crate::mcp::types::{ToolCallResult, ToolDescriptor};
use crate::pool::{ConnectionKey, ConnectionPool, PoolEntryStatus};
use crate::store::{ConfigurationStore, MemoryConfigurationStore};
use crate::tools::ToolRegistry;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value returned at the orchestration boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Success(T),
    Failure(ErrorResult),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn error(&self) -> Option<&ErrorResult> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error),
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Failure(error.to_error_result()),
        }
    }
}

/// Result of `test_connection`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestReport {
    pub transport: TransportInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    /// Whether the server answered `ping`; a server that rejects the
    /// method is still reachable
    pub ping_supported: bool,
    pub latency_ms: u64,
}

/// Pool entry joined with the health and circuit state of its configuration
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    #[serde(flatten)]
    pub connection: PoolEntryStatus,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitSnapshot>,
}

/// Errors that say nothing about the server's availability
fn counts_as_server_failure(error: &McpError) -> bool {
    !matches!(
        error,
        McpError::ToolExecution { .. } | McpError::Configuration { .. } | McpError::CircuitOpen { .. }
    )
}

fn ensure_enabled(configuration: &ServerConfiguration) -> Result<()> {
    if configuration.enabled {
        Ok(())
    } else {
        Err(McpError::configuration(format!(
            "Configuration '{}' is disabled",
            configuration.id
        )))
    }
}

pub struct McpManager {
    config: Arc<ConduitConfig>,
    retry: RetryPolicy,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    registry: ToolRegistry,
    health: HealthTracker,
    store: Arc<dyn ConfigurationStore>,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl McpManager {
    pub fn builder() -> McpManagerBuilder {
        McpManagerBuilder::new()
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn tool_registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn health(&self, configuration: &ServerConfiguration) -> Option<ConfigurationHealth> {
        self.health
            .snapshot(&ConnectionKey::for_configuration(configuration))
            .await
    }

    pub fn circuit(&self, configuration: &ServerConfiguration) -> Option<CircuitSnapshot> {
        self.breakers
            .snapshot(&ConnectionKey::for_configuration(configuration).to_string())
    }

    /// Invoke a tool, returning a value even on failure
    pub async fn call_tool(
        &self,
        configuration: &ServerConfiguration,
        tool_name: &str,
        arguments: Value,
    ) -> Outcome<ToolCallResult> {
        self.try_call_tool(configuration, tool_name, arguments)
            .await
            .into()
    }

    pub async fn try_call_tool(
        &self,
        configuration: &ServerConfiguration,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult> {
        ensure_enabled(configuration)?;
        let key = ConnectionKey::for_configuration(configuration);
        let permit = self.breakers.check(&key.to_string())?;

        let started = Instant::now();
        let outcome = async {
            let mut pooled = self.pool.acquire(configuration).await?;
            transport::call_tool(pooled.connection(), &self.retry, tool_name, &arguments).await
        }
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.record_outcome(&key, permit, &outcome).await;

        let record = match &outcome {
            Ok(result) => AuditRecord::success(
                &configuration.owner_id,
                &configuration.id,
                tool_name,
                arguments,
                serde_json::to_value(result).unwrap_or(Value::Null),
                duration_ms,
            ),
            Err(error) => AuditRecord::failure(
                &configuration.owner_id,
                &configuration.id,
                tool_name,
                arguments,
                error,
                duration_ms,
            ),
        };
        if let Err(e) = self.audit.record(&record).await {
            warn!(configuration_id = %configuration.id, error = %e, "Failed to write audit record");
        }

        match &outcome {
            Ok(_) => debug!(key = %key, tool_name, duration_ms, "Tool call succeeded"),
            Err(error) => warn!(key = %key, tool_name, duration_ms, error = %error, "Tool call failed"),
        }
        outcome
    }

    /// List a server's tools, served from cache within the TTL unless `force`
    pub async fn discover_tools(
        &self,
        configuration: &ServerConfiguration,
        force: bool,
    ) -> Outcome<Vec<ToolDescriptor>> {
        self.try_discover_tools(configuration, force).await.into()
    }

    pub async fn try_discover_tools(
        &self,
        configuration: &ServerConfiguration,
        force: bool,
    ) -> Result<Vec<ToolDescriptor>> {
        ensure_enabled(configuration)?;
        let key = ConnectionKey::for_configuration(configuration);

        if !force {
            if let Some(cached) = self.registry.get(&key).await {
                debug!(key = %key, count = cached.tools.len(), "Serving tools from cache");
                return Ok(cached.tools.as_ref().clone());
            }
        }

        let permit = self.breakers.check(&key.to_string())?;
        let outcome = async {
            let mut pooled = self.pool.acquire(configuration).await?;
            transport::discover_tools(pooled.connection(), &self.retry).await
        }
        .await;
        self.record_outcome(&key, permit, &outcome).await;

        let tools = outcome?;
        info!(key = %key, count = tools.len(), force, "Discovered tools");
        let cached = self.registry.insert(key, tools).await;
        self.record_discovery(configuration, cached.tools.len()).await;
        Ok(cached.tools.as_ref().clone())
    }

    /// Connect, handshake and ping, reporting what the server said
    pub async fn test_connection(&self, configuration: &ServerConfiguration) -> Outcome<ConnectionTestReport> {
        self.try_test_connection(configuration).await.into()
    }

    pub async fn try_test_connection(&self, configuration: &ServerConfiguration) -> Result<ConnectionTestReport> {
        ensure_enabled(configuration)?;
        let key = ConnectionKey::for_configuration(configuration);
        let permit = self.breakers.check(&key.to_string())?;

        let started = Instant::now();
        let outcome = async {
            let mut pooled = self.pool.acquire(configuration).await?;
            let connection = pooled.connection();
            if !connection.is_connected() {
                self.retry
                    .execute("connect", connection, |connection| {
                        Box::pin(async move { connection.connect().await })
                    })
                    .await?;
            }

            let ping_supported = match transport::ping(connection, &self.retry).await {
                Ok(()) => true,
                Err(McpError::Protocol { message }) => {
                    debug!(key = %key, %message, "Server does not support ping");
                    false
                }
                Err(error) => return Err(error),
            };

            Ok(ConnectionTestReport {
                transport: connection.transport_info(),
                session: connection.session().cloned(),
                ping_supported,
                latency_ms: started.elapsed().as_millis() as u64,
            })
        }
        .await;
        self.record_outcome(&key, permit, &outcome).await;
        outcome
    }

    /// Every pooled connection with its configuration's health and circuit state
    pub async fn pool_status(&self) -> Vec<ConnectionStatus> {
        let mut statuses = Vec::new();
        for entry in self.pool.pool_status().await {
            let health = self.health.status(&entry.key).await;
            let circuit = self.breakers.snapshot(&entry.key.to_string());
            statuses.push(ConnectionStatus {
                connection: entry,
                health,
                circuit,
            });
        }
        statuses
    }

    /// Start idle reclamation and cache maintenance; call once per manager
    pub fn start_background_tasks(&self) {
        let interval = self.config.pool.reap_interval;
        let reaper = self
            .pool
            .spawn_reaper(interval, self.config.pool.idle_timeout, self.cancel.child_token());

        let registry = self.registry.clone();
        let breakers = self.breakers.clone();
        let cancel = self.cancel.child_token();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = registry.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "Purged expired tool cache entries");
                        }
                        breakers.prune();
                    }
                }
            }
        });

        match self.background.lock() {
            Ok(mut handles) => handles.extend([reaper, maintenance]),
            Err(_) => warn!("Background task list poisoned, tasks will not be joined on shutdown"),
        }
        info!(interval_secs = interval.as_secs(), "Started background maintenance");
    }

    /// Stop background tasks and disconnect every pooled connection
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pool.shutdown().await;
    }

    /// Settle the breaker permit and health for one finished operation
    ///
    /// Outcomes that say nothing about the server release the permit
    /// unsettled, freeing a half-open trial slot for the next caller.
    async fn record_outcome<T>(&self, key: &ConnectionKey, permit: CircuitPermit, outcome: &Result<T>) {
        match outcome {
            Err(error) if counts_as_server_failure(error) => {
                permit.record_failure();
                self.health.record_failure(key, error).await;
            }
            Err(McpError::ToolExecution { .. }) | Ok(_) => {
                permit.record_success();
                self.health.record_success(key).await;
            }
            Err(_) => drop(permit),
        }
    }

    async fn record_discovery(&self, configuration: &ServerConfiguration, tool_count: usize) {
        let updates = [
            ("last_discovery_at", json!(Utc::now().to_rfc3339())),
            ("tool_count", json!(tool_count)),
        ];
        for (field, value) in updates {
            if let Err(e) = self.store.update_metadata(&configuration.id, field, value).await {
                warn!(configuration_id = %configuration.id, field, error = %e, "Failed to record discovery metadata");
            }
        }
    }
}

/// Assembles an [`McpManager`], defaulting every collaborator it is not given
#[derive(Default)]
pub struct McpManagerBuilder {
    config: Option<ConduitConfig>,
    store: Option<Arc<dyn ConfigurationStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    factory: Option<Arc<dyn ConnectionFactory>>,
}

impl McpManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ConduitConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConfigurationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the built-in transports, mainly for tests and custom transports
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<McpManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryConfigurationStore::new()));
        let factory: Arc<dyn ConnectionFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultConnectionFactory::new(config.clone(), store.clone())?),
        };

        Ok(McpManager {
            retry: RetryPolicy::from(&config.retry),
            pool: Arc::new(ConnectionPool::new(factory)),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            registry: ToolRegistry::new(config.tools.cache_ttl),
            health: HealthTracker::new(config.health.failure_threshold, store.clone()),
            store,
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink::default())),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditStatus, MemoryAuditSink};
    use crate::config::{CircuitBreakerSettings, RetrySettings, StdioSettings, TransportSettings};
    use crate::mcp::transport::test_support::ScriptedConnection;
    use crate::mcp::transport::Connection;
    use crate::mcp::types::JsonRpcRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Hands every scripted reply to the first connection it creates
    #[derive(Default)]
    struct ScriptedFactory {
        replies: Mutex<Vec<std::result::Result<Value, McpError>>>,
        requests: Arc<Mutex<Vec<JsonRpcRequest>>>,
        created: AtomicU32,
    }

    impl ScriptedFactory {
        fn new(replies: Vec<std::result::Result<Value, McpError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                ..Self::default()
            })
        }

        fn methods(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.method.clone())
                .collect()
        }
    }

    impl ConnectionFactory for ScriptedFactory {
        fn create(&self, _configuration: &ServerConfiguration) -> Result<Box<dyn Connection>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let replies = std::mem::take(&mut *self.replies.lock().unwrap());
            let mut connection = ScriptedConnection::new(replies);
            connection.requests = self.requests.clone();
            Ok(Box::new(connection))
        }
    }

    struct Harness {
        manager: McpManager,
        factory: Arc<ScriptedFactory>,
        store: Arc<MemoryConfigurationStore>,
        audit: MemoryAuditSink,
    }

    fn harness(replies: Vec<std::result::Result<Value, McpError>>) -> Harness {
        let config = ConduitConfig {
            retry: RetrySettings {
                max_retries: 0,
                ..RetrySettings::default()
            },
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            ..ConduitConfig::default()
        };
        let factory = ScriptedFactory::new(replies);
        let store = Arc::new(MemoryConfigurationStore::new());
        let audit = MemoryAuditSink::new();
        let manager = McpManager::builder()
            .config(config)
            .store(store.clone())
            .audit_sink(Arc::new(audit.clone()))
            .connection_factory(factory.clone())
            .build()
            .unwrap();
        Harness {
            manager,
            factory,
            store,
            audit,
        }
    }

    fn configuration() -> ServerConfiguration {
        ServerConfiguration::new(
            "cfg-1",
            "owner-1",
            "echo",
            TransportSettings::Stdio(StdioSettings::new("echo-mcp")),
        )
    }

    fn text_result(text: &str) -> Value {
        json!({"content": [{"type": "text", "text": text}]})
    }

    #[tokio::test]
    async fn test_call_tool_success_is_audited() {
        let h = harness(vec![Ok(text_result("hello"))]);
        let result = h
            .manager
            .try_call_tool(&configuration(), "echo", json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "hello");

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Success);
        assert_eq!(records[0].tool_name, "echo");
        assert_eq!(records[0].request, json!({"text": "hello"}));
        assert_eq!(h.manager.health(&configuration()).await.unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_then_recovers_after_cooldown() {
        let h = harness(vec![
            Err(McpError::connection("refused")),
            Err(McpError::connection("refused")),
            Ok(text_result("back")),
        ]);
        let config = configuration();

        for _ in 0..2 {
            let error = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap_err();
            assert!(matches!(error, McpError::Connection { .. }));
        }

        let error = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap_err();
        match error {
            McpError::CircuitOpen { failure_count, .. } => assert_eq!(failure_count, 2),
            other => panic!("expected open circuit, got {:?}", other),
        }
        assert_eq!(h.factory.methods().len(), 2);
        assert_eq!(h.manager.health(&config).await.unwrap().status, HealthStatus::Degraded);

        tokio::time::advance(Duration::from_secs(60)).await;
        let result = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap();
        assert_eq!(result.text(), "back");

        let circuit = h.manager.circuit(&config).unwrap();
        assert_eq!(circuit.state, "closed");
        assert_eq!(circuit.failure_count, 0);
    }

    async fn open_circuit(h: &Harness, config: &ServerConfiguration) {
        for _ in 0..2 {
            let error = h.manager.try_call_tool(config, "echo", json!({})).await.unwrap_err();
            assert!(matches!(error, McpError::Connection { .. }));
        }
        assert_eq!(h.manager.circuit(config).unwrap().state, "open");
        tokio::time::advance(Duration::from_secs(60)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconclusive_trial_does_not_hold_the_circuit_half_open() {
        let h = harness(vec![
            Err(McpError::connection("refused")),
            Err(McpError::connection("refused")),
            Err(McpError::configuration("environment variable TOKEN is not set")),
            Ok(text_result("back")),
        ]);
        let config = configuration();
        open_circuit(&h, &config).await;

        let error = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap_err();
        assert!(matches!(error, McpError::Configuration { .. }));
        let circuit = h.manager.circuit(&config).unwrap();
        assert_eq!(circuit.state, "half-open");
        assert_eq!(circuit.retry_after_secs, None);

        let result = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap();
        assert_eq!(result.text(), "back");
        let circuit = h.manager.circuit(&config).unwrap();
        assert_eq!(circuit.state, "closed");
        assert_eq!(circuit.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_hold_the_circuit_half_open() {
        let h = harness(vec![
            Err(McpError::connection("refused")),
            Err(McpError::connection("refused")),
            Ok(text_result("back")),
        ]);
        let config = configuration();
        open_circuit(&h, &config).await;

        // The trial waits on a busy pool slot until the caller gives up
        let held = h.manager.pool().acquire(&config).await.unwrap();
        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            h.manager.try_call_tool(&config, "echo", json!({})),
        )
        .await;
        assert!(cancelled.is_err());
        drop(held);

        let result = h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap();
        assert_eq!(result.text(), "back");
        assert_eq!(h.manager.circuit(&config).unwrap().state, "closed");
    }

    #[tokio::test]
    async fn test_health_is_tracked_per_owner() {
        let h = harness(vec![Err(McpError::connection("refused"))]);
        let config = configuration();
        let mut other_owner = configuration();
        other_owner.owner_id = "owner-2".to_string();

        h.manager.try_call_tool(&config, "echo", json!({})).await.unwrap_err();
        assert_eq!(h.manager.health(&config).await.unwrap().status, HealthStatus::Degraded);
        assert!(h.manager.health(&other_owner).await.is_none());
    }

    #[tokio::test]
    async fn test_tool_errors_do_not_trip_the_circuit() {
        let failing = json!({"content": [{"type": "text", "text": "no such file"}], "isError": true});
        let h = harness(vec![Ok(failing.clone()), Ok(failing.clone()), Ok(failing)]);
        let config = configuration();

        for _ in 0..3 {
            let error = h.manager.try_call_tool(&config, "read", json!({})).await.unwrap_err();
            assert!(matches!(error, McpError::ToolExecution { .. }));
        }
        assert_eq!(h.factory.methods().len(), 3);
        assert_eq!(h.audit.records()[2].status, AuditStatus::Error);
    }

    #[tokio::test]
    async fn test_discovery_is_cached_until_forced() {
        let h = harness(vec![
            Ok(json!({"tools": [{"name": "echo"}]})),
            Ok(json!({"tools": [{"name": "echo"}, {"name": "reverse"}]})),
        ]);
        let config = configuration();

        assert_eq!(h.manager.try_discover_tools(&config, false).await.unwrap().len(), 1);
        assert_eq!(h.manager.try_discover_tools(&config, false).await.unwrap().len(), 1);
        assert_eq!(h.factory.methods(), ["tools/list"]);

        assert_eq!(h.manager.try_discover_tools(&config, true).await.unwrap().len(), 2);
        assert_eq!(h.factory.methods(), ["tools/list", "tools/list"]);
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);

        let metadata = h.store.metadata("cfg-1").await;
        assert_eq!(metadata["tool_count"], json!(2));
        assert!(metadata.contains_key("last_discovery_at"));
    }

    #[tokio::test]
    async fn test_disabled_configuration_never_connects() {
        let h = harness(vec![]);
        let mut config = configuration();
        config.enabled = false;

        let outcome = h.manager.discover_tools(&config, false).await;
        assert_eq!(outcome.error().unwrap().kind, "configuration");
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_marks_unhealthy() {
        let h = harness(vec![Err(McpError::authentication("token revoked"))]);
        let outcome = h.manager.call_tool(&configuration(), "echo", json!({})).await;

        let error = outcome.error().unwrap();
        assert_eq!(error.kind, "authentication");
        assert!(!error.retryable);

        let stored = h.store.status("cfg-1").await.unwrap();
        assert_eq!(stored.status, HealthStatus::Unhealthy);
        assert!(stored.last_error.unwrap().contains("token revoked"));
    }

    #[tokio::test]
    async fn test_connection_test_tolerates_missing_ping() {
        let h = harness(vec![Err(McpError::protocol("Method not found"))]);
        let report = h.manager.try_test_connection(&configuration()).await.unwrap();

        assert!(!report.ping_supported);
        assert_eq!(report.transport.endpoint, "scripted");
        assert_eq!(h.factory.methods(), ["ping"]);

        let status = h.manager.pool_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].health, HealthStatus::Healthy);
        assert_eq!(status[0].connection.connected, Some(true));
    }

    #[test]
    fn test_outcome_serializes_untagged() {
        let ok = Outcome::from(Ok::<_, McpError>(json!({"content": []})));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"content": []}));

        let failed: Outcome<Value> =
            Outcome::from(Err(McpError::rate_limit("slow down", Some(Duration::from_secs(3)))));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["kind"], "rate_limit");
        assert_eq!(value["retry_after_secs"], 3);
        assert!(value["error"].as_str().unwrap().contains("slow down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_stop_on_shutdown() {
        let h = harness(vec![]);
        h.manager.start_background_tasks();
        h.manager.try_test_connection(&configuration()).await.unwrap();
        assert_eq!(h.manager.pool().len().await, 1);

        h.manager.shutdown().await;
        assert!(h.manager.pool().is_empty().await);
    }
}
