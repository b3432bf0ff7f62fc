//! Process-wide registry of live MCP connections
//!
//! The pool keeps at most one connection per [`ConnectionKey`] and hands it
//! out exclusively: a caller holds a [`PooledConnection`] for the duration of
//! an operation and other callers for the same key wait until it is dropped.
//! Connections are kept warm between calls and reclaimed once idle.
//!
//! # Connection Lifecycle
//!
//! 1. **Acquisition** - the existing connection for the key, or a new one from
//!    the [`ConnectionFactory`]
//! 2. **Usage** - the holder drives requests through `&mut dyn Connection`
//! 3. **Return** - dropping the [`PooledConnection`] stamps `last_used` and
//!    frees the slot for the next waiter
//! 4. **Recycling** - a stale connection (an idle stdio process) is replaced
//!    on the next acquisition
//! 5. **Expiration** - [`ConnectionPool::reap_idle`] disconnects and removes
//!    entries idle beyond the timeout
//!
//! ```rust,no_run
//! use mcp_conduit::config::ServerConfiguration;
//! use mcp_conduit::pool::ConnectionPool;
//!
//! # async fn example(pool: &ConnectionPool, configuration: &ServerConfiguration) -> mcp_conduit::Result<()> {
//! let mut pooled = pool.acquire(configuration).await?;
//! let connected = pooled.connection().is_connected();
//! // Returned to the pool here
//! drop(pooled);
//! # let _ = connected;
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfiguration;
use crate::error::{McpError, Result};
use crate::mcp::transport::{Connection, ConnectionFactory, TransportInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identity of a pooled connection: one per owner and configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub owner_id: String,
    pub configuration_id: String,
}

impl ConnectionKey {
    pub fn new(owner_id: impl Into<String>, configuration_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            configuration_id: configuration_id.into(),
        }
    }

    pub fn for_configuration(configuration: &ServerConfiguration) -> Self {
        Self::new(&configuration.owner_id, &configuration.id)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.configuration_id)
    }
}

/// A live connection plus the bookkeeping the reaper needs
struct PoolEntry {
    connection: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl PoolEntry {
    fn new(connection: Box<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Per-key slot; its mutex is what serializes callers for the same key
type Slot = Arc<Mutex<Option<PoolEntry>>>;

/// Exclusive handle on a pooled connection
///
/// Dropping the handle returns the connection to the pool.
pub struct PooledConnection {
    key: ConnectionKey,
    entry: OwnedMappedMutexGuard<Option<PoolEntry>, PoolEntry>,
    acquired_at: Instant,
}

impl PooledConnection {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.entry.connection.as_mut()
    }

    /// How many times this connection has been handed out, this time included
    pub fn use_count(&self) -> u64 {
        self.entry.use_count
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.entry.last_used = Instant::now();
        debug!(
            key = %self.key,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Returned connection to pool"
        );
    }
}

/// Observability snapshot of one pool entry
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntryStatus {
    pub key: ConnectionKey,
    /// Held by a caller right now; the remaining fields are unknown while in use
    pub in_use: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportInfo>,
}

/// Connection pool keyed by `(owner, configuration)`
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get exclusive use of the connection for `configuration`
    ///
    /// Waits while another caller holds the same key. A missing or stale
    /// connection is (re)created from the factory; connecting is left to the
    /// first request so it runs under the caller's retry policy.
    pub async fn acquire(&self, configuration: &ServerConfiguration) -> Result<PooledConnection> {
        let key = ConnectionKey::for_configuration(configuration);

        let mut guard = loop {
            let slot = {
                let mut slots = self.slots.lock().await;
                slots.entry(key.clone()).or_default().clone()
            };
            let guard = slot.clone().lock_owned().await;

            // The slot may have been reaped while we were waiting on it
            let current = {
                let slots = self.slots.lock().await;
                slots.get(&key).map_or(false, |s| Arc::ptr_eq(s, &slot))
            };
            if current {
                break guard;
            }
            debug!(key = %key, "Slot was reclaimed while waiting, retrying");
        };

        if let Some(entry) = guard.as_mut() {
            if entry.connection.is_stale() {
                info!(key = %key, idle_secs = entry.idle_time().as_secs(), "Recycling stale connection");
                entry.connection.disconnect().await;
                *guard = None;
            }
        }

        if guard.is_none() {
            let connection = self.factory.create(configuration)?;
            debug!(key = %key, transport = %connection.transport_info().transport_type, "Created pooled connection");
            *guard = Some(PoolEntry::new(connection));
        }

        let mut entry = OwnedMutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| McpError::connection(format!("pool slot for {} is empty", key)))?;
        entry.use_count += 1;
        debug!(key = %key, use_count = entry.use_count, "Acquired pooled connection");

        Ok(PooledConnection {
            key,
            entry,
            acquired_at: Instant::now(),
        })
    }

    /// Hand a connection back explicitly; equivalent to dropping it
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Snapshot of every tracked key without waiting on busy entries
    pub async fn pool_status(&self) -> Vec<PoolEntryStatus> {
        let slots = self.slots.lock().await;
        let mut statuses: Vec<PoolEntryStatus> = slots
            .iter()
            .filter_map(|(key, slot)| match slot.try_lock() {
                Ok(guard) => guard.as_ref().map(|entry| PoolEntryStatus {
                    key: key.clone(),
                    in_use: false,
                    connected: Some(entry.connection.is_connected()),
                    idle_secs: Some(entry.idle_time().as_secs()),
                    age_secs: Some(entry.created_at.elapsed().as_secs()),
                    use_count: Some(entry.use_count),
                    transport: Some(entry.connection.transport_info()),
                }),
                Err(_) => Some(PoolEntryStatus {
                    key: key.clone(),
                    in_use: true,
                    connected: None,
                    idle_secs: None,
                    age_secs: None,
                    use_count: None,
                    transport: None,
                }),
            })
            .collect();
        statuses.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        statuses
    }

    /// Number of keys currently tracked
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect and remove every entry idle for at least `idle_timeout`
    ///
    /// Entries held by a caller are never touched. Returns how many entries
    /// were removed.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<(ConnectionKey, Option<PoolEntry>)> = {
            let mut slots = self.slots.lock().await;
            let mut expired = Vec::new();
            slots.retain(|key, slot| {
                let Ok(mut guard) = slot.try_lock() else {
                    return true;
                };
                let idle = guard
                    .as_ref()
                    .map_or(true, |entry| entry.idle_time() >= idle_timeout);
                if idle {
                    expired.push((key.clone(), guard.take()));
                }
                !idle
            });
            expired
        };

        let count = expired.len();
        for (key, entry) in expired {
            if let Some(mut entry) = entry {
                info!(key = %key, idle_secs = entry.idle_time().as_secs(), "Reclaiming idle connection");
                entry.connection.disconnect().await;
            }
        }
        if count > 0 {
            debug!(count, "Idle reclamation finished");
        }
        count
    }

    /// Drop a key's connection, waiting for its current holder first
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        let slot = self.slots.lock().await.remove(key);
        match slot {
            Some(slot) => {
                if let Some(mut entry) = slot.lock().await.take() {
                    entry.connection.disconnect().await;
                }
                true
            }
            None => false,
        }
    }

    /// Run [`ConnectionPool::reap_idle`] every `interval` until cancelled or
    /// until the pool itself is dropped
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.reap_idle(idle_timeout).await;
                    }
                }
            }
            debug!("Pool reaper stopped");
        })
    }

    /// Disconnect every connection, waiting for in-flight holders
    pub async fn shutdown(&self) -> usize {
        let slots: Vec<(ConnectionKey, Slot)> = self.slots.lock().await.drain().collect();
        let count = slots.len();
        for (key, slot) in slots {
            if let Some(mut entry) = slot.lock().await.take() {
                debug!(key = %key, "Disconnecting on shutdown");
                entry.connection.disconnect().await;
            }
        }
        info!(count, "Connection pool shut down");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StdioSettings, TransportSettings};
    use crate::mcp::transport::test_support::ScriptedConnection;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicU32,
        stale: AtomicBool,
    }

    impl ConnectionFactory for CountingFactory {
        fn create(&self, _configuration: &ServerConfiguration) -> Result<Box<dyn Connection>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut connection = ScriptedConnection::new(vec![]);
            connection.stale = self.stale.load(Ordering::SeqCst);
            Ok(Box::new(connection))
        }
    }

    fn configuration(owner: &str, id: &str) -> ServerConfiguration {
        ServerConfiguration::new(
            id,
            owner,
            "echo",
            TransportSettings::Stdio(StdioSettings::new("echo-mcp")),
        )
    }

    fn pool() -> (Arc<ConnectionPool>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        (Arc::new(ConnectionPool::new(factory.clone())), factory)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ConnectionKey::new("owner-1", "cfg-9").to_string(), "owner-1/cfg-9");
    }

    #[tokio::test]
    async fn test_reuses_connection_for_same_key() {
        let (pool, factory) = pool();
        let config = configuration("owner", "cfg");

        let mut first = pool.acquire(&config).await.unwrap();
        first.connection().connect().await.unwrap();
        pool.release(first);

        let mut second = pool.acquire(&config).await.unwrap();
        assert!(second.connection().is_connected());
        assert_eq!(second.use_count(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_connections() {
        let (pool, factory) = pool();
        let _a = pool.acquire(&configuration("owner-a", "cfg")).await.unwrap();
        let _b = pool.acquire(&configuration("owner-b", "cfg")).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_waits_for_holder() {
        let (pool, factory) = pool();
        let config = configuration("owner", "cfg");
        let held = pool.acquire(&config).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let config = config.clone();
            tokio::spawn(async move { pool.acquire(&config).await.map(|p| p.use_count()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let use_count = waiter.await.unwrap().unwrap();
        assert_eq!(use_count, 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_is_recycled() {
        let (pool, factory) = pool();
        factory.stale.store(true, Ordering::SeqCst);
        let config = configuration("owner", "cfg");

        drop(pool.acquire(&config).await.unwrap());
        let pooled = pool.acquire(&config).await.unwrap();

        assert_eq!(pooled.use_count(), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_skips_busy_and_fresh_entries() {
        let (pool, _factory) = pool();
        drop(pool.acquire(&configuration("owner", "idle")).await.unwrap());
        let busy = pool.acquire(&configuration("owner", "busy")).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        drop(pool.acquire(&configuration("owner", "fresh")).await.unwrap());

        assert_eq!(pool.reap_idle(Duration::from_secs(300)).await, 1);

        let status = pool.pool_status().await;
        let keys: Vec<_> = status.iter().map(|s| s.key.configuration_id.as_str()).collect();
        assert_eq!(keys, ["busy", "fresh"]);
        assert!(status[0].in_use);
        assert_eq!(status[1].idle_secs, Some(0));
        drop(busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_reclaims_in_background() {
        let (pool, _factory) = pool();
        let cancel = CancellationToken::new();
        let handle = pool.spawn_reaper(Duration::from_secs(60), Duration::from_secs(300), cancel.clone());

        drop(pool.acquire(&configuration("owner", "cfg")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(pool.is_empty().await);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_status_reports_idle_entries() {
        let (pool, _factory) = pool();
        let mut pooled = pool.acquire(&configuration("owner", "cfg")).await.unwrap();
        pooled.connection().connect().await.unwrap();
        drop(pooled);

        let status = pool.pool_status().await;
        assert_eq!(status.len(), 1);
        assert!(!status[0].in_use);
        assert_eq!(status[0].connected, Some(true));
        assert_eq!(status[0].use_count, Some(1));
        assert_eq!(status[0].transport.as_ref().unwrap().endpoint, "scripted");
    }

    #[tokio::test]
    async fn test_shutdown_and_remove() {
        let (pool, _factory) = pool();
        drop(pool.acquire(&configuration("owner", "a")).await.unwrap());
        drop(pool.acquire(&configuration("owner", "b")).await.unwrap());

        assert!(pool.remove(&ConnectionKey::new("owner", "a")).await);
        assert!(!pool.remove(&ConnectionKey::new("owner", "a")).await);
        assert_eq!(pool.shutdown().await, 1);
        assert!(pool.is_empty().await);
    }
}
