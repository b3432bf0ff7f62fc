use crate::mcp::types::ToolDescriptor;
use crate::pool::ConnectionKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Discovered tools for one configuration and when they were fetched
#[derive(Debug, Clone)]
pub struct CachedTools {
    pub tools: Arc<Vec<ToolDescriptor>>,
    pub fetched_at: DateTime<Utc>,
    fetched: Instant,
}

impl CachedTools {
    fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: Arc::new(tools),
            fetched_at: Utc::now(),
            fetched: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched.elapsed()
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }
}

/// TTL cache of `tools/list` results keyed by connection
///
/// Expiry is checked on read; [`ToolRegistry::purge_expired`] drops stale
/// entries eagerly.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<ConnectionKey, CachedTools>>>,
}

impl ToolRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached tools for `key`, or `None` when absent or older than the TTL
    pub async fn get(&self, key: &ConnectionKey) -> Option<CachedTools> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(cached) if !cached.is_expired(self.ttl) => Some(cached.clone()),
            Some(cached) => {
                debug!(key = %key, age_secs = cached.age().as_secs(), "Tool cache entry expired");
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: ConnectionKey, tools: Vec<ToolDescriptor>) -> CachedTools {
        let cached = CachedTools::new(tools);
        debug!(key = %key, count = cached.tools.len(), "Caching discovered tools");
        self.entries.write().await.insert(key, cached.clone());
        cached
    }

    pub async fn invalidate(&self, key: &ConnectionKey) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Look up a single tool by name in an unexpired entry
    pub async fn find_tool(&self, key: &ConnectionKey, name: &str) -> Option<ToolDescriptor> {
        self.get(key)
            .await
            .and_then(|cached| cached.tools.iter().find(|tool| tool.name == name).cloned())
    }

    /// Remove every expired entry, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cached| !cached.is_expired(self.ttl));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
