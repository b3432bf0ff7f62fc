//! Configuration-level health derived from operation outcomes
//!
//! Authentication failures mark a configuration unhealthy immediately.
//! Connection failures degrade it and, after `failure_threshold` in a row,
//! mark it unhealthy. Transient failures (timeouts, rate limits) leave the
//! status alone; those only feed the circuit breaker. Any success restores
//! `Healthy`. Health is tracked per [`ConnectionKey`], so two owners sharing a
//! configuration id never mix states; status changes are written through to
//! the [`ConfigurationStore`] under the configuration id.

use crate::error::McpError;
use crate::pool::ConnectionKey;
use crate::store::ConfigurationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Health check result status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Service is healthy and ready
    Healthy,
    /// Recent connection failures, still below the threshold
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Tracked health of one configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for ConfigurationHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_error: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

pub struct HealthTracker {
    failure_threshold: u32,
    store: Arc<dyn ConfigurationStore>,
    states: RwLock<HashMap<ConnectionKey, ConfigurationHealth>>,
}

impl fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthTracker")
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, store: Arc<dyn ConfigurationStore>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            store,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn status(&self, key: &ConnectionKey) -> HealthStatus {
        self.states
            .read()
            .await
            .get(key)
            .map_or(HealthStatus::Healthy, |health| health.status)
    }

    pub async fn snapshot(&self, key: &ConnectionKey) -> Option<ConfigurationHealth> {
        self.states.read().await.get(key).cloned()
    }

    pub async fn record_success(&self, key: &ConnectionKey) {
        let changed = {
            let mut states = self.states.write().await;
            let health = states.entry(key.clone()).or_default();
            let previous = health.status;
            health.status = HealthStatus::Healthy;
            health.consecutive_failures = 0;
            health.last_success_at = Some(Utc::now());
            previous != HealthStatus::Healthy
        };

        if changed {
            info!(key = %key, "Configuration recovered");
            self.persist(key, HealthStatus::Healthy, None).await;
        }
    }

    pub async fn record_failure(&self, key: &ConnectionKey, error: &McpError) {
        let change = {
            let mut states = self.states.write().await;
            let health = states.entry(key.clone()).or_default();
            let previous = health.status;
            health.last_error = Some(error.to_string());
            health.last_failure_at = Some(Utc::now());

            if error.is_authentication_error() {
                health.status = HealthStatus::Unhealthy;
            } else if error.is_connection_failure() {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.status = if health.consecutive_failures >= self.failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }

            (previous != health.status).then_some((health.status, health.consecutive_failures))
        };

        if let Some((status, consecutive_failures)) = change {
            warn!(
                key = %key,
                %status,
                consecutive_failures,
                error = %error,
                "Configuration health changed"
            );
            self.persist(key, status, Some(error.to_string())).await;
        }
    }

    async fn persist(&self, key: &ConnectionKey, status: HealthStatus, last_error: Option<String>) {
        if let Err(e) = self
            .store
            .update_status(&key.configuration_id, status, last_error)
            .await
        {
            warn!(key = %key, error = %e, "Failed to persist configuration status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockConfigurationStore;
    use mockall::predicate::{always, eq};
    use std::time::Duration;

    fn key() -> ConnectionKey {
        ConnectionKey::new("owner", "cfg")
    }

    fn tracker_expecting(statuses: &[HealthStatus]) -> HealthTracker {
        let mut store = MockConfigurationStore::new();
        let mut sequence = mockall::Sequence::new();
        for status in statuses {
            store
                .expect_update_status()
                .with(eq("cfg"), eq(*status), always())
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|_, _, _| Ok(()));
        }
        HealthTracker::new(3, Arc::new(store))
    }

    #[tokio::test]
    async fn test_authentication_failure_is_immediately_unhealthy() {
        let tracker = tracker_expecting(&[HealthStatus::Unhealthy]);
        tracker
            .record_failure(&key(), &McpError::authentication("token revoked"))
            .await;
        assert_eq!(tracker.status(&key()).await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_repeated_connection_failures_escalate() {
        let tracker = tracker_expecting(&[
            HealthStatus::Degraded,
            HealthStatus::Unhealthy,
            HealthStatus::Healthy,
        ]);
        let refused = McpError::connection("refused");

        tracker.record_failure(&key(), &refused).await;
        assert_eq!(tracker.status(&key()).await, HealthStatus::Degraded);
        tracker.record_failure(&key(), &refused).await;
        assert_eq!(tracker.status(&key()).await, HealthStatus::Degraded);
        tracker.record_failure(&key(), &refused).await;
        assert_eq!(tracker.status(&key()).await, HealthStatus::Unhealthy);

        tracker.record_success(&key()).await;
        let health = tracker.snapshot(&key()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_do_not_change_status() {
        let tracker = tracker_expecting(&[]);
        tracker
            .record_failure(&key(), &McpError::timeout(Duration::from_secs(30)))
            .await;
        tracker
            .record_failure(&key(), &McpError::rate_limit("slow down", None))
            .await;

        let health = tracker.snapshot(&key()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.unwrap().contains("slow down"));
    }

    #[tokio::test]
    async fn test_store_errors_are_swallowed() {
        let mut store = MockConfigurationStore::new();
        store
            .expect_update_status()
            .returning(|_, _, _| Err(McpError::connection("database down")));
        let tracker = HealthTracker::new(1, Arc::new(store));

        tracker
            .record_failure(&key(), &McpError::process_crash(Some(1), None))
            .await;
        assert_eq!(tracker.status(&key()).await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_owners_sharing_a_configuration_id_are_tracked_apart() {
        let tracker = tracker_expecting(&[HealthStatus::Degraded]);
        let first = ConnectionKey::new("owner-a", "cfg");
        let second = ConnectionKey::new("owner-b", "cfg");

        tracker.record_failure(&first, &McpError::connection("refused")).await;

        assert_eq!(tracker.status(&first).await, HealthStatus::Degraded);
        assert_eq!(tracker.status(&second).await, HealthStatus::Healthy);
        assert!(tracker.snapshot(&second).await.is_none());
    }
}
