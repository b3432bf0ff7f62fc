//! Write-back interface to wherever server configurations are persisted
//!
//! The connection layer never owns configuration storage. It only needs to
//! push three kinds of updates back: refreshed OAuth credentials, health
//! status changes and discovery metadata.

use crate::error::Result;
use crate::health::HealthStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Credential set produced by an OAuth refresh
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for CredentialUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialUpdate")
            .field(
                "access_token",
                &crate::utils::logging::obscure_credential(&self.access_token),
            )
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Persist a refreshed credential set for a configuration
    async fn update_credentials(&self, configuration_id: &str, credentials: &CredentialUpdate) -> Result<()>;

    /// Persist a health status change and the error that caused it
    async fn update_status(
        &self,
        configuration_id: &str,
        status: HealthStatus,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Merge one key into the configuration's metadata
    async fn update_metadata(&self, configuration_id: &str, key: &str, value: Value) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredStatus {
    pub status: HealthStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-process store, used by the CLI and tests
#[derive(Debug, Default)]
pub struct MemoryConfigurationStore {
    credentials: RwLock<HashMap<String, CredentialUpdate>>,
    statuses: RwLock<HashMap<String, StoredStatus>>,
    metadata: RwLock<HashMap<String, serde_json::Map<String, Value>>>,
}

impl MemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn credentials(&self, configuration_id: &str) -> Option<CredentialUpdate> {
        self.credentials.read().await.get(configuration_id).cloned()
    }

    pub async fn status(&self, configuration_id: &str) -> Option<StoredStatus> {
        self.statuses.read().await.get(configuration_id).cloned()
    }

    pub async fn metadata(&self, configuration_id: &str) -> serde_json::Map<String, Value> {
        self.metadata
            .read()
            .await
            .get(configuration_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConfigurationStore for MemoryConfigurationStore {
    async fn update_credentials(&self, configuration_id: &str, credentials: &CredentialUpdate) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(configuration_id.to_string(), credentials.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        configuration_id: &str,
        status: HealthStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        self.statuses.write().await.insert(
            configuration_id.to_string(),
            StoredStatus {
                status,
                last_error,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update_metadata(&self, configuration_id: &str, key: &str, value: Value) -> Result<()> {
        self.metadata
            .write()
            .await
            .entry(configuration_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}
