//! Deployment store
//!
//! Persistence seam for deployment records and the backups taken before them.

use crate::deploy::record::DeploymentRecord;
use crate::error::{not_found_error, EngineResult};
use crate::schema::Table;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Structure of a target captured before a deployment touched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub project_id: Uuid,
    pub tables: Vec<Table>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeploymentStore: Send + Sync + 'static {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> EngineResult<()>;

    /// Overwrite the mutable fields of an existing record
    async fn update_deployment(&self, record: &DeploymentRecord) -> EngineResult<()>;

    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<DeploymentRecord>>;

    /// Newest first
    async fn list_deployments(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<DeploymentRecord>>;

    async fn insert_backup(&self, backup: &Backup) -> EngineResult<()>;

    async fn get_backup(&self, id: Uuid) -> EngineResult<Option<Backup>>;
}

/// In-memory deployment store
#[derive(Default)]
pub struct InMemoryDeploymentStore {
    deployments: Arc<RwLock<Vec<DeploymentRecord>>>,
    backups: Arc<RwLock<HashMap<Uuid, Backup>>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
        self.deployments.write().await.push(record.clone());
        Ok(())
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
        let mut deployments = self.deployments.write().await;
        let existing = deployments
            .iter_mut()
            .find(|d| d.id == record.id)
            .ok_or_else(|| not_found_error(format!("Deployment {} not found", record.id)))?;
        *existing = record.clone();
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<DeploymentRecord>> {
        let deployments = self.deployments.read().await;
        Ok(deployments.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deployments(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<DeploymentRecord>> {
        let deployments = self.deployments.read().await;
        Ok(deployments
            .iter()
            .rev()
            .filter(|d| d.project_id == project_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_backup(&self, backup: &Backup) -> EngineResult<()> {
        self.backups.write().await.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> EngineResult<Option<Backup>> {
        Ok(self.backups.read().await.get(&id).cloned())
    }
}
