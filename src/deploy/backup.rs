//! Pre-deployment backups

use crate::deploy::store::{Backup, DeploymentStore};
use crate::deploy::target::TargetDatabase;
use crate::error::EngineResult;
use crate::schema::SchemaSnapshot;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct BackupManager {
    store: Arc<dyn DeploymentStore>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Introspect the live target and persist its structure
    pub async fn capture(
        &self,
        target: &dyn TargetDatabase,
        project_id: Uuid,
        deployment_id: Uuid,
    ) -> EngineResult<Backup> {
        let tables = target.introspect_schema().await?;
        let backup = Backup {
            id: Uuid::new_v4(),
            deployment_id,
            project_id,
            checksum: SchemaSnapshot::compute_checksum(&tables),
            tables,
            created_at: Utc::now(),
        };
        self.store.insert_backup(&backup).await?;

        info!(
            backup_id = %backup.id,
            deployment_id = %deployment_id,
            tables = backup.tables.len(),
            "Backup captured"
        );
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::store::InMemoryDeploymentStore;
    use crate::schema::{Column, ColumnType, Table};
    use crate::simulation::SimulatedDatabase;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_capture_persists_live_structure() {
        let store = Arc::new(InMemoryDeploymentStore::new());
        let manager = BackupManager::new(store.clone());
        let tables = vec![Table::new("users", vec![Column::new("id", ColumnType::Uuid).primary_key()])];
        let target = SimulatedDatabase::new(&tables);

        let backup = manager.capture(&target, Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        assert_eq!(backup.tables, tables);
        assert_eq!(backup.checksum, SchemaSnapshot::compute_checksum(&tables));
        assert_eq!(store.get_backup(backup.id).await.unwrap(), Some(backup));
    }

    #[tokio::test]
    async fn test_capture_fails_when_introspection_fails() {
        let manager = BackupManager::new(Arc::new(InMemoryDeploymentStore::new()));
        let target = SimulatedDatabase::new(&[]);
        target.set_introspection_failure(true);
        assert_err!(manager.capture(&target, Uuid::new_v4(), Uuid::new_v4()).await);
    }
}
