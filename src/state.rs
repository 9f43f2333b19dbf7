//! Engine state
//!
//! Wires the version store and the deployment service over a pair of
//! repositories. Shared by whatever front end drives the engine.

use crate::config::DeploymentConfig;
use crate::deploy::{
    DeploymentOutcome, DeploymentRequest, DeploymentService, DeploymentStore, InMemoryDeploymentStore,
    PgDeploymentStore, TargetDatabase,
};
use crate::error::{validation_error, EngineResult};
use crate::schema::VersionNumber;
use crate::snapshot::{InMemorySnapshotRepository, PgSnapshotRepository, SnapshotRepository, VersionStore};
use deadpool_postgres::Pool;
use std::sync::Arc;
use uuid::Uuid;

pub struct Engine {
    pub versions: VersionStore,
    pub deployments: DeploymentService,
}

impl Engine {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        deployments: Arc<dyn DeploymentStore>,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            versions: VersionStore::new(snapshots),
            deployments: DeploymentService::new(deployments, config),
        }
    }

    /// Engine with nothing persisted beyond the process
    pub fn in_memory(config: DeploymentConfig) -> Self {
        Self::new(
            Arc::new(InMemorySnapshotRepository::new()),
            Arc::new(InMemoryDeploymentStore::new()),
            config,
        )
    }

    /// Engine backed by the metadata tables reachable through `pool`
    pub fn postgres(pool: Pool, config: DeploymentConfig) -> Self {
        Self::new(
            Arc::new(PgSnapshotRepository::new(pool.clone())),
            Arc::new(PgDeploymentStore::new(pool)),
            config,
        )
    }

    /// Deploy the migration stored with `version`. The target is expected to be
    /// at the preceding version and must match `version` afterwards.
    pub async fn deploy_version(
        &self,
        target: &dyn TargetDatabase,
        project_id: Uuid,
        version: VersionNumber,
    ) -> EngineResult<DeploymentOutcome> {
        let stored = self.versions.get_version(project_id, version).await?;
        let migration = stored
            .migration
            .as_ref()
            .ok_or_else(|| validation_error(format!("Version {} has no stored migration", version)))?;

        let request = DeploymentRequest::new(project_id, migration.forward_sql.clone())
            .for_version(version)
            .expecting(stored.snapshot.tables.clone());
        self.deployments.apply_migration(target, request).await
    }
}

/// Type alias for shared state
pub type SharedEngine = Arc<Engine>;
