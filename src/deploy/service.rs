//! Deployment service
//!
//! Drives one deployment through its state machine: record, backup, execute,
//! and on failure after DDL was attempted, restore from the backup.

use crate::config::DeploymentConfig;
use crate::deploy::backup::BackupManager;
use crate::deploy::executor::{ExecutionOptions, MigrationExecutor};
use crate::deploy::lock::ProjectLocks;
use crate::deploy::record::{DeploymentRecord, DeploymentStatus};
use crate::deploy::rollback::RollbackCoordinator;
use crate::deploy::store::DeploymentStore;
use crate::deploy::target::TargetDatabase;
use crate::error::{not_found_error, EngineError, EngineResult, ErrorKind};
use crate::schema::{Table, VersionNumber};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to deploy and how
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub project_id: Uuid,
    pub schema_version: Option<VersionNumber>,
    pub forward_sql: String,
    /// Structure the target must have afterwards
    pub expected_tables: Option<Vec<Table>>,
    /// Overrides the configured default
    pub transactional: Option<bool>,
}

impl DeploymentRequest {
    pub fn new(project_id: Uuid, forward_sql: impl Into<String>) -> Self {
        Self {
            project_id,
            schema_version: None,
            forward_sql: forward_sql.into(),
            expected_tables: None,
            transactional: None,
        }
    }

    pub fn for_version(mut self, version: VersionNumber) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn expecting(mut self, tables: Vec<Table>) -> Self {
        self.expected_tables = Some(tables);
        self
    }

    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = Some(transactional);
        self
    }
}

/// Structured result of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub deployment_id: Uuid,
    pub success: bool,
    pub status: DeploymentStatus,
    pub rolled_back: bool,
    pub backup_id: Option<Uuid>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl From<&DeploymentRecord> for DeploymentOutcome {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            deployment_id: record.id,
            success: record.status == DeploymentStatus::Completed && record.error_kind.is_none(),
            status: record.status,
            rolled_back: record.rolled_back,
            backup_id: record.backup_id,
            error_kind: record.error_kind,
            message: record.error_message.clone(),
        }
    }
}

pub struct DeploymentService {
    store: Arc<dyn DeploymentStore>,
    backups: BackupManager,
    rollback: RollbackCoordinator,
    locks: ProjectLocks,
    config: DeploymentConfig,
}

impl DeploymentService {
    pub fn new(store: Arc<dyn DeploymentStore>, config: DeploymentConfig) -> Self {
        Self {
            backups: BackupManager::new(store.clone()),
            rollback: RollbackCoordinator::new(config.statement_timeout()),
            locks: ProjectLocks::new(),
            store,
            config,
        }
    }

    /// Apply a forward script to `target`.
    ///
    /// Deployment failures are reported in the outcome. An `Err` means the
    /// deployment could not be recorded. Once DDL was attempted the restore
    /// runs to the end before a store error is returned.
    pub async fn apply_migration(
        &self,
        target: &dyn TargetDatabase,
        request: DeploymentRequest,
    ) -> EngineResult<DeploymentOutcome> {
        let _guard = self.locks.acquire(request.project_id).await;

        let mut record = DeploymentRecord::new(
            request.project_id,
            request.schema_version,
            request.forward_sql.clone(),
        );
        self.store.insert_deployment(&record).await?;
        info!(
            deployment_id = %record.id,
            project_id = %record.project_id,
            version = ?record.schema_version,
            "Deployment pending"
        );

        let backup = match self.backups.capture(target, record.project_id, record.id).await {
            Ok(backup) => backup,
            Err(e) => {
                warn!(deployment_id = %record.id, "Backup failed: {}", e);
                record.fail(&e)?;
                self.store.update_deployment(&record).await?;
                return Ok(DeploymentOutcome::from(&record));
            }
        };
        record.backup_id = Some(backup.id);
        self.advance(&mut record, DeploymentStatus::Running).await?;

        let executor = MigrationExecutor::new(ExecutionOptions {
            transactional: request.transactional.unwrap_or(self.config.transactional),
            verify: self.config.verify,
            statement_timeout: self.config.statement_timeout(),
        });
        let report = executor
            .execute(target, &request.forward_sql, request.expected_tables.as_deref())
            .await;

        let failure = match report.result {
            Ok(()) => {
                self.advance(&mut record, DeploymentStatus::Completed).await?;
                info!(
                    deployment_id = %record.id,
                    statements = report.statements,
                    "Deployment completed"
                );
                return Ok(DeploymentOutcome::from(&record));
            }
            Err(e) => e,
        };

        warn!(deployment_id = %record.id, kind = failure.kind().as_str(), "Deployment failed: {}", failure);
        record.fail(&failure)?;
        if !report.ddl_attempted {
            self.persist(&record).await?;
            return Ok(DeploymentOutcome::from(&record));
        }

        // The target may be half-migrated: restore even if the store is failing
        let mut store_error = None;
        self.persist_or_keep_error(&record, &mut store_error).await;
        record.transition(DeploymentStatus::RollingBack)?;
        self.persist_or_keep_error(&record, &mut store_error).await;

        match self.rollback.restore(target, &backup).await {
            Ok(()) => {
                record.rolled_back = true;
                record.transition(DeploymentStatus::Completed)?;
                info!(deployment_id = %record.id, "Deployment rolled back");
            }
            Err(rollback_error) => {
                record.error_kind = Some(rollback_error.kind());
                record.error_message = Some(format!("{}; {}", failure, rollback_error));
                record.transition(DeploymentStatus::RollbackFailed)?;
                error!(
                    deployment_id = %record.id,
                    backup_id = %backup.id,
                    "Rollback failed, manual intervention required"
                );
            }
        }
        self.persist_or_keep_error(&record, &mut store_error).await;

        match store_error {
            Some(e) => Err(e),
            None => Ok(DeploymentOutcome::from(&record)),
        }
    }

    pub async fn get_deployment(&self, id: Uuid) -> EngineResult<DeploymentRecord> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| not_found_error(format!("Deployment {} not found", id)))
    }

    /// Newest first
    pub async fn list_deployments(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<DeploymentRecord>> {
        self.store.list_deployments(project_id, limit).await
    }

    async fn advance(&self, record: &mut DeploymentRecord, next: DeploymentStatus) -> EngineResult<()> {
        record.transition(next)?;
        self.persist(record).await
    }

    async fn persist(&self, record: &DeploymentRecord) -> EngineResult<()> {
        self.store.update_deployment(record).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::Internal(format!("Deployment {} vanished", record.id)),
            other => other,
        })
    }

    /// Persist, logging a failure and keeping the first one in `first_error`
    async fn persist_or_keep_error(&self, record: &DeploymentRecord, first_error: &mut Option<EngineError>) {
        if let Err(e) = self.persist(record).await {
            error!(
                deployment_id = %record.id,
                status = %record.status,
                "Could not record deployment state: {}",
                e
            );
            first_error.get_or_insert(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::store::{Backup, InMemoryDeploymentStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::schema::{Column, ColumnType};
    use crate::simulation::SimulatedDatabase;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    const ADD_TWO_COLUMNS: &str =
        "ALTER TABLE users ADD COLUMN email text;\nALTER TABLE users ADD COLUMN name text;";

    fn users() -> Table {
        Table::new("users", vec![Column::new("id", ColumnType::Uuid).primary_key()])
    }

    /// Delegates to the in-memory store but fails one chosen update
    struct FlakyStore {
        inner: InMemoryDeploymentStore,
        updates: AtomicUsize,
        fail_update: usize,
    }

    #[async_trait]
    impl DeploymentStore for FlakyStore {
        async fn insert_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
            self.inner.insert_deployment(record).await
        }

        async fn update_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
            if self.updates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_update {
                return Err(EngineError::Internal("metadata store unavailable".to_string()));
            }
            self.inner.update_deployment(record).await
        }

        async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<DeploymentRecord>> {
            self.inner.get_deployment(id).await
        }

        async fn list_deployments(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<DeploymentRecord>> {
            self.inner.list_deployments(project_id, limit).await
        }

        async fn insert_backup(&self, backup: &Backup) -> EngineResult<()> {
            self.inner.insert_backup(backup).await
        }

        async fn get_backup(&self, id: Uuid) -> EngineResult<Option<Backup>> {
            self.inner.get_backup(id).await
        }
    }

    fn service() -> (DeploymentService, Arc<InMemoryDeploymentStore>) {
        let store = Arc::new(InMemoryDeploymentStore::new());
        (DeploymentService::new(store.clone(), DeploymentConfig::default()), store)
    }

    #[tokio::test]
    async fn test_successful_deployment() {
        let (service, store) = service();
        let target = SimulatedDatabase::new(&[users()]);
        let project = Uuid::new_v4();

        let outcome = service
            .apply_migration(&target, DeploymentRequest::new(project, ADD_TWO_COLUMNS))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, DeploymentStatus::Completed);
        assert!(!outcome.rolled_back);
        assert_eq!(outcome.error_kind, None);

        let backup = store.get_backup(outcome.backup_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(backup.tables, vec![users()]);

        let record = service.get_deployment(outcome.deployment_id).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(service.list_deployments(project, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_without_ddl() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);
        target.set_unreachable(true);

        let outcome = service
            .apply_migration(&target, DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status, DeploymentStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Connectivity));
        assert_eq!(outcome.backup_id, None);
        assert_eq!(target.execute_calls(), 0);
    }

    #[tokio::test]
    async fn test_backup_failure_is_terminal() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);
        target.set_introspection_failure(true);

        let outcome = service
            .apply_migration(&target, DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS))
            .await
            .unwrap();

        assert_eq!(outcome.status, DeploymentStatus::Failed);
        assert!(!outcome.rolled_back);
        assert_eq!(target.execute_calls(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_script_fails_without_rollback() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);

        let outcome = service
            .apply_migration(&target, DeploymentRequest::new(Uuid::new_v4(), "DELETE FROM users;"))
            .await
            .unwrap();

        assert_eq!(outcome.status, DeploymentStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
        assert!(outcome.backup_id.is_some());
        assert!(!outcome.rolled_back);
        assert_eq!(target.execute_calls(), 0);
    }

    #[tokio::test]
    async fn test_mid_run_failure_is_rolled_back() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);
        target.fail_statements_containing("ADD COLUMN name").await;

        let request = DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS).transactional(false);
        let outcome = service.apply_migration(&target, request).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status, DeploymentStatus::Completed);
        assert!(outcome.rolled_back);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Execution));
        assert_eq!(target.tables().await, vec![users()]);
    }

    #[tokio::test]
    async fn test_failed_rollback_needs_intervention() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);
        target.fail_statements_containing("ADD COLUMN name").await;
        target.fail_statements_containing("DROP COLUMN").await;

        let request = DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS).transactional(false);
        let outcome = service.apply_migration(&target, request).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status, DeploymentStatus::RollbackFailed);
        assert!(!outcome.rolled_back);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RollbackFailure));
        assert!(target.tables().await[0].column("email").is_some());

        let record = service.get_deployment(outcome.deployment_id).await.unwrap();
        assert!(record.status.is_terminal());
    }

    #[tokio::test]
    async fn test_store_error_does_not_skip_rollback() {
        // Updates: running, failed, rolling back, completed
        let store = Arc::new(FlakyStore {
            inner: InMemoryDeploymentStore::new(),
            updates: AtomicUsize::new(0),
            fail_update: 2,
        });
        let service = DeploymentService::new(store.clone(), DeploymentConfig::default());
        let target = SimulatedDatabase::new(&[users()]);
        target.fail_statements_containing("ADD COLUMN name").await;
        let project = Uuid::new_v4();

        let request = DeploymentRequest::new(project, ADD_TWO_COLUMNS).transactional(false);
        let err = service.apply_migration(&target, request).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(target.tables().await, vec![users()]);

        let record = &service.list_deployments(project, 10).await.unwrap()[0];
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert!(record.rolled_back);
        assert_eq!(store.updates.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transactional_failure_applies_nothing() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);
        target.fail_statements_containing("ADD COLUMN name").await;

        let outcome = service
            .apply_migration(&target, DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.rolled_back);
        assert_eq!(target.tables().await, vec![users()]);
        assert_eq!(target.execute_calls(), 1);
    }

    #[tokio::test]
    async fn test_verification_failure_triggers_rollback() {
        let (service, _) = service();
        let target = SimulatedDatabase::new(&[users()]);

        let request = DeploymentRequest::new(Uuid::new_v4(), ADD_TWO_COLUMNS).expecting(vec![users()]);
        let outcome = service.apply_migration(&target, request).await.unwrap();

        assert_eq!(outcome.error_kind, Some(ErrorKind::Verification));
        assert!(outcome.rolled_back);
        assert_eq!(target.tables().await, vec![users()]);
    }

    #[tokio::test]
    async fn test_unknown_deployment_not_found() {
        let (service, _) = service();
        let err = service.get_deployment(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_same_project_deployments_are_serialized() {
        let (service, _) = service();
        let service = Arc::new(service);
        let target = Arc::new(SimulatedDatabase::new(&[users()]));
        target.set_execute_delay(Some(Duration::from_millis(50))).await;
        let project = Uuid::new_v4();

        let started = Instant::now();
        let handles: Vec<_> = ["email", "name"]
            .into_iter()
            .map(|column| {
                let service = service.clone();
                let target = target.clone();
                let sql = format!("ALTER TABLE users ADD COLUMN {} text;", column);
                tokio::spawn(async move {
                    service
                        .apply_migration(target.as_ref(), DeploymentRequest::new(project, sql))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(target.tables().await[0].columns.len(), 3);
    }
}
