//! Restore a target to its pre-deployment backup

use crate::deploy::sql::{validate_script, wrap_in_transaction};
use crate::deploy::store::Backup;
use crate::deploy::target::TargetDatabase;
use crate::deploy::verify::verify_against_tables;
use crate::error::{EngineError, EngineResult};
use crate::migration::MigrationGenerator;
use crate::snapshot::diff::DiffEngine;
use std::time::Duration;
use tracing::{error, info};

pub struct RollbackCoordinator {
    statement_timeout: Duration,
}

impl RollbackCoordinator {
    pub fn new(statement_timeout: Duration) -> Self {
        Self { statement_timeout }
    }

    /// Bring the live structure back to `backup`. One attempt, always
    /// transactional. Every failure is reported as `RollbackFailure`.
    pub async fn restore(&self, target: &dyn TargetDatabase, backup: &Backup) -> EngineResult<()> {
        self.try_restore(target, backup).await.map_err(|e| {
            error!(backup_id = %backup.id, "Rollback failed: {}", e);
            match e {
                EngineError::RollbackFailure(_) => e,
                other => EngineError::RollbackFailure(other.to_string()),
            }
        })
    }

    async fn try_restore(&self, target: &dyn TargetDatabase, backup: &Backup) -> EngineResult<()> {
        let live = target.introspect_schema().await?;
        let changes = DiffEngine::diff(&live, &backup.tables);

        if changes.is_empty() {
            info!(backup_id = %backup.id, "Target already matches backup");
            return Ok(());
        }

        let script = MigrationGenerator::generate(&changes)?;
        let statements = validate_script(&script.forward_sql)?;

        let wrapped = wrap_in_transaction(&statements);
        let restore = target.execute_statement(&wrapped);
        match tokio::time::timeout(self.statement_timeout, restore).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Execution(format!(
                    "restore timed out after {:?}",
                    self.statement_timeout
                )))
            }
        }

        let restored = target.introspect_schema().await?;
        verify_against_tables(&restored, &backup.tables)?;

        info!(
            backup_id = %backup.id,
            changes = changes.len(),
            "Target restored from backup"
        );
        Ok(())
    }
}
