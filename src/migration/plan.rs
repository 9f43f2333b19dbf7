//! Migration plan between two stored versions

use crate::error::EngineResult;
use crate::migration::downtime::DowntimeEstimator;
use crate::migration::generator::MigrationGenerator;
use crate::schema::{SchemaSnapshot, Table, VersionNumber};
use crate::snapshot::diff::{has_breaking_changes, ChangeSet, DiffEngine};
use serde::{Deserialize, Serialize};

/// Everything needed to review and apply the move from one version to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub from_version: Option<VersionNumber>,
    pub to_version: VersionNumber,
    pub changes: ChangeSet,
    pub forward_sql: String,
    pub reverse_sql: String,
    pub breaking: bool,
    pub estimated_downtime_seconds: u64,
    pub data_loss_warnings: Vec<String>,
}

impl MigrationPlan {
    /// Plan between two snapshots
    pub fn between(from: &SchemaSnapshot, to: &SchemaSnapshot) -> EngineResult<Self> {
        Self::build(Some(from.version), &from.tables, to.version, &to.tables)
    }

    /// Diff, generate and estimate in one step
    pub fn build(
        from_version: Option<VersionNumber>,
        from_tables: &[Table],
        to_version: VersionNumber,
        to_tables: &[Table],
    ) -> EngineResult<Self> {
        let changes = DiffEngine::diff(from_tables, to_tables);
        let script = MigrationGenerator::generate(&changes)?;

        Ok(Self {
            from_version,
            to_version,
            breaking: has_breaking_changes(&changes),
            estimated_downtime_seconds: DowntimeEstimator::estimate(&changes),
            forward_sql: script.forward_sql,
            reverse_sql: script.reverse_sql,
            data_loss_warnings: script.data_loss_warnings,
            changes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};

    #[test]
    fn test_plan_for_initial_version() {
        let users = Table::new("users", vec![Column::new("id", ColumnType::Uuid).primary_key()]);
        let plan = MigrationPlan::build(None, &[], VersionNumber::initial(), &[users]).unwrap();

        assert_eq!(plan.from_version, None);
        assert_eq!(plan.changes.len(), 1);
        assert!(!plan.breaking);
        assert_eq!(plan.estimated_downtime_seconds, 1);
        assert!(plan.forward_sql.starts_with("CREATE TABLE users"));
        assert_eq!(plan.reverse_sql, "DROP TABLE IF EXISTS users;");
    }

    #[test]
    fn test_plan_flags_breaking() {
        let users = Table::new("users", vec![Column::new("id", ColumnType::Uuid).primary_key()]);
        let plan = MigrationPlan::build(
            Some(VersionNumber::new(1, 0, 0)),
            &[users],
            VersionNumber::new(1, 0, 1),
            &[],
        )
        .unwrap();
        assert!(plan.breaking);
        assert_eq!(plan.data_loss_warnings.len(), 1);
        assert_eq!(plan.estimated_downtime_seconds, 2);
    }
}
