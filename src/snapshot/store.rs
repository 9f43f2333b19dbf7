//! Version Store
//!
//! Creates, lists and compares immutable schema versions. Think of this as
//! "git commits" for a project's schema: every version carries the migration
//! that leads to it from its predecessor.

use crate::deploy::sql::validate_script;
use crate::error::{not_found_error, EngineResult};
use crate::migration::{DowntimeEstimator, MigrationGenerator, MigrationPlan};
use crate::schema::{SchemaDefinition, SchemaSnapshot, VersionNumber};
use crate::simulation::DryRunner;
use crate::snapshot::diff::{has_breaking_changes, DiffEngine};
use crate::snapshot::repository::{AppendDecision, SchemaVersion, SnapshotRepository, StoredMigration};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of [`VersionStore::create_version`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCreated {
    pub version: SchemaVersion,
    /// False when the candidate equals the latest version
    pub created: bool,
    /// Older version with identical content, if any
    pub duplicate_of: Option<VersionNumber>,
}

/// Lightweight listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version: VersionNumber,
    pub checksum: String,
    pub table_count: usize,
    pub breaking: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub created_by: Uuid,
}

impl From<&SchemaVersion> for VersionSummary {
    fn from(v: &SchemaVersion) -> Self {
        Self {
            version: v.version(),
            checksum: v.snapshot.checksum.clone(),
            table_count: v.snapshot.tables.len(),
            breaking: v.migration.as_ref().map(|m| m.breaking).unwrap_or(false),
            created_at: v.snapshot.created_at,
            created_by: v.snapshot.created_by,
        }
    }
}

pub struct VersionStore {
    repository: Arc<dyn SnapshotRepository>,
}

impl VersionStore {
    pub fn new(repository: Arc<dyn SnapshotRepository>) -> Self {
        Self { repository }
    }

    /// Validate a candidate schema and store it as the project's next version.
    ///
    /// The migration from the latest version (or from the empty schema) is
    /// generated and proven by a dry run before anything is written.
    pub async fn create_version(
        &self,
        project_id: Uuid,
        mut schema: SchemaDefinition,
        author_id: Uuid,
    ) -> EngineResult<VersionCreated> {
        schema.validate_definition()?;
        schema.normalize();
        let tables = schema.tables;
        let checksum = SchemaSnapshot::compute_checksum(&tables);

        let planner = |latest: Option<&SchemaVersion>| -> EngineResult<AppendDecision> {
            if let Some(latest) = latest {
                if latest.snapshot.checksum == checksum {
                    return Ok(AppendDecision::Unchanged(latest.clone()));
                }
            }

            let from_tables = latest.map(|v| v.snapshot.tables.as_slice()).unwrap_or(&[]);
            let from_version = latest.map(|v| v.version());

            let changes = DiffEngine::diff(from_tables, &tables);
            let script = MigrationGenerator::generate(&changes)?;
            // Stored scripts must pass the same checks a deployment applies
            if !script.is_empty() {
                validate_script(&script.forward_sql)?;
                validate_script(&script.reverse_sql)?;
            }
            DryRunner::verify(from_tables, &tables, &script)?;

            let snapshot = SchemaSnapshot::new(
                project_id,
                VersionNumber::after(from_version),
                tables.clone(),
                author_id,
            );
            debug!(
                version = %snapshot.version,
                changes = changes.len(),
                "Planned new version"
            );

            Ok(AppendDecision::Insert(SchemaVersion {
                snapshot,
                migration: Some(StoredMigration {
                    from_version,
                    forward_sql: script.forward_sql,
                    reverse_sql: script.reverse_sql,
                    breaking: has_breaking_changes(&changes),
                    estimated_downtime_seconds: DowntimeEstimator::estimate(&changes),
                }),
            }))
        };

        match self.repository.append(project_id, &planner).await? {
            AppendDecision::Unchanged(latest) => {
                info!(
                    "Schema for project {} unchanged since v{}, no version created",
                    project_id,
                    latest.version()
                );
                Ok(VersionCreated {
                    version: latest,
                    created: false,
                    duplicate_of: None,
                })
            }
            AppendDecision::Insert(version) => {
                let duplicate_of = self
                    .repository
                    .find_by_checksum(project_id, &version.snapshot.checksum)
                    .await?
                    .map(|v| v.version())
                    .filter(|n| *n != version.version());

                info!(
                    "Created v{} for project {}: {} tables, breaking: {}",
                    version.version(),
                    project_id,
                    version.snapshot.tables.len(),
                    version.migration.as_ref().map(|m| m.breaking).unwrap_or(false)
                );
                Ok(VersionCreated {
                    version,
                    created: true,
                    duplicate_of,
                })
            }
        }
    }

    /// Newest first, at most `limit` entries
    pub async fn get_version_history(
        &self,
        project_id: Uuid,
        limit: usize,
    ) -> EngineResult<Vec<VersionSummary>> {
        let versions = self.repository.history(project_id, limit).await?;
        Ok(versions.iter().map(VersionSummary::from).collect())
    }

    pub async fn get_version(&self, project_id: Uuid, version: VersionNumber) -> EngineResult<SchemaVersion> {
        self.repository
            .get(project_id, version)
            .await?
            .ok_or_else(|| not_found_error(format!("Version {} of project {} not found", version, project_id)))
    }

    pub async fn get_latest(&self, project_id: Uuid) -> EngineResult<Option<SchemaVersion>> {
        self.repository.latest(project_id).await
    }

    /// Plan the migration between two stored versions, in either direction
    pub async fn compare_versions(
        &self,
        project_id: Uuid,
        from: VersionNumber,
        to: VersionNumber,
    ) -> EngineResult<MigrationPlan> {
        let from_version = self.get_version(project_id, from).await?;
        let to_version = self.get_version(project_id, to).await?;
        MigrationPlan::between(&from_version.snapshot, &to_version.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::{Column, ColumnType, Policy, PolicyCommand, Table};
    use crate::snapshot::repository::InMemorySnapshotRepository;
    use pretty_assertions::assert_eq;
    use tokio_test::assert_err;

    fn store() -> VersionStore {
        VersionStore::new(Arc::new(InMemorySnapshotRepository::new()))
    }

    fn users() -> Table {
        Table::new(
            "users",
            vec![
                Column::new("id", ColumnType::Uuid).primary_key(),
                Column::new("email", ColumnType::Text).not_null(),
            ],
        )
    }

    fn orders() -> Table {
        Table::new(
            "orders",
            vec![
                Column::new("id", ColumnType::Uuid).primary_key(),
                Column::new("total", ColumnType::Decimal).not_null(),
            ],
        )
    }

    fn schema(tables: Vec<Table>) -> SchemaDefinition {
        SchemaDefinition::new(tables)
    }

    #[tokio::test]
    async fn test_first_version_is_initial() {
        let store = store();
        let project = Uuid::new_v4();

        let created = store
            .create_version(project, schema(vec![users()]), Uuid::new_v4())
            .await
            .unwrap();
        assert!(created.created);
        assert_eq!(created.version.version(), VersionNumber::initial());

        let migration = created.version.migration.unwrap();
        assert_eq!(migration.from_version, None);
        assert!(migration.forward_sql.starts_with("CREATE TABLE users"));
        assert_eq!(migration.reverse_sql, "DROP TABLE IF EXISTS users;");
    }

    #[tokio::test]
    async fn test_adding_nullable_column_creates_next_version() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();

        let mut with_phone = users();
        with_phone.columns.push(Column::new("phone", ColumnType::Text));
        let created = store
            .create_version(project, schema(vec![with_phone]), author)
            .await
            .unwrap();

        assert_eq!(created.version.version(), VersionNumber::new(1, 0, 1));
        let migration = created.version.migration.unwrap();
        assert_eq!(migration.from_version, Some(VersionNumber::initial()));
        assert_eq!(migration.forward_sql, "ALTER TABLE users ADD COLUMN phone text;");
        assert_eq!(migration.reverse_sql, "ALTER TABLE users DROP COLUMN phone;");
        assert!(!migration.breaking);
        assert_eq!(migration.estimated_downtime_seconds, 1);
    }

    #[tokio::test]
    async fn test_dropping_table_is_breaking() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store
            .create_version(project, schema(vec![users(), orders()]), author)
            .await
            .unwrap();

        let created = store
            .create_version(project, schema(vec![users()]), author)
            .await
            .unwrap();
        let migration = created.version.migration.unwrap();
        assert!(migration.breaking);
        assert_eq!(migration.forward_sql, "DROP TABLE IF EXISTS orders;");
        assert!(migration.reverse_sql.starts_with("CREATE TABLE orders ("));
    }

    #[tokio::test]
    async fn test_unchanged_schema_creates_nothing() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();

        let mut reordered = users();
        reordered.columns.reverse();
        let again = store
            .create_version(project, schema(vec![reordered]), author)
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.version.version(), VersionNumber::initial());
        assert_eq!(store.get_version_history(project, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reverting_to_older_content_flags_duplicate() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();
        store
            .create_version(project, schema(vec![users(), orders()]), author)
            .await
            .unwrap();

        let reverted = store
            .create_version(project, schema(vec![users()]), author)
            .await
            .unwrap();
        assert!(reverted.created);
        assert_eq!(reverted.version.version(), VersionNumber::new(1, 0, 2));
        assert_eq!(reverted.duplicate_of, Some(VersionNumber::initial()));
    }

    #[tokio::test]
    async fn test_invalid_schema_rejected() {
        let store = store();
        let project = Uuid::new_v4();
        let bad = Table::new("users", vec![Column::new("Bad Name", ColumnType::Text)]);

        let err = assert_err!(store.create_version(project, schema(vec![bad]), Uuid::new_v4()).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(store.get_latest(project).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_primary_key_change_rejected_without_storing() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();

        let mut rekeyed = users();
        rekeyed.columns[0].primary_key = false;
        rekeyed.columns[1].primary_key = true;
        let err = assert_err!(store.create_version(project, schema(vec![rekeyed]), author).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.get_version_history(project, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_key_column_add_or_drop_rejected() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();

        let mut widened = users();
        widened.columns.push(Column::new("tenant", ColumnType::Uuid).primary_key());
        let err = assert_err!(store.create_version(project, schema(vec![widened]), author).await);
        assert_eq!(err.kind(), ErrorKind::Validation);

        let keyless = Table::new("users", vec![Column::new("email", ColumnType::Text).not_null()]);
        let err = assert_err!(store.create_version(project, schema(vec![keyless]), author).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.get_version_history(project, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_public_policy_role_stored_as_unrestricted() {
        let store = store();
        let project = Uuid::new_v4();
        let mut table = users();
        table.policies.push(Policy {
            name: "read_all".to_string(),
            command: PolicyCommand::Select,
            roles: vec!["public".to_string()],
            using: Some("true".to_string()),
            with_check: None,
        });

        let created = store
            .create_version(project, schema(vec![table]), Uuid::new_v4())
            .await
            .unwrap();
        assert!(created.version.snapshot.tables[0].policies[0].roles.is_empty());
        let migration = created.version.migration.unwrap();
        assert!(migration
            .forward_sql
            .contains("CREATE POLICY read_all ON users FOR SELECT USING (true);"));
    }

    #[tokio::test]
    async fn test_catalog_reference_in_default_rejected() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();

        let mut stamped = users();
        stamped
            .columns
            .push(Column::new("seen_at", ColumnType::Timestamptz).with_default("pg_catalog.now()"));
        let err = assert_err!(store.create_version(project, schema(vec![stamped]), author).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.get_latest(project).await.unwrap().unwrap().version(), VersionNumber::initial());
    }

    #[tokio::test]
    async fn test_history_and_compare() {
        let store = store();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        store.create_version(project, schema(vec![users()]), author).await.unwrap();
        store
            .create_version(project, schema(vec![users(), orders()]), author)
            .await
            .unwrap();

        let history = store.get_version_history(project, 10).await.unwrap();
        assert_eq!(
            history.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![VersionNumber::new(1, 0, 1), VersionNumber::new(1, 0, 0)]
        );

        let forward = store
            .compare_versions(project, VersionNumber::new(1, 0, 0), VersionNumber::new(1, 0, 1))
            .await
            .unwrap();
        assert!(!forward.breaking);
        assert_eq!(forward.changes.len(), 1);

        let backward = store
            .compare_versions(project, VersionNumber::new(1, 0, 1), VersionNumber::new(1, 0, 0))
            .await
            .unwrap();
        assert!(backward.breaking);
        assert_eq!(backward.forward_sql, "DROP TABLE IF EXISTS orders;");

        let err = assert_err!(
            store
                .compare_versions(project, VersionNumber::new(1, 0, 0), VersionNumber::new(4, 0, 0))
                .await
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_numbers() {
        let store = Arc::new(store());
        let project = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut table = users();
                table.columns.push(Column::new(format!("extra_{}", i), ColumnType::Text));
                store
                    .create_version(project, SchemaDefinition::new(vec![table]), Uuid::new_v4())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = store.get_version_history(project, 100).await.unwrap();
        let mut numbers: Vec<VersionNumber> = history.iter().map(|v| v.version).collect();
        numbers.reverse();
        let mut expected = vec![VersionNumber::initial()];
        while expected.len() < 20 {
            let next = expected[expected.len() - 1].next();
            expected.push(next);
        }
        assert_eq!(numbers, expected);
    }
}
