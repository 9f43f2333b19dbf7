//! PostgreSQL-backed snapshot repository
//!
//! Appends run in one transaction holding a project-scoped advisory lock;
//! the unique `(project_id, major, minor, patch)` constraint backs it up.

use crate::db::queries;
use crate::error::{EngineError, EngineResult};
use crate::schema::{SchemaSnapshot, Table, VersionNumber};
use crate::snapshot::repository::{
    check_follows, AppendDecision, SchemaVersion, SnapshotRepository, StoredMigration, VersionPlanner,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{GenericClient, Pool};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::{debug, error};
use uuid::Uuid;

pub struct PgSnapshotRepository {
    pool: Pool,
}

impl PgSnapshotRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn row_to_version(row: &Row) -> EngineResult<SchemaVersion> {
        let component = |name: &str| -> EngineResult<u32> {
            let value: i32 = row.get(name);
            u32::try_from(value)
                .map_err(|_| EngineError::Internal(format!("Negative version component {}", value)))
        };
        let Json(tables): Json<Vec<Table>> = row.get("tables");

        let migration = match row.get::<_, Option<String>>("migration_up") {
            Some(forward_sql) => Some(StoredMigration {
                from_version: row
                    .get::<_, Option<String>>("from_version")
                    .map(|v| v.parse())
                    .transpose()?,
                forward_sql,
                reverse_sql: row.get::<_, Option<String>>("migration_down").unwrap_or_default(),
                breaking: row.get("breaking"),
                estimated_downtime_seconds: row.get::<_, i64>("estimated_downtime_seconds").max(0) as u64,
            }),
            None => None,
        };

        Ok(SchemaVersion {
            snapshot: SchemaSnapshot {
                id: row.get("id"),
                project_id: row.get("project_id"),
                version: VersionNumber::new(component("major")?, component("minor")?, component("patch")?),
                tables,
                checksum: row.get("checksum"),
                created_at: row.get::<_, DateTime<Utc>>("created_at"),
                created_by: row.get("created_by"),
            },
            migration,
        })
    }

    async fn latest_with<C: GenericClient>(client: &C, project_id: Uuid) -> EngineResult<Option<SchemaVersion>> {
        let sql = queries::select_versions("project_id = $1 ORDER BY major DESC, minor DESC, patch DESC LIMIT 1");
        let row = client.query_opt(&sql, &[&project_id]).await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn insert_with<C: GenericClient>(client: &C, version: &SchemaVersion) -> EngineResult<()> {
        let snapshot = &version.snapshot;
        let migration = version.migration.as_ref();
        let from_version = migration.and_then(|m| m.from_version).map(|v| v.to_string());
        let forward = migration.map(|m| m.forward_sql.clone());
        let reverse = migration.map(|m| m.reverse_sql.clone());
        let breaking = migration.map(|m| m.breaking).unwrap_or(false);
        let downtime = migration.map(|m| m.estimated_downtime_seconds as i64).unwrap_or(0);
        let (major, minor, patch) = (
            snapshot.version.major as i32,
            snapshot.version.minor as i32,
            snapshot.version.patch as i32,
        );

        client
            .execute(
                queries::INSERT_VERSION,
                &[
                    &snapshot.id,
                    &snapshot.project_id,
                    &major,
                    &minor,
                    &patch,
                    &Json(&snapshot.tables),
                    &snapshot.checksum,
                    &snapshot.created_at,
                    &snapshot.created_by,
                    &from_version,
                    &forward,
                    &reverse,
                    &breaking,
                    &downtime,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(e.code()) {
                    EngineError::Conflict(format!(
                        "Version {} already exists for project {}",
                        snapshot.version, snapshot.project_id
                    ))
                } else {
                    error!("Failed to store version {}: {:?}", snapshot.version, e);
                    EngineError::Database(e)
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn append(&self, project_id: Uuid, plan: VersionPlanner<'_>) -> EngineResult<AppendDecision> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        transaction
            .execute(queries::LOCK_PROJECT_VERSIONS, &[&project_id.to_string()])
            .await?;

        let latest = Self::latest_with(&transaction, project_id).await?;
        let decision = plan(latest.as_ref())?;

        if let AppendDecision::Insert(ref version) = decision {
            check_follows(latest.as_ref(), version)?;
            Self::insert_with(&transaction, version).await?;
        }
        transaction.commit().await?;

        debug!(project_id = %project_id, "Version append committed");
        Ok(decision)
    }

    async fn get(&self, project_id: Uuid, version: VersionNumber) -> EngineResult<Option<SchemaVersion>> {
        let client = self.pool.get().await?;
        let sql = queries::select_versions("project_id = $1 AND major = $2 AND minor = $3 AND patch = $4");
        let row = client
            .query_opt(
                &sql,
                &[
                    &project_id,
                    &(version.major as i32),
                    &(version.minor as i32),
                    &(version.patch as i32),
                ],
            )
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn latest(&self, project_id: Uuid) -> EngineResult<Option<SchemaVersion>> {
        let client = self.pool.get().await?;
        Self::latest_with(&client, project_id).await
    }

    async fn history(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<SchemaVersion>> {
        let client = self.pool.get().await?;
        let sql = queries::select_versions(
            "project_id = $1 ORDER BY major DESC, minor DESC, patch DESC LIMIT $2",
        );
        let limit = limit as i64;
        let rows = client.query(&sql, &[&project_id, &limit]).await?;
        rows.iter().map(Self::row_to_version).collect()
    }

    async fn find_by_checksum(
        &self,
        project_id: Uuid,
        checksum: &str,
    ) -> EngineResult<Option<SchemaVersion>> {
        let client = self.pool.get().await?;
        let sql = queries::select_versions(
            "project_id = $1 AND checksum = $2 ORDER BY major, minor, patch LIMIT 1",
        );
        let row = client.query_opt(&sql, &[&project_id, &checksum]).await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }
}

/// Another writer got the same (project, version) first
fn is_unique_violation(code: Option<&SqlState>) -> bool {
    code == Some(&SqlState::UNIQUE_VIOLATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unique_violation_is_a_conflict() {
        assert!(is_unique_violation(Some(&SqlState::UNIQUE_VIOLATION)));
        assert!(!is_unique_violation(Some(&SqlState::FOREIGN_KEY_VIOLATION)));
        assert!(!is_unique_violation(None));
    }
}
