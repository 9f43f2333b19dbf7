//! PostgreSQL-backed deployment store

use crate::db::queries;
use crate::deploy::record::{DeploymentRecord, DeploymentStatus};
use crate::deploy::store::{Backup, DeploymentStore};
use crate::error::{not_found_error, EngineError, EngineResult, ErrorKind};
use crate::schema::Table;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

pub struct PgDeploymentStore {
    pool: Pool,
}

impl PgDeploymentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &Row) -> EngineResult<DeploymentRecord> {
        let status: String = row.get("status");
        let status = DeploymentStatus::parse(&status)
            .ok_or_else(|| EngineError::Internal(format!("Unknown deployment status '{}'", status)))?;

        Ok(DeploymentRecord {
            id: row.get("id"),
            project_id: row.get("project_id"),
            schema_version: row
                .get::<_, Option<String>>("schema_version")
                .map(|v| v.parse())
                .transpose()?,
            forward_sql: row.get("forward_sql"),
            status,
            backup_id: row.get("backup_id"),
            rolled_back: row.get("rolled_back"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error_kind: row
                .get::<_, Option<String>>("error_kind")
                .and_then(|k| ErrorKind::parse(&k)),
            error_message: row.get("error_message"),
        })
    }

    fn row_to_backup(row: &Row) -> Backup {
        let Json(tables): Json<Vec<Table>> = row.get("tables");
        Backup {
            id: row.get("id"),
            deployment_id: row.get("deployment_id"),
            project_id: row.get("project_id"),
            tables,
            checksum: row.get("checksum"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl DeploymentStore for PgDeploymentStore {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
        let client = self.pool.get().await?;
        let schema_version = record.schema_version.map(|v| v.to_string());
        let error_kind = record.error_kind.map(|k| k.as_str());

        client
            .execute(
                queries::INSERT_DEPLOYMENT,
                &[
                    &record.id,
                    &record.project_id,
                    &schema_version,
                    &record.forward_sql,
                    &record.status.as_str(),
                    &record.backup_id,
                    &record.rolled_back,
                    &record.started_at,
                    &record.completed_at,
                    &error_kind,
                    &record.error_message,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> EngineResult<()> {
        let client = self.pool.get().await?;
        let error_kind = record.error_kind.map(|k| k.as_str());

        let updated = client
            .execute(
                queries::UPDATE_DEPLOYMENT,
                &[
                    &record.id,
                    &record.status.as_str(),
                    &record.backup_id,
                    &record.rolled_back,
                    &record.completed_at,
                    &error_kind,
                    &record.error_message,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(not_found_error(format!("Deployment {} not found", record.id)));
        }
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<DeploymentRecord>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(queries::SELECT_DEPLOYMENT, &[&id]).await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_deployments(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<DeploymentRecord>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let rows = client.query(queries::LIST_DEPLOYMENTS, &[&project_id, &limit]).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn insert_backup(&self, backup: &Backup) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                queries::INSERT_BACKUP,
                &[
                    &backup.id,
                    &backup.deployment_id,
                    &backup.project_id,
                    &Json(&backup.tables),
                    &backup.checksum,
                    &backup.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> EngineResult<Option<Backup>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(queries::SELECT_BACKUP, &[&id]).await?;
        Ok(row.as_ref().map(Self::row_to_backup))
    }
}
