//! Deployment target
//!
//! The three operations the deployment pipeline needs from a live database.

use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::introspection::PostgresIntrospector;
use crate::schema::Table;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::warn;

#[async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Run a script of one or more statements in a single round trip
    async fn execute_statement(&self, sql: &str) -> EngineResult<()>;

    /// Current structure of the managed schema
    async fn introspect_schema(&self) -> EngineResult<Vec<Table>>;

    async fn ping_connectivity(&self) -> EngineResult<()>;
}

/// A PostgreSQL database reached through a connection pool
pub struct PostgresTarget {
    pool: Pool,
    introspector: PostgresIntrospector,
}

impl PostgresTarget {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            introspector: PostgresIntrospector::new(pool.clone(), schema),
            pool,
        }
    }
}

#[async_trait]
impl TargetDatabase for PostgresTarget {
    async fn execute_statement(&self, sql: &str) -> EngineResult<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| EngineError::Connectivity(format!("Failed to get target connection: {}", e)))?;

        if let Err(e) = client.batch_execute(sql).await {
            // Leave no half-open transaction on a pooled connection
            if let Err(rollback_err) = client.batch_execute("ROLLBACK").await {
                warn!("ROLLBACK after failed script also failed: {}", rollback_err);
            }
            return Err(EngineError::Execution(e.to_string()));
        }
        Ok(())
    }

    async fn introspect_schema(&self) -> EngineResult<Vec<Table>> {
        self.introspector.introspect().await
    }

    async fn ping_connectivity(&self) -> EngineResult<()> {
        db::ping(&self.pool).await
    }
}
