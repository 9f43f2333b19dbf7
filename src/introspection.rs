//! Schema Introspection Module
//!
//! Reads the live structure of a PostgreSQL schema into the typed schema model.
//! The live schema is the source of truth for backups, verification and
//! rollback.

use crate::db::queries;
use crate::error::{EngineError, EngineResult};
use crate::schema::{Column, ColumnReference, ColumnType, Index, Policy, PolicyCommand, ReferentialAction, Table};
use deadpool_postgres::{Object, Pool};
use std::collections::HashMap;
use tracing::debug;

/// Schema introspector
pub struct PostgresIntrospector {
    pool: Pool,
    schema: String,
}

impl PostgresIntrospector {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Introspect every base table of the schema
    pub async fn introspect(&self) -> EngineResult<Vec<Table>> {
        let client = self.pool.get().await.map_err(|e| {
            EngineError::Connectivity(format!("Failed to get connection for introspection: {}", e))
        })?;

        let rows = client.query(queries::LIST_TABLES, &[&self.schema]).await?;
        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get("table_name");
            tables.push(self.introspect_table(&client, name).await?);
        }

        debug!(
            schema = %self.schema,
            tables = tables.len(),
            "Introspected schema"
        );
        Ok(tables)
    }

    async fn introspect_table(&self, client: &Object, name: String) -> EngineResult<Table> {
        let mut columns = self.get_columns(client, &name).await?;

        let foreign_keys = self.get_foreign_keys(client, &name).await?;
        for column in columns.iter_mut() {
            if let Some(reference) = foreign_keys.get(&column.name) {
                column.references = Some(reference.clone());
            }
        }

        Ok(Table {
            indexes: self.get_indexes(client, &name).await?,
            policies: self.get_policies(client, &name).await?,
            name,
            columns,
        })
    }

    /// Get columns for a table
    async fn get_columns(&self, client: &Object, table: &str) -> EngineResult<Vec<Column>> {
        let rows = client.query(queries::GET_COLUMNS, &[&self.schema, &table]).await?;

        rows.iter()
            .map(|row| {
                let name: String = row.get("column_name");
                let data_type: String = row.get("data_type");
                let column_type = ColumnType::from_sql_name(&data_type).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "Column '{}.{}' has unsupported type '{}'",
                        table, name, data_type
                    ))
                })?;

                Ok(Column {
                    name,
                    column_type,
                    nullable: row.get("nullable"),
                    unique: row.get("is_unique"),
                    primary_key: row.get("is_primary_key"),
                    default_value: row.get("column_default"),
                    references: None,
                })
            })
            .collect()
    }

    /// Single-column foreign keys, keyed by column name
    async fn get_foreign_keys(
        &self,
        client: &Object,
        table: &str,
    ) -> EngineResult<HashMap<String, ColumnReference>> {
        let rows = client.query(queries::GET_FOREIGN_KEYS, &[&self.schema, &table]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let on_delete: String = row.get("on_delete");
                (
                    row.get::<_, String>("column_name"),
                    ColumnReference {
                        table: row.get("foreign_table"),
                        column: row.get("foreign_column"),
                        on_delete: ReferentialAction::from_sql(&on_delete)
                            .filter(|a| *a != ReferentialAction::NoAction),
                    },
                )
            })
            .collect())
    }

    async fn get_indexes(&self, client: &Object, table: &str) -> EngineResult<Vec<Index>> {
        let rows = client.query(queries::GET_INDEXES, &[&self.schema, &table]).await?;

        Ok(rows
            .iter()
            .map(|row| Index {
                name: row.get("index_name"),
                columns: row.get("columns"),
                unique: row.get("is_unique"),
            })
            .collect())
    }

    async fn get_policies(&self, client: &Object, table: &str) -> EngineResult<Vec<Policy>> {
        let rows = client.query(queries::GET_POLICIES, &[&self.schema, &table]).await?;

        rows.iter()
            .map(|row| {
                let name: String = row.get("name");
                let cmd: String = row.get("cmd");
                let command = PolicyCommand::from_sql(&cmd).ok_or_else(|| {
                    EngineError::Validation(format!("Policy '{}.{}' has unknown command '{}'", table, name, cmd))
                })?;
                let roles: Vec<String> = row.get::<_, Option<Vec<String>>>("roles").unwrap_or_default();

                Ok(Policy {
                    name,
                    command,
                    roles: Policy::normalize_roles(roles),
                    using: row.get("qual"),
                    with_check: row.get("with_check"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_role_means_unrestricted() {
        assert!(Policy::normalize_roles(vec!["public".to_string()]).is_empty());
        assert_eq!(
            Policy::normalize_roles(vec!["authenticated".to_string()]),
            vec!["authenticated".to_string()]
        );
    }

    #[test]
    fn test_catalog_type_names_map_to_model() {
        for name in [
            "character varying",
            "timestamp with time zone",
            "timestamp without time zone",
            "double precision",
            "numeric",
            "jsonb",
        ] {
            assert!(ColumnType::from_sql_name(name).is_some(), "{}", name);
        }
    }
}
