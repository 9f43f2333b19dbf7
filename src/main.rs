//! SchemaFlow Migrate - schema versioning and migration deployment
//!
//! Bootstraps the metadata store and checks the configured deployment target.

use schemaflow_migrate::config::Settings;
use schemaflow_migrate::db::{bootstrap_metadata_schema, create_pool};
use schemaflow_migrate::deploy::{PostgresTarget, TargetDatabase};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting SchemaFlow Migrate...");

    let settings = Settings::load()?;
    info!("Configuration loaded successfully");

    let pool = create_pool(&settings.database)?;
    bootstrap_metadata_schema(&pool).await?;
    info!(
        transactional = settings.deployment.transactional,
        verify = settings.deployment.verify,
        timeout_secs = settings.deployment.statement_timeout_secs,
        "Metadata store ready"
    );

    match &settings.target {
        Some(target_config) => {
            let target_pool = create_pool(&target_config.database)?;
            let target = PostgresTarget::new(target_pool, target_config.schema.clone());
            target.ping_connectivity().await?;

            let tables = target.introspect_schema().await?;
            info!(
                host = %target_config.database.host,
                schema = %target_config.schema,
                tables = tables.len(),
                "Target database reachable"
            );
            for table in &tables {
                info!(
                    "   {} ({} columns, {} indexes, {} policies)",
                    table.name,
                    table.columns.len(),
                    table.indexes.len(),
                    table.policies.len()
                );
            }
        }
        None => warn!("TARGET_DATABASE_URL not set, skipping target check"),
    }

    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_migrate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}
