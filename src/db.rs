//! Database connection management
//!
//! Builds connection pools for the metadata store and deployment targets, and
//! creates the metadata tables.

pub mod queries;

use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Create a connection pool, with TLS when the configuration asks for it
pub fn create_pool(config: &DatabaseConfig) -> EngineResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    let pool = if config.use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
    }
    .map_err(|e| EngineError::Config(format!("Failed to create pool: {}", e)))?;

    debug!(
        host = %config.host,
        database = %config.database,
        tls = config.use_tls,
        "Connection pool created"
    );
    Ok(pool)
}

/// Check that the pool can reach its database
pub async fn ping(pool: &Pool) -> EngineResult<()> {
    let client = pool
        .get()
        .await
        .map_err(|e| EngineError::Connectivity(format!("Failed to get pool connection: {}", e)))?;
    client
        .query_one(queries::PING, &[])
        .await
        .map_err(|e| EngineError::Connectivity(format!("Database did not answer: {}", e)))?;
    Ok(())
}

/// Create the metadata tables if they don't exist
pub async fn bootstrap_metadata_schema(pool: &Pool) -> EngineResult<()> {
    let client = pool.get().await?;
    client.batch_execute(queries::CREATE_METADATA_SCHEMA).await?;
    info!("Metadata tables initialized");
    Ok(())
}
