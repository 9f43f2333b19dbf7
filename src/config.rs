//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub use_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            use_tls: false,
        }
    }
}

/// Database that migrations are deployed to
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub database: DatabaseConfig,
    /// Schema that is introspected and migrated
    pub schema: String,
}

/// Deployment behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub statement_timeout_secs: u64,
    /// Wrap forward scripts in a single transaction
    pub transactional: bool,
    /// Re-introspect the target after execution
    pub verify: bool,
}

impl DeploymentConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            statement_timeout_secs: 30,
            transactional: true,
            verify: true,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Metadata store (versions, deployments, backups)
    pub database: DatabaseConfig,
    pub target: Option<TargetConfig>,
    pub deployment: DeploymentConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_pool_size = parse_or(&lookup, "DB_MAX_CONNECTIONS", 10usize)?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
        let database = Self::parse_database_url(&database_url, max_pool_size)?;

        let target = match lookup("TARGET_DATABASE_URL") {
            Some(url) => Some(TargetConfig {
                database: Self::parse_database_url(&url, max_pool_size)?,
                schema: lookup("TARGET_SCHEMA").unwrap_or_else(|| "public".to_string()),
            }),
            None => None,
        };

        let defaults = DeploymentConfig::default();
        let deployment = DeploymentConfig {
            statement_timeout_secs: parse_or(
                &lookup,
                "DEPLOY_STATEMENT_TIMEOUT_SECS",
                defaults.statement_timeout_secs,
            )?,
            transactional: parse_or(&lookup, "DEPLOY_TRANSACTIONAL", defaults.transactional)?,
            verify: parse_or(&lookup, "DEPLOY_VERIFY", defaults.verify)?,
        };
        if deployment.statement_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "DEPLOY_STATEMENT_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            database,
            target,
            deployment,
        })
    }

    /// Parse a connection string (postgresql://...)
    pub fn parse_database_url(url: &str, max_pool_size: usize) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid database URL format (expected postgresql://...)".to_string())
        })?;

        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported database URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in database URL".to_string()))?
            .to_string();

        let sslmode_required = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full"));
        // Neon requires TLS
        let use_tls = sslmode_required || host.contains("neon.tech");

        let database = match parsed.path().trim_start_matches('/') {
            "" => "postgres".to_string(),
            name => name.to_string(),
        };

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size,
            use_tls,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}
