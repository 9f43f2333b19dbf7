//! Error handling module
//!
//! Provides the unified error taxonomy for versioning, migration generation and
//! deployment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or unsafe SQL, malformed schema input, incomplete changeset details
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing project, version, deployment or backup
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target database unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// DDL failed (or timed out) mid-run
    #[error("Execution error: {0}")]
    Execution(String),

    /// Post-execution probe contradicts the reported result
    #[error("Verification error: {0}")]
    Verification(String),

    /// Restore from backup failed; manual intervention required
    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Serializable classification of an [`EngineError`], carried by structured results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Connectivity,
    Execution,
    Verification,
    RollbackFailure,
    Storage,
    Conflict,
    Internal,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Execution => "execution",
            ErrorKind::Verification => "verification",
            ErrorKind::RollbackFailure => "rollback_failure",
            ErrorKind::Storage => "storage",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
            ErrorKind::Config => "config",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "validation" => ErrorKind::Validation,
            "not_found" => ErrorKind::NotFound,
            "connectivity" => ErrorKind::Connectivity,
            "execution" => ErrorKind::Execution,
            "verification" => ErrorKind::Verification,
            "rollback_failure" => ErrorKind::RollbackFailure,
            "storage" => ErrorKind::Storage,
            "conflict" => ErrorKind::Conflict,
            "internal" => ErrorKind::Internal,
            "config" => ErrorKind::Config,
            _ => return None,
        };
        Some(kind)
    }
}

impl EngineError {
    /// Classify this error for structured results. Pure; callers that handle
    /// the error do the logging.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Connectivity(_) => ErrorKind::Connectivity,
            EngineError::Execution(_) => ErrorKind::Execution,
            EngineError::Verification(_) => ErrorKind::Verification,
            EngineError::RollbackFailure(_) => ErrorKind::RollbackFailure,
            EngineError::Database(_) | EngineError::Pool(_) => ErrorKind::Storage,
            EngineError::Serialization(_) => ErrorKind::Internal,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Internal(_) => ErrorKind::Internal,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        EngineError::Validation(errors.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> EngineError {
    EngineError::NotFound(msg.into())
}
