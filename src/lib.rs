//! SchemaFlow Migrate
//!
//! Versioned schema snapshots, migration generation between them, and safe
//! deployment of migrations to live PostgreSQL databases with backup and
//! rollback.

pub mod config;
pub mod db;
pub mod deploy;
pub mod error;
pub mod introspection;
pub mod lexer;
pub mod migration;
pub mod schema;
pub mod simulation;
pub mod snapshot;
pub mod state;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use state::{Engine, SharedEngine};
