//! Schema Snapshot Module
//!
//! Versioned storage of schema snapshots and the diff engine that compares them:
//! - Change detection with breaking-change classification
//! - Version store over an injected repository
//! - In-memory and PostgreSQL repositories

pub mod diff;
pub mod postgres;
pub mod repository;
pub mod store;

pub use diff::{ChangeDetails, ChangeOperation, ChangeSet, DiffEngine, ObjectKind, SchemaChange};
pub use postgres::PgSnapshotRepository;
pub use repository::{InMemorySnapshotRepository, SchemaVersion, SnapshotRepository, StoredMigration};
pub use store::{VersionCreated, VersionStore, VersionSummary};
