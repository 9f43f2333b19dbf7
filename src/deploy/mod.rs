//! Deployment of migrations to live databases

pub mod backup;
pub mod executor;
pub mod lock;
pub mod postgres;
pub mod record;
pub mod rollback;
pub mod service;
pub mod sql;
pub mod store;
pub mod target;
mod verify;

pub use backup::BackupManager;
pub use executor::{ExecutionOptions, ExecutionReport, MigrationExecutor};
pub use lock::{ProjectGuard, ProjectLocks};
pub use postgres::PgDeploymentStore;
pub use record::{DeploymentRecord, DeploymentStatus};
pub use rollback::RollbackCoordinator;
pub use service::{DeploymentOutcome, DeploymentRequest, DeploymentService};
pub use store::{Backup, DeploymentStore, InMemoryDeploymentStore};
pub use target::{PostgresTarget, TargetDatabase};
