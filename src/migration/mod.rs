//! Migration generation
//!
//! Converts changesets into forward/reverse DDL and estimates their cost.

pub mod downtime;
pub mod generator;
pub mod plan;

pub use downtime::DowntimeEstimator;
pub use generator::{MigrationGenerator, MigrationScript};
pub use plan::MigrationPlan;
