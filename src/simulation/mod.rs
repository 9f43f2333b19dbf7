//! Simulation engine
//!
//! In-memory execution of generated DDL, used to prove migrations before they
//! are stored and as a deployment target in tests.

pub mod database;
mod dry_run;

pub use database::{SimulatedDatabase, SimulatedSchema};
pub use dry_run::{DryRunResult, DryRunner};
