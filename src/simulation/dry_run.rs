//! Dry run executor
//!
//! Proves that a migration script round-trips structurally: forward turns the
//! prior state into the new state, and reverse turns it back.

use crate::error::{EngineError, EngineResult};
use crate::migration::MigrationScript;
use crate::schema::{SchemaSnapshot, Table};
use crate::simulation::database::SimulatedSchema;
use serde::Serialize;
use tracing::debug;

pub struct DryRunner;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub success: bool,
    pub error: Option<String>,
    pub forward_statements: usize,
    pub reverse_statements: usize,
}

impl DryRunner {
    /// Execute a dry run of the migration against an in-memory copy of `before`
    pub fn execute(before: &[Table], after: &[Table], script: &MigrationScript) -> DryRunResult {
        let outcome = Self::round_trip(before, after, script);
        debug!(ok = outcome.is_ok(), "Dry run finished");

        DryRunResult {
            success: outcome.is_ok(),
            error: outcome.err(),
            forward_statements: script.forward_statements.len(),
            reverse_statements: script.reverse_statements.len(),
        }
    }

    /// Like [`execute`](Self::execute), failing with `Validation` when the round trip breaks
    pub fn verify(before: &[Table], after: &[Table], script: &MigrationScript) -> EngineResult<()> {
        let result = Self::execute(before, after, script);
        match result.error {
            None => Ok(()),
            Some(e) => Err(EngineError::Validation(format!(
                "Generated migration does not round-trip: {}",
                e
            ))),
        }
    }

    fn round_trip(before: &[Table], after: &[Table], script: &MigrationScript) -> Result<(), String> {
        let mut db = SimulatedSchema::new(before);

        db.apply(&script.forward_sql)
            .map_err(|e| format!("forward script failed: {}", e))?;
        if !Self::same_structure(&db.tables(), after) {
            return Err("forward script does not produce the target schema".to_string());
        }

        db.apply(&script.reverse_sql)
            .map_err(|e| format!("reverse script failed: {}", e))?;
        if !Self::same_structure(&db.tables(), before) {
            return Err("reverse script does not restore the prior schema".to_string());
        }

        Ok(())
    }

    fn same_structure(a: &[Table], b: &[Table]) -> bool {
        SchemaSnapshot::canonical_tables(a) == SchemaSnapshot::canonical_tables(b)
    }
}
