//! Migration executor
//!
//! Runs a forward script against a target: connectivity check, safety
//! validation, optional transactional wrapping, bounded execution and
//! verification.

use crate::deploy::sql::{join_statements, validate_script, wrap_in_transaction};
use crate::deploy::target::TargetDatabase;
use crate::deploy::verify::{verify_against_script, verify_against_tables};
use crate::error::{EngineError, EngineResult};
use crate::schema::Table;
use std::time::Duration;
use tracing::{debug, warn};

/// How a script is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub transactional: bool,
    pub verify: bool,
    /// Bound on each call to the target
    pub statement_timeout: Duration,
}

/// Result of one execution attempt
#[derive(Debug)]
pub struct ExecutionReport {
    /// Whether any DDL was sent to the target
    pub ddl_attempted: bool,
    pub statements: usize,
    pub result: EngineResult<()>,
}

impl ExecutionReport {
    fn before_ddl(error: EngineError) -> Self {
        Self {
            ddl_attempted: false,
            statements: 0,
            result: Err(error),
        }
    }
}

pub struct MigrationExecutor {
    options: ExecutionOptions,
}

impl MigrationExecutor {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    /// Execute `sql` and verify the outcome against `expected` when given,
    /// otherwise against what the script itself creates and drops
    pub async fn execute(
        &self,
        target: &dyn TargetDatabase,
        sql: &str,
        expected: Option<&[Table]>,
    ) -> ExecutionReport {
        if let Err(e) = target.ping_connectivity().await {
            return ExecutionReport::before_ddl(match e {
                EngineError::Connectivity(_) => e,
                other => EngineError::Connectivity(other.to_string()),
            });
        }

        let statements = match validate_script(sql) {
            Ok(statements) => statements,
            Err(e) => return ExecutionReport::before_ddl(e),
        };

        let result = self.run(target, &statements).await;
        let result = match result {
            Ok(()) if self.options.verify => self.verify(target, &statements, expected).await,
            other => other,
        };

        ExecutionReport {
            ddl_attempted: true,
            statements: statements.len(),
            result,
        }
    }

    async fn run(&self, target: &dyn TargetDatabase, statements: &[String]) -> EngineResult<()> {
        if self.options.transactional {
            debug!(statements = statements.len(), "Executing script in one transaction");
            return self.call(target, &wrap_in_transaction(statements)).await;
        }

        for (i, statement) in statements.iter().enumerate() {
            debug!(statement = i + 1, total = statements.len(), "Executing statement");
            self.call(target, &join_statements(std::slice::from_ref(statement)))
                .await
                .map_err(|e| match e {
                    EngineError::Execution(msg) => {
                        EngineError::Execution(format!("statement {} failed: {}", i + 1, msg))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    async fn call(&self, target: &dyn TargetDatabase, sql: &str) -> EngineResult<()> {
        match tokio::time::timeout(self.options.statement_timeout, target.execute_statement(sql)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(EngineError::Execution(msg))) => Err(EngineError::Execution(msg)),
            Ok(Err(other)) => Err(EngineError::Execution(other.to_string())),
            Err(_) => {
                warn!(
                    timeout_secs = self.options.statement_timeout.as_secs_f64(),
                    "Statement timed out; outcome unknown"
                );
                Err(EngineError::Execution(format!(
                    "timed out after {:?}; outcome unknown",
                    self.options.statement_timeout
                )))
            }
        }
    }

    async fn verify(
        &self,
        target: &dyn TargetDatabase,
        statements: &[String],
        expected: Option<&[Table]>,
    ) -> EngineResult<()> {
        let live = target
            .introspect_schema()
            .await
            .map_err(|e| EngineError::Verification(format!("could not introspect target: {}", e)))?;

        match expected {
            Some(expected) => verify_against_tables(&live, expected),
            None => verify_against_script(&live, statements),
        }
    }
}
