//! SQL safety validation
//!
//! Scripts reaching a deployment target may only contain schema DDL in the
//! generator's vocabulary. Anything touching databases, server settings,
//! system schemas or transaction control is refused before execution.

use crate::error::{validation_error, EngineResult};
use crate::lexer;
use once_cell::sync::Lazy;
use regex::Regex;

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

fn rule(pattern: &str, reason: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("deny rule pattern is valid"),
        reason,
    }
}

static DENY_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)\bDROP\s+DATABASE\b", "DROP DATABASE is not allowed"),
        rule(r"(?i)\bCREATE\s+DATABASE\b", "CREATE DATABASE is not allowed"),
        rule(r"(?i)\bALTER\s+SYSTEM\b", "ALTER SYSTEM is not allowed"),
        rule(r"(?i)\bpg_catalog\b", "system schema pg_catalog is off limits"),
        rule(r"(?i)\binformation_schema\b", "system schema information_schema is off limits"),
        rule(r"(?i)\bpg_toast\b", "system schema pg_toast is off limits"),
        rule(
            r"(?i)^\s*(BEGIN|COMMIT|ROLLBACK|START\s+TRANSACTION|SAVEPOINT|RELEASE|END|ABORT)\b",
            "transaction control is managed by the executor",
        ),
    ]
});

static DDL_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(CREATE|ALTER|DROP)\b").expect("verb pattern is valid"));

/// Validate a script and return its statements
pub fn validate_script(sql: &str) -> EngineResult<Vec<String>> {
    let statements = lexer::split_statements(sql).map_err(|e| validation_error(format!("Malformed SQL: {}", e)))?;

    if statements.is_empty() {
        return Err(validation_error("Migration script contains no statements"));
    }

    for (i, statement) in statements.iter().enumerate() {
        for rule in DENY_RULES.iter() {
            if rule.pattern.is_match(statement) {
                return Err(validation_error(format!(
                    "Statement {} rejected: {}",
                    i + 1,
                    rule.reason
                )));
            }
        }
        if !DDL_VERB.is_match(statement) {
            return Err(validation_error(format!(
                "Statement {} rejected: only CREATE, ALTER and DROP statements are allowed",
                i + 1
            )));
        }
    }

    Ok(statements)
}

/// Join statements into one transactional script
pub fn wrap_in_transaction(statements: &[String]) -> String {
    let mut script = String::from("BEGIN;\n");
    for statement in statements {
        script.push_str(statement);
        script.push_str(";\n");
    }
    script.push_str("COMMIT;");
    script
}

pub fn join_statements(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n")
}
