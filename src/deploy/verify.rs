//! Post-deployment verification
//!
//! Compares the re-introspected live structure with what the deployment was
//! supposed to produce. Defaults, policies and uniqueness are not compared.

use crate::error::{EngineError, EngineResult};
use crate::schema::Table;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

static CREATE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^CREATE TABLE (?:IF NOT EXISTS )?(\w+)").expect("valid regex"));
static DROP_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^DROP TABLE (?:IF EXISTS )?(\w+)").expect("valid regex"));
static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER TABLE (\w+) ADD COLUMN (?:IF NOT EXISTS )?(\w+)").expect("valid regex")
});
static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER TABLE (\w+) DROP COLUMN (?:IF EXISTS )?(\w+)").expect("valid regex")
});
static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^CREATE (?:UNIQUE )?INDEX (?:IF NOT EXISTS )?(\w+) ON (\w+)").expect("valid regex")
});
static DROP_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^DROP INDEX (?:IF EXISTS )?(\w+)").expect("valid regex"));

/// Live structure must match `expected` on table set, column names, types,
/// nullability, primary key and index names
pub fn verify_against_tables(live: &[Table], expected: &[Table]) -> EngineResult<()> {
    let live: BTreeMap<&str, &Table> = live.iter().map(|t| (t.name.as_str(), t)).collect();
    let expected: BTreeMap<&str, &Table> = expected.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut problems = Vec::new();
    for name in expected.keys().filter(|n| !live.contains_key(*n)) {
        problems.push(format!("table '{}' is missing", name));
    }
    for name in live.keys().filter(|n| !expected.contains_key(*n)) {
        problems.push(format!("unexpected table '{}'", name));
    }

    for (name, want) in &expected {
        let Some(have) = live.get(name) else { continue };
        compare_table(have, want, &mut problems);
    }

    into_result(problems)
}

fn compare_table(have: &Table, want: &Table, problems: &mut Vec<String>) {
    let have_columns: BTreeSet<&str> = have.columns.iter().map(|c| c.name.as_str()).collect();
    let want_columns: BTreeSet<&str> = want.columns.iter().map(|c| c.name.as_str()).collect();
    if have_columns != want_columns {
        problems.push(format!(
            "table '{}' has columns {:?}, expected {:?}",
            want.name, have_columns, want_columns
        ));
    }

    for column in &want.columns {
        let Some(live) = have.column(&column.name) else { continue };
        if live.column_type != column.column_type {
            problems.push(format!(
                "column '{}.{}' is {}, expected {}",
                want.name,
                column.name,
                live.column_type.sql_name(),
                column.column_type.sql_name()
            ));
        }
        let want_nullable = column.nullable && !column.primary_key;
        let have_nullable = live.nullable && !live.primary_key;
        if have_nullable != want_nullable {
            problems.push(format!(
                "column '{}.{}' nullability is {}, expected {}",
                want.name, column.name, have_nullable, want_nullable
            ));
        }
    }

    let mut have_key = have.primary_key_columns();
    let mut want_key = want.primary_key_columns();
    have_key.sort_unstable();
    want_key.sort_unstable();
    if have_key != want_key {
        problems.push(format!(
            "table '{}' has primary key {:?}, expected {:?}",
            want.name, have_key, want_key
        ));
    }

    let have_indexes: BTreeSet<&str> = have.indexes.iter().map(|i| i.name.as_str()).collect();
    let want_indexes: BTreeSet<&str> = want.indexes.iter().map(|i| i.name.as_str()).collect();
    if have_indexes != want_indexes {
        problems.push(format!(
            "table '{}' has indexes {:?}, expected {:?}",
            want.name, have_indexes, want_indexes
        ));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Object {
    Table(String),
    Column(String, String),
    /// Index names are schema-wide
    Index(String),
}

/// Check the objects a script creates or drops against the live structure.
/// The last statement touching an object decides whether it should exist.
pub fn verify_against_script(live: &[Table], statements: &[String]) -> EngineResult<()> {
    let mut expectations: BTreeMap<Object, bool> = BTreeMap::new();

    for statement in statements {
        let statement = statement.trim();
        if let Some(caps) = CREATE_TABLE.captures(statement) {
            expectations.insert(Object::Table(caps[1].to_string()), true);
        } else if let Some(caps) = DROP_TABLE.captures(statement) {
            expectations.insert(Object::Table(caps[1].to_string()), false);
        } else if let Some(caps) = ADD_COLUMN.captures(statement) {
            expectations.insert(Object::Column(caps[1].to_string(), caps[2].to_string()), true);
        } else if let Some(caps) = DROP_COLUMN.captures(statement) {
            expectations.insert(Object::Column(caps[1].to_string(), caps[2].to_string()), false);
        } else if let Some(caps) = CREATE_INDEX.captures(statement) {
            expectations.insert(Object::Index(caps[1].to_string()), true);
        } else if let Some(caps) = DROP_INDEX.captures(statement) {
            expectations.insert(Object::Index(caps[1].to_string()), false);
        }
    }

    let table = |name: &str| live.iter().find(|t| t.name == name);
    let table_dropped = |name: &str| expectations.get(&Object::Table(name.to_string())) == Some(&false);

    let mut problems = Vec::new();
    for (object, should_exist) in &expectations {
        match object {
            Object::Table(name) => {
                let exists = table(name).is_some();
                if exists != *should_exist {
                    problems.push(presence("table", name, *should_exist));
                }
            }
            Object::Column(table_name, column) => {
                if *should_exist && table_dropped(table_name) {
                    continue;
                }
                let exists = table(table_name).and_then(|t| t.column(column)).is_some();
                if exists != *should_exist {
                    problems.push(presence("column", &format!("{}.{}", table_name, column), *should_exist));
                }
            }
            Object::Index(name) => {
                let exists = live.iter().any(|t| t.index(name).is_some());
                if exists != *should_exist {
                    problems.push(presence("index", name, *should_exist));
                }
            }
        }
    }

    into_result(problems)
}

fn presence(kind: &str, name: &str, should_exist: bool) -> String {
    if should_exist {
        format!("{} '{}' is missing", kind, name)
    } else {
        format!("{} '{}' still exists", kind, name)
    }
}

fn into_result(problems: Vec<String>) -> EngineResult<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Verification(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::{Column, ColumnType, Index};
    use tokio_test::{assert_err, assert_ok};

    fn users() -> Table {
        let mut table = Table::new(
            "users",
            vec![
                Column::new("id", ColumnType::Uuid).primary_key(),
                Column::new("email", ColumnType::Text).not_null(),
            ],
        );
        table.indexes.push(Index {
            name: "users_email_idx".to_string(),
            columns: vec!["email".to_string()],
            unique: false,
        });
        table
    }

    #[test]
    fn test_matching_tables_verify() {
        assert_ok!(verify_against_tables(&[users()], &[users()]));
    }

    #[test]
    fn test_table_differences_are_reported() {
        let mut live = users();
        live.columns[1].nullable = true;
        live.columns[1].column_type = ColumnType::Varchar;
        live.indexes.clear();

        let err = assert_err!(verify_against_tables(&[live], &[users()]));
        assert_eq!(err.kind(), ErrorKind::Verification);
        let message = err.to_string();
        assert!(message.contains("users.email"));
        assert!(message.contains("nullability"));
        assert!(message.contains("indexes"));

        assert_err!(verify_against_tables(&[], &[users()]));
        assert_err!(verify_against_tables(&[users()], &[]));
    }

    #[test]
    fn test_primary_key_difference_reported() {
        let mut live = users();
        live.columns[1].primary_key = true;

        let err = assert_err!(verify_against_tables(&[live], &[users()]));
        assert!(err.to_string().contains("primary key"));

        let mut keyless = users();
        keyless.columns[0].primary_key = false;
        keyless.columns[0].nullable = false;
        assert_err!(verify_against_tables(&[keyless], &[users()]));
    }

    #[test]
    fn test_script_expectations() {
        let statements = vec![
            "CREATE TABLE users (id uuid PRIMARY KEY, email text NOT NULL)".to_string(),
            "CREATE INDEX users_email_idx ON users (email)".to_string(),
        ];
        assert_ok!(verify_against_script(&[users()], &statements));
        assert_err!(verify_against_script(&[], &statements));
    }

    #[test]
    fn test_last_statement_per_object_wins() {
        let statements = vec![
            "ALTER TABLE users ADD COLUMN nickname text".to_string(),
            "ALTER TABLE users DROP COLUMN IF EXISTS nickname".to_string(),
            "DROP INDEX IF EXISTS users_email_idx".to_string(),
            "CREATE INDEX users_email_idx ON users (email)".to_string(),
        ];
        assert_ok!(verify_against_script(&[users()], &statements));

        let dropped = vec!["DROP TABLE IF EXISTS users".to_string()];
        let err = assert_err!(verify_against_script(&[users()], &dropped));
        assert!(err.to_string().contains("still exists"));
    }
}
