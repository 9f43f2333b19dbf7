//! In-memory database simulation
//!
//! `SimulatedSchema` interprets the DDL vocabulary produced by the migration
//! generator against a set of tables, with PostgreSQL's transaction and
//! dependency rules. `SimulatedDatabase` wraps it as a deployment target with
//! fault injection.

use crate::deploy::target::TargetDatabase;
use crate::error::{EngineError, EngineResult};
use crate::lexer;
use crate::schema::{
    Column, ColumnReference, ColumnType, Index, Policy, PolicyCommand, ReferentialAction, Table,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("simulation pattern is valid")
}

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| pattern(r"(?is)^CREATE TABLE (\w+)\s*\((.*)\)$"));
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^DROP TABLE (IF EXISTS )?(\w+)$"));
static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| pattern(r"(?is)^ALTER TABLE (\w+) ADD COLUMN (.+)$"));
static DROP_COLUMN: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^ALTER TABLE (\w+) DROP COLUMN (IF EXISTS )?(\w+)$"));
static ALTER_COLUMN: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?is)^ALTER TABLE (\w+) ALTER COLUMN (\w+) (.+)$"));
static ADD_UNIQUE: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^ALTER TABLE (\w+) ADD CONSTRAINT (\w+) UNIQUE \((\w+)\)$"));
static ADD_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    pattern(
        r"(?i)^ALTER TABLE (\w+) ADD CONSTRAINT (\w+) FOREIGN KEY \((\w+)\) REFERENCES (\w+) \((\w+)\)(?: ON DELETE (CASCADE|RESTRICT|SET NULL|SET DEFAULT|NO ACTION))?$",
    )
});
static DROP_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^ALTER TABLE (\w+) DROP CONSTRAINT (IF EXISTS )?(\w+)$"));
static ENABLE_RLS: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^ALTER TABLE (\w+) ENABLE ROW LEVEL SECURITY$"));
static CREATE_INDEX: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^CREATE (UNIQUE )?INDEX (\w+) ON (\w+)\s*\(([^)]*)\)$"));
static DROP_INDEX: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^DROP INDEX (IF EXISTS )?(\w+)$"));
static CREATE_POLICY: Lazy<Regex> = Lazy::new(|| {
    pattern(
        r"(?is)^CREATE POLICY (\w+) ON (\w+) FOR (\w+)(?: TO (\w+(?:,\s*\w+)*))?(?: USING \((.*?)\))?(?: WITH CHECK \((.*)\))?$",
    )
});
static DROP_POLICY: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)^DROP POLICY (IF EXISTS )?(\w+) ON (\w+)$"));
static COLUMN_DEF: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?is)^(\w+)\s+(double precision|\w+)\s*(.*)$"));
static DEFAULT_KEYWORD: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bDEFAULT\b"));
static TABLE_PRIMARY_KEY: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^PRIMARY KEY\s*\(([^)]*)\)$"));

type StepResult = Result<(), String>;

/// Schema state that DDL is applied to
#[derive(Debug, Clone, Default)]
pub struct SimulatedSchema {
    tables: BTreeMap<String, Table>,
}

impl SimulatedSchema {
    pub fn new(tables: &[Table]) -> Self {
        Self {
            tables: tables.iter().map(|t| (t.name.clone(), t.clone())).collect(),
        }
    }

    pub fn tables(&self) -> Vec<Table> {
        self.tables.values().cloned().collect()
    }

    /// Apply a script.
    ///
    /// Statements between `BEGIN` and `COMMIT` are atomic; outside a
    /// transaction every statement that succeeded before a failure stays
    /// applied.
    pub fn apply(&mut self, sql: &str) -> EngineResult<()> {
        let statements = lexer::split_statements(sql)
            .map_err(|e| EngineError::Execution(format!("syntax error: {}", e)))?;
        self.apply_statements(&statements, |_| false)
    }

    /// Like [`apply`](Self::apply), failing any statement for which `fails` returns true
    fn apply_statements(
        &mut self,
        statements: &[String],
        fails: impl Fn(&str) -> bool,
    ) -> EngineResult<()> {
        let mut savepoint: Option<BTreeMap<String, Table>> = None;

        for (i, statement) in statements.iter().enumerate() {
            let upper = statement.trim().to_uppercase();
            match upper.as_str() {
                "BEGIN" | "START TRANSACTION" => {
                    savepoint = Some(self.tables.clone());
                    continue;
                }
                "COMMIT" => {
                    savepoint = None;
                    continue;
                }
                "ROLLBACK" => {
                    if let Some(saved) = savepoint.take() {
                        self.tables = saved;
                    }
                    continue;
                }
                _ => {}
            }

            let result = if fails(statement) {
                Err("injected failure".to_string())
            } else {
                self.execute(statement)
            };

            if let Err(e) = result {
                if let Some(saved) = savepoint.take() {
                    self.tables = saved;
                }
                return Err(EngineError::Execution(format!(
                    "statement {} failed: {} ({})",
                    i + 1,
                    e,
                    statement
                )));
            }
        }

        // A transaction left open is rolled back when the session ends
        if let Some(saved) = savepoint {
            self.tables = saved;
        }
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> StepResult {
        let statement = statement.trim();

        if let Some(c) = CREATE_TABLE.captures(statement) {
            return self.create_table(&c[1], &c[2]);
        }
        if let Some(c) = DROP_TABLE.captures(statement) {
            return self.drop_table(&c[2], c.get(1).is_some());
        }
        if let Some(c) = ADD_COLUMN.captures(statement) {
            let column = parse_column(&c[2])?;
            let table = self.table_mut(&c[1])?;
            if table.column(&column.name).is_some() {
                return Err(format!("column '{}' already exists", column.name));
            }
            if column.primary_key && !table.primary_key_columns().is_empty() {
                return Err(format!("multiple primary keys for table '{}' are not allowed", table.name));
            }
            table.columns.push(column);
            return Ok(());
        }
        if let Some(c) = DROP_COLUMN.captures(statement) {
            return self.drop_column(&c[1], &c[3], c.get(2).is_some());
        }
        if let Some(c) = ALTER_COLUMN.captures(statement) {
            return self.alter_column(&c[1], &c[2], c[3].trim());
        }
        if let Some(c) = ADD_UNIQUE.captures(statement) {
            let column = self.column_mut(&c[1], &c[3])?;
            if column.unique {
                return Err(format!("constraint '{}' already exists", &c[2]));
            }
            column.unique = true;
            return Ok(());
        }
        if let Some(c) = ADD_FOREIGN_KEY.captures(statement) {
            let on_delete = c
                .get(6)
                .and_then(|m| ReferentialAction::from_sql(m.as_str()))
                .filter(|a| *a != ReferentialAction::NoAction);
            let (ref_table, ref_column) = (c[4].to_string(), c[5].to_string());
            let exists = self
                .tables
                .get(&ref_table)
                .is_some_and(|t| t.column(&ref_column).is_some());
            if !exists {
                return Err(format!("referenced column '{}.{}' does not exist", ref_table, ref_column));
            }
            let column = self.column_mut(&c[1], &c[3])?;
            if column.references.is_some() {
                return Err(format!("constraint '{}' already exists", &c[2]));
            }
            column.references = Some(ColumnReference {
                table: ref_table,
                column: ref_column,
                on_delete,
            });
            return Ok(());
        }
        if let Some(c) = DROP_CONSTRAINT.captures(statement) {
            return self.drop_constraint(&c[1], &c[3], c.get(2).is_some());
        }
        if let Some(c) = ENABLE_RLS.captures(statement) {
            self.table_mut(&c[1])?;
            return Ok(());
        }
        if let Some(c) = CREATE_INDEX.captures(statement) {
            let index = Index {
                name: c[2].to_string(),
                columns: split_list(&c[4]),
                unique: c.get(1).is_some(),
            };
            return self.create_index(&c[3], index);
        }
        if let Some(c) = DROP_INDEX.captures(statement) {
            return self.drop_index(&c[2], c.get(1).is_some());
        }
        if let Some(c) = CREATE_POLICY.captures(statement) {
            let command = PolicyCommand::from_sql(&c[3])
                .ok_or_else(|| format!("unknown policy command '{}'", &c[3]))?;
            let policy = Policy {
                name: c[1].to_string(),
                command,
                roles: Policy::normalize_roles(c.get(4).map(|m| split_list(m.as_str())).unwrap_or_default()),
                using: c.get(5).map(|m| m.as_str().to_string()),
                with_check: c.get(6).map(|m| m.as_str().to_string()),
            };
            let table = self.table_mut(&c[2])?;
            if table.policy(&policy.name).is_some() {
                return Err(format!("policy '{}' already exists", policy.name));
            }
            table.policies.push(policy);
            return Ok(());
        }
        if let Some(c) = DROP_POLICY.captures(statement) {
            let if_exists = c.get(1).is_some();
            let name = c[2].to_string();
            let table = self.table_mut(&c[3])?;
            let before = table.policies.len();
            table.policies.retain(|p| p.name != name);
            if table.policies.len() == before && !if_exists {
                return Err(format!("policy '{}' does not exist", name));
            }
            return Ok(());
        }

        Err("unsupported statement".to_string())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, String> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| format!("relation '{}' does not exist", name))
    }

    fn column_mut(&mut self, table: &str, column: &str) -> Result<&mut Column, String> {
        self.table_mut(table)?
            .columns
            .iter_mut()
            .find(|c| c.name == column)
            .ok_or_else(|| format!("column '{}.{}' does not exist", table, column))
    }

    /// First column outside `except_table` holding a foreign key into `table[.column]`
    fn referenced_by(&self, table: &str, column: Option<&str>, except_table: Option<&str>) -> Option<String> {
        self.tables.values().find_map(|t| {
            if Some(t.name.as_str()) == except_table {
                return None;
            }
            t.columns.iter().find_map(|c| {
                let r = c.references.as_ref()?;
                let hit = r.table == table && column.map_or(true, |col| r.column == col);
                hit.then(|| format!("{}.{}", t.name, c.name))
            })
        })
    }

    fn index_exists(&self, name: &str) -> bool {
        self.tables.values().any(|t| t.index(name).is_some())
    }

    fn create_table(&mut self, name: &str, body: &str) -> StepResult {
        if self.tables.contains_key(name) {
            return Err(format!("relation '{}' already exists", name));
        }

        let mut columns: Vec<Column> = Vec::new();
        let mut table_pk: Vec<String> = Vec::new();
        for def in split_top_level(body) {
            if let Some(c) = TABLE_PRIMARY_KEY.captures(&def) {
                table_pk = split_list(&c[1]);
            } else {
                let column = parse_column(&def)?;
                if columns.iter().any(|c| c.name == column.name) {
                    return Err(format!("column '{}' specified more than once", column.name));
                }
                columns.push(column);
            }
        }
        for key in &table_pk {
            let column = columns
                .iter_mut()
                .find(|c| &c.name == key)
                .ok_or_else(|| format!("primary key column '{}' does not exist", key))?;
            column.primary_key = true;
            column.nullable = false;
        }
        if columns.iter().filter(|c| c.primary_key).count() > 1 && table_pk.is_empty() {
            return Err("multiple primary keys are not allowed".to_string());
        }

        self.tables.insert(name.to_string(), Table::new(name, columns));
        Ok(())
    }

    fn drop_table(&mut self, name: &str, if_exists: bool) -> StepResult {
        if !self.tables.contains_key(name) {
            return if if_exists {
                Ok(())
            } else {
                Err(format!("table '{}' does not exist", name))
            };
        }
        if let Some(dependent) = self.referenced_by(name, None, Some(name)) {
            return Err(format!(
                "cannot drop table '{}' because '{}' depends on it",
                name, dependent
            ));
        }
        self.tables.remove(name);
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str, if_exists: bool) -> StepResult {
        if let Some(dependent) = self.referenced_by(table, Some(column), None) {
            return Err(format!(
                "cannot drop column '{}.{}' because '{}' depends on it",
                table, column, dependent
            ));
        }
        let t = self.table_mut(table)?;
        if t.column(column).is_none() {
            return if if_exists {
                Ok(())
            } else {
                Err(format!("column '{}.{}' does not exist", table, column))
            };
        }
        let was_key = t.column(column).is_some_and(|c| c.primary_key);
        t.columns.retain(|c| c.name != column);
        t.indexes.retain(|i| !i.columns.iter().any(|c| c == column));
        // Dropping a key column drops the whole constraint; NOT NULL stays
        if was_key {
            for remaining in &mut t.columns {
                remaining.primary_key = false;
            }
        }
        Ok(())
    }

    fn alter_column(&mut self, table: &str, column: &str, action: &str) -> StepResult {
        let target = self.column_mut(table, column)?;
        let upper = action.to_uppercase();

        if let Some(ty) = upper.strip_prefix("TYPE ") {
            target.column_type = ColumnType::from_sql_name(ty)
                .ok_or_else(|| format!("type '{}' does not exist", ty.to_lowercase()))?;
        } else if upper == "SET NOT NULL" {
            target.nullable = false;
        } else if upper == "DROP NOT NULL" {
            if target.primary_key {
                return Err(format!("column '{}' is in a primary key", column));
            }
            target.nullable = true;
        } else if upper.starts_with("SET DEFAULT ") {
            target.default_value = Some(action["SET DEFAULT ".len()..].trim().to_string());
        } else if upper == "DROP DEFAULT" {
            target.default_value = None;
        } else {
            return Err(format!("unsupported column action '{}'", action));
        }
        Ok(())
    }

    fn drop_constraint(&mut self, table: &str, name: &str, if_exists: bool) -> StepResult {
        let t = self.table_mut(table)?;
        let mut found = false;
        for column in t.columns.iter_mut() {
            if column.unique && name == format!("{}_{}_key", table, column.name) {
                column.unique = false;
                found = true;
            }
            if column.references.is_some() && name == format!("{}_{}_fkey", table, column.name) {
                column.references = None;
                found = true;
            }
        }
        if !found && !if_exists {
            return Err(format!("constraint '{}' does not exist", name));
        }
        Ok(())
    }

    fn create_index(&mut self, table: &str, index: Index) -> StepResult {
        if self.index_exists(&index.name) {
            return Err(format!("relation '{}' already exists", index.name));
        }
        let t = self.table_mut(table)?;
        if let Some(missing) = index.columns.iter().find(|c| t.column(c).is_none()) {
            return Err(format!("column '{}' does not exist", missing));
        }
        t.indexes.push(index);
        Ok(())
    }

    fn drop_index(&mut self, name: &str, if_exists: bool) -> StepResult {
        if !self.index_exists(name) {
            return if if_exists {
                Ok(())
            } else {
                Err(format!("index '{}' does not exist", name))
            };
        }
        for table in self.tables.values_mut() {
            table.indexes.retain(|i| i.name != name);
        }
        Ok(())
    }
}

/// Split on commas outside parentheses and quotes
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quote = false;

    for ch in body.chars() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth -= 1,
            ',' if !in_quote && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `name type[ PRIMARY KEY][ NOT NULL][ UNIQUE][ DEFAULT expr]`
fn parse_column(def: &str) -> Result<Column, String> {
    let caps = COLUMN_DEF
        .captures(def.trim())
        .ok_or_else(|| format!("malformed column definition '{}'", def.trim()))?;
    let column_type = ColumnType::from_sql_name(&caps[2])
        .ok_or_else(|| format!("type '{}' does not exist", &caps[2]))?;

    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
    let (flags, default_value) = match DEFAULT_KEYWORD.find(rest) {
        Some(m) => (&rest[..m.start()], Some(rest[m.end()..].trim().to_string())),
        None => (rest, None),
    };
    let flags = flags.to_uppercase();
    let primary_key = flags.contains("PRIMARY KEY");

    Ok(Column {
        name: caps[1].to_string(),
        column_type,
        nullable: !(primary_key || flags.contains("NOT NULL")),
        unique: flags.contains("UNIQUE"),
        primary_key,
        default_value,
        references: None,
    })
}

/// A deployment target backed by [`SimulatedSchema`]
#[derive(Debug, Default)]
pub struct SimulatedDatabase {
    schema: Mutex<SimulatedSchema>,
    failing_statements: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    fail_introspection: AtomicBool,
    execute_delay: Mutex<Option<Duration>>,
    executed: Mutex<Vec<String>>,
    execute_calls: AtomicUsize,
}

impl SimulatedDatabase {
    pub fn new(tables: &[Table]) -> Self {
        Self {
            schema: Mutex::new(SimulatedSchema::new(tables)),
            ..Default::default()
        }
    }

    /// Fail every statement containing `fragment`
    pub async fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.failing_statements.lock().await.push(fragment.into());
    }

    pub async fn clear_failures(&self) {
        self.failing_statements.lock().await.clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_introspection_failure(&self, failing: bool) {
        self.fail_introspection.store(failing, Ordering::SeqCst);
    }

    /// Sleep this long before every execution
    pub async fn set_execute_delay(&self, delay: Option<Duration>) {
        *self.execute_delay.lock().await = delay;
    }

    pub async fn tables(&self) -> Vec<Table> {
        self.schema.lock().await.tables()
    }

    /// Scripts received by `execute_statement`, in order
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> EngineResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Connectivity(
                "simulated database is unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetDatabase for SimulatedDatabase {
    async fn execute_statement(&self, sql: &str) -> EngineResult<()> {
        self.check_reachable()?;
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().await.push(sql.to_string());

        let delay = *self.execute_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let statements = lexer::split_statements(sql)
            .map_err(|e| EngineError::Execution(format!("syntax error: {}", e)))?;
        let failing = self.failing_statements.lock().await.clone();

        let mut schema = self.schema.lock().await;
        let result = schema.apply_statements(&statements, |statement| {
            failing.iter().any(|f| statement.contains(f.as_str()))
        });
        debug!(statements = statements.len(), ok = result.is_ok(), "Simulated execution");
        result
    }

    async fn introspect_schema(&self) -> EngineResult<Vec<Table>> {
        self.check_reachable()?;
        if self.fail_introspection.load(Ordering::SeqCst) {
            return Err(EngineError::Connectivity(
                "simulated introspection failure".to_string(),
            ));
        }
        Ok(self.schema.lock().await.tables())
    }

    async fn ping_connectivity(&self) -> EngineResult<()> {
        self.check_reachable()
    }
}
