//! Migration SQL generator
//!
//! Turns a changeset into forward and reverse PostgreSQL DDL. Each direction is
//! assembled from three phases: foreign keys that must go away are dropped
//! first, then the structural statements run in changeset order, and foreign
//! keys that must exist are added last. Reference order between tables therefore
//! never matters.

use crate::error::{validation_error, EngineResult};
use crate::schema::{Column, Index, Policy, Table};
use crate::snapshot::diff::{ChangeDetails, ChangeOperation, ObjectKind, SchemaChange};
use serde::{Deserialize, Serialize};

/// Forward and reverse DDL for a changeset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationScript {
    pub forward_sql: String,
    pub reverse_sql: String,
    pub forward_statements: Vec<String>,
    pub reverse_statements: Vec<String>,
    pub data_loss_warnings: Vec<String>,
}

impl MigrationScript {
    pub fn is_empty(&self) -> bool {
        self.forward_statements.is_empty()
    }
}

/// Statements of one direction, grouped by phase
#[derive(Debug, Default)]
struct Phases {
    prelude: Vec<String>,
    body: Vec<String>,
    deferred: Vec<String>,
}

impl Phases {
    fn append(&mut self, other: Phases) {
        self.prelude.extend(other.prelude);
        self.body.extend(other.body);
        self.deferred.extend(other.deferred);
    }

    fn into_statements(self) -> Vec<String> {
        let mut statements = self.prelude;
        statements.extend(self.body);
        statements.extend(self.deferred);
        statements
    }
}

pub struct MigrationGenerator;

impl MigrationGenerator {
    /// Generate forward and reverse SQL for a changeset.
    ///
    /// Fails before producing anything if any entry cannot be rendered in
    /// both directions.
    pub fn generate(changes: &[SchemaChange]) -> EngineResult<MigrationScript> {
        let mut forward = Phases::default();
        let mut reverse_parts = Vec::with_capacity(changes.len());
        let mut data_loss_warnings = Vec::new();

        for change in changes {
            if change.details.kind() != change.kind {
                return Err(validation_error(format!(
                    "Change '{}' is a {:?} change but carries {:?} details",
                    change.target,
                    change.kind,
                    change.details.kind()
                )));
            }

            let (fwd, rev) = Self::render(change)?;
            forward.append(fwd);
            reverse_parts.push(rev);

            if let Some(warning) = Self::data_loss_warning(change) {
                data_loss_warnings.push(warning);
            }
        }

        let mut reverse = Phases::default();
        for part in reverse_parts.into_iter().rev() {
            reverse.append(part);
        }

        let forward_statements = forward.into_statements();
        let reverse_statements = reverse.into_statements();

        Ok(MigrationScript {
            forward_sql: forward_statements.join("\n"),
            reverse_sql: reverse_statements.join("\n"),
            forward_statements,
            reverse_statements,
            data_loss_warnings,
        })
    }

    /// Render one change in both directions
    fn render(change: &SchemaChange) -> EngineResult<(Phases, Phases)> {
        let mut forward = Phases::default();
        let mut reverse = Phases::default();

        match &change.details {
            ChangeDetails::Table { before, after } => match change.operation {
                ChangeOperation::Create => {
                    let table = Self::require(after.as_ref(), change, "after")?;
                    Self::create_table(table, &mut forward);
                    Self::drop_table(table, &mut reverse);
                }
                ChangeOperation::Delete => {
                    let table = Self::require(before.as_ref(), change, "before")?;
                    Self::drop_table(table, &mut forward);
                    Self::create_table(table, &mut reverse);
                }
                ChangeOperation::Modify => {
                    return Err(validation_error(format!(
                        "Table '{}' cannot be modified as a whole; express the change per column, index or policy",
                        change.target
                    )));
                }
            },
            ChangeDetails::Column { before, after } => {
                let table = change.table.as_str();
                match change.operation {
                    ChangeOperation::Create => {
                        let column = Self::require(after.as_ref(), change, "after")?;
                        Self::reject_key_column(table, column, "Adding")?;
                        Self::add_column(table, column, &mut forward);
                        Self::drop_column(table, column, &mut reverse);
                    }
                    ChangeOperation::Delete => {
                        let column = Self::require(before.as_ref(), change, "before")?;
                        Self::reject_key_column(table, column, "Dropping")?;
                        Self::drop_column(table, column, &mut forward);
                        Self::add_column(table, column, &mut reverse);
                    }
                    ChangeOperation::Modify => {
                        let old = Self::require(before.as_ref(), change, "before")?;
                        let new = Self::require(after.as_ref(), change, "after")?;
                        Self::alter_column(table, old, new, &mut forward)?;
                        Self::alter_column(table, new, old, &mut reverse)?;
                    }
                }
            }
            ChangeDetails::Index { before, after } => {
                let table = change.table.as_str();
                match change.operation {
                    ChangeOperation::Create => {
                        let index = Self::require(after.as_ref(), change, "after")?;
                        forward.body.push(Self::create_index_sql(table, index));
                        reverse.body.push(Self::drop_index_sql(index));
                    }
                    ChangeOperation::Delete => {
                        let index = Self::require(before.as_ref(), change, "before")?;
                        forward.body.push(Self::drop_index_sql(index));
                        reverse.body.push(Self::create_index_sql(table, index));
                    }
                    ChangeOperation::Modify => {
                        let old = Self::require(before.as_ref(), change, "before")?;
                        let new = Self::require(after.as_ref(), change, "after")?;
                        if old == new {
                            return Err(Self::no_difference(change));
                        }
                        forward.body.push(Self::drop_index_sql(old));
                        forward.body.push(Self::create_index_sql(table, new));
                        reverse.body.push(Self::drop_index_sql(new));
                        reverse.body.push(Self::create_index_sql(table, old));
                    }
                }
            }
            ChangeDetails::Policy { before, after } => {
                let table = change.table.as_str();
                match change.operation {
                    ChangeOperation::Create => {
                        let policy = Self::require(after.as_ref(), change, "after")?;
                        Self::create_policy(table, policy, &mut forward);
                        reverse.body.push(Self::drop_policy_sql(table, policy));
                    }
                    ChangeOperation::Delete => {
                        let policy = Self::require(before.as_ref(), change, "before")?;
                        forward.body.push(Self::drop_policy_sql(table, policy));
                        Self::create_policy(table, policy, &mut reverse);
                    }
                    ChangeOperation::Modify => {
                        let old = Self::require(before.as_ref(), change, "before")?;
                        let new = Self::require(after.as_ref(), change, "after")?;
                        if old == new {
                            return Err(Self::no_difference(change));
                        }
                        forward.body.push(Self::drop_policy_sql(table, old));
                        Self::create_policy(table, new, &mut forward);
                        reverse.body.push(Self::drop_policy_sql(table, new));
                        Self::create_policy(table, old, &mut reverse);
                    }
                }
            }
        }

        Ok((forward, reverse))
    }

    fn require<'a, T>(value: Option<&'a T>, change: &SchemaChange, side: &str) -> EngineResult<&'a T> {
        value.ok_or_else(|| {
            validation_error(format!(
                "Change '{}' ({:?} {:?}) is missing its '{}' definition",
                change.target, change.operation, change.kind, side
            ))
        })
    }

    fn no_difference(change: &SchemaChange) -> crate::error::EngineError {
        validation_error(format!(
            "Modify change '{}' has no effective difference",
            change.target
        ))
    }

    fn data_loss_warning(change: &SchemaChange) -> Option<String> {
        if change.operation != ChangeOperation::Delete {
            return None;
        }
        match change.kind {
            ObjectKind::Table => Some(format!(
                "Dropping table '{}' permanently deletes its rows; rollback restores structure only",
                change.target
            )),
            ObjectKind::Column => Some(format!(
                "Dropping column '{}' permanently deletes its values; rollback restores structure only",
                change.target
            )),
            _ => None,
        }
    }

    // -- tables -----------------------------------------------------------

    fn create_table(table: &Table, out: &mut Phases) {
        let pk = table.primary_key_columns();
        let composite = pk.len() > 1;

        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("  {}", Self::column_definition(c, !composite)))
            .collect();
        if composite {
            defs.push(format!("  PRIMARY KEY ({})", pk.join(", ")));
        }

        out.body.push(format!("CREATE TABLE {} (\n{}\n);", table.name, defs.join(",\n")));

        for index in &table.indexes {
            out.body.push(Self::create_index_sql(&table.name, index));
        }
        if !table.policies.is_empty() {
            out.body.push(Self::enable_rls_sql(&table.name));
            for policy in &table.policies {
                out.body.push(Self::create_policy_sql(&table.name, policy));
            }
        }

        for column in &table.columns {
            if let Some(sql) = Self::add_foreign_key_sql(&table.name, column) {
                out.deferred.push(sql);
            }
        }
    }

    fn drop_table(table: &Table, out: &mut Phases) {
        for column in &table.columns {
            if column.references.is_some() {
                out.prelude.push(Self::drop_foreign_key_sql(&table.name, &column.name));
            }
        }
        out.body.push(format!("DROP TABLE IF EXISTS {};", table.name));
    }

    // -- columns ----------------------------------------------------------

    /// `name type[ PRIMARY KEY][ NOT NULL][ UNIQUE][ DEFAULT expr]`
    fn column_definition(column: &Column, inline_primary_key: bool) -> String {
        let mut def = format!("{} {}", column.name, column.column_type.sql_name());
        if inline_primary_key && column.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if column.unique {
            def.push_str(" UNIQUE");
        }
        if let Some(ref default) = column.default_value {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }

    /// Adding or dropping a key column changes the table's primary key
    fn reject_key_column(table: &str, column: &Column, action: &str) -> EngineResult<()> {
        if column.primary_key {
            return Err(validation_error(format!(
                "{} primary key column '{}.{}' changes the table's primary key; this requires a manual migration",
                action, table, column.name
            )));
        }
        Ok(())
    }

    fn add_column(table: &str, column: &Column, out: &mut Phases) {
        out.body.push(format!(
            "ALTER TABLE {} ADD COLUMN {};",
            table,
            Self::column_definition(column, true)
        ));
        if let Some(sql) = Self::add_foreign_key_sql(table, column) {
            out.deferred.push(sql);
        }
    }

    fn drop_column(table: &str, column: &Column, out: &mut Phases) {
        if column.references.is_some() {
            out.prelude.push(Self::drop_foreign_key_sql(table, &column.name));
        }
        out.body.push(format!("ALTER TABLE {} DROP COLUMN {};", table, column.name));
    }

    /// Statements turning `from` into `to`
    fn alter_column(table: &str, from: &Column, to: &Column, out: &mut Phases) -> EngineResult<()> {
        if from.name != to.name {
            return Err(validation_error(format!(
                "Column '{}.{}' cannot be renamed to '{}' by a modify change",
                table, from.name, to.name
            )));
        }
        if from.primary_key != to.primary_key {
            return Err(validation_error(format!(
                "Primary key membership of '{}.{}' changed; this requires a manual migration",
                table, from.name
            )));
        }
        if from == to {
            return Err(validation_error(format!(
                "Modify change '{}.{}' has no effective difference",
                table, from.name
            )));
        }

        let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, to.name);

        if from.column_type != to.column_type {
            out.body.push(format!("{} TYPE {};", prefix, to.column_type.sql_name()));
        }

        match (from.nullable, to.nullable) {
            (true, false) => out.body.push(format!("{} SET NOT NULL;", prefix)),
            (false, true) => out.body.push(format!("{} DROP NOT NULL;", prefix)),
            _ => {}
        }

        if from.default_value != to.default_value {
            match to.default_value {
                Some(ref default) => out.body.push(format!("{} SET DEFAULT {};", prefix, default)),
                None => out.body.push(format!("{} DROP DEFAULT;", prefix)),
            }
        }

        match (from.unique, to.unique) {
            (false, true) => out.body.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
                table,
                Self::unique_constraint_name(table, &to.name),
                to.name
            )),
            (true, false) => out.body.push(format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                table,
                Self::unique_constraint_name(table, &to.name)
            )),
            _ => {}
        }

        if from.references != to.references {
            if from.references.is_some() {
                out.prelude.push(Self::drop_foreign_key_sql(table, &from.name));
            }
            if let Some(sql) = Self::add_foreign_key_sql(table, to) {
                out.deferred.push(sql);
            }
        }

        Ok(())
    }

    // -- constraints ------------------------------------------------------

    pub fn foreign_key_name(table: &str, column: &str) -> String {
        format!("{}_{}_fkey", table, column)
    }

    pub fn unique_constraint_name(table: &str, column: &str) -> String {
        format!("{}_{}_key", table, column)
    }

    fn add_foreign_key_sql(table: &str, column: &Column) -> Option<String> {
        let reference = column.references.as_ref()?;
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            table,
            Self::foreign_key_name(table, &column.name),
            column.name,
            reference.table,
            reference.column
        );
        if let Some(action) = reference.on_delete {
            sql.push_str(&format!(" ON DELETE {}", action.sql()));
        }
        sql.push(';');
        Some(sql)
    }

    fn drop_foreign_key_sql(table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
            table,
            Self::foreign_key_name(table, column)
        )
    }

    // -- indexes ----------------------------------------------------------

    fn create_index_sql(table: &str, index: &Index) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            table,
            index.columns.join(", ")
        )
    }

    fn drop_index_sql(index: &Index) -> String {
        format!("DROP INDEX IF EXISTS {};", index.name)
    }

    // -- policies ---------------------------------------------------------

    fn enable_rls_sql(table: &str) -> String {
        format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;", table)
    }

    /// A standalone policy also switches row-level security on; enabling is idempotent
    fn create_policy(table: &str, policy: &Policy, out: &mut Phases) {
        out.body.push(Self::enable_rls_sql(table));
        out.body.push(Self::create_policy_sql(table, policy));
    }

    fn create_policy_sql(table: &str, policy: &Policy) -> String {
        let mut sql = format!(
            "CREATE POLICY {} ON {} FOR {}",
            policy.name,
            table,
            policy.command.sql()
        );
        if !policy.roles.is_empty() {
            sql.push_str(&format!(" TO {}", policy.roles.join(", ")));
        }
        if let Some(ref using) = policy.using {
            sql.push_str(&format!(" USING ({})", using));
        }
        if let Some(ref check) = policy.with_check {
            sql.push_str(&format!(" WITH CHECK ({})", check));
        }
        sql.push(';');
        sql
    }

    fn drop_policy_sql(table: &str, policy: &Policy) -> String {
        format!("DROP POLICY IF EXISTS {} ON {};", policy.name, table)
    }
}
