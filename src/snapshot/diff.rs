//! Schema Diff Engine
//!
//! Compares two schema snapshots and produces an ordered, classified
//! changeset. Every entry carries the full definitions needed to build both
//! the forward and the reverse statement.

use crate::schema::{Column, ColumnType, Index, Policy, SchemaSnapshot, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Categories of schema objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    Column,
    Index,
    Policy,
}

/// What happened to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Modify,
    Delete,
}

impl ChangeOperation {
    /// Emission order within a table: delete, create, modify
    fn rank(&self) -> u8 {
        match self {
            ChangeOperation::Delete => 0,
            ChangeOperation::Create => 1,
            ChangeOperation::Modify => 2,
        }
    }
}

/// Definitions of the affected object before and after the change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum ChangeDetails {
    Table {
        before: Option<Table>,
        after: Option<Table>,
    },
    Column {
        before: Option<Column>,
        after: Option<Column>,
    },
    Index {
        before: Option<Index>,
        after: Option<Index>,
    },
    Policy {
        before: Option<Policy>,
        after: Option<Policy>,
    },
}

impl ChangeDetails {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ChangeDetails::Table { .. } => ObjectKind::Table,
            ChangeDetails::Column { .. } => ObjectKind::Column,
            ChangeDetails::Index { .. } => ObjectKind::Index,
            ChangeDetails::Policy { .. } => ObjectKind::Policy,
        }
    }
}

/// A single entry of a changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    pub kind: ObjectKind,
    pub operation: ChangeOperation,
    /// Qualified name: `table` or `table.object`
    pub target: String,
    /// Table the change applies to
    pub table: String,
    pub details: ChangeDetails,
    pub breaking: bool,
}

pub type ChangeSet = Vec<SchemaChange>;

impl SchemaChange {
    pub fn table_created(table: &Table) -> Self {
        Self {
            kind: ObjectKind::Table,
            operation: ChangeOperation::Create,
            target: table.name.clone(),
            table: table.name.clone(),
            details: ChangeDetails::Table {
                before: None,
                after: Some(table.clone()),
            },
            breaking: false,
        }
    }

    pub fn table_deleted(table: &Table) -> Self {
        Self {
            kind: ObjectKind::Table,
            operation: ChangeOperation::Delete,
            target: table.name.clone(),
            table: table.name.clone(),
            details: ChangeDetails::Table {
                before: Some(table.clone()),
                after: None,
            },
            // Dropping a table is always breaking
            breaking: true,
        }
    }

    pub fn column_created(table: &str, column: &Column) -> Self {
        Self {
            kind: ObjectKind::Column,
            operation: ChangeOperation::Create,
            target: format!("{}.{}", table, column.name),
            table: table.to_string(),
            details: ChangeDetails::Column {
                before: None,
                after: Some(column.clone()),
            },
            breaking: !column.nullable && column.default_value.is_none(),
        }
    }

    pub fn column_deleted(table: &str, column: &Column) -> Self {
        Self {
            kind: ObjectKind::Column,
            operation: ChangeOperation::Delete,
            target: format!("{}.{}", table, column.name),
            table: table.to_string(),
            details: ChangeDetails::Column {
                before: Some(column.clone()),
                after: None,
            },
            breaking: !column.nullable,
        }
    }

    pub fn column_modified(table: &str, before: &Column, after: &Column) -> Self {
        Self {
            kind: ObjectKind::Column,
            operation: ChangeOperation::Modify,
            target: format!("{}.{}", table, before.name),
            table: table.to_string(),
            details: ChangeDetails::Column {
                before: Some(before.clone()),
                after: Some(after.clone()),
            },
            breaking: DiffEngine::is_column_change_breaking(before, after),
        }
    }

    pub fn index_created(table: &str, index: &Index) -> Self {
        Self {
            kind: ObjectKind::Index,
            operation: ChangeOperation::Create,
            target: format!("{}.{}", table, index.name),
            table: table.to_string(),
            details: ChangeDetails::Index {
                before: None,
                after: Some(index.clone()),
            },
            breaking: false,
        }
    }

    pub fn index_deleted(table: &str, index: &Index) -> Self {
        Self {
            kind: ObjectKind::Index,
            operation: ChangeOperation::Delete,
            target: format!("{}.{}", table, index.name),
            table: table.to_string(),
            details: ChangeDetails::Index {
                before: Some(index.clone()),
                after: None,
            },
            // Unique index removal drops a constraint clients may rely on
            breaking: index.unique,
        }
    }

    pub fn index_modified(table: &str, before: &Index, after: &Index) -> Self {
        Self {
            kind: ObjectKind::Index,
            operation: ChangeOperation::Modify,
            target: format!("{}.{}", table, before.name),
            table: table.to_string(),
            details: ChangeDetails::Index {
                before: Some(before.clone()),
                after: Some(after.clone()),
            },
            breaking: before.unique != after.unique,
        }
    }

    pub fn policy_created(table: &str, policy: &Policy) -> Self {
        Self::policy_change(table, ChangeOperation::Create, None, Some(policy))
    }

    pub fn policy_deleted(table: &str, policy: &Policy) -> Self {
        Self::policy_change(table, ChangeOperation::Delete, Some(policy), None)
    }

    pub fn policy_modified(table: &str, before: &Policy, after: &Policy) -> Self {
        Self::policy_change(table, ChangeOperation::Modify, Some(before), Some(after))
    }

    fn policy_change(
        table: &str,
        operation: ChangeOperation,
        before: Option<&Policy>,
        after: Option<&Policy>,
    ) -> Self {
        let name = before
            .or(after)
            .map(|p| p.name.as_str())
            .unwrap_or_default();
        Self {
            kind: ObjectKind::Policy,
            operation,
            target: format!("{}.{}", table, name),
            table: table.to_string(),
            details: ChangeDetails::Policy {
                before: before.cloned(),
                after: after.cloned(),
            },
            breaking: false,
        }
    }

    /// Position of this entry's kind within its operation group.
    ///
    /// Deletes run dependents first, creates run containers first.
    fn kind_rank(&self) -> u8 {
        match (self.operation, self.kind) {
            (ChangeOperation::Delete, ObjectKind::Policy) => 0,
            (ChangeOperation::Delete, ObjectKind::Index) => 1,
            (ChangeOperation::Delete, ObjectKind::Column) => 2,
            (ChangeOperation::Delete, ObjectKind::Table) => 3,
            (ChangeOperation::Create, ObjectKind::Table) => 0,
            (ChangeOperation::Create, ObjectKind::Column) => 1,
            (ChangeOperation::Create, ObjectKind::Index) => 2,
            (ChangeOperation::Create, ObjectKind::Policy) => 3,
            (ChangeOperation::Modify, ObjectKind::Column) => 0,
            (ChangeOperation::Modify, ObjectKind::Index) => 1,
            (ChangeOperation::Modify, ObjectKind::Policy) => 2,
            (ChangeOperation::Modify, ObjectKind::Table) => 3,
        }
    }
}

/// True when any entry is breaking
pub fn has_breaking_changes(changes: &[SchemaChange]) -> bool {
    changes.iter().any(|c| c.breaking)
}

/// The diff engine that compares schema snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare two snapshots
    pub fn diff_snapshots(old: &SchemaSnapshot, new: &SchemaSnapshot) -> ChangeSet {
        Self::diff(&old.tables, &new.tables)
    }

    /// Compare two table sets and return all differences in deterministic order
    pub fn diff(old: &[Table], new: &[Table]) -> ChangeSet {
        let mut changes = Vec::new();

        let old_map: BTreeMap<&str, &Table> = old.iter().map(|t| (t.name.as_str(), t)).collect();
        let new_map: BTreeMap<&str, &Table> = new.iter().map(|t| (t.name.as_str(), t)).collect();

        for (name, table) in &old_map {
            match new_map.get(name) {
                None => changes.push(SchemaChange::table_deleted(table)),
                Some(new_table) => Self::diff_table(table, new_table, &mut changes),
            }
        }

        for (name, table) in &new_map {
            if !old_map.contains_key(name) {
                changes.push(SchemaChange::table_created(table));
            }
        }

        Self::sort(&mut changes);
        changes
    }

    fn diff_table(old: &Table, new: &Table, changes: &mut Vec<SchemaChange>) {
        let table = old.name.as_str();

        let old_cols: BTreeMap<&str, &Column> =
            old.columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let new_cols: BTreeMap<&str, &Column> =
            new.columns.iter().map(|c| (c.name.as_str(), c)).collect();

        for (name, column) in &old_cols {
            match new_cols.get(name) {
                None => changes.push(SchemaChange::column_deleted(table, column)),
                Some(after) if after != column => {
                    changes.push(SchemaChange::column_modified(table, column, after))
                }
                Some(_) => {}
            }
        }
        for (name, column) in &new_cols {
            if !old_cols.contains_key(name) {
                changes.push(SchemaChange::column_created(table, column));
            }
        }

        let old_idx: BTreeMap<&str, &Index> =
            old.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
        let new_idx: BTreeMap<&str, &Index> =
            new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

        for (name, index) in &old_idx {
            match new_idx.get(name) {
                None => changes.push(SchemaChange::index_deleted(table, index)),
                Some(after) if after != index => {
                    changes.push(SchemaChange::index_modified(table, index, after))
                }
                Some(_) => {}
            }
        }
        for (name, index) in &new_idx {
            if !old_idx.contains_key(name) {
                changes.push(SchemaChange::index_created(table, index));
            }
        }

        let old_pol: BTreeMap<&str, &Policy> =
            old.policies.iter().map(|p| (p.name.as_str(), p)).collect();
        let new_pol: BTreeMap<&str, &Policy> =
            new.policies.iter().map(|p| (p.name.as_str(), p)).collect();

        for (name, policy) in &old_pol {
            match new_pol.get(name) {
                None => changes.push(SchemaChange::policy_deleted(table, policy)),
                Some(after) if after != policy => {
                    changes.push(SchemaChange::policy_modified(table, policy, after))
                }
                Some(_) => {}
            }
        }
        for (name, policy) in &new_pol {
            if !old_pol.contains_key(name) {
                changes.push(SchemaChange::policy_created(table, policy));
            }
        }
    }

    fn sort(changes: &mut [SchemaChange]) {
        changes.sort_by(|a, b| {
            a.table
                .cmp(&b.table)
                .then(a.operation.rank().cmp(&b.operation.rank()))
                .then(a.kind_rank().cmp(&b.kind_rank()))
                .then(a.target.cmp(&b.target))
        });
    }

    /// Whether modifying a column from `before` to `after` can break clients
    pub fn is_column_change_breaking(before: &Column, after: &Column) -> bool {
        let type_breaking = before.column_type != after.column_type
            && !Self::is_compatible_type_change(before.column_type, after.column_type);
        let tightened = before.nullable && !after.nullable;
        let uniqueness_added = !before.unique && after.unique;
        let reference_added = after.references.is_some() && before.references != after.references;
        let key_changed = before.primary_key != after.primary_key;

        type_breaking || tightened || uniqueness_added || reference_added || key_changed
    }

    /// Directional allow-list of widening conversions.
    ///
    /// The reverse of every pair is breaking.
    pub fn is_compatible_type_change(from: ColumnType, to: ColumnType) -> bool {
        matches!(
            (from, to),
            (ColumnType::Varchar, ColumnType::Text)
                | (ColumnType::Integer, ColumnType::Bigint)
                | (ColumnType::Float, ColumnType::Double)
                | (ColumnType::Date, ColumnType::Timestamp)
                | (ColumnType::Date, ColumnType::Timestamptz)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PolicyCommand;
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new(
            "users",
            vec![
                Column::new("id", ColumnType::Uuid).primary_key(),
                Column::new("email", ColumnType::Text).not_null(),
            ],
        )
    }

    fn orders() -> Table {
        Table::new(
            "orders",
            vec![
                Column::new("id", ColumnType::Uuid).primary_key(),
                Column::new("total", ColumnType::Decimal).not_null(),
            ],
        )
    }

    #[test]
    fn test_identical_schemas_have_no_changes() {
        assert!(DiffEngine::diff(&[users(), orders()], &[orders(), users()]).is_empty());
    }

    #[test]
    fn test_adding_nullable_column() {
        let mut new = users();
        new.columns.push(Column::new("phone", ColumnType::Text));

        let changes = DiffEngine::diff(&[users()], &[new]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ObjectKind::Column);
        assert_eq!(changes[0].operation, ChangeOperation::Create);
        assert_eq!(changes[0].target, "users.phone");
        assert!(!changes[0].breaking);
    }

    #[test]
    fn test_dropping_table_is_breaking_and_embeds_definition() {
        let changes = DiffEngine::diff(&[users(), orders()], &[users()]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ObjectKind::Table);
        assert_eq!(changes[0].operation, ChangeOperation::Delete);
        assert_eq!(changes[0].target, "orders");
        assert!(changes[0].breaking);
        assert_eq!(
            changes[0].details,
            ChangeDetails::Table {
                before: Some(orders()),
                after: None
            }
        );
    }

    #[test]
    fn test_new_table_is_not_breaking() {
        let changes = DiffEngine::diff(&[users()], &[users(), orders()]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOperation::Create);
        assert!(!changes[0].breaking);
    }

    #[test]
    fn test_column_removal_breaking_depends_on_nullability() {
        let mut old = users();
        old.columns.push(Column::new("nickname", ColumnType::Text));

        let changes = DiffEngine::diff(&[old], &[Table::new("users", vec![users().columns[0].clone()])]);
        let email = changes.iter().find(|c| c.target == "users.email").unwrap();
        let nickname = changes.iter().find(|c| c.target == "users.nickname").unwrap();
        assert!(email.breaking);
        assert!(!nickname.breaking);
    }

    #[test]
    fn test_added_required_column_breaking_unless_defaulted() {
        let mut new = users();
        new.columns.push(Column::new("status", ColumnType::Text).not_null());
        new.columns
            .push(Column::new("active", ColumnType::Boolean).not_null().with_default("true"));

        let changes = DiffEngine::diff(&[users()], &[new]);
        let status = changes.iter().find(|c| c.target == "users.status").unwrap();
        let active = changes.iter().find(|c| c.target == "users.active").unwrap();
        assert!(status.breaking);
        assert!(!active.breaking);
    }

    #[test]
    fn test_type_compatibility_is_directional() {
        let widen = DiffEngine::diff(
            &[Table::new("t", vec![Column::new("c", ColumnType::Varchar)])],
            &[Table::new("t", vec![Column::new("c", ColumnType::Text)])],
        );
        assert_eq!(widen.len(), 1);
        assert_eq!(widen[0].operation, ChangeOperation::Modify);
        assert!(!widen[0].breaking);

        let narrow = DiffEngine::diff(
            &[Table::new("t", vec![Column::new("c", ColumnType::Text)])],
            &[Table::new("t", vec![Column::new("c", ColumnType::Varchar)])],
        );
        assert!(narrow[0].breaking);
    }

    #[test]
    fn test_compatibility_table() {
        use ColumnType::*;
        assert!(DiffEngine::is_compatible_type_change(Integer, Bigint));
        assert!(DiffEngine::is_compatible_type_change(Float, Double));
        assert!(DiffEngine::is_compatible_type_change(Date, Timestamp));
        assert!(DiffEngine::is_compatible_type_change(Date, Timestamptz));
        assert!(!DiffEngine::is_compatible_type_change(Bigint, Integer));
        assert!(!DiffEngine::is_compatible_type_change(Double, Float));
        assert!(!DiffEngine::is_compatible_type_change(Timestamp, Date));
        assert!(!DiffEngine::is_compatible_type_change(Text, Uuid));
    }

    #[test]
    fn test_nullability_and_default_changes() {
        let base = Table::new("t", vec![Column::new("c", ColumnType::Text)]);
        let tightened = Table::new("t", vec![Column::new("c", ColumnType::Text).not_null()]);
        let defaulted = Table::new("t", vec![Column::new("c", ColumnType::Text).with_default("'x'")]);

        assert!(DiffEngine::diff(&[base.clone()], &[tightened.clone()])[0].breaking);
        assert!(!DiffEngine::diff(&[tightened], &[base.clone()])[0].breaking);
        assert!(!DiffEngine::diff(&[base], &[defaulted])[0].breaking);
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let mut old_users = users();
        old_users.columns.push(Column::new("legacy", ColumnType::Text));
        old_users.columns.push(Column::new("age", ColumnType::Integer));
        let mut new_users = users();
        new_users.columns.push(Column::new("phone", ColumnType::Text));
        new_users.columns.push(Column::new("age", ColumnType::Bigint));

        let accounts = Table::new("accounts", vec![Column::new("id", ColumnType::Uuid).primary_key()]);

        let changes = DiffEngine::diff(&[old_users.clone(), orders()], &[accounts.clone(), new_users.clone()]);
        let order: Vec<(ChangeOperation, &str)> =
            changes.iter().map(|c| (c.operation, c.target.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (ChangeOperation::Create, "accounts"),
                (ChangeOperation::Delete, "orders"),
                (ChangeOperation::Delete, "users.legacy"),
                (ChangeOperation::Create, "users.phone"),
                (ChangeOperation::Modify, "users.age"),
            ]
        );

        let again = DiffEngine::diff(&[orders(), old_users], &[new_users, accounts]);
        assert_eq!(changes, again);
    }

    #[test]
    fn test_index_and_policy_changes() {
        let mut old = users();
        old.indexes.push(Index {
            name: "users_email_idx".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
        });
        old.policies.push(Policy {
            name: "users_read".to_string(),
            command: PolicyCommand::Select,
            roles: vec![],
            using: Some("true".to_string()),
            with_check: None,
        });

        let mut new = users();
        new.indexes.push(Index {
            name: "users_email_lower_idx".to_string(),
            columns: vec!["email".to_string()],
            unique: false,
        });
        new.policies.push(Policy {
            name: "users_read".to_string(),
            command: PolicyCommand::Select,
            roles: vec!["authenticated".to_string()],
            using: Some("true".to_string()),
            with_check: None,
        });

        let changes = DiffEngine::diff(&[old], &[new]);
        let summary: Vec<(ObjectKind, ChangeOperation, bool)> = changes
            .iter()
            .map(|c| (c.kind, c.operation, c.breaking))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ObjectKind::Index, ChangeOperation::Delete, true),
                (ObjectKind::Index, ChangeOperation::Create, false),
                (ObjectKind::Policy, ChangeOperation::Modify, false),
            ]
        );
    }

    #[test]
    fn test_changes_serialize_with_tagged_details() {
        let changes = DiffEngine::diff(&[users(), orders()], &[users()]);
        let json = serde_json::to_value(&changes[0]).unwrap();
        assert_eq!(json["kind"], "table");
        assert_eq!(json["operation"], "delete");
        assert_eq!(json["details"]["object"], "table");
        assert_eq!(json["details"]["before"]["name"], "orders");
    }
}
