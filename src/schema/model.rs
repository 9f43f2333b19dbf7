//! Schema model
//!
//! Typed representation of a schema snapshot. Candidate schemas arrive as JSON
//! from the authoring step and are validated here before anything else sees
//! them; identifiers are emitted unquoted in DDL, so they are restricted to
//! lowercase PostgreSQL-safe names.

use crate::error::{EngineError, EngineResult};
use crate::lexer;
use crate::schema::types::{ColumnType, PolicyCommand, ReferentialAction};
use crate::schema::version::VersionNumber;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;
use validator::{Validate, ValidationError};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier pattern is valid"));

/// Words that cannot be used as unquoted identifiers
const RESERVED: &[&str] = &[
    "all", "and", "any", "as", "asc", "both", "case", "check", "column", "constraint", "create",
    "default", "desc", "distinct", "do", "else", "end", "except", "false", "for", "foreign", "from",
    "grant", "group", "having", "in", "into", "is", "limit", "not", "null", "offset", "on", "only",
    "or", "order", "primary", "references", "select", "table", "then", "to", "true", "union",
    "unique", "user", "using", "when", "where", "with",
];

/// Validate an unquoted PostgreSQL identifier
fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if !IDENTIFIER.is_match(name) {
        let mut err = ValidationError::new("invalid_identifier");
        err.message = Some(
            format!(
                "Invalid identifier '{}'. Must start with a lowercase letter or underscore and contain only lowercase letters, digits, underscores.",
                name
            )
            .into(),
        );
        return Err(err);
    }

    if RESERVED.contains(&name) {
        let mut err = ValidationError::new("reserved_name");
        err.message = Some(format!("'{}' is a reserved word", name).into());
        return Err(err);
    }

    Ok(())
}

fn default_nullable() -> bool {
    true
}

/// Foreign key target of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    #[validate(length(min = 1, max = 63, message = "Column name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(rename = "type")]
    pub column_type: ColumnType,

    #[serde(default = "default_nullable")]
    pub nullable: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub primary_key: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ColumnReference>,
}

impl Column {
    /// A nullable column with no constraints
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            primary_key: false,
            default_value: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ColumnReference {
            table: table.into(),
            column: column.into(),
            on_delete: None,
        });
        self
    }
}

/// Secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    #[validate(length(min = 1, max = 63, message = "Index name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "An index needs at least one column"))]
    pub columns: Vec<String>,

    #[serde(default)]
    pub unique: bool,
}

/// Row-level security policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[validate(length(min = 1, max = 63, message = "Policy name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(default)]
    pub command: PolicyCommand,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_check: Option<String>,
}

impl Policy {
    /// `public` is PostgreSQL's implicit role: a policy `TO public` is stored
    /// and reported the same as one without `TO`
    pub fn normalize_roles(roles: Vec<String>) -> Vec<String> {
        roles.into_iter().filter(|r| r != "public").collect()
    }
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[validate(length(min = 1, max = 63, message = "Table name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "At least one column is required"))]
    #[validate(nested)]
    pub columns: Vec<Column>,

    #[serde(default)]
    #[validate(nested)]
    pub indexes: Vec<Index>,

    #[serde(default)]
    #[validate(nested)]
    pub policies: Vec<Policy>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Copy with columns, indexes and policies sorted by name
    pub fn canonical(&self) -> Table {
        let mut table = self.clone();
        table.columns.sort_by(|a, b| a.name.cmp(&b.name));
        table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        table.policies.sort_by(|a, b| a.name.cmp(&b.name));
        table
    }
}

/// A candidate schema as submitted by the authoring step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    #[validate(nested)]
    pub tables: Vec<Table>,
}

impl SchemaDefinition {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    /// Parse and validate a JSON candidate schema
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let definition: SchemaDefinition = serde_json::from_str(raw)
            .map_err(|e| EngineError::Validation(format!("Malformed schema: {}", e)))?;
        definition.validate_definition()?;
        Ok(definition)
    }

    /// Rewrite equivalent spellings into the form introspection reports
    pub fn normalize(&mut self) {
        for policy in self.tables.iter_mut().flat_map(|t| t.policies.iter_mut()) {
            policy.roles = Policy::normalize_roles(std::mem::take(&mut policy.roles));
        }
    }

    /// Field-level and cross-object validation
    pub fn validate_definition(&self) -> EngineResult<()> {
        self.validate()?;

        let mut problems = Vec::new();
        let mut table_names = HashSet::new();
        let mut index_names = HashSet::new();

        for table in &self.tables {
            if !table_names.insert(table.name.as_str()) {
                problems.push(format!("Duplicate table '{}'", table.name));
            }

            let mut column_names = HashSet::new();
            for column in &table.columns {
                let path = format!("{}.{}", table.name, column.name);
                if !column_names.insert(column.name.as_str()) {
                    problems.push(format!("Duplicate column '{}'", path));
                }
                if column.primary_key && column.nullable {
                    problems.push(format!("Primary key column '{}' cannot be nullable", path));
                }
                if let Some(ref default) = column.default_value {
                    if let Err(e) = lexer::check_fragment(default) {
                        problems.push(format!("Default of '{}': {}", path, e));
                    }
                }
                if let Some(ref reference) = column.references {
                    match self.tables.iter().find(|t| t.name == reference.table) {
                        Some(target) if target.column(&reference.column).is_some() => {}
                        Some(_) => problems.push(format!(
                            "'{}' references missing column '{}.{}'",
                            path, reference.table, reference.column
                        )),
                        None => problems.push(format!(
                            "'{}' references missing table '{}'",
                            path, reference.table
                        )),
                    }
                }
            }

            for index in &table.indexes {
                if !index_names.insert(index.name.as_str()) {
                    problems.push(format!("Duplicate index '{}'", index.name));
                }
                for column in &index.columns {
                    if table.column(column).is_none() {
                        problems.push(format!(
                            "Index '{}' uses missing column '{}.{}'",
                            index.name, table.name, column
                        ));
                    }
                }
            }

            let mut policy_names = HashSet::new();
            for policy in &table.policies {
                let path = format!("{}.{}", table.name, policy.name);
                if !policy_names.insert(policy.name.as_str()) {
                    problems.push(format!("Duplicate policy '{}'", path));
                }
                for role in &policy.roles {
                    if !IDENTIFIER.is_match(role) {
                        problems.push(format!("Policy '{}' has invalid role '{}'", path, role));
                    }
                }
                for expression in [&policy.using, &policy.with_check].into_iter().flatten() {
                    if let Err(e) = lexer::check_fragment(expression) {
                        problems.push(format!("Policy '{}': {}", path, e));
                    }
                }
                if policy.command == PolicyCommand::Insert && policy.using.is_some() {
                    problems.push(format!("INSERT policy '{}' cannot have USING", path));
                }
                if matches!(policy.command, PolicyCommand::Select | PolicyCommand::Delete)
                    && policy.with_check.is_some()
                {
                    problems.push(format!(
                        "{} policy '{}' cannot have WITH CHECK",
                        policy.command.sql(),
                        path
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(problems.join("; ")))
        }
    }
}

/// Immutable, versioned description of a project's full schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: VersionNumber,
    pub tables: Vec<Table>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Uuid,
}

impl SchemaSnapshot {
    pub fn new(
        project_id: Uuid,
        version: VersionNumber,
        tables: Vec<Table>,
        created_by: Uuid,
    ) -> Self {
        let checksum = Self::compute_checksum(&tables);
        Self {
            id: Uuid::new_v4(),
            project_id,
            version,
            tables,
            checksum,
            created_at: Utc::now(),
            created_by,
        }
    }

    /// Tables sorted by name, each in canonical form
    pub fn canonical_tables(tables: &[Table]) -> Vec<Table> {
        let mut canonical: Vec<Table> = tables.iter().map(Table::canonical).collect();
        canonical.sort_by(|a, b| a.name.cmp(&b.name));
        canonical
    }

    /// Compute checksum from schema content
    ///
    /// `serde_json::Value` objects keep their keys sorted, so the serialization
    /// of the canonical tables is key-sorted as well.
    pub fn compute_checksum(tables: &[Table]) -> String {
        let canonical = Self::canonical_tables(tables);
        // Tables are plain structs with string keys; serializing them cannot fail
        let serialized = serde_json::to_value(&canonical)
            .expect("schema tables serialize to JSON")
            .to_string();

        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}
