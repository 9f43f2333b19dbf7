//! Closed vocabularies of the schema model: column types, referential actions
//! and policy commands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column type domain. Anything outside this set is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Uuid,
    Text,
    Varchar,
    Smallint,
    #[serde(alias = "int")]
    Integer,
    Bigint,
    #[serde(alias = "numeric")]
    Decimal,
    #[serde(alias = "real")]
    Float,
    #[serde(alias = "double precision")]
    Double,
    #[serde(alias = "bool")]
    Boolean,
    Json,
    Jsonb,
    Timestamp,
    Timestamptz,
    Date,
    Time,
    Bytea,
}

impl ColumnType {
    pub const ALL: [ColumnType; 17] = [
        ColumnType::Uuid,
        ColumnType::Text,
        ColumnType::Varchar,
        ColumnType::Smallint,
        ColumnType::Integer,
        ColumnType::Bigint,
        ColumnType::Decimal,
        ColumnType::Float,
        ColumnType::Double,
        ColumnType::Boolean,
        ColumnType::Json,
        ColumnType::Jsonb,
        ColumnType::Timestamp,
        ColumnType::Timestamptz,
        ColumnType::Date,
        ColumnType::Time,
        ColumnType::Bytea,
    ];

    /// The type as written in generated DDL
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Uuid => "uuid",
            ColumnType::Text => "text",
            ColumnType::Varchar => "varchar",
            ColumnType::Smallint => "smallint",
            ColumnType::Integer => "integer",
            ColumnType::Bigint => "bigint",
            ColumnType::Decimal => "numeric",
            ColumnType::Float => "real",
            ColumnType::Double => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Json => "json",
            ColumnType::Jsonb => "jsonb",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Timestamptz => "timestamptz",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Bytea => "bytea",
        }
    }

    /// Parse a DDL type name (case-insensitive), accepting the usual aliases
    pub fn from_sql_name(name: &str) -> Option<Self> {
        let lowered = name.trim().to_lowercase();
        let ty = match lowered.as_str() {
            "uuid" => ColumnType::Uuid,
            "text" => ColumnType::Text,
            "varchar" | "character varying" => ColumnType::Varchar,
            "smallint" | "int2" => ColumnType::Smallint,
            "integer" | "int" | "int4" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::Bigint,
            "numeric" | "decimal" => ColumnType::Decimal,
            "real" | "float" | "float4" => ColumnType::Float,
            "double precision" | "double" | "float8" => ColumnType::Double,
            "boolean" | "bool" => ColumnType::Boolean,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            "timestamp" | "timestamp without time zone" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::Timestamptz,
            "date" => ColumnType::Date,
            "time" | "time without time zone" => ColumnType::Time,
            "bytea" => ColumnType::Bytea,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// `ON DELETE` behaviour of a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ReferentialAction {
    pub fn sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }

    pub fn from_sql(value: &str) -> Option<Self> {
        let action = match value.trim().to_uppercase().as_str() {
            "CASCADE" => ReferentialAction::Cascade,
            "RESTRICT" => ReferentialAction::Restrict,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            "NO ACTION" => ReferentialAction::NoAction,
            _ => return None,
        };
        Some(action)
    }
}

/// Command a row-level security policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    #[default]
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn sql(&self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }

    pub fn from_sql(value: &str) -> Option<Self> {
        let command = match value.trim().to_uppercase().as_str() {
            "ALL" | "*" => PolicyCommand::All,
            "SELECT" | "R" => PolicyCommand::Select,
            "INSERT" | "A" => PolicyCommand::Insert,
            "UPDATE" | "W" => PolicyCommand::Update,
            "DELETE" | "D" => PolicyCommand::Delete,
            _ => return None,
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_names_parse_back() {
        for ty in ColumnType::ALL {
            assert_eq!(ColumnType::from_sql_name(ty.sql_name()), Some(ty));
        }
    }

    #[test]
    fn test_catalog_names() {
        assert_eq!(
            ColumnType::from_sql_name("character varying"),
            Some(ColumnType::Varchar)
        );
        assert_eq!(
            ColumnType::from_sql_name("timestamp with time zone"),
            Some(ColumnType::Timestamptz)
        );
        assert_eq!(ColumnType::from_sql_name("money"), None);
    }

    #[test]
    fn test_serde_aliases() {
        let ty: ColumnType = serde_json::from_str("\"int\"").unwrap();
        assert_eq!(ty, ColumnType::Integer);
        let ty: ColumnType = serde_json::from_str("\"double precision\"").unwrap();
        assert_eq!(ty, ColumnType::Double);
        assert!(serde_json::from_str::<ColumnType>("\"geometry\"").is_err());
    }
}
