//! Schema Model
//!
//! Typed snapshot of a relational schema: tables, columns, indexes and
//! row-level security policies, plus the version numbering scheme.

pub mod model;
pub mod types;
pub mod version;

pub use model::{Column, ColumnReference, Index, Policy, SchemaDefinition, SchemaSnapshot, Table};
pub use types::{ColumnType, PolicyCommand, ReferentialAction};
pub use version::VersionNumber;
