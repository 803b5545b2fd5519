//! Schema types for inferred and externally supplied tables.
//!
//! These types are the contract between the normalizer, the dependency
//! sorter, the DDL renderers and the destination adapters. Column types are
//! storage-type tags, not source-language types.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// Fixed-precision decimal.
    Decimal { precision: u8, scale: u8 },
    /// Bounded variable-width text.
    VarChar { length: u32 },
    /// Fixed-width text (document-store identifiers).
    Char { length: u32 },
    /// Unbounded text.
    Text,
    Boolean,
    /// Date without a time component.
    Date,
    /// Timestamp without time zone.
    Timestamp,
    Binary,
    /// JSON document stored as a blob.
    Json,
}

impl ColumnType {
    /// Whether values of this type are integers.
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::BigInt)
    }

    /// Whether values of this type are bound as text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ColumnType::VarChar { .. } | ColumnType::Char { .. } | ColumnType::Text
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({},{})", precision, scale)
            }
            ColumnType::VarChar { length } => write!(f, "varchar({})", length),
            ColumnType::Char { length } => write!(f, "char({})", length),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::Json => write!(f, "json"),
        }
    }
}

/// Default value of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    /// Synthetic auto-incrementing key.
    AutoIncrement,
    /// Current timestamp at insert time.
    CurrentTimestamp,
    /// Literal SQL default expression.
    Literal(String),
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Storage type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether the column allows NULL.
    pub nullable: bool,

    /// Whether the column is the table's primary key.
    #[serde(default)]
    pub is_primary_key: bool,

    /// Default value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
}

impl ColumnDef {
    /// Create a nullable, non-key column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            is_primary_key: false,
            default: None,
        }
    }

    /// Create a primary-key column.
    pub fn primary_key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            is_primary_key: true,
            default: None,
        }
    }

    /// Create a synthetic auto-incrementing integer primary key.
    pub fn synthetic_key(name: impl Into<String>) -> Self {
        Self {
            default: Some(ColumnDefault::AutoIncrement),
            ..Self::primary_key(name, ColumnType::Integer)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Whether this column's values are generated by the key counter.
    pub fn is_auto_increment(&self) -> bool {
        matches!(self.default, Some(ColumnDefault::AutoIncrement))
    }
}

/// Foreign key definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Column on the owning table.
    pub column: String,

    /// Referenced table name.
    pub referenced_table: String,

    /// Referenced column name.
    pub referenced_column: String,
}

impl ForeignKeyDef {
    pub fn new(
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Unique constraint over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub columns: Vec<String>,
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,

    /// Column definitions, unique by name, in declaration order.
    pub columns: Vec<ColumnDef>,

    /// Primary key column name.
    pub primary_key: String,

    /// Foreign key constraints.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,

    /// Unique constraints.
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl TableDefinition {
    /// Create a table with the given primary-key column.
    pub fn new(name: impl Into<String>, primary_key: ColumnDef) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.name.clone(),
            columns: vec![primary_key],
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// The primary-key column.
    pub fn primary_key_column(&self) -> Option<&ColumnDef> {
        self.column(&self.primary_key)
    }

    /// Append a column, renaming it with a numeric suffix if the name is taken.
    ///
    /// Returns the name the column was stored under.
    pub fn push_column(&mut self, mut column: ColumnDef) -> String {
        if self.has_column(&column.name) {
            let base = column.name.clone();
            let mut n = 2;
            while self.has_column(&format!("{}_{}", base, n)) {
                n += 1;
            }
            column.name = format!("{}_{}", base, n);
        }
        let name = column.name.clone();
        self.columns.push(column);
        name
    }

    /// Add a single-column unique constraint.
    pub fn add_unique(&mut self, column: impl Into<String>) {
        let column = column.into();
        let exists = self
            .unique_constraints
            .iter()
            .any(|u| u.columns.len() == 1 && u.columns[0] == column);
        if !exists {
            self.unique_constraints.push(UniqueConstraint {
                columns: vec![column],
            });
        }
    }

    /// Foreign keys that reference other tables.
    pub fn external_foreign_keys(&self) -> impl Iterator<Item = &ForeignKeyDef> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.referenced_table != self.name)
    }

    /// Check the structural invariants of the definition.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(MigrateError::Schema(format!(
                    "table {} has duplicate column {}",
                    self.name, col.name
                )));
            }
        }

        let pk_columns: Vec<&ColumnDef> =
            self.columns.iter().filter(|c| c.is_primary_key).collect();
        if pk_columns.len() != 1 {
            return Err(MigrateError::Schema(format!(
                "table {} must have exactly one primary key column, found {}",
                self.name,
                pk_columns.len()
            )));
        }
        if pk_columns[0].name != self.primary_key {
            return Err(MigrateError::Schema(format!(
                "table {} declares primary key {} but column {} is flagged",
                self.name, self.primary_key, pk_columns[0].name
            )));
        }

        for fk in &self.foreign_keys {
            if !self.has_column(&fk.column) {
                return Err(MigrateError::Schema(format!(
                    "table {} has foreign key on missing column {}",
                    self.name, fk.column
                )));
            }
        }

        for unique in &self.unique_constraints {
            if let Some(missing) = unique.columns.iter().find(|c| !self.has_column(c)) {
                return Err(MigrateError::Schema(format!(
                    "table {} has unique constraint on missing column {}",
                    self.name, missing
                )));
            }
        }

        Ok(())
    }
}

/// Longest constraint name accepted by every supported engine.
const MAX_CONSTRAINT_NAME: usize = 63;

/// Deterministic constraint name `<prefix>_<table>_<column>`, truncated to
/// the shortest engine limit.
pub fn constraint_name(prefix: &str, table: &str, column: &str) -> String {
    let mut name = format!("{}_{}_{}", prefix, table, column);
    if name.len() > MAX_CONSTRAINT_NAME {
        let mut cut = MAX_CONSTRAINT_NAME;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

/// Validate a set of tables, including cross-table foreign key targets.
pub fn validate_tables(tables: &[TableDefinition]) -> Result<()> {
    let mut names = HashSet::new();
    for table in tables {
        table.validate()?;
        if !names.insert(table.name.as_str()) {
            return Err(MigrateError::Schema(format!(
                "duplicate table name {}",
                table.name
            )));
        }
    }

    for table in tables {
        for fk in &table.foreign_keys {
            let Some(target) = tables.iter().find(|t| t.name == fk.referenced_table) else {
                return Err(MigrateError::Schema(format!(
                    "table {} references unknown table {}",
                    table.name, fk.referenced_table
                )));
            };
            if !target.has_column(&fk.referenced_column) {
                return Err(MigrateError::Schema(format!(
                    "table {} references missing column {}.{}",
                    table.name, fk.referenced_table, fk.referenced_column
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDefinition {
        let mut table = TableDefinition::new("users", ColumnDef::synthetic_key("id"));
        table.push_column(ColumnDef::new("email", ColumnType::VarChar { length: 255 }));
        table.push_column(ColumnDef::new("manager_id", ColumnType::Integer));
        table
            .foreign_keys
            .push(ForeignKeyDef::new("manager_id", "users", "id"));
        table
    }

    #[test]
    fn test_valid_table() {
        assert!(users().validate().is_ok());
        assert_eq!(users().primary_key_column().unwrap().name, "id");
    }

    #[test]
    fn test_push_column_renames_duplicates() {
        let mut table = users();
        let name = table.push_column(ColumnDef::new("email", ColumnType::Text));
        assert_eq!(name, "email_2");
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_second_primary_key_rejected() {
        let mut table = users();
        table
            .columns
            .push(ColumnDef::primary_key("other", ColumnType::Integer));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_foreign_key_on_missing_column_rejected() {
        let mut table = users();
        table
            .foreign_keys
            .push(ForeignKeyDef::new("team_id", "teams", "id"));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_self_reference_excluded_from_external_keys() {
        assert_eq!(users().external_foreign_keys().count(), 0);
    }

    #[test]
    fn test_validate_tables_unknown_reference() {
        let mut orders = TableDefinition::new("orders", ColumnDef::synthetic_key("id"));
        orders.push_column(ColumnDef::new("users_id", ColumnType::Integer));
        orders
            .foreign_keys
            .push(ForeignKeyDef::new("users_id", "users", "id"));

        assert!(validate_tables(&[orders.clone()]).is_err());
        assert!(validate_tables(&[users(), orders]).is_ok());
    }

    #[test]
    fn test_constraint_name_truncated() {
        assert_eq!(constraint_name("fk", "orders", "users_id"), "fk_orders_users_id");
        let long = constraint_name("fk", &"t".repeat(80), "c");
        assert_eq!(long.len(), 63);
    }

    #[test]
    fn test_column_type_display() {
        assert_eq!(
            ColumnType::Decimal {
                precision: 12,
                scale: 2
            }
            .to_string(),
            "decimal(12,2)"
        );
        assert_eq!(ColumnType::Char { length: 24 }.to_string(), "char(24)");
    }
}
