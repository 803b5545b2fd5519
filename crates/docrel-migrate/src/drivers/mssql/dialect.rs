//! MSSQL SQL dialect (Strategy pattern).
//!
//! Provides MSSQL-specific SQL syntax for identifier quoting, column types
//! and parameter placeholders. SQL Server has no `IF NOT EXISTS` clause on
//! CREATE TABLE, so append mode guards the statement with `OBJECT_ID`.

use crate::core::schema::{ColumnDef, ColumnType, TableDefinition};
use crate::core::traits::Dialect;

/// Longest NVARCHAR that does not need the MAX form.
const MAX_NVARCHAR: u32 = 4000;

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new MSSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "mssql"
    }

    fn quote_ident(&self, name: &str) -> String {
        // Handle names that contain closing brackets by doubling them
        format!("[{}]", name.replace(']', "]]"))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    // Synthetic keys get explicit values from the normalizer, so no IDENTITY.
    fn column_type(&self, column: &ColumnDef) -> String {
        match column.column_type {
            ColumnType::Integer => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({},{})", precision, scale),
            ColumnType::VarChar { length } if length > MAX_NVARCHAR => "NVARCHAR(MAX)".to_string(),
            ColumnType::VarChar { length } => format!("NVARCHAR({})", length),
            ColumnType::Char { length } if length > MAX_NVARCHAR => "NVARCHAR(MAX)".to_string(),
            ColumnType::Char { length } => format!("NCHAR({})", length),
            ColumnType::Text => "NVARCHAR(MAX)".to_string(),
            ColumnType::Boolean => "BIT".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "DATETIME2".to_string(),
            ColumnType::Binary => "VARBINARY(MAX)".to_string(),
            ColumnType::Json => "NVARCHAR(MAX)".to_string(),
        }
    }

    fn max_params(&self) -> usize {
        // 2100 is the hard limit; leave headroom for the driver
        2_000
    }

    fn max_rows_per_insert(&self) -> usize {
        1_000
    }

    fn create_table(&self, schema: &str, table: &TableDefinition, if_not_exists: bool) -> String {
        let qualified = self.qualify_table(schema, &table.name);
        let create = format!("CREATE TABLE {} (\n{}\n)", qualified, self.table_body(table));
        if if_not_exists {
            format!(
                "IF OBJECT_ID(N'{}', N'U') IS NULL\n{}",
                qualified.replace('\'', "''"),
                create
            )
        } else {
            create
        }
    }
}
