//! PostgreSQL SQL dialect (Strategy pattern).
//!
//! Provides PostgreSQL-specific SQL syntax for identifier quoting, column
//! types, deferrable foreign keys and parameter placeholders.

use crate::core::schema::{constraint_name, ColumnDef, ColumnType, ForeignKeyDef, TableDefinition};
use crate::core::traits::Dialect;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        // Handle names that contain double quotes by doubling them
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        if column.is_auto_increment() {
            let base = match column.column_type {
                ColumnType::BigInt => "BIGINT",
                _ => "INTEGER",
            };
            return format!("{} GENERATED BY DEFAULT AS IDENTITY", base);
        }
        match column.column_type {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => format!("NUMERIC({},{})", precision, scale),
            ColumnType::VarChar { length } => format!("VARCHAR({})", length),
            ColumnType::Char { length } => format!("CHAR({})", length),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Binary => "BYTEA".to_string(),
            ColumnType::Json => "JSONB".to_string(),
        }
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn add_foreign_key(&self, schema: &str, table: &TableDefinition, fk: &ForeignKeyDef) -> String {
        // Deferrable so SET CONSTRAINTS ALL DEFERRED can postpone the check to commit
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) DEFERRABLE INITIALLY IMMEDIATE",
            self.qualify_table(schema, &table.name),
            self.quote_ident(&constraint_name("fk", &table.name, &fk.column)),
            self.quote_ident(&fk.column),
            self.qualify_table(schema, &fk.referenced_table),
            self.quote_ident(&fk.referenced_column)
        )
    }

    fn drop_table(&self, schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", self.qualify_table(schema, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableDefinition {
        let mut t = TableDefinition::new("orders", ColumnDef::synthetic_key("id"));
        t.push_column(ColumnDef::new("amount", ColumnType::Decimal { precision: 12, scale: 2 }));
        t.push_column(ColumnDef::new("users_id", ColumnType::Char { length: 24 }).not_null());
        t.foreign_keys.push(ForeignKeyDef::new("users_id", "users", "_id"));
        t
    }

    #[test]
    fn test_quote_ident() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.quote_ident("table"), "\"table\"");
        assert_eq!(dialect.quote_ident("my\"table"), "\"my\"\"table\"");
    }

    #[test]
    fn test_param_placeholder() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.param_placeholder(1), "$1");
        assert_eq!(dialect.param_placeholder(10), "$10");
    }

    #[test]
    fn test_create_table() {
        let ddl = PostgresDialect::new().create_table("public", &orders(), false);
        assert!(ddl.starts_with("CREATE TABLE \"public\".\"orders\""));
        assert!(ddl.contains("\"id\" INTEGER GENERATED BY DEFAULT AS IDENTITY NOT NULL"));
        assert!(ddl.contains("\"amount\" NUMERIC(12,2)"));
        assert!(ddl.contains("\"users_id\" CHAR(24) NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn test_foreign_key_is_deferrable() {
        let table = orders();
        let sql = PostgresDialect::new().add_foreign_key("public", &table, &table.foreign_keys[0]);
        assert!(sql.contains("REFERENCES \"public\".\"users\" (\"_id\")"));
        assert!(sql.ends_with("DEFERRABLE INITIALLY IMMEDIATE"));
    }

    #[test]
    fn test_insert_statement() {
        let cols = vec!["a".to_string(), "b".to_string()];
        let sql = PostgresDialect::new().insert_statement("public", "t", &cols, 2);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
    }
}
