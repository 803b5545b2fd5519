//! MySQL SQL dialect (Strategy pattern).
//!
//! Provides MySQL-specific SQL syntax for identifier quoting, column types
//! and parameter placeholders.

use crate::core::schema::{ColumnDef, ColumnType, TableDefinition};
use crate::core::traits::Dialect;

/// MySQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> String {
        // MySQL uses backticks; embedded backticks are doubled
        format!("`{}`", name.replace('`', "``"))
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        let base = match column.column_type {
            ColumnType::Integer => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({},{})", precision, scale),
            ColumnType::VarChar { length } => format!("VARCHAR({})", length),
            ColumnType::Char { length } => format!("CHAR({})", length),
            ColumnType::Text => "LONGTEXT".to_string(),
            ColumnType::Boolean => "TINYINT(1)".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "DATETIME(6)".to_string(),
            ColumnType::Binary => "LONGBLOB".to_string(),
            ColumnType::Json => "JSON".to_string(),
        };
        if column.is_auto_increment() {
            format!("{} AUTO_INCREMENT", base)
        } else {
            base
        }
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn create_table(&self, schema: &str, table: &TableDefinition, if_not_exists: bool) -> String {
        format!(
            "CREATE TABLE {}{} (\n{}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.qualify_table(schema, &table.name),
            self.table_body(table)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.quote_ident("name"), "`name`");
        assert_eq!(dialect.quote_ident("my`col"), "`my``col`");
    }

    #[test]
    fn test_param_placeholder() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.param_placeholder(1), "?");
        assert_eq!(dialect.param_placeholder(7), "?");
    }

    #[test]
    fn test_create_table_uses_innodb() {
        let mut table = TableDefinition::new("users", ColumnDef::synthetic_key("id"));
        table.push_column(ColumnDef::new("active", ColumnType::Boolean));
        table.push_column(ColumnDef::new("email", ColumnType::VarChar { length: 255 }));
        table.add_unique("email");

        let ddl = MysqlDialect::new().create_table("shop", &table, true);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `shop`.`users`"));
        assert!(ddl.contains("`id` INT AUTO_INCREMENT NOT NULL"));
        assert!(ddl.contains("`active` TINYINT(1)"));
        assert!(ddl.contains("CONSTRAINT `uq_users_email` UNIQUE (`email`)"));
        assert!(ddl.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));
    }

    #[test]
    fn test_insert_statement() {
        let cols = vec!["a".to_string(), "b".to_string()];
        let sql = MysqlDialect::new().insert_statement("", "t", &cols, 2);
        assert_eq!(sql, "INSERT INTO `t` (`a`, `b`) VALUES (?, ?), (?, ?)");
    }
}
