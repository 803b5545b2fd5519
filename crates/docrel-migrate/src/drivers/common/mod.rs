//! Utilities shared by the SQL destinations.

mod tls;

pub use tls::{SslMode, TlsBuilder};

use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::schema::{ColumnType, TableDefinition};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

/// Column types of every prepared table.
///
/// SQL drivers bind parameters by column type, so `prepare_schema` records
/// the definitions and `write_batch` looks them up here.
#[derive(Debug, Default)]
pub struct TableTypes {
    tables: RwLock<HashMap<String, HashMap<String, ColumnType>>>,
}

impl TableTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tables: &[TableDefinition]) {
        let mut map = self.tables.write().unwrap_or_else(|e| e.into_inner());
        for table in tables {
            map.insert(
                table.name.clone(),
                table
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.column_type))
                    .collect(),
            );
        }
    }

    /// Types of `columns` in `table`, in the same order.
    pub fn column_types(&self, table: &str, columns: &[String]) -> Result<Vec<ColumnType>> {
        let map = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(types) = map.get(table) else {
            return Err(MigrateError::write(table, "table was not prepared"));
        };
        columns
            .iter()
            .map(|c| {
                types
                    .get(c)
                    .copied()
                    .ok_or_else(|| MigrateError::write(table, format!("column {} does not exist", c)))
            })
            .collect()
    }
}

/// Conform every value of `rows` to its column type.
pub fn conform_rows(
    table: &str,
    types: &[ColumnType],
    rows: Vec<Vec<SqlValue>>,
) -> Result<Vec<Vec<SqlValue>>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .zip(types)
                .map(|(value, ty)| value.conform(*ty).map_err(|e| MigrateError::write(table, e)))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnDef;

    #[test]
    fn test_column_types_in_requested_order() {
        let mut table = TableDefinition::new("users", ColumnDef::synthetic_key("id"));
        table.push_column(ColumnDef::new("name", ColumnType::Text));
        let types = TableTypes::new();
        types.register(&[table]);

        let cols = vec!["name".to_string(), "id".to_string()];
        assert_eq!(
            types.column_types("users", &cols).unwrap(),
            vec![ColumnType::Text, ColumnType::Integer]
        );
        assert!(types.column_types("users", &["age".to_string()]).is_err());
        assert!(types.column_types("orders", &cols).is_err());
    }

    #[test]
    fn test_conform_rows_reports_table() {
        let err = conform_rows(
            "users",
            &[ColumnType::Integer],
            vec![vec![SqlValue::Text("abc".into())]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("users"));
    }
}
