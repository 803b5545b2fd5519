//! Database driver implementations.
//!
//! - [`postgres`], [`mysql`], [`mssql`]: relational destinations and their dialects
//! - [`mongo`]: document-store destination
//! - [`memory`]: in-process destination used for dry runs and tests
//! - [`common`]: Shared utilities (TLS, column type registry)
//!
//! # Adding New Databases
//!
//! 1. Create a new module under `drivers/`
//! 2. Implement [`Destination`] (and [`Dialect`] for SQL engines)
//! 3. Add a variant to [`Backend`] and, for SQL engines, to [`DialectImpl`]
//! 4. Wire it into [`connect`]

pub mod common;
pub mod memory;
pub mod mongo;
pub mod mssql;
pub mod mysql;
pub mod postgres;

use std::sync::Arc;

pub use common::{SslMode, TlsBuilder};
pub use memory::MemoryDestination;
pub use mongo::MongoWriter;
pub use mssql::{MssqlDialect, MssqlWriter};
pub use mysql::{MysqlDialect, MysqlWriter};
pub use postgres::{PostgresDialect, PostgresWriter};

use crate::config::{MigrationConfig, TargetConfig};
use crate::core::schema::{ColumnDef, ForeignKeyDef, TableDefinition};
use crate::core::traits::{Backend, Destination, Dialect};
use crate::error::{MigrateError, Result};

/// Enum-based static dispatch for dialects.
///
/// The compiler generates a match statement instead of using vtable dispatch.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Mssql(MssqlDialect),
    Mysql(MysqlDialect),
    Postgres(PostgresDialect),
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $call:expr) => {
        match $self {
            DialectImpl::Mssql($d) => $call,
            DialectImpl::Mysql($d) => $call,
            DialectImpl::Postgres($d) => $call,
        }
    };
}

impl Dialect for DialectImpl {
    fn name(&self) -> &str {
        dispatch!(self, d => d.name())
    }

    fn quote_ident(&self, name: &str) -> String {
        dispatch!(self, d => d.quote_ident(name))
    }

    fn param_placeholder(&self, index: usize) -> String {
        dispatch!(self, d => d.param_placeholder(index))
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        dispatch!(self, d => d.column_type(column))
    }

    fn max_params(&self) -> usize {
        dispatch!(self, d => d.max_params())
    }

    fn max_rows_per_insert(&self) -> usize {
        dispatch!(self, d => d.max_rows_per_insert())
    }

    fn create_table(&self, schema: &str, table: &TableDefinition, if_not_exists: bool) -> String {
        dispatch!(self, d => d.create_table(schema, table, if_not_exists))
    }

    fn add_foreign_key(&self, schema: &str, table: &TableDefinition, fk: &ForeignKeyDef) -> String {
        dispatch!(self, d => d.add_foreign_key(schema, table, fk))
    }

    fn drop_table(&self, schema: &str, table: &str) -> String {
        dispatch!(self, d => d.drop_table(schema, table))
    }
}

impl DialectImpl {
    /// Dialect of a relational backend.
    ///
    /// # Errors
    ///
    /// Returns an error for backends that do not speak SQL.
    pub fn from_backend(backend: Backend) -> Result<Self> {
        match backend {
            Backend::Mssql => Ok(DialectImpl::Mssql(MssqlDialect::new())),
            Backend::Mysql => Ok(DialectImpl::Mysql(MysqlDialect::new())),
            Backend::Postgres => Ok(DialectImpl::Postgres(PostgresDialect::new())),
            other => Err(MigrateError::Config(format!(
                "{} has no SQL dialect. Supported types: mssql, mysql, postgres",
                other
            ))),
        }
    }

    /// Create a dialect implementation from a database type string.
    ///
    /// # Errors
    ///
    /// Returns an error if the database type is not recognized.
    pub fn from_db_type(db_type: &str) -> Result<Self> {
        Self::from_backend(db_type.parse()?)
    }
}

/// DDL for `tables`: every CREATE TABLE first, then the foreign keys, so
/// creation order never has to respect references.
pub fn schema_script(dialect: &dyn Dialect, schema: &str, tables: &[TableDefinition]) -> Vec<String> {
    let mut statements: Vec<String> = tables
        .iter()
        .map(|t| dialect.create_table(schema, t, false))
        .collect();
    for table in tables {
        for fk in &table.foreign_keys {
            statements.push(dialect.add_foreign_key(schema, table, fk));
        }
    }
    statements
}

/// Connect to the configured destination.
pub async fn connect(
    target: &TargetConfig,
    migration: &MigrationConfig,
) -> Result<Arc<dyn Destination>> {
    let max_conns = migration.max_connections;
    let destination: Arc<dyn Destination> = match target.r#type {
        Backend::Postgres => Arc::new(PostgresWriter::new(target, max_conns).await?),
        Backend::Mysql => Arc::new(MysqlWriter::new(target, max_conns).await?),
        Backend::Mssql => Arc::new(MssqlWriter::new(target, max_conns).await?),
        Backend::Mongodb => Arc::new(MongoWriter::new(target).await?),
        Backend::Memory => {
            let memory = match &target.fail_on_table {
                Some(table) => MemoryDestination::new().fail_on_table(table.clone()),
                None => MemoryDestination::new(),
            };
            Arc::new(memory)
        }
    };
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnType;

    #[test]
    fn test_dialect_impl_from_db_type() {
        let mssql = DialectImpl::from_db_type("mssql").unwrap();
        assert_eq!(mssql.name(), "mssql");

        let postgres = DialectImpl::from_db_type("postgres").unwrap();
        assert_eq!(postgres.name(), "postgres");

        // Alternative names
        assert!(DialectImpl::from_db_type("sqlserver").is_ok());
        assert!(DialectImpl::from_db_type("postgresql").is_ok());
        assert!(DialectImpl::from_db_type("mariadb").is_ok());

        // Document stores have no dialect
        assert!(DialectImpl::from_db_type("mongodb").is_err());
        assert!(DialectImpl::from_db_type("unknown").is_err());
    }

    #[test]
    fn test_dialect_impl_dispatches_overrides() {
        let dialect = DialectImpl::Postgres(PostgresDialect::new());
        assert_eq!(dialect.quote_ident("table"), "\"table\"");
        assert_eq!(dialect.param_placeholder(1), "$1");
        assert!(dialect.drop_table("public", "t").ends_with("CASCADE"));

        let dialect = DialectImpl::Mssql(MssqlDialect::new());
        assert_eq!(dialect.quote_ident("table"), "[table]");
        assert_eq!(dialect.param_placeholder(1), "@P1");
        assert_eq!(dialect.rows_per_statement(1), 1_000);
    }

    #[test]
    fn test_schema_script_creates_before_foreign_keys() {
        let users = TableDefinition::new("users", ColumnDef::synthetic_key("id"));
        let mut orders = TableDefinition::new("orders", ColumnDef::synthetic_key("id"));
        orders.push_column(ColumnDef::new("users_id", ColumnType::Integer).not_null());
        orders
            .foreign_keys
            .push(ForeignKeyDef::new("users_id", "users", "id"));

        let dialect = DialectImpl::from_backend(Backend::Mysql).unwrap();
        let script = schema_script(&dialect, "shop", &[orders, users]);
        assert_eq!(script.len(), 3);
        assert!(script[0].contains("`orders`"));
        assert!(script[2].starts_with("ALTER TABLE `shop`.`orders`"));
    }

    #[tokio::test]
    async fn test_connect_memory_with_injected_failure() {
        let mut target = TargetConfig::memory();
        target.fail_on_table = Some("orders".into());
        let dest = connect(&target, &MigrationConfig::default()).await.unwrap();
        assert_eq!(dest.backend(), Backend::Memory);
        let err = dest
            .write_batch("orders", &["id".to_string()], vec![vec![1i64.into()]])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Write { .. }));
    }
}
