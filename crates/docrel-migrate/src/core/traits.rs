//! Destination abstraction.
//!
//! A [`Destination`] is the small capability interface every backend
//! implements: schema preparation, a unit of work, chunked writes, and
//! commit/rollback. What a backend can actually guarantee is described by
//! [`Capabilities`], which the orchestrator consults to decide how to wrap a
//! run (one transaction, deferred constraint checks, concurrent waves).

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TargetMode;
use crate::error::{MigrateError, Result};

use super::schema::{constraint_name, ColumnDef, ForeignKeyDef, TableDefinition};
use super::value::SqlValue;

/// Destination backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Postgres,
    Mysql,
    Mssql,
    Mongodb,
    Memory,
}

impl Backend {
    /// Backend identifier as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Mysql => "mysql",
            Backend::Mssql => "mssql",
            Backend::Mongodb => "mongodb",
            Backend::Memory => "memory",
        }
    }

    /// Whether the backend stores rows in tables with SQL DDL.
    pub fn is_relational(&self) -> bool {
        matches!(self, Backend::Postgres | Backend::Mysql | Backend::Mssql)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            "mysql" | "mariadb" => Ok(Backend::Mysql),
            "mssql" | "sqlserver" | "sql_server" => Ok(Backend::Mssql),
            "mongodb" | "mongo" => Ok(Backend::Mongodb),
            "memory" => Ok(Backend::Memory),
            other => Err(MigrateError::Config(format!(
                "unknown backend '{}'; expected postgres, mysql, mssql, mongodb or memory",
                other
            ))),
        }
    }
}

/// What a destination can guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Begin/commit/rollback span every table of the run.
    pub transactional: bool,

    /// Schema changes can run inside the unit of work.
    pub transactional_ddl: bool,

    /// Foreign-key checks can be postponed until commit.
    pub deferrable_constraints: bool,

    /// Different tables may be written at the same time.
    pub concurrent_writes: bool,
}

/// Write schema and data to a destination store.
///
/// A destination instance belongs to exactly one migration run. Methods take
/// `&self`; implementations that hold a single transactional connection keep
/// it behind an async mutex so the unit of work stays single-owner.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Backend identifier.
    fn backend(&self) -> Backend;

    /// Transaction and batching semantics of this destination.
    fn capabilities(&self) -> Capabilities;

    /// Create (or drop and recreate) the given tables.
    ///
    /// `tables` arrive in write order; drops happen in reverse.
    async fn prepare_schema(&self, tables: &[TableDefinition], mode: TargetMode) -> Result<()>;

    /// Open the unit of work. A no-op for non-transactional destinations.
    async fn begin_unit_of_work(&self, defer_constraints: bool) -> Result<()>;

    /// Insert one chunk of rows. `rows` are positional against `columns`.
    async fn write_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64>;

    /// Post-load fixups for a fully written table (sequence resets).
    async fn finish_table(&self, _table: &TableDefinition) -> Result<()> {
        Ok(())
    }

    /// Largest integer primary key already stored in `table`, if any.
    ///
    /// Appending runs continue synthetic key numbering after this value.
    async fn max_key(&self, _table: &TableDefinition) -> Result<Option<i64>> {
        Ok(None)
    }

    /// Commit the unit of work.
    async fn commit(&self) -> Result<()>;

    /// Roll back the unit of work, discarding everything since begin.
    async fn rollback(&self) -> Result<()>;

    /// Release connections.
    async fn close(&self);
}

/// SQL syntax strategy for different database engines.
///
/// Renders DDL and INSERT statements from the [`TableDefinition`] shape. The
/// default methods produce ANSI-style SQL; dialects override what differs.
pub trait Dialect: Send + Sync {
    /// Get the dialect identifier (e.g., "mssql", "postgres").
    fn name(&self) -> &str;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_ident(&self, name: &str) -> String;

    /// Get a parameter placeholder for the given 1-based index.
    fn param_placeholder(&self, index: usize) -> String;

    /// Column type including any identity clause.
    fn column_type(&self, column: &ColumnDef) -> String;

    /// Maximum bind parameters per statement.
    fn max_params(&self) -> usize;

    /// Maximum rows in one multi-row INSERT.
    fn max_rows_per_insert(&self) -> usize {
        usize::MAX
    }

    /// Rows per INSERT statement for a given column count.
    fn rows_per_statement(&self, column_count: usize) -> usize {
        (self.max_params() / column_count.max(1)).clamp(1, self.max_rows_per_insert())
    }

    /// Schema-qualified, quoted table name.
    fn qualify_table(&self, schema: &str, table: &str) -> String {
        if schema.is_empty() {
            self.quote_ident(table)
        } else {
            format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
        }
    }

    /// Column list, primary key and unique constraints of a table.
    fn table_body(&self, table: &TableDefinition) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|col| {
                let null = if col.nullable { "" } else { " NOT NULL" };
                format!(
                    "    {} {}{}",
                    self.quote_ident(&col.name),
                    self.column_type(col),
                    null
                )
            })
            .collect();

        parts.push(format!(
            "    CONSTRAINT {} PRIMARY KEY ({})",
            self.quote_ident(&constraint_name("pk", &table.name, &table.primary_key)),
            self.quote_ident(&table.primary_key)
        ));

        for unique in &table.unique_constraints {
            let cols = unique
                .columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "    CONSTRAINT {} UNIQUE ({})",
                self.quote_ident(&constraint_name("uq", &table.name, &unique.columns.join("_"))),
                cols
            ));
        }

        parts.join(",\n")
    }

    /// CREATE TABLE statement.
    fn create_table(&self, schema: &str, table: &TableDefinition, if_not_exists: bool) -> String {
        format!(
            "CREATE TABLE {}{} (\n{}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.qualify_table(schema, &table.name),
            self.table_body(table)
        )
    }

    /// ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY statement.
    fn add_foreign_key(&self, schema: &str, table: &TableDefinition, fk: &ForeignKeyDef) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.qualify_table(schema, &table.name),
            self.quote_ident(&constraint_name("fk", &table.name, &fk.column)),
            self.quote_ident(&fk.column),
            self.qualify_table(schema, &fk.referenced_table),
            self.quote_ident(&fk.referenced_column)
        )
    }

    /// DROP TABLE IF EXISTS statement.
    fn drop_table(&self, schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualify_table(schema, table))
    }

    /// Multi-row INSERT with placeholders for `row_count` rows.
    fn insert_statement(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        row_count: usize,
    ) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.qualify_table(schema, table),
            cols
        );
        let mut index = 1;
        for row in 0..row_count {
            if row > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for col in 0..columns.len() {
                if col > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&self.param_placeholder(index));
                index += 1;
            }
            sql.push(')');
        }
        sql
    }
}
