//! MySQL/MariaDB destination.
//!
//! Uses mysql_async with batched multi-row INSERTs. MySQL commits DDL
//! implicitly, so schema preparation runs before the unit of work opens and
//! cannot be rolled back. Foreign keys are never deferrable; deferral is
//! emulated by suspending `FOREIGN_KEY_CHECKS` for the session, which skips
//! the check entirely rather than re-validating at commit.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, SslOpts, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{TargetConfig, TargetMode};
use crate::core::schema::TableDefinition;
use crate::core::traits::{Backend, Capabilities, Destination, Dialect};
use crate::core::value::SqlValue;
use crate::drivers::common::{conform_rows, TableTypes};
use crate::error::{MigrateError, Result};

use super::MysqlDialect;

struct Session {
    conn: Conn,
    in_transaction: bool,
    checks_suspended: bool,
}

/// MySQL destination implementation using mysql_async.
pub struct MysqlWriter {
    database: String,
    dialect: MysqlDialect,
    session: Mutex<Session>,
    types: TableTypes,
}

impl MysqlWriter {
    /// Connect and reserve the session connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let ssl_opts = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
                None
            }
            "require" => Some(SslOpts::default().with_danger_accept_invalid_certs(true)),
            _ => Some(SslOpts::default()),
        };

        let mut builder = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port())
            .db_name(Some(&config.database))
            .user(Some(&config.user))
            .pass(Some(&config.password))
            // Use utf8mb4 for full Unicode support
            .init(vec!["SET NAMES utf8mb4"]);

        if let Some(ssl) = ssl_opts {
            builder = builder.ssl_opts(ssl);
        }

        let constraints = PoolConstraints::new(1, max_conns.max(1)).ok_or_else(|| {
            MigrateError::Config(format!("invalid MySQL pool size {}", max_conns))
        })?;
        let opts: Opts = builder
            .pool_opts(PoolOpts::new().with_constraints(constraints))
            .into();
        let pool = Pool::new(opts);

        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| MigrateError::connection("mysql", e))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection("mysql", e))?;

        info!(
            "Connected to MySQL target: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            database: config.database.clone(),
            dialect: MysqlDialect::new(),
            session: Mutex::new(Session {
                conn,
                in_transaction: false,
                checks_suspended: false,
            }),
            types: TableTypes::new(),
        })
    }

    async fn table_exists(conn: &mut Conn, database: &str, table: &str) -> Result<bool> {
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                (database, table),
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn restore_checks(session: &mut Session) -> Result<()> {
        if session.checks_suspended {
            session.conn.query_drop("SET FOREIGN_KEY_CHECKS = 1").await?;
            session.checks_suspended = false;
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MysqlWriter {
    fn backend(&self) -> Backend {
        Backend::Mysql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: true,
            transactional_ddl: false,
            deferrable_constraints: true,
            concurrent_writes: false,
        }
    }

    async fn prepare_schema(&self, tables: &[TableDefinition], mode: TargetMode) -> Result<()> {
        let mut session = self.session.lock().await;
        let conn = &mut session.conn;

        let mut created: Vec<&TableDefinition> = Vec::new();
        match mode {
            TargetMode::DropRecreate => {
                conn.query_drop("SET FOREIGN_KEY_CHECKS = 0").await?;
                for table in tables.iter().rev() {
                    conn.query_drop(self.dialect.drop_table(&self.database, &table.name))
                        .await?;
                }
                conn.query_drop("SET FOREIGN_KEY_CHECKS = 1").await?;
                for table in tables {
                    conn.query_drop(self.dialect.create_table(&self.database, table, false))
                        .await?;
                    created.push(table);
                }
            }
            TargetMode::Append => {
                for table in tables {
                    if Self::table_exists(conn, &self.database, &table.name).await? {
                        debug!("Table {}.{} exists, appending", self.database, table.name);
                        continue;
                    }
                    conn.query_drop(self.dialect.create_table(&self.database, table, false))
                        .await?;
                    created.push(table);
                }
            }
        }

        for table in &created {
            for fk in &table.foreign_keys {
                conn.query_drop(self.dialect.add_foreign_key(&self.database, table, fk))
                    .await?;
            }
        }

        self.types.register(tables);
        debug!(
            "Prepared {} tables in {} ({} created)",
            tables.len(),
            self.database,
            created.len()
        );
        Ok(())
    }

    async fn begin_unit_of_work(&self, defer_constraints: bool) -> Result<()> {
        let mut session = self.session.lock().await;
        if defer_constraints {
            session.conn.query_drop("SET FOREIGN_KEY_CHECKS = 0").await?;
            session.checks_suspended = true;
        }
        session.conn.query_drop("START TRANSACTION").await?;
        session.in_transaction = true;
        Ok(())
    }

    async fn write_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        let types = self.types.column_types(table, columns)?;
        let rows = conform_rows(table, &types, rows)?;
        let per_statement = self.dialect.rows_per_statement(columns.len());
        let mut session = self.session.lock().await;

        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let sql = self
                .dialect
                .insert_statement(&self.database, table, columns, chunk.len());
            let params: Vec<Value> = chunk.iter().flatten().map(to_mysql_value).collect();

            session
                .conn
                .exec_drop(sql, params)
                .await
                .map_err(|e| MigrateError::write(table, e.to_string()))?;
            written += session.conn.affected_rows();
        }
        Ok(written)
    }

    async fn max_key(&self, table: &TableDefinition) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT CAST(MAX({}) AS SIGNED) FROM {}",
            self.dialect.quote_ident(&table.primary_key),
            self.dialect.qualify_table(&self.database, &table.name)
        );
        let mut session = self.session.lock().await;
        let max: Option<Option<i64>> = session.conn.query_first(sql).await?;
        Ok(max.flatten())
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            session.conn.query_drop("COMMIT").await?;
            session.in_transaction = false;
        }
        Self::restore_checks(&mut session).await
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            session.in_transaction = false;
            session.conn.query_drop("ROLLBACK").await?;
        }
        Self::restore_checks(&mut session).await
    }

    // The session connection returns to the pool on drop.
    async fn close(&self) {
        debug!("Closing MySQL destination for {}", self.database);
    }
}

fn to_mysql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(b) => Value::from(*b),
        SqlValue::I32(i) => Value::from(*i),
        SqlValue::I64(i) => Value::from(*i),
        SqlValue::F64(f) => Value::from(*f),
        SqlValue::Decimal(d) => Value::from(d.to_string()),
        SqlValue::Text(s) | SqlValue::ObjectId(s) => Value::from(s.as_str()),
        SqlValue::Bytes(b) => Value::from(b.as_slice()),
        SqlValue::Date(d) => Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0),
        SqlValue::DateTime(dt) => Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1_000,
        ),
        SqlValue::Json(v) => Value::from(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_to_mysql_value() {
        assert_eq!(to_mysql_value(&SqlValue::Null), Value::NULL);
        assert_eq!(to_mysql_value(&SqlValue::I32(5)), Value::Int(5));
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(10, 30, 0, 250)
            .unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::DateTime(dt)),
            Value::Date(2024, 3, 1, 10, 30, 0, 250)
        );
    }
}
