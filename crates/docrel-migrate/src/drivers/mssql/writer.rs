//! MSSQL destination.
//!
//! Uses Tiberius with a bb8 pool. SQL Server DDL is transactional, but its
//! foreign keys cannot be deferred: deferral disables checking on every
//! prepared table with `NOCHECK CONSTRAINT ALL` and re-enables it with
//! `WITH CHECK CHECK CONSTRAINT ALL` right before commit, which validates the
//! loaded rows and fails the commit on a dangling reference.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::{TargetConfig, TargetMode};
use crate::core::schema::{ColumnType, TableDefinition};
use crate::core::traits::{Backend, Capabilities, Destination, Dialect};
use crate::core::value::SqlValue;
use crate::drivers::common::{conform_rows, TableTypes};
use crate::error::{MigrateError, Result};

use super::MssqlDialect;

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection pool timeouts.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: TargetConfig,
}

impl TiberiusConnectionManager {
    fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        match self.config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                config.encryption(EncryptionLevel::NotSupported);
            }
            "require" => {
                config.trust_cert();
                config.encryption(EncryptionLevel::Required);
            }
            _ => {
                config.encryption(EncryptionLevel::Required);
            }
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true).ok();

        // Enable TCP keepalives
        let std_tcp = tcp.into_std().map_err(|e| tiberius::error::Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        })?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| tiberius::error::Error::Io {
            kind: e.kind(),
            message: format!("Failed to convert socket: {}", e),
        })?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

type Connection = PooledConnection<'static, TiberiusConnectionManager>;

struct Session {
    conn: Connection,
    in_transaction: bool,
    defer_constraints: bool,
    prepared: Vec<String>,
}

impl Session {
    async fn batch(&mut self, sql: &str) -> Result<()> {
        self.conn.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

/// MSSQL destination implementation.
pub struct MssqlWriter {
    schema: String,
    dialect: MssqlDialect,
    session: Mutex<Session>,
    types: TableTypes,
}

impl MssqlWriter {
    /// Connect and reserve the session connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_conns.max(1) as u32)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)
            .await
            .map_err(|e| MigrateError::connection("mssql", e))?;

        let mut conn = pool
            .get_owned()
            .await
            .map_err(|e| MigrateError::connection("mssql", e))?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection("mssql", e))?
            .into_row()
            .await?;

        info!(
            "Connected to MSSQL target: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            schema: config.schema(),
            dialect: MssqlDialect::new(),
            session: Mutex::new(Session {
                conn,
                in_transaction: false,
                defer_constraints: false,
                prepared: Vec::new(),
            }),
            types: TableTypes::new(),
        })
    }

    fn quote_literal(&self, table: &str) -> String {
        self.dialect
            .qualify_table(&self.schema, table)
            .replace('\'', "''")
    }

    /// Drop every foreign key that references `table` from another table.
    fn drop_referencing_keys(&self, table: &str) -> String {
        format!(
            "DECLARE @sql NVARCHAR(MAX) = N''; \
             SELECT @sql += N'ALTER TABLE ' + QUOTENAME(OBJECT_SCHEMA_NAME(parent_object_id)) \
             + N'.' + QUOTENAME(OBJECT_NAME(parent_object_id)) \
             + N' DROP CONSTRAINT ' + QUOTENAME(name) + N';' \
             FROM sys.foreign_keys WHERE referenced_object_id = OBJECT_ID(N'{}'); \
             EXEC sp_executesql @sql;",
            self.quote_literal(table)
        )
    }

    async fn suspend_checks(&self, session: &mut Session) -> Result<()> {
        for table in session.prepared.clone() {
            let sql = format!(
                "ALTER TABLE {} NOCHECK CONSTRAINT ALL",
                self.dialect.qualify_table(&self.schema, &table)
            );
            session.batch(&sql).await?;
        }
        Ok(())
    }

    async fn recheck(&self, session: &mut Session) -> Result<()> {
        for table in session.prepared.clone() {
            let sql = format!(
                "ALTER TABLE {} WITH CHECK CHECK CONSTRAINT ALL",
                self.dialect.qualify_table(&self.schema, &table)
            );
            session
                .batch(&sql)
                .await
                .map_err(|e| MigrateError::write(&table, format!("constraint check: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MssqlWriter {
    fn backend(&self) -> Backend {
        Backend::Mssql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: true,
            transactional_ddl: true,
            deferrable_constraints: true,
            concurrent_writes: false,
        }
    }

    async fn prepare_schema(&self, tables: &[TableDefinition], mode: TargetMode) -> Result<()> {
        let mut session = self.session.lock().await;

        let schema_sql = format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.schemas WHERE name = N'{}') EXEC(N'CREATE SCHEMA {}')",
            self.schema.replace('\'', "''"),
            self.dialect.quote_ident(&self.schema).replace('\'', "''")
        );
        session.batch(&schema_sql).await?;

        if mode == TargetMode::DropRecreate {
            for table in tables.iter().rev() {
                session.batch(&self.drop_referencing_keys(&table.name)).await?;
                session
                    .batch(&self.dialect.drop_table(&self.schema, &table.name))
                    .await?;
            }
        }

        let mut created: Vec<&TableDefinition> = Vec::new();
        for table in tables {
            if mode == TargetMode::Append {
                let exists = format!(
                    "SELECT CASE WHEN OBJECT_ID(N'{}', N'U') IS NULL THEN 0 ELSE 1 END",
                    self.quote_literal(&table.name)
                );
                let row = session.conn.simple_query(exists).await?.into_row().await?;
                if row.and_then(|r| r.get::<i32, _>(0)).unwrap_or(0) == 1 {
                    debug!("Table {}.{} exists, appending", self.schema, table.name);
                    continue;
                }
            }
            session
                .batch(&self.dialect.create_table(&self.schema, table, false))
                .await?;
            created.push(table);
        }

        for table in &created {
            for fk in &table.foreign_keys {
                session
                    .batch(&self.dialect.add_foreign_key(&self.schema, table, fk))
                    .await?;
            }
        }

        session.prepared = tables.iter().map(|t| t.name.clone()).collect();
        if session.defer_constraints {
            self.suspend_checks(&mut session).await?;
        }

        self.types.register(tables);
        debug!(
            "Prepared {} tables in schema {} ({} created)",
            tables.len(),
            self.schema,
            created.len()
        );
        Ok(())
    }

    async fn begin_unit_of_work(&self, defer_constraints: bool) -> Result<()> {
        let mut session = self.session.lock().await;
        session.batch("BEGIN TRANSACTION").await?;
        session.in_transaction = true;
        session.defer_constraints = defer_constraints;
        if defer_constraints {
            self.suspend_checks(&mut session).await?;
        }
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
                .insert_statement(&self.schema, table, columns, chunk.len());
            let params: Vec<Box<dyn ToSql>> = chunk
                .iter()
                .flat_map(|row| row.iter().zip(&types).map(|(v, ty)| to_sql_param(v, *ty)))
                .collect();
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            let result = session
                .conn
                .execute(sql.as_str(), &param_refs)
                .await
                .map_err(|e| MigrateError::write(table, e.to_string()))?;
            written += result.total();
        }
        Ok(written)
    }

    async fn max_key(&self, table: &TableDefinition) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT CAST(MAX({}) AS BIGINT) FROM {}",
            self.dialect.quote_ident(&table.primary_key),
            self.dialect.qualify_table(&self.schema, &table.name)
        );
        let mut session = self.session.lock().await;
        let row = session.conn.simple_query(sql).await?.into_row().await?;
        Ok(row.and_then(|r| r.get::<i64, _>(0)))
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if !session.in_transaction {
            return Ok(());
        }
        if session.defer_constraints {
            self.recheck(&mut session).await?;
        }
        session.batch("COMMIT TRANSACTION").await?;
        session.in_transaction = false;
        session.defer_constraints = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            session.in_transaction = false;
            session.defer_constraints = false;
            session
                .batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
                .await?;
        }
        Ok(())
    }

    // bb8 pool handles cleanup automatically
    async fn close(&self) {}
}

/// Bind a conformed value; NULLs are typed by the column.
fn to_sql_param(value: &SqlValue, ty: ColumnType) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null => match ty {
            ColumnType::Integer => Box::new(Option::<i32>::None),
            ColumnType::BigInt => Box::new(Option::<i64>::None),
            ColumnType::Decimal { .. } => Box::new(Option::<Decimal>::None),
            ColumnType::Boolean => Box::new(Option::<bool>::None),
            ColumnType::Date => Box::new(Option::<chrono::NaiveDate>::None),
            ColumnType::Timestamp => Box::new(Option::<chrono::NaiveDateTime>::None),
            ColumnType::Binary => Box::new(Option::<Vec<u8>>::None),
            _ => Box::new(Option::<String>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::Text(s) | SqlValue::ObjectId(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::Json(v) => Box::new(v.to_string()),
    }
}
