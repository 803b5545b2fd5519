//! PostgreSQL destination.
//!
//! Uses deadpool-postgres for the connection and multi-row parameterized
//! INSERTs for data. All work of a run happens on one session connection so
//! DDL, data and the deferred constraint check share a single transaction.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::{TargetConfig, TargetMode};
use crate::core::schema::{ColumnType, TableDefinition};
use crate::core::traits::{Backend, Capabilities, Destination, Dialect};
use crate::core::value::SqlValue;
use crate::drivers::common::{SslMode, TableTypes, TlsBuilder};
use crate::error::{MigrateError, Result};

use super::PostgresDialect;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

type Param = Box<dyn ToSql + Sync + Send>;

struct Session {
    client: Object,
    in_transaction: bool,
}

/// PostgreSQL destination implementation.
pub struct PostgresWriter {
    pool: Pool,
    schema: String,
    dialect: PostgresDialect,
    session: Mutex<Session>,
    types: TableTypes,
}

impl PostgresWriter {
    /// Connect and reserve the session connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port());
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode: SslMode = config.ssl_mode.parse()?;
        let mgr = match TlsBuilder::new(ssl_mode).build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection("postgres", e))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection("postgres", e))?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            pool,
            schema: config.schema(),
            dialect: PostgresDialect::new(),
            session: Mutex::new(Session {
                client,
                in_transaction: false,
            }),
            types: TableTypes::new(),
        })
    }

    async fn table_exists(client: &tokio_postgres::Client, schema: &str, table: &str) -> Result<bool> {
        let sql = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
        "#;
        let row = client.query_one(sql, &[&schema, &table]).await?;
        Ok(row.get::<_, bool>(0))
    }
}

#[async_trait]
impl Destination for PostgresWriter {
    fn backend(&self) -> Backend {
        Backend::Postgres
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
        let session = self.session.lock().await;
        let client: &tokio_postgres::Client = &session.client;

        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                self.dialect.quote_ident(&self.schema)
            ))
            .await?;

        let mut created: Vec<&TableDefinition> = Vec::new();
        match mode {
            TargetMode::DropRecreate => {
                for table in tables.iter().rev() {
                    client
                        .batch_execute(&self.dialect.drop_table(&self.schema, &table.name))
                        .await?;
                }
                for table in tables {
                    client
                        .batch_execute(&self.dialect.create_table(&self.schema, table, false))
                        .await?;
                    created.push(table);
                }
            }
            TargetMode::Append => {
                for table in tables {
                    if Self::table_exists(client, &self.schema, &table.name).await? {
                        debug!("Table {}.{} exists, appending", self.schema, table.name);
                        continue;
                    }
                    client
                        .batch_execute(&self.dialect.create_table(&self.schema, table, false))
                        .await?;
                    created.push(table);
                }
            }
        }

        for table in &created {
            for fk in &table.foreign_keys {
                client
                    .batch_execute(&self.dialect.add_foreign_key(&self.schema, table, fk))
                    .await?;
            }
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
        session.client.batch_execute("BEGIN").await?;
        session.in_transaction = true;
        if defer_constraints {
            session
                .client
                .batch_execute("SET CONSTRAINTS ALL DEFERRED")
                .await?;
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
        let per_statement = self.dialect.rows_per_statement(columns.len());
        let session = self.session.lock().await;

        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let sql = self
                .dialect
                .insert_statement(&self.schema, table, columns, chunk.len());

            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                for (value, ty) in row.iter().zip(&types) {
                    params.push(
                        to_param(value.clone(), *ty).map_err(|e| MigrateError::write(table, e))?,
                    );
                }
            }
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            written += session
                .client
                .execute(sql.as_str(), &refs)
                .await
                .map_err(|e| MigrateError::write(table, e.to_string()))?;
        }
        Ok(written)
    }

    async fn finish_table(&self, table: &TableDefinition) -> Result<()> {
        let Some(pk) = table.primary_key_column().filter(|c| c.is_auto_increment()) else {
            return Ok(());
        };
        let qualified = self.dialect.qualify_table(&self.schema, &table.name);
        let session = self.session.lock().await;

        let seq_query = format!(
            "SELECT pg_get_serial_sequence('{}', '{}')",
            qualified.replace('\'', "''"),
            pk.name.replace('\'', "''")
        );
        let row = session.client.query_one(seq_query.as_str(), &[]).await?;
        if let Some(seq_name) = row.get::<_, Option<String>>(0) {
            let reset_query =
                sequence_reset_sql(&seq_name, &self.dialect.quote_ident(&pk.name), &qualified);
            session.client.batch_execute(&reset_query).await?;
            debug!("Reset sequence {} for {}.{}", seq_name, self.schema, table.name);
        }
        Ok(())
    }

    async fn max_key(&self, table: &TableDefinition) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MAX({})::BIGINT FROM {}",
            self.dialect.quote_ident(&table.primary_key),
            self.dialect.qualify_table(&self.schema, &table.name)
        );
        let session = self.session.lock().await;
        let row = session.client.query_one(sql.as_str(), &[]).await?;
        Ok(row.get::<_, Option<i64>>(0))
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            session.client.batch_execute("COMMIT").await?;
            session.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            session.in_transaction = false;
            session.client.batch_execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Point `sequence` at the value after the column's current maximum, or 1
/// for an empty table.
fn sequence_reset_sql(sequence: &str, column: &str, table: &str) -> String {
    format!(
        "SELECT setval('{}', COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
        sequence.replace('\'', "''"),
        column,
        table
    )
}

/// Bind a value as the Rust type tokio-postgres maps to the column type.
fn to_param(value: SqlValue, ty: ColumnType) -> std::result::Result<Param, String> {
    let param: Param = match value.conform(ty)? {
        SqlValue::Null => null_param(ty),
        SqlValue::Bool(v) => Box::new(v),
        SqlValue::I32(v) => Box::new(v),
        SqlValue::I64(v) => Box::new(v),
        SqlValue::F64(v) => Box::new(v),
        SqlValue::Decimal(v) => Box::new(v),
        SqlValue::Text(v) | SqlValue::ObjectId(v) => Box::new(v),
        SqlValue::Bytes(v) => Box::new(v),
        SqlValue::Date(v) => Box::new(v),
        SqlValue::DateTime(v) => Box::new(v),
        SqlValue::Json(v) => Box::new(v),
    };
    Ok(param)
}

/// Typed NULL for a column type.
fn null_param(ty: ColumnType) -> Param {
    match ty {
        ColumnType::Integer => Box::new(None::<i32>),
        ColumnType::BigInt => Box::new(None::<i64>),
        ColumnType::Decimal { .. } => Box::new(None::<Decimal>),
        ColumnType::VarChar { .. } | ColumnType::Char { .. } | ColumnType::Text => {
            Box::new(None::<String>)
        }
        ColumnType::Boolean => Box::new(None::<bool>),
        ColumnType::Date => Box::new(None::<chrono::NaiveDate>),
        ColumnType::Timestamp => Box::new(None::<chrono::NaiveDateTime>),
        ColumnType::Binary => Box::new(None::<Vec<u8>>),
        ColumnType::Json => Box::new(None::<serde_json::Value>),
    }
}
