//! MongoDB destination.
//!
//! Each table becomes a collection and each row a document. MongoDB offers
//! no multi-collection unit of work here, so every `insert_many` is durable
//! as soon as it returns and a failed run leaves earlier tables in place.
//! Foreign keys are not enforced; unique constraints become sparse unique
//! indexes. Inserts are ordered, so a chunk that fails part way keeps the
//! documents ahead of the first failed one.

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use chrono::NaiveTime;
use mongodb::error::ErrorKind;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use crate::config::{TargetConfig, TargetMode};
use crate::core::schema::TableDefinition;
use crate::core::traits::{Backend, Capabilities, Destination};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

/// MongoDB destination implementation.
pub struct MongoWriter {
    client: Client,
    db: Database,
}

impl MongoWriter {
    /// Connect and ping the target database.
    pub async fn new(config: &TargetConfig) -> Result<Self> {
        let client = Client::with_uri_str(config.mongodb_uri())
            .await
            .map_err(|e| MigrateError::connection("mongodb", e))?;
        let db = client.database(&config.database);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MigrateError::connection("mongodb", e))?;

        info!("Connected to MongoDB target: {}", config.database);
        Ok(Self { client, db })
    }
}

#[async_trait]
impl Destination for MongoWriter {
    fn backend(&self) -> Backend {
        Backend::Mongodb
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: false,
            transactional_ddl: false,
            deferrable_constraints: false,
            concurrent_writes: true,
        }
    }

    async fn prepare_schema(&self, tables: &[TableDefinition], mode: TargetMode) -> Result<()> {
        if mode == TargetMode::DropRecreate {
            for table in tables.iter().rev() {
                self.db.collection::<Document>(&table.name).drop().await?;
            }
        }

        for table in tables {
            let collection = self.db.collection::<Document>(&table.name);
            for unique in &table.unique_constraints {
                let mut keys = Document::new();
                for column in &unique.columns {
                    keys.insert(column.as_str(), 1);
                }
                let options = IndexOptions::builder().unique(true).sparse(true).build();
                collection
                    .create_index(IndexModel::builder().keys(keys).options(options).build())
                    .await?;
            }
        }

        debug!("Prepared {} collections ({:?})", tables.len(), mode);
        Ok(())
    }

    async fn begin_unit_of_work(&self, _defer_constraints: bool) -> Result<()> {
        Ok(())
    }

    async fn write_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        let chunk_len = rows.len();
        let mut docs = Vec::with_capacity(chunk_len);
        for row in rows {
            let mut document = Document::new();
            for (column, value) in columns.iter().zip(row) {
                let value = to_bson(value).map_err(|e| MigrateError::write(table, e))?;
                document.insert(column.as_str(), value);
            }
            docs.push(document);
        }

        let result = self
            .db
            .collection::<Document>(table)
            .insert_many(docs)
            .await
            .map_err(|e| insert_error(table, e, chunk_len))?;
        Ok(result.inserted_ids.len() as u64)
    }

    async fn max_key(&self, table: &TableDefinition) -> Result<Option<i64>> {
        let mut sort = Document::new();
        sort.insert(table.primary_key.as_str(), -1);
        let latest = self
            .db
            .collection::<Document>(&table.name)
            .find_one(doc! {})
            .sort(sort)
            .await?;
        Ok(latest.and_then(|d| match d.get(&table.primary_key) {
            Some(Bson::Int64(v)) => Some(*v),
            Some(Bson::Int32(v)) => Some(i64::from(*v)),
            _ => None,
        }))
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        debug!("MongoDB has no unit of work; written collections are kept");
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn insert_error(table: &str, err: mongodb::error::Error, chunk_len: usize) -> MigrateError {
    let applied = match err.kind.as_ref() {
        ErrorKind::InsertMany(failure) => applied_before_failure(
            failure
                .write_errors
                .as_ref()
                .and_then(|errors| errors.iter().map(|e| e.index).min()),
            failure.write_concern_error.is_some(),
            chunk_len,
        ),
        _ => 0,
    };
    if applied == 0 {
        return MigrateError::write(table, err.to_string());
    }
    MigrateError::PartialWrite {
        table: table.to_string(),
        applied,
        message: err.to_string(),
    }
}

/// Documents an ordered insert kept: everything before the first failed
/// index, or the whole chunk when only the write concern failed.
fn applied_before_failure(
    first_failed: Option<usize>,
    write_concern_failed: bool,
    chunk_len: usize,
) -> u64 {
    match first_failed {
        Some(index) => index.min(chunk_len) as u64,
        None if write_concern_failed => chunk_len as u64,
        None => 0,
    }
}

/// Convert a value to BSON, keeping ObjectIds and dates native.
fn to_bson(value: SqlValue) -> std::result::Result<Bson, String> {
    Ok(match value {
        SqlValue::Null => Bson::Null,
        SqlValue::Bool(b) => Bson::Boolean(b),
        SqlValue::I32(i) => Bson::Int32(i),
        SqlValue::I64(i) => Bson::Int64(i),
        SqlValue::F64(f) => Bson::Double(f),
        SqlValue::Decimal(d) => match d.to_f64() {
            Some(f) => Bson::Double(f),
            None => Bson::String(d.to_string()),
        },
        SqlValue::Text(s) => Bson::String(s),
        SqlValue::ObjectId(s) => match bson::oid::ObjectId::parse_str(&s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(s),
        },
        SqlValue::Bytes(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }),
        SqlValue::Date(d) => {
            Bson::DateTime(bson::DateTime::from_chrono(d.and_time(NaiveTime::MIN).and_utc()))
        }
        SqlValue::DateTime(dt) => Bson::DateTime(bson::DateTime::from_chrono(dt.and_utc())),
        SqlValue::Json(v) => bson::to_bson(&v).map_err(|e| e.to_string())?,
    })
}
