//! # docrel-migrate
//!
//! Move document data into relational databases (and back into document
//! stores) without a schema authority.
//!
//! This library provides:
//!
//! - **Schema inference** of a normalized table forest from JSON documents
//! - **Dependency ordering** of tables by foreign key, tolerating cycles
//! - **Chunked batch writes** with per-table progress
//! - **Transactional runs** on PostgreSQL, MySQL and SQL Server, with
//!   partial-success reporting on MongoDB
//!
//! ## Example
//!
//! ```rust,no_run
//! use docrel_migrate::{source, Config, MigrationPlan, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> docrel_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let records = source::load_documents("users.json", config.source.format)?;
//!     let plan = MigrationPlan::from_documents(&config.source.root_table, records)?;
//!     let report = Orchestrator::new(config).run(&plan).await?;
//!     println!("Migrated {} rows", report.rows_committed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod drivers;
pub mod enhance;
pub mod error;
pub mod graph;
pub mod infer;
pub mod normalize;
pub mod orchestrator;
pub mod plan;
pub mod source;
pub mod writer;

// Re-exports for convenient access
pub use config::{Config, InputFormat, MigrationConfig, SourceConfig, TargetConfig, TargetMode};
pub use context::{MigrationContext, MigrationEvent, MigrationProgress, Phase};
pub use crate::core::schema::{ColumnDef, ColumnType, ForeignKeyDef, TableDefinition};
pub use crate::core::traits::{Backend, Capabilities, Destination, Dialect};
pub use crate::core::value::{InsertRecord, SqlValue, TableRows};
pub use drivers::{connect, schema_script, DialectImpl};
pub use error::{MigrateError, Result};
pub use graph::{SortResult, TableDependency};
pub use normalize::SchemaNormalizer;
pub use orchestrator::{MigrationReport, MigrationStatus, Orchestrator};
pub use plan::MigrationPlan;
pub use writer::{BatchWriter, WriteStats};
