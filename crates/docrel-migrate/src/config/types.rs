//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::traits::Backend;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input records.
    #[serde(default)]
    pub source: SourceConfig,

    /// Destination store.
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Input record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// A JSON array of documents, or a single document.
    #[default]
    Json,

    /// One JSON document per line.
    Ndjson,

    /// Pre-tabulated rows plus external table definitions.
    Tables,
}

/// Input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Path to the input file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Input format (default: json).
    #[serde(default)]
    pub format: InputFormat,

    /// Root table name for document input (default: "records").
    #[serde(default = "default_root_table")]
    pub root_table: String,

    /// Table definitions for `format: tables`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: InputFormat::default(),
            root_table: default_root_table(),
            schema_path: None,
        }
    }
}

/// Destination configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Destination backend.
    pub r#type: Backend,

    /// Database host (default: "localhost").
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port. Falls back to the backend's standard port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema. Falls back to the backend's default schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// SSL mode (default: "disable").
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Connection URI (MongoDB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Fail writes to this table (memory backend only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_table: Option<String>,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("uri", &self.uri.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl TargetConfig {
    /// A memory target, used for dry runs and tests.
    pub fn memory() -> Self {
        Self {
            r#type: Backend::Memory,
            host: default_host(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: None,
            ssl_mode: default_ssl_mode(),
            uri: None,
            fail_on_table: None,
        }
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.r#type {
            Backend::Postgres => 5432,
            Backend::Mysql => 3306,
            Backend::Mssql => 1433,
            Backend::Mongodb => 27017,
            Backend::Memory => 0,
        })
    }

    /// Effective schema: `public` for PostgreSQL, `dbo` for SQL Server, the
    /// database itself for MySQL and MongoDB.
    pub fn schema(&self) -> String {
        if let Some(schema) = self.schema.as_deref().filter(|s| !s.is_empty()) {
            return schema.to_string();
        }
        match self.r#type {
            Backend::Postgres => "public".to_string(),
            Backend::Mssql => "dbo".to_string(),
            _ => self.database.clone(),
        }
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per chunk (default: 1000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Target mode (default: drop_recreate).
    #[serde(default)]
    pub target_mode: TargetMode,

    /// Postpone foreign-key checks to commit where the backend can (default: true).
    #[serde(default = "default_true")]
    pub defer_constraints: bool,

    /// Write tables of one dependency wave concurrently (default: false).
    #[serde(default)]
    pub parallel_waves: bool,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds to wait for the suggestion hook (default: 10).
    #[serde(default = "default_suggestion_timeout")]
    pub suggestion_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            target_mode: TargetMode::default(),
            defer_constraints: default_true(),
            parallel_waves: false,
            max_connections: default_max_connections(),
            suggestion_timeout_secs: default_suggestion_timeout(),
        }
    }
}

/// Target mode for migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Drop and recreate target tables.
    #[default]
    DropRecreate,

    /// Keep existing tables, create missing ones.
    Append,
}

// Default value functions for serde
fn default_root_table() -> String {
    "records".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_chunk_size() -> usize {
    crate::writer::DEFAULT_CHUNK_SIZE
}

fn default_max_connections() -> usize {
    4
}

fn default_suggestion_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
