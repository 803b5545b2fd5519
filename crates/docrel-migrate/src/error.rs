//! Error types for the migration library.

use thiserror::Error;

use crate::context::Phase;
use crate::orchestrator::{MigrationReport, MigrationStatus};

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for destination connection failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for write failures and aborted migrations.
pub const EXIT_WRITE_ERROR: u8 = 3;
/// Exit code for cancelled migrations.
pub const EXIT_CANCELLED: u8 = 4;
/// Exit code for input/schema errors.
pub const EXIT_INPUT_ERROR: u8 = 5;
/// Exit code for IO errors (file not found, permissions).
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input records could not be read or parsed.
    #[error("Input error: {0}")]
    Input(String),

    /// A table definition violates a schema invariant.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Destination could not be reached.
    #[error("Connection to {backend} failed: {message}")]
    Connection { backend: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A write against a specific table failed.
    #[error("Write failed for table {table}: {message}")]
    Write { table: String, message: String },

    /// A write failed after the destination had already kept part of the chunk.
    #[error("Write failed for table {table} after {applied} rows of the chunk: {message}")]
    PartialWrite {
        table: String,
        applied: u64,
        message: String,
    },

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// MongoDB driver error
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// The migration stopped in `phase`; the report holds the log and progress snapshot.
    #[error("Migration aborted during {phase}: {message}")]
    Aborted {
        phase: Phase,
        message: String,
        report: Box<MigrationReport>,
    },
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Connection error
    pub fn connection(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Rows of the failing chunk that persisted despite the error.
    pub fn applied_rows(&self) -> u64 {
        match self {
            MigrateError::PartialWrite { applied, .. } => *applied,
            _ => 0,
        }
    }

    /// The report attached to an aborted migration, if any.
    pub fn report(&self) -> Option<&MigrationReport> {
        match self {
            MigrateError::Aborted { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Map the error to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Aborted { report, .. } if report.status == MigrationStatus::Cancelled => EXIT_CANCELLED,
            MigrateError::Aborted { phase, .. } if *phase == Phase::Connecting => {
                EXIT_CONNECTION_ERROR
            }
            MigrateError::Input(_) | MigrateError::Schema(_) | MigrateError::Json(_) => {
                EXIT_INPUT_ERROR
            }
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_WRITE_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        if let Some(report) = self.report() {
            for progress in report.progress.iter().filter(|p| p.error.is_some()) {
                output.push_str(&format!(
                    "\n  Table {}: {}/{} rows written before failure",
                    progress.table, progress.written_rows, progress.total_rows
                ));
            }
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
