//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax strategy for MSSQL
//! - [`MssqlWriter`]: Destination for SQL Server databases

mod dialect;
mod writer;

pub use dialect::MssqlDialect;
pub use writer::MssqlWriter;
