//! MySQL/MariaDB driver.
//!
//! - [`MysqlDialect`]: SQL syntax strategy for MySQL
//! - [`MysqlWriter`]: Destination for MySQL databases

mod dialect;
mod writer;

pub use dialect::MysqlDialect;
pub use writer::MysqlWriter;
