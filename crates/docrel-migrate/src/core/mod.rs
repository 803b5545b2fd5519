//! Core types shared by every component: schema, values, and the destination trait.

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    constraint_name, validate_tables, ColumnDef, ColumnDefault, ColumnType, ForeignKeyDef,
    TableDefinition, UniqueConstraint,
};
pub use traits::{Backend, Capabilities, Destination, Dialect};
pub use value::{InsertRecord, SqlValue, TableRows};
