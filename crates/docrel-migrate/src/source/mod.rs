//! Input loading.
//!
//! Document input is a JSON array, a single JSON object, or newline-delimited
//! JSON. Relational input skips inference: a JSON list of table definitions
//! plus a data file mapping each table name to an array of row objects.

use std::collections::HashSet;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{InputFormat, SourceConfig};
use crate::core::schema::{validate_tables, TableDefinition};
use crate::core::value::{InsertRecord, TableRows};
use crate::error::{MigrateError, Result};
use crate::normalize::{coerce_value, json_kind};

/// Externally supplied tables and their rows.
#[derive(Debug, Clone, Default)]
pub struct RelationalInput {
    pub tables: Vec<TableDefinition>,
    pub rows: Vec<TableRows>,
}

/// Everything a run reads before planning.
#[derive(Debug, Clone)]
pub enum SourceData {
    Documents(Vec<Value>),
    Relational(RelationalInput),
}

/// Parse document input.
///
/// With [`InputFormat::Json`] a document that is not a single JSON value is
/// retried as NDJSON, so either shape can be passed without configuration.
pub fn parse_documents(text: &str, format: InputFormat) -> Result<Vec<Value>> {
    match format {
        InputFormat::Ndjson => parse_ndjson(text),
        InputFormat::Json => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(Value::Object(map)) => Ok(vec![Value::Object(map)]),
            Ok(other) => Err(MigrateError::Input(format!(
                "expected a JSON array or object, found {}",
                json_kind(&other)
            ))),
            Err(json_err) => parse_ndjson(text).map_err(|_| MigrateError::Json(json_err)),
        },
        InputFormat::Tables => Err(MigrateError::Input(
            "tables format carries relational input, not documents".into(),
        )),
    }
}

fn parse_ndjson(text: &str) -> Result<Vec<Value>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| MigrateError::Input(format!("line {}: {}", n + 1, e)))
        })
        .collect()
}

/// Read and parse a document file.
pub fn load_documents(path: impl AsRef<Path>, format: InputFormat) -> Result<Vec<Value>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let records = parse_documents(&text, format)?;
    info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Build relational input from a table-definition list and a data object.
///
/// Every value is coerced to its column type; an unknown table, an unknown
/// column or a value that does not fit is an input error.
pub fn parse_relational(schema_json: &str, data_json: &str) -> Result<RelationalInput> {
    let tables: Vec<TableDefinition> = serde_json::from_str(schema_json)?;
    validate_tables(&tables)?;

    let data: Map<String, Value> = match serde_json::from_str(data_json)? {
        Value::Object(map) => map,
        other => {
            return Err(MigrateError::Input(format!(
                "relational data must map table names to row arrays, found {}",
                json_kind(&other)
            )))
        }
    };

    let mut rows = Vec::with_capacity(data.len());
    let mut seen = HashSet::new();
    for (name, value) in data {
        let Some(table) = tables.iter().find(|t| t.name == name) else {
            return Err(MigrateError::Input(format!(
                "data for unknown table {}",
                name
            )));
        };
        seen.insert(name.clone());

        let Value::Array(items) = value else {
            return Err(MigrateError::Input(format!(
                "rows for table {} must be an array",
                name
            )));
        };

        let mut table_rows = TableRows::new(&table.name);
        for (index, item) in items.iter().enumerate() {
            let Value::Object(fields) = item else {
                return Err(MigrateError::Input(format!(
                    "row {} of table {} is not an object",
                    index, name
                )));
            };
            let mut record = InsertRecord::with_capacity(fields.len());
            for (column, raw) in fields {
                let Some(def) = table.column(column) else {
                    return Err(MigrateError::Input(format!(
                        "row {} of table {} has unknown column {}",
                        index, name, column
                    )));
                };
                let value = coerce_value(raw, def.column_type).map_err(|e| {
                    MigrateError::Input(format!("{}.{} row {}: {}", name, column, index, e))
                })?;
                record.insert(column.clone(), value);
            }
            table_rows.rows.push(record);
        }
        rows.push(table_rows);
    }

    for table in tables.iter().filter(|t| !seen.contains(&t.name)) {
        debug!("Relational input has no rows for table {}", table.name);
    }

    Ok(RelationalInput { tables, rows })
}

/// Read relational input from its two files.
pub fn load_relational(
    schema_path: impl AsRef<Path>,
    data_path: impl AsRef<Path>,
) -> Result<RelationalInput> {
    let schema = std::fs::read_to_string(schema_path)?;
    let data = std::fs::read_to_string(data_path)?;
    let input = parse_relational(&schema, &data)?;
    info!(
        "Loaded {} tables with {} rows of relational input",
        input.tables.len(),
        input.rows.iter().map(|t| t.rows.len()).sum::<usize>()
    );
    Ok(input)
}

/// Load whatever the source section describes.
pub fn load(source: &SourceConfig) -> Result<SourceData> {
    let Some(path) = &source.path else {
        return Err(MigrateError::Config("source.path is required".into()));
    };
    match source.format {
        InputFormat::Tables => {
            let Some(schema_path) = &source.schema_path else {
                return Err(MigrateError::Config(
                    "source.schema_path is required when source.format is 'tables'".into(),
                ));
            };
            load_relational(schema_path, path).map(SourceData::Relational)
        }
        format => load_documents(path, format).map(SourceData::Documents),
    }
}
