//! Scalar values and insert records.
//!
//! Every value reaching a destination has already been flattened: arrays and
//! objects were extracted into child tables by the normalizer, so an
//! [`InsertRecord`] only ever holds scalars or NULL.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use super::schema::ColumnType;

/// SQL value for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,

    Bool(bool),

    /// 32-bit signed integer.
    I32(i32),

    /// 64-bit signed integer.
    I64(i64),

    /// Double precision float.
    F64(f64),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Text data.
    Text(String),

    /// Store-native document identifier (hex ObjectId).
    ///
    /// Relational destinations bind it as text; document destinations keep
    /// the native identifier type.
    ObjectId(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// Date without time component.
    Date(NaiveDate),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// JSON blob.
    Json(serde_json::Value),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render the value as text, the way it would be bound to a text column.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::I32(v) => Some(v.to_string()),
            SqlValue::I64(v) => Some(v.to_string()),
            SqlValue::F64(v) => Some(v.to_string()),
            SqlValue::Decimal(v) => Some(v.to_string()),
            SqlValue::Text(v) | SqlValue::ObjectId(v) => Some(v.clone()),
            SqlValue::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
            SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            SqlValue::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::Json(v) => Some(v.to_string()),
        }
    }

    /// Convert the value to the variant a column of `column_type` binds.
    ///
    /// Values produced by the normalizer already match; this covers rows read
    /// from relational input and keys assigned as 64-bit integers.
    pub fn conform(self, column_type: ColumnType) -> std::result::Result<SqlValue, String> {
        if self.is_null() {
            return Ok(SqlValue::Null);
        }
        let kind = self.kind();
        let mismatch = || format!("{} value cannot be stored as {}", kind, column_type);
        match column_type {
            ColumnType::Integer => {
                let v = self.as_i64().ok_or_else(mismatch)?;
                i32::try_from(v)
                    .map(SqlValue::I32)
                    .map_err(|_| format!("{} is out of range for integer", v))
            }
            ColumnType::BigInt => self.as_i64().map(SqlValue::I64).ok_or_else(mismatch),
            ColumnType::Decimal { .. } => match self {
                SqlValue::Decimal(d) => Ok(SqlValue::Decimal(d)),
                SqlValue::I32(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
                SqlValue::I64(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
                SqlValue::F64(v) => Decimal::try_from(v)
                    .map(SqlValue::Decimal)
                    .map_err(|_| mismatch()),
                SqlValue::Text(ref s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(SqlValue::Decimal)
                    .map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            t if t.is_textual() => self.to_text().map(SqlValue::Text).ok_or_else(mismatch),
            ColumnType::Boolean => match self {
                SqlValue::Bool(b) => Ok(SqlValue::Bool(b)),
                SqlValue::I32(v) if v == 0 || v == 1 => Ok(SqlValue::Bool(v == 1)),
                SqlValue::I64(v) if v == 0 || v == 1 => Ok(SqlValue::Bool(v == 1)),
                _ => Err(mismatch()),
            },
            ColumnType::Date => match self {
                SqlValue::Date(d) => Ok(SqlValue::Date(d)),
                SqlValue::DateTime(dt) => Ok(SqlValue::Date(dt.date())),
                _ => Err(mismatch()),
            },
            ColumnType::Timestamp => match self {
                SqlValue::DateTime(dt) => Ok(SqlValue::DateTime(dt)),
                SqlValue::Date(d) => Ok(SqlValue::DateTime(d.and_time(NaiveTime::MIN))),
                _ => Err(mismatch()),
            },
            ColumnType::Binary => match self {
                SqlValue::Bytes(b) => Ok(SqlValue::Bytes(b)),
                SqlValue::Text(s) => Ok(SqlValue::Bytes(s.into_bytes())),
                _ => Err(mismatch()),
            },
            ColumnType::Json => match self {
                SqlValue::Json(v) => Ok(SqlValue::Json(v)),
                other => Ok(SqlValue::Json(serde_json::Value::String(
                    other.to_text().unwrap_or_default(),
                ))),
            },
            _ => Err(mismatch()),
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::I32(_) | SqlValue::I64(_) => "integer",
            SqlValue::F64(_) => "float",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "text",
            SqlValue::ObjectId(_) => "objectid",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Date(_) => "date",
            SqlValue::DateTime(_) => "timestamp",
            SqlValue::Json(_) => "json",
        }
    }

    /// Integer view of the value, when it has one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Key used to detect duplicate primary-key values.
    #[must_use]
    pub fn key_repr(&self) -> String {
        match self {
            SqlValue::I32(_) | SqlValue::I64(_) => {
                self.as_i64().map(|v| v.to_string()).unwrap_or_default()
            }
            other => other.to_text().unwrap_or_default(),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Ordered mapping from column name to scalar value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertRecord {
    fields: Vec<(String, SqlValue)>,
}

impl InsertRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Set a column value, replacing an existing entry in place.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Column names in insertion order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Project the record onto `columns`, filling missing columns with NULL.
    pub fn project(&self, columns: &[String]) -> Vec<SqlValue> {
        columns
            .iter()
            .map(|c| self.get(c).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for InsertRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = InsertRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// All rows destined for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<InsertRecord>,
}

impl TableRows {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_in_place() {
        let mut record = InsertRecord::new().with("id", 1i64).with("name", "a");
        record.insert("id", 2i64);
        assert_eq!(record.columns().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(record.get("id"), Some(&SqlValue::I64(2)));
    }

    #[test]
    fn test_project_fills_missing_with_null() {
        let record = InsertRecord::new()
            .with("_id", SqlValue::ObjectId("507f1f77bcf86cd799439011".into()))
            .with("name", "a");
        let cols = vec!["_id".to_string(), "email".to_string(), "name".to_string()];
        assert_eq!(
            record.project(&cols),
            vec![
                SqlValue::ObjectId("507f1f77bcf86cd799439011".into()),
                SqlValue::Null,
                SqlValue::Text("a".into()),
            ]
        );
    }

    #[test]
    fn test_conform_to_column_types() {
        assert_eq!(
            SqlValue::I64(5).conform(ColumnType::Integer),
            Ok(SqlValue::I32(5))
        );
        assert!(SqlValue::I64(i64::MAX).conform(ColumnType::Integer).is_err());
        assert_eq!(
            SqlValue::ObjectId("507f1f77bcf86cd799439011".into())
                .conform(ColumnType::Char { length: 24 }),
            Ok(SqlValue::Text("507f1f77bcf86cd799439011".into()))
        );
        assert_eq!(
            SqlValue::Text("12.50".into()).conform(ColumnType::Decimal { precision: 12, scale: 2 }),
            Ok(SqlValue::Decimal(Decimal::new(1250, 2)))
        );
        assert_eq!(SqlValue::Null.conform(ColumnType::Boolean), Ok(SqlValue::Null));
        assert!(SqlValue::Bool(true).conform(ColumnType::Date).is_err());
    }

    #[test]
    fn test_key_repr_normalizes_integers() {
        assert_eq!(SqlValue::I32(7).key_repr(), SqlValue::I64(7).key_repr());
    }

    #[test]
    fn test_option_into_value() {
        let v: SqlValue = Option::<i64>::None.into();
        assert!(v.is_null());
    }
}
