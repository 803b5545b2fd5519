//! Schema normalization and row flattening.
//!
//! The first record is the structural template. The root table takes the
//! template's top-level scalar fields; every nested object becomes a child
//! table `<parent>_<field>`, every array of objects a one-to-many child table,
//! and every array of scalars a `(parent key, value)` child table. Each child
//! carries a foreign key whose column copies the parent's primary-key type.
//!
//! Alongside the table definitions the normalizer produces a [`TableLayout`]
//! tree that [`flatten`] follows to turn every record into per-table
//! [`InsertRecord`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::schema::{ColumnDef, ColumnType, ForeignKeyDef, TableDefinition};
use crate::core::value::{InsertRecord, SqlValue, TableRows};
use crate::error::{MigrateError, Result};
use crate::infer::{
    find_identifier, infer_field, infer_identifier, is_object_id, is_scalar, is_self_reference,
    parse_temporal, ExtendedScalar, DEFAULT_VARCHAR,
};

/// Primary-key column of tables without a natural identifier.
pub const SYNTHETIC_KEY: &str = "id";

/// Value column of scalar-array tables.
pub const SCALAR_VALUE_COLUMN: &str = "value";

/// Where a table's primary-key value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum KeySource {
    /// Copied from an identifier field of the object.
    Field { field: String, column: String },
    /// Assigned from a per-table counter.
    Synthetic { column: String },
}

impl KeySource {
    pub fn column(&self) -> &str {
        match self {
            KeySource::Field { column, .. } | KeySource::Synthetic { column } => column,
        }
    }
}

/// How one field of an object is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldLayout {
    Column {
        field: String,
        column: String,
        column_type: ColumnType,
    },
    Object {
        field: String,
        child: TableLayout,
    },
    ObjectArray {
        field: String,
        child: TableLayout,
    },
    ScalarArray {
        field: String,
        child: ScalarArrayLayout,
    },
}

impl FieldLayout {
    pub fn field(&self) -> &str {
        match self {
            FieldLayout::Column { field, .. }
            | FieldLayout::Object { field, .. }
            | FieldLayout::ObjectArray { field, .. }
            | FieldLayout::ScalarArray { field, .. } => field,
        }
    }
}

/// Table holding the elements of an array of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScalarArrayLayout {
    pub table: String,
    pub key_column: String,
    pub parent_key_column: String,
    pub value_column: String,
    pub value_type: ColumnType,
}

/// Mapping from an object shape to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLayout {
    pub table: String,
    pub key: KeySource,
    pub key_type: ColumnType,
    /// Column holding the parent row's key, for child tables.
    pub parent_key_column: Option<String>,
    pub fields: Vec<FieldLayout>,
}

impl TableLayout {
    /// Table names in pre-order (parents before children).
    pub fn table_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        names.push(&self.table);
        for field in &self.fields {
            match field {
                FieldLayout::Object { child, .. } | FieldLayout::ObjectArray { child, .. } => {
                    child.collect_names(names)
                }
                FieldLayout::ScalarArray { child, .. } => names.push(&child.table),
                FieldLayout::Column { .. } => {}
            }
        }
    }
}

/// Output of [`SchemaNormalizer::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSchema {
    /// Root table first, then children in pre-order.
    pub tables: Vec<TableDefinition>,
    pub warnings: Vec<String>,
    /// `None` when the input was empty.
    pub layout: Option<TableLayout>,
}

/// Derives a relational schema from document records.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    root_table: String,
}

#[derive(Debug, Clone)]
struct ParentKey {
    table: String,
    column: String,
    column_type: ColumnType,
}

#[derive(Default)]
struct Builder {
    tables: Vec<TableDefinition>,
    warnings: Vec<String>,
    names: HashSet<String>,
}

impl SchemaNormalizer {
    pub fn new(root_table: impl Into<String>) -> Self {
        Self {
            root_table: root_table.into(),
        }
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Infer the table forest from the first record.
    ///
    /// The result depends only on the template record, so normalizing the
    /// same input twice yields identical schemas.
    pub fn normalize(&self, records: &[Value]) -> Result<NormalizedSchema> {
        let Some(template) = records.first() else {
            return Ok(NormalizedSchema {
                tables: Vec::new(),
                warnings: vec!["input contains no records; no tables inferred".to_string()],
                layout: None,
            });
        };
        let Some(template) = template.as_object() else {
            return Err(MigrateError::Input(format!(
                "template record must be a JSON object, got {}",
                json_kind(template)
            )));
        };
        if self.root_table.trim().is_empty() {
            return Err(MigrateError::Config("root table name is empty".into()));
        }

        let mut builder = Builder::default();
        let layout = builder.build_table(&self.root_table, template, None);
        debug!(
            "Normalized template into {} tables with {} warnings",
            builder.tables.len(),
            builder.warnings.len()
        );

        Ok(NormalizedSchema {
            tables: builder.tables,
            warnings: builder.warnings,
            layout: Some(layout),
        })
    }
}

impl Builder {
    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    fn unique_table_name(&mut self, requested: &str) -> String {
        let mut name = requested.to_string();
        let mut n = 2;
        while self.names.contains(&name) {
            name = format!("{}_{}", requested, n);
            n += 1;
        }
        if name != requested {
            self.warn(format!(
                "table name {} already used; child table renamed to {}",
                requested, name
            ));
        }
        self.names.insert(name.clone());
        name
    }

    fn attach_parent(table: &mut TableDefinition, parent: &ParentKey) -> String {
        let column = table.push_column(
            ColumnDef::new(
                foreign_key_column(&parent.table, &parent.column),
                parent.column_type,
            )
            .not_null(),
        );
        table.foreign_keys.push(ForeignKeyDef::new(
            &column,
            &parent.table,
            &parent.column,
        ));
        column
    }

    fn build_table(
        &mut self,
        requested_name: &str,
        obj: &Map<String, Value>,
        parent: Option<&ParentKey>,
    ) -> TableLayout {
        let name = self.unique_table_name(requested_name);

        let (pk, key) = match find_identifier(obj) {
            Some(field) => {
                let inference = infer_identifier(field, &obj[field]);
                if let Some(reason) = inference.ambiguity {
                    self.warn(format!("{}.{}: {}", name, field, reason));
                }
                (
                    ColumnDef::primary_key(field, inference.column_type),
                    KeySource::Field {
                        field: field.to_string(),
                        column: field.to_string(),
                    },
                )
            }
            None => {
                let column = synthetic_key_name(obj);
                (
                    ColumnDef::synthetic_key(&column),
                    KeySource::Synthetic { column },
                )
            }
        };
        let key_type = pk.column_type;
        let mut table = TableDefinition::new(&name, pk);
        let parent_key_column = parent.map(|p| Self::attach_parent(&mut table, p));

        let key_field = match &key {
            KeySource::Field { field, .. } => Some(field.clone()),
            KeySource::Synthetic { .. } => None,
        };

        let mut fields = Vec::new();
        let mut nested = Vec::new();
        for (field, value) in obj {
            if key_field.as_deref() == Some(field.as_str()) {
                continue;
            }
            if !is_scalar(value) {
                nested.push((field, value));
                continue;
            }

            if is_self_reference(field) {
                let column = table.push_column(ColumnDef::new(field, key_type));
                let pk_column = table.primary_key.clone();
                table
                    .foreign_keys
                    .push(ForeignKeyDef::new(&column, &name, pk_column));
                fields.push(FieldLayout::Column {
                    field: field.clone(),
                    column,
                    column_type: key_type,
                });
                continue;
            }

            let inference = infer_field(field, value);
            if let Some(reason) = &inference.ambiguity {
                self.warn(format!("{}.{}: {}", name, field, reason));
            }
            let column = table.push_column(ColumnDef::new(field, inference.column_type));
            if inference.unique {
                table.add_unique(&column);
            }
            fields.push(FieldLayout::Column {
                field: field.clone(),
                column,
                column_type: inference.column_type,
            });
        }

        let this_key = ParentKey {
            table: name.clone(),
            column: table.primary_key.clone(),
            column_type: key_type,
        };
        self.tables.push(table);

        for (field, value) in nested {
            let child_name = format!("{}_{}", name, field);
            let layout = match value {
                Value::Object(map) => FieldLayout::Object {
                    field: field.clone(),
                    child: self.build_table(&child_name, map, Some(&this_key)),
                },
                Value::Array(items) => {
                    let sample = items.iter().find(|v| !v.is_null());
                    match sample.and_then(nested_object) {
                        Some(map) => FieldLayout::ObjectArray {
                            field: field.clone(),
                            child: self.build_table(&child_name, map, Some(&this_key)),
                        },
                        None => FieldLayout::ScalarArray {
                            field: field.clone(),
                            child: self.build_scalar_array(&child_name, field, sample, &this_key),
                        },
                    }
                }
                _ => continue,
            };
            fields.push(layout);
        }

        TableLayout {
            table: name,
            key,
            key_type,
            parent_key_column,
            fields,
        }
    }

    fn build_scalar_array(
        &mut self,
        requested_name: &str,
        field: &str,
        sample: Option<&Value>,
        parent: &ParentKey,
    ) -> ScalarArrayLayout {
        let name = self.unique_table_name(requested_name);

        let value_type = match sample {
            None => {
                self.warn(format!(
                    "{}: template array {} is empty; element type defaults to varchar(255)",
                    name, field
                ));
                DEFAULT_VARCHAR
            }
            Some(Value::Array(_)) => {
                self.warn(format!(
                    "{}: nested arrays in {} are stored as JSON",
                    name, field
                ));
                ColumnType::Json
            }
            Some(value) => {
                let inference = infer_field(field, value);
                if let Some(reason) = inference.ambiguity {
                    self.warn(format!("{}.{}: {}", name, field, reason));
                }
                inference.column_type
            }
        };

        let mut table = TableDefinition::new(&name, ColumnDef::synthetic_key(SYNTHETIC_KEY));
        let parent_key_column = Self::attach_parent(&mut table, parent);
        let value_column = table.push_column(ColumnDef::new(SCALAR_VALUE_COLUMN, value_type));
        self.tables.push(table);

        ScalarArrayLayout {
            table: name,
            key_column: SYNTHETIC_KEY.to_string(),
            parent_key_column,
            value_column,
            value_type,
        }
    }
}

/// Name of the foreign-key column a child uses to point at its parent.
pub fn foreign_key_column(parent_table: &str, parent_key: &str) -> String {
    let key = parent_key.trim_start_matches('_');
    if key.is_empty() {
        format!("{}_key", parent_table)
    } else {
        format!("{}_{}", parent_table, key)
    }
}

fn synthetic_key_name(obj: &Map<String, Value>) -> String {
    let taken = |name: &str| obj.keys().any(|k| k.eq_ignore_ascii_case(name));
    for candidate in [SYNTHETIC_KEY, "row_id", "_row_id"] {
        if !taken(candidate) {
            return candidate.to_string();
        }
    }
    let mut n = 2;
    while taken(&format!("row_id_{}", n)) {
        n += 1;
    }
    format!("row_id_{}", n)
}

/// The object behind a value that should become a child table.
fn nested_object(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) if !is_scalar(value) => Some(map),
        _ => None,
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ===== Value coercion =====

/// Convert a JSON value to the given column type.
///
/// Extended-JSON wrappers are unwrapped first. Errors describe why the value
/// does not fit; callers decide whether that is fatal.
pub fn coerce_value(value: &Value, column_type: ColumnType) -> std::result::Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if let Some(ext) = ExtendedScalar::parse(value) {
        return coerce_extended(ext, column_type);
    }

    match column_type {
        ColumnType::Integer => {
            let i = integer_of(value)?;
            i32::try_from(i)
                .map(SqlValue::I32)
                .map_err(|_| format!("{} is out of range for integer", i))
        }
        ColumnType::BigInt => integer_of(value).map(SqlValue::I64),
        ColumnType::Decimal { precision, scale } => {
            decimal_of(value).and_then(|d| fit_decimal(d, precision, scale))
        }
        ColumnType::VarChar { length } | ColumnType::Char { length } => {
            let text = text_of(value);
            let chars = text.chars().count();
            if chars > length as usize {
                Err(format!("{} characters exceed length {}", chars, length))
            } else {
                Ok(SqlValue::Text(text))
            }
        }
        ColumnType::Text => Ok(SqlValue::Text(text_of(value))),
        ColumnType::Boolean => boolean_of(value).map(SqlValue::Bool),
        ColumnType::Date => temporal_of(value).map(|v| match v {
            SqlValue::DateTime(dt) => SqlValue::Date(dt.date()),
            other => other,
        }),
        ColumnType::Timestamp => temporal_of(value).map(|v| match v {
            SqlValue::Date(d) => SqlValue::DateTime(d.and_time(NaiveTime::MIN)),
            other => other,
        }),
        ColumnType::Binary => match value {
            Value::String(s) => Ok(SqlValue::Bytes(s.clone().into_bytes())),
            other => Err(format!("{} is not binary data", json_kind(other))),
        },
        ColumnType::Json => Ok(SqlValue::Json(value.clone())),
    }
}

fn coerce_extended(ext: ExtendedScalar, column_type: ColumnType) -> std::result::Result<SqlValue, String> {
    match ext {
        ExtendedScalar::ObjectId(oid) => {
            if !is_object_id(&oid) {
                return Err(format!("{:?} is not a valid ObjectId", oid));
            }
            match column_type {
                ColumnType::Json => Ok(SqlValue::Json(serde_json::json!({ "$oid": oid }))),
                t if t.is_textual() => {
                    coerce_value(&Value::String(oid.clone()), t).map(|_| SqlValue::ObjectId(oid))
                }
                other => Err(format!("ObjectId cannot be stored as {}", other)),
            }
        }
        ExtendedScalar::Date(inner) => match inner {
            Value::Object(_) => match ExtendedScalar::parse(&inner) {
                Some(ExtendedScalar::NumberLong(ms)) => {
                    let millis: i64 = ms
                        .parse()
                        .map_err(|_| format!("{:?} is not an epoch timestamp", ms))?;
                    coerce_value(&Value::from(millis), column_type)
                }
                _ => Err("unsupported $date payload".to_string()),
            },
            other => coerce_value(&other, column_type),
        },
        ExtendedScalar::NumberLong(s) | ExtendedScalar::NumberDecimal(s) => {
            coerce_value(&Value::String(s), column_type)
        }
    }
}

fn integer_of(value: &Value) -> std::result::Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                if f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Ok(f as i64)
                } else {
                    Err(format!("{} is out of range for bigint", n))
                }
            } else {
                Err(format!("{} is not an integer", n))
            }
        }
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("{:?} is not an integer", s)),
        other => Err(format!("{} is not an integer", json_kind(other))),
    }
}

fn parse_decimal(s: &str) -> std::result::Result<Decimal, String> {
    let s = s.trim();
    s.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| format!("{:?} is not a decimal number", s))
}

fn decimal_of(value: &Value) -> std::result::Result<Decimal, String> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s),
        other => Err(format!("{} is not a number", json_kind(other))),
    }
}

fn fit_decimal(d: Decimal, precision: u8, scale: u8) -> std::result::Result<SqlValue, String> {
    let rounded = d.round_dp(u32::from(scale));
    let integer_digits = rounded.trunc().abs().to_string().len();
    let allowed = usize::from(precision.saturating_sub(scale)).max(1);
    if integer_digits > allowed {
        return Err(format!(
            "{} does not fit decimal({},{})",
            d, precision, scale
        ));
    }
    Ok(SqlValue::Decimal(rounded))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn boolean_of(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{} is not a boolean", n)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(true),
            "false" | "f" | "no" | "n" | "0" => Ok(false),
            _ => Err(format!("{:?} is not a boolean", s)),
        },
        other => Err(format!("{} is not a boolean", json_kind(other))),
    }
}

fn temporal_of(value: &Value) -> std::result::Result<SqlValue, String> {
    match value {
        Value::String(s) => {
            parse_temporal(s).ok_or_else(|| format!("{:?} is not an ISO-8601 date", s))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| SqlValue::DateTime(dt.naive_utc()))
            .ok_or_else(|| format!("{} is not an epoch timestamp", n)),
        other => Err(format!("{} is not a date", json_kind(other))),
    }
}

// ===== Flattening =====

/// Per-table rows produced by [`flatten`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenOutput {
    /// One entry per table, in layout pre-order, including empty tables.
    pub tables: Vec<TableRows>,
    pub warnings: Vec<String>,
}

impl FlattenOutput {
    pub fn rows(&self, table: &str) -> Option<&[InsertRecord]> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.rows.as_slice())
    }

    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

#[derive(Default)]
struct CoercionIssue {
    count: usize,
    column_type: Option<ColumnType>,
    first: String,
}

struct Flattener<'a> {
    index: HashMap<&'a str, usize>,
    out: Vec<TableRows>,
    counters: HashMap<&'a str, i64>,
    seen_keys: HashMap<&'a str, HashSet<String>>,
    issues: BTreeMap<(String, String), CoercionIssue>,
    unknown_fields: BTreeSet<(String, String)>,
    skipped: BTreeMap<String, usize>,
    duplicates: BTreeMap<String, usize>,
    non_objects: usize,
}

/// Convert records into per-table rows following `layout`.
///
/// Synthetic keys are numbered from 1 per table in encounter order. Child
/// rows receive their parent's key value in the foreign-key column.
pub fn flatten(layout: &TableLayout, records: &[Value]) -> FlattenOutput {
    flatten_after(layout, records, &HashMap::new())
}

/// Like [`flatten`], but synthetic keys of a table listed in `last_keys`
/// continue after the given value instead of starting at 1.
pub fn flatten_after(
    layout: &TableLayout,
    records: &[Value],
    last_keys: &HashMap<String, i64>,
) -> FlattenOutput {
    let names = layout.table_names();
    let counters = names
        .iter()
        .filter_map(|n| last_keys.get(*n).map(|last| (*n, (*last).max(0))))
        .collect();
    let mut flattener = Flattener {
        index: names.iter().enumerate().map(|(i, n)| (*n, i)).collect(),
        out: names.iter().map(|n| TableRows::new(*n)).collect(),
        counters,
        seen_keys: HashMap::new(),
        issues: BTreeMap::new(),
        unknown_fields: BTreeSet::new(),
        skipped: BTreeMap::new(),
        duplicates: BTreeMap::new(),
        non_objects: 0,
    };

    for record in records {
        match record.as_object() {
            Some(obj) => {
                flattener.flatten_object(layout, obj, None);
            }
            None => flattener.non_objects += 1,
        }
    }

    let warnings = flattener.warnings(&layout.table);
    FlattenOutput {
        tables: flattener.out,
        warnings,
    }
}

impl<'a> Flattener<'a> {
    fn push(&mut self, table: &str, record: InsertRecord) {
        if let Some(&i) = self.index.get(table) {
            self.out[i].rows.push(record);
        }
    }

    fn next_key(&mut self, table: &'a str) -> SqlValue {
        let counter = self.counters.entry(table).or_insert(0);
        *counter += 1;
        SqlValue::I64(*counter)
    }

    fn coerce(&mut self, table: &str, column: &str, value: &Value, ty: ColumnType) -> SqlValue {
        match coerce_value(value, ty) {
            Ok(v) => v,
            Err(reason) => {
                self.note_issue(table, column, Some(ty), reason);
                SqlValue::Null
            }
        }
    }

    fn note_issue(&mut self, table: &str, column: &str, ty: Option<ColumnType>, reason: String) {
        let issue = self
            .issues
            .entry((table.to_string(), column.to_string()))
            .or_default();
        if issue.count == 0 {
            issue.first = reason;
            issue.column_type = ty;
        }
        issue.count += 1;
    }

    fn flatten_object(
        &mut self,
        layout: &'a TableLayout,
        obj: &Map<String, Value>,
        parent_key: Option<&SqlValue>,
    ) -> Option<SqlValue> {
        let table = layout.table.as_str();

        let key_field = match &layout.key {
            KeySource::Field { field, .. } => Some(field.as_str()),
            KeySource::Synthetic { .. } => None,
        };
        for name in obj.keys() {
            let known = key_field == Some(name.as_str())
                || layout.fields.iter().any(|f| f.field() == name);
            if !known {
                self.unknown_fields.insert((table.to_string(), name.clone()));
            }
        }

        let key = match &layout.key {
            KeySource::Field { field, .. } => {
                let key = obj
                    .get(field)
                    .and_then(|v| coerce_value(v, layout.key_type).ok())
                    .filter(|v| !v.is_null());
                let Some(key) = key else {
                    *self.skipped.entry(table.to_string()).or_default() += 1;
                    return None;
                };
                if !self.seen_keys.entry(table).or_default().insert(key.key_repr()) {
                    *self.duplicates.entry(table.to_string()).or_default() += 1;
                    return None;
                }
                key
            }
            KeySource::Synthetic { .. } => self.next_key(table),
        };

        let mut record = InsertRecord::with_capacity(layout.fields.len() + 2);
        record.insert(layout.key.column(), key.clone());
        if let (Some(column), Some(parent)) = (&layout.parent_key_column, parent_key) {
            record.insert(column.as_str(), parent.clone());
        }

        for field_layout in &layout.fields {
            let value = obj.get(field_layout.field());
            match field_layout {
                FieldLayout::Column {
                    column,
                    column_type,
                    ..
                } => {
                    let v = match value {
                        Some(v) => self.coerce(table, column, v, *column_type),
                        None => SqlValue::Null,
                    };
                    record.insert(column.as_str(), v);
                }
                FieldLayout::Object { field, child } => match value {
                    None | Some(Value::Null) => {}
                    Some(v) => match nested_object(v) {
                        Some(map) => {
                            self.flatten_object(child, map, Some(&key));
                        }
                        None => self.note_issue(
                            table,
                            field,
                            None,
                            format!("expected an object, found {}", json_kind(v)),
                        ),
                    },
                },
                FieldLayout::ObjectArray { field, child } => {
                    let items: &[Value] = match value {
                        None | Some(Value::Null) => &[],
                        Some(Value::Array(items)) => items,
                        // a lone object stands for a one-element array
                        Some(v) => std::slice::from_ref(v),
                    };
                    for item in items.iter().filter(|v| !v.is_null()) {
                        match nested_object(item) {
                            Some(map) => {
                                self.flatten_object(child, map, Some(&key));
                            }
                            None => self.note_issue(
                                table,
                                field,
                                None,
                                format!("expected objects, found {}", json_kind(item)),
                            ),
                        }
                    }
                }
                FieldLayout::ScalarArray { child, .. } => match value {
                    Some(Value::Array(items)) => {
                        for item in items {
                            self.push_scalar(child, item, &key);
                        }
                    }
                    None | Some(Value::Null) => {}
                    Some(single) => self.push_scalar(child, single, &key),
                },
            }
        }

        self.push(table, record);
        Some(key)
    }

    fn push_scalar(&mut self, layout: &'a ScalarArrayLayout, item: &Value, parent_key: &SqlValue) {
        let id = self.next_key(&layout.table);
        let value = self.coerce(&layout.table, &layout.value_column, item, layout.value_type);
        let record = InsertRecord::with_capacity(3)
            .with(layout.key_column.as_str(), id)
            .with(layout.parent_key_column.as_str(), parent_key.clone())
            .with(layout.value_column.as_str(), value);
        self.push(&layout.table, record);
    }

    fn warnings(&self, root_table: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.non_objects > 0 {
            warnings.push(format!(
                "{}: {} record(s) are not JSON objects and were skipped",
                root_table, self.non_objects
            ));
        }
        for (table, count) in &self.skipped {
            warnings.push(format!(
                "{}: {} record(s) without an identifier value were skipped",
                table, count
            ));
        }
        for (table, count) in &self.duplicates {
            warnings.push(format!(
                "{}: {} record(s) repeat an existing identifier and were de-duplicated",
                table, count
            ));
        }
        for ((table, column), issue) in &self.issues {
            let target = match issue.column_type {
                Some(ty) => format!("could not be stored as {} and were set to NULL", ty),
                None => "did not match the template shape and were ignored".to_string(),
            };
            warnings.push(format!(
                "{}.{}: {} value(s) {} (first: {})",
                table, column, issue.count, target, issue.first
            ));
        }
        for (table, field) in &self.unknown_fields {
            warnings.push(format!(
                "{}: field {} is not in the template record and was ignored",
                table, field
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_template() -> Value {
        json!({
            "_id": "507f1f77bcf86cd799439011",
            "email": "a@b.com",
            "manager_id": "507f1f77bcf86cd799439012",
            "profile": {"age": 31, "city": "Oslo"},
            "orders": [{"id": 1, "amount": 9.5}],
            "tags": ["a", "b"]
        })
    }

    fn table<'a>(schema: &'a NormalizedSchema, name: &str) -> &'a TableDefinition {
        schema
            .tables
            .iter()
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("missing table {}", name))
    }

    #[test]
    fn test_document_id_becomes_text_primary_key() {
        let records = vec![json!({"_id": "507f1f77bcf86cd799439011", "email": "a@b.com"})];
        let schema = SchemaNormalizer::new("users").normalize(&records).unwrap();
        let users = table(&schema, "users");
        assert_eq!(users.primary_key, "_id");
        let id = users.column("_id").unwrap();
        assert_eq!(id.column_type, ColumnType::Char { length: 24 });
        assert!(id.is_primary_key);
        assert_eq!(users.unique_constraints[0].columns, vec!["email"]);
    }

    #[test]
    fn test_nested_structures_become_child_tables() {
        let schema = SchemaNormalizer::new("users")
            .normalize(&[users_template()])
            .unwrap();
        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["users", "users_profile", "users_orders", "users_tags"]
        );

        let users = table(&schema, "users");
        assert!(!users.has_column("profile"));
        assert!(!users.has_column("orders"));

        let profile = table(&schema, "users_profile");
        assert_eq!(profile.primary_key, "id");
        assert!(profile.primary_key_column().unwrap().is_auto_increment());

        let orders = table(&schema, "users_orders");
        assert_eq!(orders.primary_key, "id");
        assert_eq!(orders.column("id").unwrap().column_type, ColumnType::Integer);

        let tags = table(&schema, "users_tags");
        assert!(tags.has_column("value"));
        assert_eq!(
            tags.foreign_keys,
            vec![ForeignKeyDef::new("users_id", "users", "_id")]
        );
    }

    #[test]
    fn test_foreign_keys_copy_parent_key_type() {
        let schema = SchemaNormalizer::new("users")
            .normalize(&[users_template()])
            .unwrap();
        for t in &schema.tables {
            for fk in &t.foreign_keys {
                let referenced = table(&schema, &fk.referenced_table);
                assert_eq!(referenced.primary_key, fk.referenced_column);
                assert_eq!(
                    t.column(&fk.column).unwrap().column_type,
                    referenced.primary_key_column().unwrap().column_type,
                    "{}.{}",
                    t.name,
                    fk.column
                );
            }
        }
        crate::core::schema::validate_tables(&schema.tables).unwrap();
    }

    #[test]
    fn test_self_reference_typed_as_primary_key() {
        let schema = SchemaNormalizer::new("users")
            .normalize(&[users_template()])
            .unwrap();
        let users = table(&schema, "users");
        assert_eq!(
            users.column("manager_id").unwrap().column_type,
            ColumnType::Char { length: 24 }
        );
        assert_eq!(
            users.foreign_keys,
            vec![ForeignKeyDef::new("manager_id", "users", "_id")]
        );
        assert_eq!(users.external_foreign_keys().count(), 0);
    }

    #[test]
    fn test_grandchild_references_child_key() {
        let records = vec![json!({
            "id": 7,
            "orders": [{"order_id": "x", "lines": [{"sku": "A1", "qty": 2}]}]
        })];
        let schema = SchemaNormalizer::new("customers").normalize(&records).unwrap();
        let lines = table(&schema, "customers_orders_lines");
        assert_eq!(
            lines.foreign_keys,
            vec![ForeignKeyDef::new(
                "customers_orders_id",
                "customers_orders",
                "id"
            )]
        );
        assert_eq!(
            lines.column("customers_orders_id").unwrap().column_type,
            ColumnType::Integer
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = SchemaNormalizer::new("users");
        let records = vec![users_template()];
        assert_eq!(
            normalizer.normalize(&records).unwrap(),
            normalizer.normalize(&records).unwrap()
        );
    }

    #[test]
    fn test_empty_input_warns() {
        let schema = SchemaNormalizer::new("users").normalize(&[]).unwrap();
        assert!(schema.tables.is_empty());
        assert_eq!(schema.warnings.len(), 1);
        assert!(schema.layout.is_none());
    }

    #[test]
    fn test_non_object_template_rejected() {
        let err = SchemaNormalizer::new("users")
            .normalize(&[json!([1, 2])])
            .unwrap_err();
        assert!(matches!(err, MigrateError::Input(_)));
    }

    #[test]
    fn test_empty_array_defaults_with_warning() {
        let schema = SchemaNormalizer::new("posts")
            .normalize(&[json!({"id": 1, "labels": []})])
            .unwrap();
        let labels = table(&schema, "posts_labels");
        assert_eq!(labels.column("value").unwrap().column_type, DEFAULT_VARCHAR);
        assert!(schema.warnings.iter().any(|w| w.contains("empty")));
    }

    #[test]
    fn test_synthetic_key_avoids_existing_field() {
        let schema = SchemaNormalizer::new("events")
            .normalize(&[json!({"ID": null, "name": "x"})])
            .unwrap();
        let events = table(&schema, "events");
        assert_eq!(events.primary_key, "row_id");
        assert!(events.has_column("ID"));
        events.validate().unwrap();
    }

    #[test]
    fn test_flatten_links_children_to_parent_keys() {
        let template = users_template();
        let second = json!({
            "_id": {"$oid": "507f1f77bcf86cd799439013"},
            "email": "c@d.com",
            "profile": {"age": 40},
            "orders": [{"id": 2, "amount": "12.349"}, {"id": 3, "amount": 1}],
            "tags": []
        });
        let records = vec![template, second];
        let schema = SchemaNormalizer::new("users").normalize(&records).unwrap();
        let output = flatten(schema.layout.as_ref().unwrap(), &records);

        assert_eq!(output.rows("users").unwrap().len(), 2);
        assert_eq!(output.rows("users_profile").unwrap().len(), 2);
        assert_eq!(output.rows("users_orders").unwrap().len(), 3);
        assert_eq!(output.rows("users_tags").unwrap().len(), 2);
        assert_eq!(output.total_rows(), 9);

        let second_user = &output.rows("users").unwrap()[1];
        assert_eq!(
            second_user.get("_id"),
            Some(&SqlValue::ObjectId("507f1f77bcf86cd799439013".into()))
        );
        assert_eq!(second_user.get("manager_id"), Some(&SqlValue::Null));

        let profile = &output.rows("users_profile").unwrap()[1];
        assert_eq!(profile.get("id"), Some(&SqlValue::I64(2)));
        assert_eq!(
            profile.get("users_id"),
            Some(&SqlValue::ObjectId("507f1f77bcf86cd799439013".into()))
        );

        let orders = output.rows("users_orders").unwrap();
        assert_eq!(orders[1].get("amount"), Some(&SqlValue::Decimal("12.35".parse().unwrap())));
        assert_eq!(
            orders[0].get("users_id"),
            Some(&SqlValue::Text("507f1f77bcf86cd799439011".into()))
        );
    }

    #[test]
    fn test_flatten_after_continues_synthetic_keys() {
        let records = vec![
            json!({"name": "a", "tags": ["x", "y"], "items": [{"sku": "a"}]}),
            json!({"name": "b", "tags": ["z"], "items": []}),
        ];
        let schema = SchemaNormalizer::new("users").normalize(&records).unwrap();
        let last_keys = HashMap::from([
            ("users".to_string(), 10),
            ("users_tags".to_string(), 4),
        ]);
        let output = flatten_after(schema.layout.as_ref().unwrap(), &records, &last_keys);

        let ids = |table: &str| -> Vec<SqlValue> {
            output
                .rows(table)
                .unwrap()
                .iter()
                .map(|r| r.get("id").cloned().unwrap())
                .collect()
        };
        assert_eq!(ids("users"), vec![SqlValue::I64(11), SqlValue::I64(12)]);
        assert_eq!(
            ids("users_tags"),
            vec![SqlValue::I64(5), SqlValue::I64(6), SqlValue::I64(7)]
        );
        assert_eq!(ids("users_items"), vec![SqlValue::I64(1)]);
        assert_eq!(
            output.rows("users_items").unwrap()[0].get("users_id"),
            Some(&SqlValue::I64(11))
        );
    }

    #[test]
    fn test_flatten_skips_missing_and_duplicate_identifiers() {
        let records = vec![
            json!({"id": 1, "items": [{"sku": "a"}]}),
            json!({"id": 1, "items": [{"sku": "b"}]}),
            json!({"name": "no id", "items": [{"sku": "c"}]}),
        ];
        let schema = SchemaNormalizer::new("carts").normalize(&records).unwrap();
        let output = flatten(schema.layout.as_ref().unwrap(), &records);
        assert_eq!(output.rows("carts").unwrap().len(), 1);
        assert_eq!(output.rows("carts_items").unwrap().len(), 1);
        assert!(output.warnings.iter().any(|w| w.contains("without an identifier")));
        assert!(output.warnings.iter().any(|w| w.contains("de-duplicated")));
        assert!(output.warnings.iter().any(|w| w.contains("field name")));
    }

    #[test]
    fn test_flatten_coercion_failure_becomes_null() {
        let records = vec![json!({"id": 1, "age": 3}), json!({"id": 2, "age": "old"})];
        let schema = SchemaNormalizer::new("people").normalize(&records).unwrap();
        let output = flatten(schema.layout.as_ref().unwrap(), &records);
        let rows = output.rows("people").unwrap();
        assert_eq!(rows[1].get("age"), Some(&SqlValue::Null));
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].starts_with("people.age: 1 value(s)"));
    }

    #[test]
    fn test_every_row_has_every_column() {
        let records = vec![json!({"id": 1, "a": 1, "b": "x"}), json!({"id": 2})];
        let schema = SchemaNormalizer::new("t").normalize(&records).unwrap();
        let output = flatten(schema.layout.as_ref().unwrap(), &records);
        let rows = output.rows("t").unwrap();
        assert_eq!(
            rows[0].columns().collect::<Vec<_>>(),
            rows[1].columns().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_coerce_value_rules() {
        assert_eq!(
            coerce_value(&json!("42"), ColumnType::Integer),
            Ok(SqlValue::I32(42))
        );
        assert!(coerce_value(&json!(3_000_000_000i64), ColumnType::Integer).is_err());
        assert_eq!(
            coerce_value(&json!({"$numberLong": "9000000000"}), ColumnType::BigInt),
            Ok(SqlValue::I64(9_000_000_000))
        );
        assert!(coerce_value(
            &json!(123456789012.5),
            ColumnType::Decimal {
                precision: 12,
                scale: 2
            }
        )
        .is_err());
        assert_eq!(
            coerce_value(&json!("yes"), ColumnType::Boolean),
            Ok(SqlValue::Bool(true))
        );
        assert!(matches!(
            coerce_value(&json!({"$date": "2024-01-01T00:00:00Z"}), ColumnType::Timestamp),
            Ok(SqlValue::DateTime(_))
        ));
        assert!(coerce_value(&json!("x".repeat(30)), ColumnType::Char { length: 24 }).is_err());
    }
}
