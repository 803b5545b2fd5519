//! Type and key inference for semi-structured fields.
//!
//! Inference looks at a field name and one sampled value and decides the
//! storage type, whether the column should carry a unique constraint, and
//! whether the decision was a guess. Rules apply in priority order:
//!
//! 1. `_id` always maps to fixed-width text.
//! 2. Identifier candidates (`_id`, `id`, `uuid`, any casing) become the
//!    owning object's primary key.
//! 3. Name patterns (`email`, `phone`, money words, dates) override the value.
//! 4. Otherwise the runtime shape of the value decides.
//!
//! Self-referential names (`manager_id`, `parent_id`, ...) are detected here
//! but typed by the normalizer, which knows the owning table's key type.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

use crate::core::schema::ColumnType;
use crate::core::value::SqlValue;

/// Identifier field names, in priority order.
pub const IDENTIFIER_CANDIDATES: &[&str] = &["_id", "id", "uuid"];

/// Prefixes of `<prefix>_id` fields that reference the owning table.
pub const SELF_REFERENCE_PREFIXES: &[&str] = &[
    "manager",
    "supervisor",
    "parent",
    "reports_to",
    "referred_by",
];

/// Name tokens that imply a unique constraint on textual columns.
pub const UNIQUE_NAME_TOKENS: &[&str] = &["email", "username", "ssn", "passport"];

const MONEY_PATTERNS: &[&str] = &["price", "salary", "amount", "cost", "budget"];

/// Width of a document-store ObjectId rendered as hex.
pub const OBJECT_ID_WIDTH: u32 = 24;

/// Strings longer than this become unbounded text.
pub const MAX_BOUNDED_TEXT: usize = 255;

pub const DEFAULT_VARCHAR: ColumnType = ColumnType::VarChar { length: 255 };
pub const EMAIL_TYPE: ColumnType = ColumnType::VarChar { length: 255 };
pub const PHONE_TYPE: ColumnType = ColumnType::VarChar { length: 32 };
pub const MONEY_TYPE: ColumnType = ColumnType::Decimal {
    precision: 12,
    scale: 2,
};
pub const FRACTION_TYPE: ColumnType = ColumnType::Decimal {
    precision: 18,
    scale: 6,
};

/// Result of inferring one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInference {
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    /// Set when the type is a guess the caller should surface as a warning.
    pub ambiguity: Option<String>,
}

impl FieldInference {
    fn of(column_type: ColumnType) -> Self {
        Self {
            column_type,
            nullable: true,
            unique: false,
            ambiguity: None,
        }
    }

    fn ambiguous(column_type: ColumnType, reason: impl Into<String>) -> Self {
        Self {
            ambiguity: Some(reason.into()),
            ..Self::of(column_type)
        }
    }

    fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// Extended-JSON scalar wrappers emitted by document-store exports.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedScalar {
    ObjectId(String),
    Date(Value),
    NumberLong(String),
    NumberDecimal(String),
}

impl ExtendedScalar {
    /// Recognize `{"$oid": ..}`, `{"$date": ..}`, `{"$numberLong": ..}` and
    /// `{"$numberDecimal": ..}`.
    pub fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let (key, inner) = obj.iter().next()?;
        match (key.as_str(), inner) {
            ("$oid", Value::String(s)) => Some(ExtendedScalar::ObjectId(s.clone())),
            ("$date", v) => Some(ExtendedScalar::Date(v.clone())),
            ("$numberLong", Value::String(s)) => Some(ExtendedScalar::NumberLong(s.clone())),
            ("$numberDecimal", Value::String(s)) => {
                Some(ExtendedScalar::NumberDecimal(s.clone()))
            }
            _ => None,
        }
    }
}

/// Whether a value is stored as a column rather than a child table.
pub fn is_scalar(value: &Value) -> bool {
    match value {
        Value::Object(_) => ExtendedScalar::parse(value).is_some(),
        Value::Array(_) => false,
        _ => true,
    }
}

/// Whether a string is a 24-character hex ObjectId.
pub fn is_object_id(s: &str) -> bool {
    s.len() == OBJECT_ID_WIDTH as usize && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse an ISO-8601 date or timestamp.
///
/// Returns `SqlValue::Date` for date-only strings and `SqlValue::DateTime`
/// (normalized to UTC) when a time component is present.
pub fn parse_temporal(s: &str) -> Option<SqlValue> {
    let s = s.trim();
    if s.len() < 10 || !looks_like_date_prefix(s) {
        return None;
    }
    if s.len() == 10 {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(SqlValue::DateTime(dt.naive_utc()));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(SqlValue::DateTime(dt));
        }
    }
    None
}

fn looks_like_date_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
}

/// Split a field name into lowercase tokens on `_`, `-` and camelCase humps.
pub fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Find the field to use as an object's primary key.
///
/// Candidates are checked in [`IDENTIFIER_CANDIDATES`] order, matching keys
/// case-insensitively; only non-null scalar values qualify.
pub fn find_identifier(obj: &Map<String, Value>) -> Option<&str> {
    IDENTIFIER_CANDIDATES.iter().find_map(|candidate| {
        obj.iter()
            .find(|(key, value)| {
                key.eq_ignore_ascii_case(candidate) && !value.is_null() && is_scalar(value)
            })
            .map(|(key, _)| key.as_str())
    })
}

/// Whether the field names a reference back to the owning table.
pub fn is_self_reference(name: &str) -> bool {
    let tokens = name_tokens(name);
    match tokens.split_last() {
        Some((last, prefix)) if last == "id" && !prefix.is_empty() => {
            let prefix = prefix.join("_");
            SELF_REFERENCE_PREFIXES.contains(&prefix.as_str())
        }
        _ => false,
    }
}

/// Whether a textual column with this name should be unique.
pub fn is_unique_name(name: &str) -> bool {
    name_tokens(name)
        .iter()
        .any(|t| UNIQUE_NAME_TOKENS.contains(&t.as_str()))
}

/// Infer the primary-key type of an identifier field.
pub fn infer_identifier(name: &str, value: &Value) -> FieldInference {
    let mut inference = if name == "_id" {
        infer_document_id(value)
    } else {
        match value {
            Value::String(s) if s.len() == 36 && s.matches('-').count() == 4 => {
                FieldInference::of(ColumnType::Char { length: 36 })
            }
            _ => infer_by_value(value),
        }
    };
    inference.nullable = false;
    inference.unique = false;
    inference
}

fn infer_document_id(value: &Value) -> FieldInference {
    match value {
        Value::String(s) if s.len() > OBJECT_ID_WIDTH as usize => FieldInference::ambiguous(
            DEFAULT_VARCHAR,
            format!(
                "_id value is {} characters, wider than an ObjectId; using varchar(255)",
                s.len()
            ),
        ),
        _ => FieldInference::of(ColumnType::Char {
            length: OBJECT_ID_WIDTH,
        }),
    }
}

/// Infer the storage type of a scalar field.
pub fn infer_field(name: &str, value: &Value) -> FieldInference {
    if name == "_id" {
        return infer_document_id(value);
    }

    if let Some(ext) = ExtendedScalar::parse(value) {
        return match ext {
            ExtendedScalar::ObjectId(_) => FieldInference::of(ColumnType::Char {
                length: OBJECT_ID_WIDTH,
            }),
            ExtendedScalar::Date(_) => FieldInference::of(ColumnType::Timestamp),
            ExtendedScalar::NumberLong(_) => FieldInference::of(ColumnType::BigInt),
            ExtendedScalar::NumberDecimal(_) => FieldInference::of(FRACTION_TYPE),
        };
    }

    if let Some(inference) = infer_by_name(name, value) {
        return inference;
    }

    let tokens = name_tokens(name);
    if tokens.last().map(String::as_str) == Some("id") && tokens.len() > 1 {
        if let Some(n) = value.as_number() {
            if n.is_i64() || n.is_u64() {
                return FieldInference::of(ColumnType::BigInt);
            }
        }
    }

    let inference = infer_by_value(value);
    let unique = inference.column_type.is_textual() && is_unique_name(name);
    inference.with_unique(unique)
}

fn infer_by_name(name: &str, value: &Value) -> Option<FieldInference> {
    let lower = name.to_ascii_lowercase();
    let textual_sample = matches!(value, Value::String(_) | Value::Null);
    let numeric_sample = matches!(value, Value::Number(_) | Value::String(_) | Value::Null);

    if lower.contains("email") && textual_sample {
        return Some(FieldInference::of(EMAIL_TYPE).with_unique(true));
    }

    if (lower.contains("phone") || lower.contains("mobile")) && numeric_sample {
        let unique = is_unique_name(name);
        return Some(FieldInference::of(PHONE_TYPE).with_unique(unique));
    }

    if MONEY_PATTERNS.iter().any(|p| lower.contains(p)) && numeric_sample {
        if let Value::String(s) = value {
            if s.trim().parse::<f64>().is_err() {
                return Some(FieldInference::ambiguous(
                    DEFAULT_VARCHAR,
                    format!("{} looks monetary but sample {:?} is not numeric", name, s),
                ));
            }
        }
        return Some(FieldInference::of(MONEY_TYPE));
    }

    let tokens = name_tokens(name);
    let date_suffix = tokens.len() > 1
        && matches!(tokens.last().map(String::as_str), Some("at") | Some("on"));
    if (lower.contains("date") || date_suffix) && textual_sample {
        return Some(match value {
            Value::String(s) => match parse_temporal(s) {
                Some(SqlValue::Date(_)) => FieldInference::of(ColumnType::Date),
                Some(_) => FieldInference::of(ColumnType::Timestamp),
                None => FieldInference::ambiguous(
                    DEFAULT_VARCHAR,
                    format!("{} looks temporal but sample {:?} does not parse", name, s),
                ),
            },
            _ => FieldInference::of(ColumnType::Timestamp),
        });
    }

    None
}

fn infer_by_value(value: &Value) -> FieldInference {
    match value {
        Value::Bool(_) => FieldInference::of(ColumnType::Boolean),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    FieldInference::of(ColumnType::Integer)
                } else {
                    FieldInference::of(ColumnType::BigInt)
                }
            } else if n.is_u64() {
                FieldInference::of(ColumnType::Decimal {
                    precision: 20,
                    scale: 0,
                })
            } else {
                FieldInference::of(FRACTION_TYPE)
            }
        }
        Value::String(s) => match parse_temporal(s) {
            Some(SqlValue::Date(_)) => FieldInference::of(ColumnType::Date),
            Some(_) => FieldInference::of(ColumnType::Timestamp),
            None if s.chars().count() > MAX_BOUNDED_TEXT => FieldInference::of(ColumnType::Text),
            None => FieldInference::of(DEFAULT_VARCHAR),
        },
        Value::Null => FieldInference::ambiguous(
            DEFAULT_VARCHAR,
            "sample value is null; defaulting to varchar(255)",
        ),
        Value::Array(_) | Value::Object(_) => FieldInference::ambiguous(
            ColumnType::Json,
            "nested value stored as a JSON blob",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_is_fixed_width_text() {
        let inference = infer_identifier("_id", &json!("507f1f77bcf86cd799439011"));
        assert_eq!(inference.column_type, ColumnType::Char { length: 24 });
        assert!(!inference.nullable);

        let oid = infer_field("_id", &json!({"$oid": "507f1f77bcf86cd799439011"}));
        assert_eq!(oid.column_type, ColumnType::Char { length: 24 });
    }

    #[test]
    fn test_numeric_document_id_still_text() {
        let inference = infer_identifier("_id", &json!(42));
        assert_eq!(inference.column_type, ColumnType::Char { length: 24 });
    }

    #[test]
    fn test_find_identifier_priority_and_casing() {
        let obj = json!({"uuid": "x", "ID": 5, "name": "a"});
        assert_eq!(find_identifier(obj.as_object().unwrap()), Some("ID"));

        let obj = json!({"id": 1, "_id": "507f1f77bcf86cd799439011"});
        assert_eq!(find_identifier(obj.as_object().unwrap()), Some("_id"));

        let obj = json!({"id": null, "name": "a"});
        assert_eq!(find_identifier(obj.as_object().unwrap()), None);

        let obj = json!({"id": {"nested": true}});
        assert_eq!(find_identifier(obj.as_object().unwrap()), None);
    }

    #[test]
    fn test_foreign_key_shaped_integer_is_wide() {
        let inference = infer_field("user_id", &json!(123));
        assert_eq!(inference.column_type, ColumnType::BigInt);

        let camel = infer_field("userId", &json!(123));
        assert_eq!(camel.column_type, ColumnType::BigInt);
    }

    #[test]
    fn test_integer_promotion() {
        assert_eq!(infer_field("count", &json!(7)).column_type, ColumnType::Integer);
        assert_eq!(
            infer_field("count", &json!(3_000_000_000i64)).column_type,
            ColumnType::BigInt
        );
    }

    #[test]
    fn test_name_patterns() {
        let email = infer_field("contact_email", &json!("a@b.com"));
        assert_eq!(email.column_type, EMAIL_TYPE);
        assert!(email.unique);

        assert_eq!(infer_field("mobile", &json!("555-1234")).column_type, PHONE_TYPE);
        assert_eq!(infer_field("unit_price", &json!(9.99)).column_type, MONEY_TYPE);
        assert_eq!(infer_field("salary", &json!(50000)).column_type, MONEY_TYPE);
    }

    #[test]
    fn test_date_names_pick_date_or_timestamp() {
        assert_eq!(
            infer_field("birth_date", &json!("1990-04-01")).column_type,
            ColumnType::Date
        );
        assert_eq!(
            infer_field("created_at", &json!("2024-01-02T03:04:05Z")).column_type,
            ColumnType::Timestamp
        );
        assert_eq!(
            infer_field("shippedOn", &json!(null)).column_type,
            ColumnType::Timestamp
        );
        // numeric samples fall through to value inference
        assert_eq!(
            infer_field("update_count", &json!(3)).column_type,
            ColumnType::Integer
        );
    }

    #[test]
    fn test_iso_strings_detected_by_value() {
        assert_eq!(
            infer_field("seen", &json!("2024-05-06 10:11:12")).column_type,
            ColumnType::Timestamp
        );
    }

    #[test]
    fn test_value_shapes() {
        assert_eq!(infer_field("active", &json!(true)).column_type, ColumnType::Boolean);
        assert_eq!(infer_field("ratio", &json!(0.5)).column_type, FRACTION_TYPE);
        assert_eq!(
            infer_field("bio", &json!("x".repeat(300))).column_type,
            ColumnType::Text
        );
        let null = infer_field("nickname", &json!(null));
        assert_eq!(null.column_type, DEFAULT_VARCHAR);
        assert!(null.ambiguity.is_some());
    }

    #[test]
    fn test_unique_only_on_textual_columns() {
        assert!(infer_field("username", &json!("bob")).unique);
        assert!(!infer_field("email_verified", &json!(true)).unique);
    }

    #[test]
    fn test_self_reference_vocabulary() {
        assert!(is_self_reference("manager_id"));
        assert!(is_self_reference("reports_to_id"));
        assert!(is_self_reference("parentId"));
        assert!(!is_self_reference("user_id"));
        assert!(!is_self_reference("manager"));
    }

    #[test]
    fn test_name_tokens() {
        assert_eq!(name_tokens("createdAt"), vec!["created", "at"]);
        assert_eq!(name_tokens("reports_to_id"), vec!["reports", "to", "id"]);
        assert_eq!(name_tokens("_id"), vec!["id"]);
    }

    #[test]
    fn test_parse_temporal() {
        assert!(matches!(parse_temporal("2024-01-01"), Some(SqlValue::Date(_))));
        assert!(matches!(
            parse_temporal("2024-01-01T10:00:00+02:00"),
            Some(SqlValue::DateTime(_))
        ));
        assert_eq!(parse_temporal("hello world"), None);
        assert_eq!(parse_temporal("2024-13-45"), None);
    }
}
