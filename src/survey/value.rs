// ABOUTME: Field-type mapping for survey values - infers column types from samples
// ABOUTME: Carries each value as a tagged FieldValue decided once per batch

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_postgres::types::ToSql;

use crate::config::DbType;

/// Destination column type for a survey field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Text,
    Numeric,
    Boolean,
    Timestamp,
}

impl ValueType {
    /// SQL type used when this crate creates a column.
    pub fn sql_type(&self, db_type: DbType) -> &'static str {
        match self {
            ValueType::Text => match db_type {
                DbType::PostgreSql => "VARCHAR",
                DbType::Redshift => "VARCHAR(MAX)",
            },
            ValueType::Numeric => "DOUBLE PRECISION",
            ValueType::Boolean => "BOOLEAN",
            ValueType::Timestamp => "TIMESTAMP",
        }
    }

    /// Map an `information_schema.columns.data_type` value back to a value type.
    ///
    /// Unknown types map to text so an existing column never blocks a sync.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "real"
            | "double precision" | "float4" | "float8" | "numeric" | "decimal" => {
                ValueType::Numeric
            }
            "boolean" | "bool" => ValueType::Boolean,
            "timestamp without time zone" | "timestamp with time zone" | "timestamp"
            | "timestamptz" | "date" => ValueType::Timestamp,
            _ => ValueType::Text,
        }
    }

    /// Whether a column of this type can store values inferred as `incoming`.
    pub fn accepts(&self, incoming: ValueType) -> bool {
        *self == incoming || *self == ValueType::Text
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Text => "text",
            ValueType::Numeric => "numeric",
            ValueType::Boolean => "boolean",
            ValueType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A survey value after coercion to its column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    /// Coerce a raw source string into `target`.
    ///
    /// Empty strings become `Null`. A value that does not parse as the target
    /// type also becomes `Null`; callers log it as a degraded data error.
    pub fn coerce(raw: &str, target: ValueType) -> Self {
        let cleaned = strip_nul(raw);
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        match target {
            ValueType::Text => FieldValue::Text(cleaned),
            ValueType::Numeric => parse_number(trimmed)
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Null),
            ValueType::Boolean => parse_bool(trimmed)
                .map(FieldValue::Boolean)
                .unwrap_or(FieldValue::Null),
            ValueType::Timestamp => parse_timestamp(trimmed)
                .map(FieldValue::Timestamp)
                .unwrap_or(FieldValue::Null),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Box this value as a query parameter for a column of type `column_type`.
    ///
    /// Nulls are typed after the column so the driver accepts them.
    pub fn to_sql(&self, column_type: ValueType) -> Box<dyn ToSql + Sync + Send> {
        match (self, column_type) {
            (FieldValue::Null, ValueType::Text) => Box::new(None::<String>),
            (FieldValue::Null, ValueType::Numeric) => Box::new(None::<f64>),
            (FieldValue::Null, ValueType::Boolean) => Box::new(None::<bool>),
            (FieldValue::Null, ValueType::Timestamp) => Box::new(None::<NaiveDateTime>),
            (value, ValueType::Text) => Box::new(value.as_text()),
            (FieldValue::Number(n), ValueType::Numeric) => Box::new(Some(*n)),
            (FieldValue::Boolean(b), ValueType::Boolean) => Box::new(Some(*b)),
            (FieldValue::Timestamp(ts), ValueType::Timestamp) => Box::new(Some(*ts)),
            (_, ValueType::Numeric) => Box::new(None::<f64>),
            (_, ValueType::Boolean) => Box::new(None::<bool>),
            (_, ValueType::Timestamp) => Box::new(None::<NaiveDateTime>),
        }
    }

    /// Text rendering used when a typed value lands in a text column.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        }
    }
}

/// Accumulates samples for one field and resolves the most specific type
/// consistent with all of them.
#[derive(Debug, Clone, Default)]
pub struct TypeInference {
    samples: usize,
    numeric: bool,
    boolean: bool,
    timestamp: bool,
    // at least one value parsed as the type
    numeric_seen: bool,
    boolean_seen: bool,
    timestamp_seen: bool,
}

impl TypeInference {
    pub fn new() -> Self {
        Self {
            samples: 0,
            numeric: true,
            boolean: true,
            timestamp: true,
            numeric_seen: false,
            boolean_seen: false,
            timestamp_seen: false,
        }
    }

    /// Record one raw value. Empty values carry no type evidence.
    pub fn observe(&mut self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        self.samples += 1;
        match parse_number(trimmed) {
            Some(_) => self.numeric_seen = true,
            None => self.numeric = false,
        }
        match parse_bool(trimmed) {
            Some(_) => self.boolean_seen = true,
            None => self.boolean = false,
        }
        match parse_timestamp(trimmed) {
            Some(_) => self.timestamp_seen = true,
            None => self.timestamp = false,
        }
    }

    /// True once at least one non-empty value has been observed.
    pub fn has_evidence(&self) -> bool {
        self.samples > 0
    }

    /// True if at least one non-empty value parses as `target`.
    pub fn any_parses_as(&self, target: ValueType) -> bool {
        match target {
            ValueType::Text => self.has_evidence(),
            ValueType::Numeric => self.numeric_seen,
            ValueType::Boolean => self.boolean_seen,
            ValueType::Timestamp => self.timestamp_seen,
        }
    }

    /// Typed column types that at least one observed value fits.
    pub fn parseable_types(&self) -> Vec<ValueType> {
        [ValueType::Numeric, ValueType::Boolean, ValueType::Timestamp]
            .into_iter()
            .filter(|t| self.any_parses_as(*t))
            .collect()
    }

    pub fn resolve(&self) -> ValueType {
        if self.samples == 0 {
            ValueType::Text
        } else if self.boolean {
            ValueType::Boolean
        } else if self.numeric {
            ValueType::Numeric
        } else if self.timestamp {
            ValueType::Timestamp
        } else {
            ValueType::Text
        }
    }
}

/// Map a sample of raw values to a column type. Never fails; falls back to text.
pub fn infer_type<'a, I>(samples: I) -> ValueType
where
    I: IntoIterator<Item = &'a str>,
{
    let mut inference = TypeInference::new();
    for sample in samples {
        inference.observe(sample);
    }
    inference.resolve()
}

fn strip_nul(raw: &str) -> String {
    if raw.contains('\0') {
        raw.chars().filter(|c| *c != '\0').collect()
    } else {
        raw.to_string()
    }
}

// Identifiers such as zip codes or long account numbers must stay text:
// leading zeros and digits beyond f64 precision would be lost.
fn parse_number(value: &str) -> Option<f64> {
    let unsigned = value.strip_prefix('-').unwrap_or(value);
    if unsigned.is_empty() || !unsigned.chars().next()?.is_ascii_digit() {
        return None;
    }
    if !unsigned
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '-' || c == '+')
    {
        return None;
    }
    let integer_part = unsigned.split(['.', 'e', 'E']).next().unwrap_or(unsigned);
    if integer_part.len() > 1 && integer_part.starts_with('0') {
        return None;
    }
    let digits = unsigned.chars().filter(|c| c.is_ascii_digit()).count();
    if digits > 15 {
        return None;
    }
    value.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse the timestamp shapes survey answers and `--since` values use.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_numeric() {
        assert_eq!(infer_type(["1", "2.5", "-3", "1e3"]), ValueType::Numeric);
    }

    #[test]
    fn test_infer_boolean() {
        assert_eq!(infer_type(["true", "FALSE", "True"]), ValueType::Boolean);
    }

    #[test]
    fn test_infer_timestamp() {
        assert_eq!(
            infer_type(["2018-10-01 01:01:01", "2018-10-05", "2018-10-06T12:00:00Z"]),
            ValueType::Timestamp
        );
    }

    #[test]
    fn test_mixed_samples_fall_back_to_text() {
        assert_eq!(infer_type(["1", "yes"]), ValueType::Text);
        assert_eq!(infer_type(["true", "1"]), ValueType::Text);
        assert_eq!(infer_type(["2018-10-01", "42"]), ValueType::Text);
    }

    #[test]
    fn test_empty_samples_are_text_without_evidence() {
        let mut inference = TypeInference::new();
        inference.observe("");
        inference.observe("   ");
        assert!(!inference.has_evidence());
        assert_eq!(inference.resolve(), ValueType::Text);
        assert_eq!(infer_type(std::iter::empty()), ValueType::Text);
    }

    #[test]
    fn test_parseable_types_survive_a_bad_value() {
        let mut inference = TypeInference::new();
        for value in ["30", "n/a", "31"] {
            inference.observe(value);
        }
        assert_eq!(inference.resolve(), ValueType::Text);
        assert!(inference.any_parses_as(ValueType::Numeric));
        assert!(!inference.any_parses_as(ValueType::Boolean));
        assert_eq!(inference.parseable_types(), vec![ValueType::Numeric]);

        let mut words = TypeInference::new();
        words.observe("forty");
        assert!(words.parseable_types().is_empty());
    }

    #[test]
    fn test_empty_values_do_not_spoil_numeric() {
        assert_eq!(infer_type(["", "12", " "]), ValueType::Numeric);
    }

    #[test]
    fn test_identifier_like_numbers_stay_text() {
        assert_eq!(infer_type(["02134"]), ValueType::Text);
        assert_eq!(infer_type(["1234567890123456789"]), ValueType::Text);
        assert_eq!(infer_type(["0", "0.25"]), ValueType::Numeric);
        assert_eq!(infer_type(["NaN"]), ValueType::Text);
        assert_eq!(infer_type(["inf"]), ValueType::Text);
    }

    #[test]
    fn test_coerce_values() {
        assert_eq!(
            FieldValue::coerce("42", ValueType::Numeric),
            FieldValue::Number(42.0)
        );
        assert_eq!(
            FieldValue::coerce("true", ValueType::Boolean),
            FieldValue::Boolean(true)
        );
        assert_eq!(FieldValue::coerce("", ValueType::Text), FieldValue::Null);
        assert_eq!(
            FieldValue::coerce("hello", ValueType::Text),
            FieldValue::Text("hello".to_string())
        );
    }

    #[test]
    fn test_coerce_unparseable_degrades_to_null() {
        assert_eq!(FieldValue::coerce("abc", ValueType::Numeric), FieldValue::Null);
        assert_eq!(FieldValue::coerce("maybe", ValueType::Boolean), FieldValue::Null);
        assert_eq!(FieldValue::coerce("soon", ValueType::Timestamp), FieldValue::Null);
    }

    #[test]
    fn test_coerce_strips_nul_bytes() {
        assert_eq!(
            FieldValue::coerce("a\0b", ValueType::Text),
            FieldValue::Text("ab".to_string())
        );
    }

    #[test]
    fn test_text_column_accepts_everything() {
        assert!(ValueType::Text.accepts(ValueType::Numeric));
        assert!(ValueType::Text.accepts(ValueType::Timestamp));
        assert!(ValueType::Numeric.accepts(ValueType::Numeric));
        assert!(!ValueType::Numeric.accepts(ValueType::Text));
        assert!(!ValueType::Boolean.accepts(ValueType::Numeric));
    }

    #[test]
    fn test_sql_type_per_dialect() {
        assert_eq!(ValueType::Text.sql_type(DbType::PostgreSql), "VARCHAR");
        assert_eq!(ValueType::Text.sql_type(DbType::Redshift), "VARCHAR(MAX)");
        assert_eq!(ValueType::Numeric.sql_type(DbType::Redshift), "DOUBLE PRECISION");
    }

    #[test]
    fn test_from_data_type() {
        assert_eq!(ValueType::from_data_type("character varying"), ValueType::Text);
        assert_eq!(ValueType::from_data_type("double precision"), ValueType::Numeric);
        assert_eq!(ValueType::from_data_type("integer"), ValueType::Numeric);
        assert_eq!(ValueType::from_data_type("boolean"), ValueType::Boolean);
        assert_eq!(
            ValueType::from_data_type("timestamp without time zone"),
            ValueType::Timestamp
        );
        assert_eq!(ValueType::from_data_type("jsonb"), ValueType::Text);
    }

    #[test]
    fn test_as_text_renders_typed_values() {
        assert_eq!(FieldValue::Number(2.5).as_text(), Some("2.5".to_string()));
        assert_eq!(FieldValue::Boolean(false).as_text(), Some("false".to_string()));
        assert_eq!(FieldValue::Null.as_text(), None);
    }
}
