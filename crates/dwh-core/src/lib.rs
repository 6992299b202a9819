//! Core table model, dimensional specs and the error taxonomy shared by the loader crates.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod table;

pub use table::{canonical_member_list, split_members, RowRef, Table, LIST_DELIMITER};

pub type Record = BTreeMap<String, Value>;

/// Floats compare and hash by bit pattern so any value can be used as a join key.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Text(s) => parse_date(s),
            _ => None,
        }
    }

    /// Infers a typed value from a delimited-text cell. Empty cells are null.
    ///
    /// Integers only parse when they round-trip, so codes like `001` stay text.
    pub fn infer(raw: &str) -> Self {
        if raw.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = raw.parse::<i64>() {
            if i.to_string() == raw {
                return Value::Int(i);
            }
            return Value::Text(raw.to_string());
        }
        let numeric_chars = raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
        if numeric_chars && raw.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(f) = raw.parse::<f64>() {
                return Value::Float(f);
            }
        }
        match raw {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            _ => Value::Text(raw.to_string()),
        }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Text,
    Integer,
    Date,
}

impl KeyType {
    pub fn canonicalize(&self, column: &str, value: &Value) -> Result<Value, LoadError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self {
            KeyType::Text => Some(Value::Text(value.to_string())),
            KeyType::Integer => value.as_i64().map(Value::Int),
            KeyType::Date => value.as_date().map(Value::Date),
        };
        converted.ok_or_else(|| LoadError::InvalidKey {
            column: column.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub dim_table: String,
    pub natural_key: String,
    pub surrogate_key: String,
    #[serde(default)]
    pub key_type: KeyType,
}

/// Many-to-many dimension resolved through a bridge table keyed by `group_key`.
///
/// The batch carries the natural keys of all members as one delimiter-joined list,
/// so member keys are always compared as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSpec {
    pub dim_table: String,
    pub bridge_table: String,
    pub natural_key: String,
    pub surrogate_key: String,
    pub group_key: String,
}

impl BridgeSpec {
    pub fn dimension(&self) -> DimensionSpec {
        DimensionSpec {
            dim_table: self.dim_table.clone(),
            natural_key: self.natural_key.clone(),
            surrogate_key: self.surrogate_key.clone(),
            key_type: KeyType::Text,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file format '{extension}' of {key} is not supported")]
    UnsupportedFormat { key: String, extension: String },
    #[error("manifest {key} has columns {found:?}, expected {expected:?}")]
    ManifestSchemaMismatch {
        key: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("object {0} not found")]
    NotFound(String),
    #[error("{context}")]
    Transport {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("input files cannot be transformed: {0}")]
    MalformedInputSchema(String),
    #[error("table {table} does not match the expected schema: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("column {column} missing (available: {available:?})")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("row has {found} values, table has {expected} columns")]
    RowArity { expected: usize, found: usize },
    #[error("value '{value}' in column {column} is not a valid key")]
    InvalidKey { column: String, value: String },
    #[error("value '{value}' in column {column} cannot be parsed")]
    InvalidValue { column: String, value: String },
    #[error("end date ({end}) cannot be less than or equal to start date ({start})")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot decode {key}: {detail}")]
    Codec { key: String, detail: String },
}

impl LoadError {
    pub fn transport(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        LoadError::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn codec(key: &str, detail: impl fmt::Display) -> Self {
        LoadError::Codec {
            key: key.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_keeps_zero_padded_codes_as_text() {
        assert_eq!(Value::infer("001"), Value::text("001"));
        assert_eq!(Value::infer("42"), Value::Int(42));
        assert_eq!(Value::infer("4.5"), Value::Float(4.5));
        assert_eq!(Value::infer(""), Value::Null);
        assert_eq!(Value::infer("praca zdalna"), Value::text("praca zdalna"));
        assert_eq!(Value::infer("2024-01-05"), Value::text("2024-01-05"));
    }

    #[test]
    fn date_keys_canonicalize_from_text_and_timestamps() {
        let expected = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        let key = KeyType::Date;
        assert_eq!(
            key.canonicalize("published_date", &Value::text("2024-01-05")).unwrap(),
            expected
        );
        assert_eq!(
            key.canonicalize("published_date", &Value::text("2024-01-05 00:00:00"))
                .unwrap(),
            expected
        );
        assert!(matches!(
            key.canonicalize("published_date", &Value::text("yesterday")),
            Err(LoadError::InvalidKey { .. })
        ));
    }

    #[test]
    fn text_keys_render_numbers() {
        assert_eq!(
            KeyType::Text.canonicalize("offer_id", &Value::Int(7)).unwrap(),
            Value::text("7")
        );
        assert_eq!(
            KeyType::Integer.canonicalize("offer_id", &Value::text(" 7 ")).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn specs_deserialize_with_key_types() {
        let spec: BridgeSpec = serde_yaml::from_str(
            "dim_table: dim_category\nbridge_table: br_category\nnatural_key: category_id\nsurrogate_key: category_key\ngroup_key: category_group_key\n",
        )
        .unwrap();
        let dimension = spec.dimension();
        assert_eq!(dimension.dim_table, "dim_category");
        assert_eq!(dimension.key_type, KeyType::Text);

        let spec: DimensionSpec = serde_yaml::from_str(
            "dim_table: dim_date\nnatural_key: published_date\nsurrogate_key: date_id\nkey_type: date\n",
        )
        .unwrap();
        assert_eq!(spec.key_type, KeyType::Date);
    }
}
