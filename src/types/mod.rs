//! Type Coercion Layer - logical field types shared by the wire encoder and the SQL decoder
//!
//! Every value written to the stream or read back from the relational backend is
//! tagged by exactly one [`FieldType`]: one of ten base types, optionally wrapped
//! in an array or map modifier. Encode and decode sites match exhaustively on it.

pub mod postgres;
pub mod wire;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed set of scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    String,
    Long,
    Integer,
    Decimal,
    Double,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
}

impl BaseType {
    pub const ALL: [BaseType; 10] = [
        BaseType::String,
        BaseType::Long,
        BaseType::Integer,
        BaseType::Decimal,
        BaseType::Double,
        BaseType::Boolean,
        BaseType::Date,
        BaseType::Time,
        BaseType::Timestamp,
        BaseType::Binary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BaseType::String => "STRING",
            BaseType::Long => "LONG",
            BaseType::Integer => "INTEGER",
            BaseType::Decimal => "DECIMAL",
            BaseType::Double => "DOUBLE",
            BaseType::Boolean => "BOOLEAN",
            BaseType::Date => "DATE",
            BaseType::Time => "TIME",
            BaseType::Timestamp => "TIMESTAMP",
            BaseType::Binary => "BINARY",
        }
    }
}

/// A base type plus its (at most one) structural modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Scalar(BaseType),
    Array(BaseType),
    /// String-keyed map whose values are of the base type.
    Map(BaseType),
}

impl FieldType {
    pub const STRING: FieldType = FieldType::Scalar(BaseType::String);
    pub const LONG: FieldType = FieldType::Scalar(BaseType::Long);
    pub const INTEGER: FieldType = FieldType::Scalar(BaseType::Integer);
    pub const DECIMAL: FieldType = FieldType::Scalar(BaseType::Decimal);
    pub const DOUBLE: FieldType = FieldType::Scalar(BaseType::Double);
    pub const BOOLEAN: FieldType = FieldType::Scalar(BaseType::Boolean);
    pub const DATE: FieldType = FieldType::Scalar(BaseType::Date);
    pub const TIME: FieldType = FieldType::Scalar(BaseType::Time);
    pub const TIMESTAMP: FieldType = FieldType::Scalar(BaseType::Timestamp);
    pub const BINARY: FieldType = FieldType::Scalar(BaseType::Binary);

    pub fn base(&self) -> BaseType {
        match self {
            FieldType::Scalar(base) | FieldType::Array(base) | FieldType::Map(base) => *base,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, FieldType::Map(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Scalar(base) => write!(f, "{}", base.name()),
            FieldType::Array(base) => write!(f, "ARRAY_{}", base.name()),
            FieldType::Map(base) => write!(f, "MAP_{}", base.name()),
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let (wrap, base_name): (fn(BaseType) -> FieldType, &str) =
            if let Some(rest) = upper.strip_prefix("ARRAY_") {
                (FieldType::Array, rest)
            } else if let Some(rest) = upper.strip_prefix("MAP_") {
                (FieldType::Map, rest)
            } else {
                (FieldType::Scalar, upper.as_str())
            };

        BaseType::ALL
            .iter()
            .find(|base| base.name() == base_name)
            .map(|base| wrap(*base))
            .ok_or_else(|| format!("Unknown field type: {}", s))
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

/// A named, typed column of an event schema or a query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// One typed cell value.
///
/// DECIMAL values travel as `f64` on both paths; precision beyond a double is lost.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    String(String),
    Long(i64),
    Integer(i32),
    Decimal(f64),
    Double(f64),
    Boolean(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a JSON value into the representation `field_type` expects.
    ///
    /// Dates accept `YYYY-MM-DD` or a day count, times `HH:MM:SS[.fff]`,
    /// timestamps RFC 3339 or epoch milliseconds, binary a byte array.
    pub fn from_json(json: &serde_json::Value, field_type: FieldType) -> Option<Value> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Some(Value::Null);
        }

        match field_type {
            FieldType::Array(base) => match json {
                Json::Array(items) => items
                    .iter()
                    .map(|item| Value::from_json(item, FieldType::Scalar(base)))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array),
                _ => None,
            },
            FieldType::Map(base) => match json {
                Json::Object(entries) => entries
                    .iter()
                    .map(|(key, item)| {
                        Value::from_json(item, FieldType::Scalar(base)).map(|v| (key.clone(), v))
                    })
                    .collect::<Option<BTreeMap<_, _>>>()
                    .map(Value::Map),
                _ => None,
            },
            FieldType::Scalar(base) => match (base, json) {
                (BaseType::String, Json::String(s)) => Some(Value::String(s.clone())),
                (BaseType::String, other) => Some(Value::String(other.to_string())),
                (BaseType::Long, Json::Number(n)) => n.as_i64().map(Value::Long),
                (BaseType::Integer, Json::Number(n)) => {
                    n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::Integer)
                }
                (BaseType::Decimal, Json::Number(n)) => n.as_f64().map(Value::Decimal),
                (BaseType::Double, Json::Number(n)) => n.as_f64().map(Value::Double),
                (BaseType::Boolean, Json::Bool(b)) => Some(Value::Boolean(*b)),
                (BaseType::Date, Json::String(s)) => {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date)
                }
                (BaseType::Date, Json::Number(n)) => n
                    .as_i64()
                    .and_then(|days| i32::try_from(days).ok())
                    .and_then(wire::date_from_days)
                    .map(Value::Date),
                (BaseType::Time, Json::String(s)) => {
                    NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok().map(Value::Time)
                }
                (BaseType::Timestamp, Json::String(s)) => DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|ts| Value::Timestamp(ts.with_timezone(&Utc))),
                (BaseType::Timestamp, Json::Number(n)) => n
                    .as_i64()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(Value::Timestamp),
                (BaseType::Binary, Json::Array(bytes)) => bytes
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Value::Binary),
                _ => None,
            },
        }
    }

    /// Convert an arbitrary JSON document without a declared type.
    pub fn from_json_untyped(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Long(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json_untyped).collect()),
            Json::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), Value::from_json_untyped(item)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Long(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Decimal(v) | Value::Double(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Value::Array(v) => write!(f, "<array of {}>", v.len()),
            Value::Map(v) => write!(f, "<map of {}>", v.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_names_round_trip() {
        for base in BaseType::ALL {
            for field_type in [FieldType::Scalar(base), FieldType::Array(base), FieldType::Map(base)] {
                let parsed: FieldType = field_type.to_string().parse().unwrap();
                assert_eq!(parsed, field_type);
            }
        }
        assert!("ARRAY_UUID".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_modifiers() {
        assert!(FieldType::Array(BaseType::Long).is_array());
        assert!(!FieldType::Array(BaseType::Long).is_map());
        assert!(FieldType::Map(BaseType::String).is_map());
        assert_eq!(FieldType::Map(BaseType::Double).base(), BaseType::Double);
    }

    #[test]
    fn test_from_json_rejects_wrong_shape() {
        assert_eq!(
            Value::from_json(&serde_json::json!(42), FieldType::INTEGER),
            Some(Value::Integer(42))
        );
        assert_eq!(Value::from_json(&serde_json::json!("x"), FieldType::LONG), None);
        assert_eq!(
            Value::from_json(&serde_json::json!(["a", "b"]), FieldType::Array(BaseType::String)),
            Some(Value::Array(vec![
                Value::String("a".to_string()),
                Value::String("b".to_string())
            ]))
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(null), FieldType::TIMESTAMP),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_schema_field_serde() {
        let field: SchemaField =
            serde_json::from_str(r#"{"name":"tags","type":"ARRAY_STRING"}"#).unwrap();
        assert_eq!(field, SchemaField::new("tags", FieldType::Array(BaseType::String)));
    }
}
