//! Postgres native type table
//!
//! Maps the type names reported in result column metadata to [`FieldType`]s.
//! Array types are accepted both as `INT4[]` and in the catalog spelling `_INT4`.

use crate::error::DecodeError;
use crate::types::{BaseType, FieldType};

fn base_from_pg(name: &str) -> Option<BaseType> {
    let base = match name {
        "BOOL" | "BOOLEAN" => BaseType::Boolean,
        "INT2" | "INT4" | "SMALLINT" | "INTEGER" => BaseType::Integer,
        "INT8" | "BIGINT" => BaseType::Long,
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => BaseType::Double,
        "NUMERIC" => BaseType::Decimal,
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN" | "JSON" => {
            BaseType::String
        }
        "DATE" => BaseType::Date,
        "TIME" => BaseType::Time,
        "TIMESTAMP" | "TIMESTAMPTZ" => BaseType::Timestamp,
        "BYTEA" => BaseType::Binary,
        _ => return None,
    };
    Some(base)
}

/// Resolve a Postgres column type name.
///
/// `JSONB` resolves to a string map. `JSON` is kept as its text, since only
/// the [`MAP_ENCODING`] object encoding decodes into a map.
pub fn field_type_from_pg(type_name: &str) -> Result<FieldType, DecodeError> {
    let name = type_name.trim().to_uppercase();
    let unsupported = || DecodeError::UnsupportedType {
        type_name: type_name.to_string(),
    };

    if name == "JSONB" {
        return Ok(FieldType::Map(BaseType::String));
    }

    let element = name
        .strip_suffix("[]")
        .or_else(|| name.strip_prefix('_'));
    if let Some(element) = element {
        return base_from_pg(element).map(FieldType::Array).ok_or_else(unsupported);
    }

    base_from_pg(&name).map(FieldType::Scalar).ok_or_else(unsupported)
}

/// The one map encoding the decoder understands.
pub const MAP_ENCODING: &str = "jsonb";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_types() {
        assert_eq!(field_type_from_pg("INT4").unwrap(), FieldType::INTEGER);
        assert_eq!(field_type_from_pg("int8").unwrap(), FieldType::LONG);
        assert_eq!(field_type_from_pg("NUMERIC").unwrap(), FieldType::DECIMAL);
        assert_eq!(field_type_from_pg("TIMESTAMPTZ").unwrap(), FieldType::TIMESTAMP);
        assert_eq!(field_type_from_pg("BYTEA").unwrap(), FieldType::BINARY);
    }

    #[test]
    fn test_array_spellings() {
        assert_eq!(
            field_type_from_pg("TEXT[]").unwrap(),
            FieldType::Array(BaseType::String)
        );
        assert_eq!(
            field_type_from_pg("_INT8").unwrap(),
            FieldType::Array(BaseType::Long)
        );
    }

    #[test]
    fn test_map_like_types() {
        assert!(field_type_from_pg("JSONB").unwrap().is_map());
        assert_eq!(field_type_from_pg("json").unwrap(), FieldType::STRING);
        assert_eq!(
            field_type_from_pg("JSON[]").unwrap(),
            FieldType::Array(BaseType::String)
        );
    }

    #[test]
    fn test_numeric_arrays_resolve() {
        assert_eq!(
            field_type_from_pg("NUMERIC[]").unwrap(),
            FieldType::Array(BaseType::Decimal)
        );
    }

    #[test]
    fn test_unmapped_types() {
        for name in ["UUID", "INTERVAL", "POINT", "JSONB[]", "HSTORE", "INET", "OID"] {
            assert!(matches!(
                field_type_from_pg(name),
                Err(DecodeError::UnsupportedType { .. })
            ));
        }
    }
}
