//! Result decoding - read side of the Type Coercion Layer
//!
//! Turns a backend cursor into a uniform typed table. Column types come from the
//! backend's [`TypeTable`]; unmapped native types degrade to STRING and are read
//! through the generic string accessor. Every extracted cell is checked against
//! the backend null flag afterwards, since scalar accessors return zero values
//! for NULL.

use tracing::warn;

use crate::error::DecodeError;
use crate::execution::backend::{ResultCursor, RowAccess, TypeTable};
use crate::types::{BaseType, FieldType, SchemaField, Value};

/// A fully decoded result set.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTable {
    pub columns: Vec<SchemaField>,
    pub rows: Vec<Vec<Value>>,
}

/// Resolve every column of `cursor` to a schema field.
pub fn resolve_columns(cursor: &dyn ResultCursor, types: &dyn TypeTable) -> Vec<SchemaField> {
    cursor
        .columns()
        .iter()
        .map(|column| {
            let field_type = types.field_type(&column.type_name).unwrap_or_else(|e| {
                warn!("{}; reading column {} as STRING", e, column.name);
                FieldType::STRING
            });
            SchemaField::new(column.name.clone(), field_type)
        })
        .collect()
}

pub fn decode_cursor(
    cursor: &mut dyn ResultCursor,
    types: &dyn TypeTable,
) -> Result<DecodedTable, DecodeError> {
    let columns = resolve_columns(cursor, types);

    let mut rows = Vec::new();
    while let Some(row) = cursor.next_row()? {
        let values = columns
            .iter()
            .enumerate()
            .map(|(index, field)| read_cell(row, index, field, types.map_encoding()))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(values);
    }

    Ok(DecodedTable { columns, rows })
}

fn read_cell(
    row: &dyn RowAccess,
    index: usize,
    field: &SchemaField,
    map_encoding: &str,
) -> Result<Value, DecodeError> {
    let value = match field.field_type {
        FieldType::Scalar(base) => read_scalar(row, index, &field.name, base)?,
        FieldType::Array(element) => row
            .get_array(index, element)?
            .map(Value::Array)
            .unwrap_or(Value::Null),
        FieldType::Map(_) => match row.get_object(index)? {
            None => Value::Null,
            Some(object) if object.encoding == map_encoding => {
                let json: serde_json::Value =
                    serde_json::from_str(&object.text).map_err(|e| DecodeError::Malformed {
                        column: field.name.clone(),
                        reason: e.to_string(),
                    })?;
                match Value::from_json_untyped(&json) {
                    map @ Value::Map(_) => map,
                    Value::Null => Value::Null,
                    _ => {
                        return Err(DecodeError::Malformed {
                            column: field.name.clone(),
                            reason: "expected a JSON object".to_string(),
                        })
                    }
                }
            }
            Some(object) => {
                return Err(DecodeError::UnsupportedMapEncoding {
                    encoding: object.encoding,
                })
            }
        },
    };

    if row.is_null(index)? {
        return Ok(Value::Null);
    }
    Ok(value)
}

fn read_scalar(
    row: &dyn RowAccess,
    index: usize,
    column: &str,
    base: BaseType,
) -> Result<Value, DecodeError> {
    let value = match base {
        BaseType::String => row.get_string(index)?.map(Value::String).unwrap_or(Value::Null),
        BaseType::Long => Value::Long(row.get_long(index)?),
        BaseType::Integer => Value::Integer(row.get_int(index)?),
        BaseType::Decimal => row.get_decimal(index)?.map(Value::Decimal).unwrap_or(Value::Null),
        BaseType::Double => Value::Double(row.get_double(index)?),
        BaseType::Boolean => Value::Boolean(row.get_boolean(index)?),
        BaseType::Date => row.get_date(index)?.map(Value::Date).unwrap_or(Value::Null),
        BaseType::Time => row.get_time(index)?.map(Value::Time).unwrap_or(Value::Null),
        BaseType::Timestamp => row
            .get_timestamp(index)?
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        BaseType::Binary => match row.get_binary(index) {
            Ok(Some(bytes)) => Value::Binary(bytes),
            Ok(None) => Value::Null,
            Err(e) => {
                warn!("{} in column {}", e, column);
                Value::Null
            }
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::backend::{ColumnMeta, PostgresTypes};
    use crate::execution::scripted::{Cell, ScriptedCursor};

    fn decode(columns: Vec<ColumnMeta>, rows: Vec<Vec<Cell>>) -> Result<DecodedTable, DecodeError> {
        let mut cursor = ScriptedCursor::new(columns, rows);
        decode_cursor(&mut cursor, &PostgresTypes)
    }

    #[test]
    fn test_scalar_columns() {
        let table = decode(
            vec![ColumnMeta::new("n", "INT8"), ColumnMeta::new("s", "TEXT")],
            vec![vec![Cell::Long(7), Cell::Text("a".to_string())]],
        )
        .unwrap();
        assert_eq!(table.columns[0], SchemaField::new("n", FieldType::LONG));
        assert_eq!(table.rows, vec![vec![Value::Long(7), Value::String("a".to_string())]]);
    }

    #[test]
    fn test_unmapped_type_reads_as_string() {
        let table = decode(
            vec![ColumnMeta::new("id", "UUID")],
            vec![vec![Cell::Text("6f1c".to_string())]],
        )
        .unwrap();
        assert_eq!(table.columns[0].field_type, FieldType::STRING);
        assert_eq!(table.rows[0][0], Value::String("6f1c".to_string()));
    }

    #[test]
    fn test_null_overrides_zero_value() {
        let table = decode(
            vec![ColumnMeta::new("n", "INT4"), ColumnMeta::new("b", "BOOL")],
            vec![vec![Cell::Null, Cell::Null]],
        )
        .unwrap();
        assert_eq!(table.rows[0], vec![Value::Null, Value::Null]);
    }

    #[test]
    fn test_binary_failure_becomes_null() {
        let table = decode(
            vec![ColumnMeta::new("payload", "BYTEA"), ColumnMeta::new("n", "INT4")],
            vec![vec![Cell::BrokenBinary, Cell::Int(1)]],
        )
        .unwrap();
        assert_eq!(table.rows[0], vec![Value::Null, Value::Integer(1)]);
    }

    #[test]
    fn test_jsonb_map() {
        let table = decode(
            vec![ColumnMeta::new("props", "JSONB")],
            vec![vec![Cell::Object("jsonb".to_string(), r#"{"a": 1}"#.to_string())]],
        )
        .unwrap();
        let Value::Map(map) = &table.rows[0][0] else {
            panic!("expected a map");
        };
        assert_eq!(map["a"], Value::Long(1));
    }

    #[test]
    fn test_other_map_encoding_fails() {
        let err = decode(
            vec![ColumnMeta::new("props", "JSONB")],
            vec![vec![Cell::Object("hstore".to_string(), "a=>1".to_string())]],
        )
        .unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedMapEncoding {
                encoding: "hstore".to_string()
            }
        );
    }

    #[test]
    fn test_json_column_keeps_its_text() {
        let table = decode(
            vec![ColumnMeta::new("doc", "JSON")],
            vec![vec![Cell::Object("json".to_string(), r#"{"a": 1}"#.to_string())]],
        )
        .unwrap();
        assert_eq!(table.columns[0].field_type, FieldType::STRING);
        assert_eq!(table.rows[0][0], Value::String(r#"{"a": 1}"#.to_string()));
    }

    #[test]
    fn test_array_column() {
        let table = decode(
            vec![ColumnMeta::new("xs", "_INT4")],
            vec![vec![Cell::Array(vec![Value::Integer(1), Value::Null])]],
        )
        .unwrap();
        assert_eq!(table.columns[0].field_type, FieldType::Array(BaseType::Integer));
        assert_eq!(table.rows[0][0], Value::Array(vec![Value::Integer(1), Value::Null]));
    }
}
