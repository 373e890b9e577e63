//! Binary wire format for event rows
//!
//! A row is `varint(field_count) | DATE(_time) | value*`, little-endian throughout:
//!
//! | type | encoding |
//! |---|---|
//! | INTEGER | 4-byte i32 |
//! | LONG | 8-byte i64 |
//! | DOUBLE, DECIMAL | 8-byte f64 (DECIMAL is lossy) |
//! | BOOLEAN | 1 byte, 0 or 1 |
//! | DATE | 4-byte i32 day count since 1970-01-01 |
//! | TIME | 4-byte i32 milliseconds of day |
//! | TIMESTAMP | 8-byte i64 epoch milliseconds |
//! | STRING, BINARY | varint length + bytes |
//! | ARRAY | varint count + elements |
//! | MAP | varint count + (STRING key, value) pairs |
//!
//! Columns in the bulk-load row format are not nullable, so a null is written as
//! the type's zero value: empty string, 0, false, day 0, epoch, empty array or map.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use std::collections::BTreeMap;

use crate::error::EncodeError;
use crate::types::{BaseType, FieldType, SchemaField, Value};

pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Destination of encoded bytes. Lets one writer serve both the sizing pass and the real write.
pub trait WireSink {
    fn put(&mut self, bytes: &[u8]);
}

/// Counts bytes instead of storing them.
#[derive(Debug, Default)]
pub struct ByteCounter {
    pub len: usize,
}

impl WireSink for ByteCounter {
    fn put(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl WireSink for &mut [u8] {
    fn put(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
    }
}

impl WireSink for BytesMut {
    fn put(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
    }
}

impl WireSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Unsigned LEB128.
pub fn write_varint<S: WireSink + ?Sized>(out: &mut S, mut value: u64) {
    let mut scratch = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            scratch[len] = byte;
            len += 1;
            break;
        }
        scratch[len] = byte | 0x80;
        len += 1;
    }
    out.put(&scratch[..len]);
}

pub fn read_varint<B: Buf>(input: &mut B) -> Result<u64, EncodeError> {
    let mut result = 0u64;
    for shift in (0..64).step_by(7) {
        if !input.has_remaining() {
            return Err(EncodeError::Truncated("varint"));
        }
        let byte = input.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(EncodeError::Malformed("varint longer than 10 bytes".to_string()))
}

/// Day count for an epoch-millis timestamp, truncated toward zero.
pub fn days_from_millis(millis: i64) -> i32 {
    (millis / MILLIS_PER_DAY) as i32
}

fn epoch_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(epoch_day()).num_days() as i32
}

pub fn date_from_days(days: i32) -> Option<NaiveDate> {
    epoch_day().checked_add_signed(chrono::Duration::days(i64::from(days)))
}

fn time_to_millis(time: NaiveTime) -> i32 {
    (time.num_seconds_from_midnight() * 1000 + time.nanosecond() / 1_000_000) as i32
}

fn time_from_millis(millis: i32) -> Option<NaiveTime> {
    let millis = u32::try_from(millis).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(millis / 1000, (millis % 1000) * 1_000_000)
}

fn mismatch(expected: FieldType, value: &Value) -> EncodeError {
    EncodeError::TypeMismatch {
        expected,
        value: value.to_string(),
    }
}

/// Write one value according to `field_type`.
pub fn write_value<S: WireSink + ?Sized>(
    out: &mut S,
    value: &Value,
    field_type: FieldType,
) -> Result<(), EncodeError> {
    match field_type {
        FieldType::Scalar(base) => write_scalar(out, value, base),
        FieldType::Array(base) => match value {
            Value::Null => {
                write_varint(out, 0);
                Ok(())
            }
            Value::Array(items) => {
                write_varint(out, items.len() as u64);
                for item in items {
                    write_scalar(out, item, base)?;
                }
                Ok(())
            }
            other => Err(mismatch(field_type, other)),
        },
        FieldType::Map(base) => match value {
            Value::Null => {
                write_varint(out, 0);
                Ok(())
            }
            Value::Map(entries) => {
                write_varint(out, entries.len() as u64);
                for (key, item) in entries {
                    write_bytes(out, key.as_bytes());
                    write_scalar(out, item, base)?;
                }
                Ok(())
            }
            other => Err(mismatch(field_type, other)),
        },
    }
}

fn write_bytes<S: WireSink + ?Sized>(out: &mut S, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.put(bytes);
}

fn write_scalar<S: WireSink + ?Sized>(
    out: &mut S,
    value: &Value,
    base: BaseType,
) -> Result<(), EncodeError> {
    match (base, value) {
        (BaseType::String, Value::String(s)) => write_bytes(out, s.as_bytes()),
        (BaseType::String, Value::Null) => write_varint(out, 0),

        (BaseType::Long, Value::Long(v)) => out.put(&v.to_le_bytes()),
        (BaseType::Long, Value::Integer(v)) => out.put(&i64::from(*v).to_le_bytes()),
        (BaseType::Long, Value::Null) => out.put(&0i64.to_le_bytes()),

        (BaseType::Integer, Value::Integer(v)) => out.put(&v.to_le_bytes()),
        (BaseType::Integer, Value::Null) => out.put(&0i32.to_le_bytes()),

        (BaseType::Decimal | BaseType::Double, Value::Double(v) | Value::Decimal(v)) => {
            out.put(&v.to_le_bytes())
        }
        (BaseType::Decimal | BaseType::Double, Value::Long(v)) => out.put(&(*v as f64).to_le_bytes()),
        (BaseType::Decimal | BaseType::Double, Value::Integer(v)) => {
            out.put(&f64::from(*v).to_le_bytes())
        }
        (BaseType::Decimal | BaseType::Double, Value::Null) => out.put(&0f64.to_le_bytes()),

        (BaseType::Boolean, Value::Boolean(v)) => out.put(&[u8::from(*v)]),
        (BaseType::Boolean, Value::Null) => out.put(&[0]),

        (BaseType::Date, Value::Date(d)) => out.put(&date_to_days(*d).to_le_bytes()),
        (BaseType::Date, Value::Null) => out.put(&0i32.to_le_bytes()),

        (BaseType::Time, Value::Time(t)) => out.put(&time_to_millis(*t).to_le_bytes()),
        (BaseType::Time, Value::Null) => out.put(&0i32.to_le_bytes()),

        (BaseType::Timestamp, Value::Timestamp(ts)) => out.put(&ts.timestamp_millis().to_le_bytes()),
        (BaseType::Timestamp, Value::Long(millis)) => out.put(&millis.to_le_bytes()),
        (BaseType::Timestamp, Value::Null) => out.put(&0i64.to_le_bytes()),

        (BaseType::Binary, Value::Binary(bytes)) => write_bytes(out, bytes),
        (BaseType::Binary, Value::Null) => write_varint(out, 0),

        (base, other) => return Err(mismatch(FieldType::Scalar(base), other)),
    }
    Ok(())
}

/// Write a complete row: field count, the `_time` partition date, then every property.
pub fn write_row<S: WireSink + ?Sized>(
    out: &mut S,
    schema: &[SchemaField],
    values: &[Value],
    time_millis: Option<i64>,
) -> Result<(), EncodeError> {
    if schema.len() != values.len() {
        return Err(EncodeError::SchemaMismatch {
            fields: schema.len(),
            values: values.len(),
        });
    }

    write_varint(out, schema.len() as u64);
    out.put(&time_millis.map(days_from_millis).unwrap_or(0).to_le_bytes());

    for (field, value) in schema.iter().zip(values) {
        write_value(out, value, field.field_type)?;
    }
    Ok(())
}

/// Exact byte length `write_row` would produce. Also surfaces type mismatches before any write.
pub fn row_len(
    schema: &[SchemaField],
    values: &[Value],
    time_millis: Option<i64>,
) -> Result<usize, EncodeError> {
    let mut counter = ByteCounter::default();
    write_row(&mut counter, schema, values, time_millis)?;
    Ok(counter.len)
}

/// A row read back from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    /// Day count of the implicit leading DATE column.
    pub day: i32,
    pub values: Vec<Value>,
}

impl DecodedRow {
    pub fn date(&self) -> Option<NaiveDate> {
        date_from_days(self.day)
    }
}

fn need<B: Buf>(input: &B, bytes: usize, what: &'static str) -> Result<(), EncodeError> {
    if input.remaining() < bytes {
        Err(EncodeError::Truncated(what))
    } else {
        Ok(())
    }
}

fn read_bytes<B: Buf>(input: &mut B) -> Result<Vec<u8>, EncodeError> {
    let len = read_varint(input)? as usize;
    need(input, len, "length-prefixed bytes")?;
    let mut bytes = vec![0u8; len];
    input.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn read_string<B: Buf>(input: &mut B) -> Result<String, EncodeError> {
    String::from_utf8(read_bytes(input)?).map_err(|_| EncodeError::InvalidUtf8)
}

fn read_scalar<B: Buf>(input: &mut B, base: BaseType) -> Result<Value, EncodeError> {
    let value = match base {
        BaseType::String => Value::String(read_string(input)?),
        BaseType::Long => {
            need(input, 8, "LONG")?;
            Value::Long(input.get_i64_le())
        }
        BaseType::Integer => {
            need(input, 4, "INTEGER")?;
            Value::Integer(input.get_i32_le())
        }
        BaseType::Decimal => {
            need(input, 8, "DECIMAL")?;
            Value::Decimal(input.get_f64_le())
        }
        BaseType::Double => {
            need(input, 8, "DOUBLE")?;
            Value::Double(input.get_f64_le())
        }
        BaseType::Boolean => {
            need(input, 1, "BOOLEAN")?;
            Value::Boolean(input.get_u8() != 0)
        }
        BaseType::Date => {
            need(input, 4, "DATE")?;
            let days = input.get_i32_le();
            Value::Date(
                date_from_days(days)
                    .ok_or_else(|| EncodeError::Malformed(format!("day {} out of range", days)))?,
            )
        }
        BaseType::Time => {
            need(input, 4, "TIME")?;
            let millis = input.get_i32_le();
            Value::Time(
                time_from_millis(millis)
                    .ok_or_else(|| EncodeError::Malformed(format!("time {}ms out of range", millis)))?,
            )
        }
        BaseType::Timestamp => {
            need(input, 8, "TIMESTAMP")?;
            let millis = input.get_i64_le();
            Value::Timestamp(DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                EncodeError::Malformed(format!("timestamp {}ms out of range", millis))
            })?)
        }
        BaseType::Binary => Value::Binary(read_bytes(input)?),
    };
    Ok(value)
}

pub fn read_value<B: Buf>(input: &mut B, field_type: FieldType) -> Result<Value, EncodeError> {
    match field_type {
        FieldType::Scalar(base) => read_scalar(input, base),
        FieldType::Array(base) => {
            let count = read_varint(input)? as usize;
            let mut items = Vec::with_capacity(count.min(input.remaining()));
            for _ in 0..count {
                items.push(read_scalar(input, base)?);
            }
            Ok(Value::Array(items))
        }
        FieldType::Map(base) => {
            let count = read_varint(input)? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = read_string(input)?;
                entries.insert(key, read_scalar(input, base)?);
            }
            Ok(Value::Map(entries))
        }
    }
}

/// Read one encoded row using the schema it was written with.
pub fn decode_event_row(bytes: &[u8], schema: &[SchemaField]) -> Result<DecodedRow, EncodeError> {
    let mut input = bytes;
    let fields = read_varint(&mut input)? as usize;
    if fields != schema.len() {
        return Err(EncodeError::SchemaMismatch {
            fields: schema.len(),
            values: fields,
        });
    }

    need(&input, 4, "DATE")?;
    let day = input.get_i32_le();

    let values = schema
        .iter()
        .map(|field| read_value(&mut input, field.field_type))
        .collect::<Result<Vec<_>, _>>()?;

    if input.has_remaining() {
        return Err(EncodeError::Malformed(format!(
            "{} trailing bytes after last field",
            input.remaining()
        )));
    }

    Ok(DecodedRow { day, values })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(schema: &[SchemaField], values: &[Value], time: Option<i64>) -> Vec<u8> {
        let mut out = Vec::new();
        write_row(&mut out, schema, values, time).unwrap();
        out
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, len) in [(0u64, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (u64::MAX, 10)] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out.len(), len, "length of varint({})", value);
            assert_eq!(read_varint(&mut out.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn test_count_event_exact_bytes() {
        let schema = vec![SchemaField::new("count", FieldType::INTEGER)];
        let bytes = encode(&schema, &[Value::Integer(42)], Some(1_700_000_000_000));

        let day = (1_700_000_000_000i64 / 86_400_000) as i32;
        let mut expected = vec![1u8];
        expected.extend_from_slice(&day.to_le_bytes());
        expected.extend_from_slice(&42i32.to_le_bytes());
        assert_eq!(bytes, expected);

        let row = decode_event_row(&bytes, &schema).unwrap();
        assert_eq!(row.day, 19_675);
        assert_eq!(row.values, vec![Value::Integer(42)]);
    }

    #[test]
    fn test_missing_time_writes_day_zero() {
        let schema = vec![SchemaField::new("flag", FieldType::BOOLEAN)];
        let bytes = encode(&schema, &[Value::Boolean(true)], None);
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_round_trip_every_type() {
        let schema = vec![
            SchemaField::new("s", FieldType::STRING),
            SchemaField::new("l", FieldType::LONG),
            SchemaField::new("i", FieldType::INTEGER),
            SchemaField::new("dec", FieldType::DECIMAL),
            SchemaField::new("dbl", FieldType::DOUBLE),
            SchemaField::new("b", FieldType::BOOLEAN),
            SchemaField::new("d", FieldType::DATE),
            SchemaField::new("t", FieldType::TIME),
            SchemaField::new("ts", FieldType::TIMESTAMP),
            SchemaField::new("bin", FieldType::BINARY),
            SchemaField::new("tags", FieldType::Array(BaseType::String)),
            SchemaField::new("attrs", FieldType::Map(BaseType::Long)),
        ];
        let values = vec![
            Value::String("héllo".to_string()),
            Value::Long(-9_000_000_000),
            Value::Integer(-7),
            Value::Decimal(12.5),
            Value::Double(3.25),
            Value::Boolean(true),
            Value::Date(NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()),
            Value::Time(NaiveTime::from_hms_milli_opt(13, 45, 10, 250).unwrap()),
            Value::Timestamp(DateTime::<Utc>::from_timestamp_millis(1_700_000_123_456).unwrap()),
            Value::Binary(vec![0, 1, 255]),
            Value::Array(vec![Value::String("a".to_string()), Value::String("bc".to_string())]),
            Value::Map(BTreeMap::from([
                ("x".to_string(), Value::Long(1)),
                ("y".to_string(), Value::Long(2)),
            ])),
        ];

        let bytes = encode(&schema, &values, Some(1_700_000_000_000));
        assert_eq!(row_len(&schema, &values, Some(1_700_000_000_000)).unwrap(), bytes.len());

        let row = decode_event_row(&bytes, &schema).unwrap();
        assert_eq!(row.values, values);
    }

    #[test]
    fn test_nulls_write_zero_values() {
        let schema = vec![
            SchemaField::new("s", FieldType::STRING),
            SchemaField::new("l", FieldType::LONG),
            SchemaField::new("tags", FieldType::Array(BaseType::Integer)),
        ];
        let bytes = encode(&schema, &[Value::Null, Value::Null, Value::Null], None);
        let row = decode_event_row(&bytes, &schema).unwrap();
        assert_eq!(
            row.values,
            vec![Value::String(String::new()), Value::Long(0), Value::Array(vec![])]
        );
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let schema = vec![SchemaField::new("count", FieldType::INTEGER)];
        let err = row_len(&schema, &[Value::String("42".to_string())], None).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { expected, .. } if expected == FieldType::INTEGER));
    }

    #[test]
    fn test_truncated_row() {
        let schema = vec![SchemaField::new("count", FieldType::LONG)];
        let bytes = encode(&schema, &[Value::Long(5)], None);
        let err = decode_event_row(&bytes[..bytes.len() - 1], &schema).unwrap_err();
        assert_eq!(err, EncodeError::Truncated("LONG"));
    }
}
