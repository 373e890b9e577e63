//! Postgres backend for the query engine
//!
//! One session holds one pooled connection. Its cancel handle remembers the
//! server process id and cancels over a fresh connection opened outside the
//! pool, so a kill never waits for a pooled connection to free up.
//!
//! Results normally arrive in binary format. A statement with a column the
//! type table cannot map runs over the simple protocol instead, so every value
//! arrives as the server's text rendering.

use async_trait::async_trait;
use bytes::Buf;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgRow, PgValueFormat};
use sqlx::{Column, Connection, Decode, Executor, Postgres, Row, Statement, Type, TypeInfo, ValueRef};
use std::sync::Arc;
use tracing::debug;

use crate::error::{BackendError, BinaryReadError};
use crate::execution::backend::{
    BackendSession, CancelHandle, ColumnMeta, NativeObject, QueryBackend, ResultCursor, RowAccess,
};
use crate::types::postgres::field_type_from_pg;
use crate::types::{BaseType, Value};

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryBackend for PostgresBackend {
    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        let mut conn = self.pool.acquire().await?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        Ok(Box::new(PgSession {
            conn,
            cancel: Arc::new(PgCancelHandle {
                options: self.pool.connect_options(),
                pid,
            }),
        }))
    }
}

pub struct PgCancelHandle {
    options: Arc<PgConnectOptions>,
    pid: i32,
}

#[async_trait]
impl CancelHandle for PgCancelHandle {
    async fn cancel(&self) -> Result<(), BackendError> {
        let mut conn = PgConnection::connect_with(&self.options).await?;
        let signalled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.pid)
            .fetch_one(&mut conn)
            .await?;
        if !signalled {
            debug!("Backend {} had nothing to cancel", self.pid);
        }
        if let Err(e) = conn.close().await {
            debug!("Closing cancel connection failed: {}", e);
        }
        Ok(())
    }
}

struct PgSession {
    conn: PoolConnection<Postgres>,
    cancel: Arc<PgCancelHandle>,
}

#[async_trait]
impl BackendSession for PgSession {
    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }

    async fn execute_update(&mut self, sql: &str) -> Result<(), BackendError> {
        (&mut *self.conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultCursor>, BackendError> {
        let conn: &mut PgConnection = &mut self.conn;
        // Prepared first so column metadata exists even for an empty result.
        let statement = conn.prepare(sql).await?;
        let columns: Vec<ColumnMeta> = statement
            .columns()
            .iter()
            .map(|column| ColumnMeta {
                name: column.name().to_string(),
                type_name: column.type_info().name().to_string(),
                type_id: column.type_info().oid().map(|oid| oid.0),
            })
            .collect();

        let text_format = columns
            .iter()
            .any(|column| field_type_from_pg(&column.type_name).is_err());
        let rows = if text_format {
            debug!("Fetching results as text, statement has unmapped column types");
            (&mut *self.conn).fetch_all(sqlx::raw_sql(sql)).await?
        } else {
            statement.query().fetch_all(&mut *self.conn).await?
        };

        let type_names: Arc<[String]> = columns
            .iter()
            .map(|column| column.type_name.to_uppercase())
            .collect();
        let rows = rows
            .into_iter()
            .map(|row| PgResultRow {
                row,
                type_names: type_names.clone(),
            })
            .collect();

        Ok(Box::new(PgCursor {
            columns,
            rows,
            position: 0,
        }))
    }
}

struct PgCursor {
    columns: Vec<ColumnMeta>,
    rows: Vec<PgResultRow>,
    position: usize,
}

impl ResultCursor for PgCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<&dyn RowAccess>, BackendError> {
        let row = self.rows.get(self.position);
        if row.is_some() {
            self.position += 1;
        }
        Ok(row.map(|r| r as &dyn RowAccess))
    }
}

/// A fetched row plus the column type names of its statement.
///
/// Simple-protocol rows do not always carry resolved type names, so the
/// names come from the prepared statement.
struct PgResultRow {
    row: PgRow,
    type_names: Arc<[String]>,
}

impl PgResultRow {
    fn type_name(&self, index: usize) -> Result<&str, BackendError> {
        self.type_names
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| BackendError::Internal(format!("Column index {} out of range", index)))
    }
}

fn raw_bytes<'r>(row: &'r PgRow, index: usize) -> Result<Option<(&'r [u8], PgValueFormat)>, BackendError> {
    let value = row.try_get_raw(index)?;
    if value.is_null() {
        return Ok(None);
    }
    let format = value.format();
    let bytes = <&[u8] as Decode<Postgres>>::decode(value)
        .map_err(|e| BackendError::Internal(e.to_string()))?;
    Ok(Some((bytes, format)))
}

/// Binary NUMERIC: digit count, weight, sign, display scale, then base-10000 digits.
fn decode_numeric(bytes: &[u8]) -> Result<f64, BackendError> {
    let malformed = || BackendError::Internal("Malformed NUMERIC value".to_string());
    let mut buf = bytes;
    if buf.remaining() < 8 {
        return Err(malformed());
    }
    let digits = buf.get_i16();
    let weight = buf.get_i16();
    let sign = buf.get_u16();
    let _scale = buf.get_i16();

    match sign {
        0xC000 => return Ok(f64::NAN),
        0xD000 => return Ok(f64::INFINITY),
        0xF000 => return Ok(f64::NEG_INFINITY),
        _ => {}
    }
    if digits < 0 || buf.remaining() < digits as usize * 2 {
        return Err(malformed());
    }

    let mut value = 0f64;
    for i in 0..digits as i32 {
        let digit = buf.get_i16();
        value += f64::from(digit) * 10_000f64.powi(i32::from(weight) - i);
    }
    Ok(if sign == 0x4000 { -value } else { value })
}

/// Binary array of NUMERIC: dimension count, null flag, element oid, one
/// (length, lower bound) pair per dimension, then length-prefixed elements.
/// Multi-dimensional arrays are flattened in storage order.
fn decode_numeric_array(bytes: &[u8]) -> Result<Vec<Value>, BackendError> {
    let malformed = || BackendError::Internal("Malformed NUMERIC[] value".to_string());
    let mut buf = bytes;
    if buf.remaining() < 12 {
        return Err(malformed());
    }
    let dimensions = buf.get_i32();
    let _has_nulls = buf.get_i32();
    let _element_oid = buf.get_u32();
    if dimensions <= 0 {
        return Ok(Vec::new());
    }
    if buf.remaining() < dimensions as usize * 8 {
        return Err(malformed());
    }
    let mut count = 1usize;
    for _ in 0..dimensions {
        let length = buf.get_i32();
        let _lower_bound = buf.get_i32();
        count = count.saturating_mul(length.max(0) as usize);
    }

    let mut items = Vec::with_capacity(count.min(buf.remaining() / 4));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(malformed());
        }
        let length = buf.get_i32();
        if length < 0 {
            items.push(Value::Null);
            continue;
        }
        let length = length as usize;
        if buf.remaining() < length {
            return Err(malformed());
        }
        items.push(Value::Decimal(decode_numeric(&buf[..length])?));
        buf.advance(length);
    }
    Ok(items)
}

/// Text array of NUMERIC, e.g. `{1.5,NULL,{2,3}}`.
fn parse_numeric_array(text: &str) -> Result<Vec<Value>, BackendError> {
    text.split(',')
        .map(|item| item.trim_matches(|c: char| c == '{' || c == '}' || c == '"' || c.is_whitespace()))
        .filter(|item| !item.is_empty())
        .map(|item| match item {
            "NULL" => Ok(Value::Null),
            number => number.parse().map(Value::Decimal).map_err(|_| {
                BackendError::Internal(format!("Malformed NUMERIC element: {}", number))
            }),
        })
        .collect()
}

fn array_of<T>(
    row: &PgRow,
    index: usize,
    convert: impl Fn(T) -> Value,
) -> Result<Option<Vec<Value>>, BackendError>
where
    Option<Vec<Option<T>>>: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    let items: Option<Vec<Option<T>>> = row.try_get(index)?;
    Ok(flatten(items, convert))
}

fn flatten<T>(items: Option<Vec<Option<T>>>, convert: impl Fn(T) -> Value) -> Option<Vec<Value>> {
    items.map(|items| {
        items
            .into_iter()
            .map(|item| item.map(&convert).unwrap_or(Value::Null))
            .collect()
    })
}

impl RowAccess for PgResultRow {
    fn is_null(&self, index: usize) -> Result<bool, BackendError> {
        Ok(self.row.try_get_raw(index)?.is_null())
    }

    fn get_string(&self, index: usize) -> Result<Option<String>, BackendError> {
        match self.type_name(index)? {
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
                Ok(self.row.try_get(index)?)
            }
            "UUID" => Ok(self
                .row
                .try_get::<Option<uuid::Uuid>, _>(index)?
                .map(|id| id.to_string())),
            name => match raw_bytes(&self.row, index)? {
                None => Ok(None),
                Some((bytes, PgValueFormat::Text)) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
                // The binary send format of json is its text.
                Some((bytes, PgValueFormat::Binary)) if name == "JSON" => {
                    Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
                }
                Some((_, PgValueFormat::Binary)) => Err(BackendError::Internal(format!(
                    "{} value arrived in binary format and has no text rendering",
                    name
                ))),
            },
        }
    }

    fn get_long(&self, index: usize) -> Result<i64, BackendError> {
        let value = match self.type_name(index)? {
            "INT2" => self.row.try_get::<Option<i16>, _>(index)?.map(i64::from),
            "INT4" => self.row.try_get::<Option<i32>, _>(index)?.map(i64::from),
            _ => self.row.try_get::<Option<i64>, _>(index)?,
        };
        Ok(value.unwrap_or_default())
    }

    fn get_int(&self, index: usize) -> Result<i32, BackendError> {
        let value = match self.type_name(index)? {
            "INT2" => self.row.try_get::<Option<i16>, _>(index)?.map(i32::from),
            _ => self.row.try_get::<Option<i32>, _>(index)?,
        };
        Ok(value.unwrap_or_default())
    }

    fn get_double(&self, index: usize) -> Result<f64, BackendError> {
        let value = match self.type_name(index)? {
            "FLOAT4" => self.row.try_get::<Option<f32>, _>(index)?.map(f64::from),
            "NUMERIC" => self.get_decimal(index)?,
            _ => self.row.try_get::<Option<f64>, _>(index)?,
        };
        Ok(value.unwrap_or_default())
    }

    fn get_boolean(&self, index: usize) -> Result<bool, BackendError> {
        Ok(self.row.try_get::<Option<bool>, _>(index)?.unwrap_or_default())
    }

    fn get_decimal(&self, index: usize) -> Result<Option<f64>, BackendError> {
        if self.type_name(index)? != "NUMERIC" {
            return Ok(Some(self.get_double(index)?));
        }
        match raw_bytes(&self.row, index)? {
            None => Ok(None),
            Some((bytes, PgValueFormat::Binary)) => decode_numeric(bytes).map(Some),
            Some((bytes, PgValueFormat::Text)) => String::from_utf8_lossy(bytes)
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| BackendError::Internal("Malformed NUMERIC value".to_string())),
        }
    }

    fn get_date(&self, index: usize) -> Result<Option<NaiveDate>, BackendError> {
        Ok(self.row.try_get(index)?)
    }

    fn get_time(&self, index: usize) -> Result<Option<NaiveTime>, BackendError> {
        Ok(self.row.try_get(index)?)
    }

    fn get_timestamp(&self, index: usize) -> Result<Option<DateTime<Utc>>, BackendError> {
        match self.type_name(index)? {
            "TIMESTAMPTZ" => Ok(self.row.try_get(index)?),
            _ => Ok(self
                .row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map(|ts| ts.and_utc())),
        }
    }

    fn get_binary(&self, index: usize) -> Result<Option<Vec<u8>>, BinaryReadError> {
        self.row
            .try_get(index)
            .map_err(|e: sqlx::Error| BinaryReadError(e.to_string()))
    }

    fn get_array(&self, index: usize, element: BaseType) -> Result<Option<Vec<Value>>, BackendError> {
        let name = self.type_name(index)?;
        let native = name
            .strip_suffix("[]")
            .or_else(|| name.strip_prefix('_'))
            .unwrap_or(name);
        let row = &self.row;

        match (native, element) {
            ("INT2", _) => array_of(row, index, |v: i16| Value::Integer(i32::from(v))),
            ("INT4", _) => array_of(row, index, Value::Integer),
            ("INT8", _) => array_of(row, index, Value::Long),
            ("FLOAT4", _) => array_of(row, index, |v: f32| Value::Double(f64::from(v))),
            ("FLOAT8", _) => array_of(row, index, Value::Double),
            ("NUMERIC", _) => match raw_bytes(row, index)? {
                None => Ok(None),
                Some((bytes, PgValueFormat::Binary)) => decode_numeric_array(bytes).map(Some),
                Some((bytes, PgValueFormat::Text)) => {
                    parse_numeric_array(&String::from_utf8_lossy(bytes)).map(Some)
                }
            },
            ("BOOL", _) => array_of(row, index, Value::Boolean),
            ("DATE", _) => array_of(row, index, Value::Date),
            ("TIME", _) => array_of(row, index, Value::Time),
            ("TIMESTAMP", _) => array_of(row, index, |v: NaiveDateTime| Value::Timestamp(v.and_utc())),
            ("TIMESTAMPTZ", _) => array_of(row, index, Value::Timestamp),
            ("BYTEA", _) => array_of(row, index, Value::Binary),
            // Text-like element types share the utf-8 representation of TEXT.
            (_, BaseType::String) => {
                let items: Option<Vec<Option<String>>> = row.try_get_unchecked(index)?;
                Ok(flatten(items, Value::String))
            }
            (other, _) => Err(BackendError::Internal(format!(
                "Arrays of {} are not supported",
                other
            ))),
        }
    }

    fn get_object(&self, index: usize) -> Result<Option<NativeObject>, BackendError> {
        let encoding = self.type_name(index)?.to_lowercase();
        let Some((bytes, format)) = raw_bytes(&self.row, index)? else {
            return Ok(None);
        };
        // Binary jsonb carries a one-byte version header.
        let body = match (encoding.as_str(), format) {
            ("jsonb", PgValueFormat::Binary) => bytes.strip_prefix(&[1u8]).unwrap_or(bytes),
            _ => bytes,
        };
        Ok(Some(NativeObject {
            encoding,
            text: String::from_utf8_lossy(body).into_owned(),
        }))
    }
}
