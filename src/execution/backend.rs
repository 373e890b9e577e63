//! Relational backend seam
//!
//! The query engine talks to the database only through these traits. A session
//! is one connection with one statement at a time; its [`CancelHandle`] can be
//! used from another task while a statement runs.
//!
//! Typed accessors on [`RowAccess`] follow the usual driver convention: scalar
//! getters return the type's zero value for SQL NULL, object getters return
//! `None`. Callers check [`RowAccess::is_null`] to tell the two apart.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::error::{BackendError, BinaryReadError, DecodeError};
use crate::types::{postgres, BaseType, FieldType, Value};

/// Column metadata reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    /// Native type name, e.g. `INT4`, `_TEXT`, `JSONB`.
    pub type_name: String,
    pub type_id: Option<u32>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_id: None,
        }
    }
}

/// A value of a backend-specific object type, tagged with its encoding name.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeObject {
    /// Lower-case type name, e.g. `jsonb` or `hstore`.
    pub encoding: String,
    pub text: String,
}

/// Typed access to the current row of a cursor. Indices are 0-based.
pub trait RowAccess {
    fn is_null(&self, index: usize) -> Result<bool, BackendError>;

    /// Generic string accessor; works for any column type.
    fn get_string(&self, index: usize) -> Result<Option<String>, BackendError>;
    fn get_long(&self, index: usize) -> Result<i64, BackendError>;
    fn get_int(&self, index: usize) -> Result<i32, BackendError>;
    fn get_double(&self, index: usize) -> Result<f64, BackendError>;
    fn get_boolean(&self, index: usize) -> Result<bool, BackendError>;
    fn get_decimal(&self, index: usize) -> Result<Option<f64>, BackendError>;

    /// Temporal getters normalize to UTC.
    fn get_date(&self, index: usize) -> Result<Option<NaiveDate>, BackendError>;
    fn get_time(&self, index: usize) -> Result<Option<NaiveTime>, BackendError>;
    fn get_timestamp(&self, index: usize) -> Result<Option<DateTime<Utc>>, BackendError>;

    fn get_binary(&self, index: usize) -> Result<Option<Vec<u8>>, BinaryReadError>;

    /// Elements converted to `element` values; NULL elements become [`Value::Null`].
    fn get_array(&self, index: usize, element: BaseType) -> Result<Option<Vec<Value>>, BackendError>;

    fn get_object(&self, index: usize) -> Result<Option<NativeObject>, BackendError>;
}

/// Forward-only cursor over a materialized result set.
pub trait ResultCursor: Send {
    fn columns(&self) -> &[ColumnMeta];

    fn next_row(&mut self) -> Result<Option<&dyn RowAccess>, BackendError>;
}

/// Cancels whatever statement the owning session is running.
#[async_trait]
pub trait CancelHandle: Send + Sync {
    async fn cancel(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait BackendSession: Send {
    fn cancel_handle(&self) -> std::sync::Arc<dyn CancelHandle>;

    /// Run a statement for its side effect (DDL, DML).
    async fn execute_update(&mut self, sql: &str) -> Result<(), BackendError>;

    async fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultCursor>, BackendError>;
}

/// Backend-specific mapping from native column types to [`FieldType`]s.
pub trait TypeTable: Send + Sync {
    fn field_type(&self, type_name: &str) -> Result<FieldType, DecodeError>;

    /// The only object encoding that decodes into a map column.
    fn map_encoding(&self) -> &str;
}

pub struct PostgresTypes;

impl TypeTable for PostgresTypes {
    fn field_type(&self, type_name: &str) -> Result<FieldType, DecodeError> {
        postgres::field_type_from_pg(type_name)
    }

    fn map_encoding(&self) -> &str {
        postgres::MAP_ENCODING
    }
}

/// Opens sessions. Shared by every query of an executor.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError>;

    fn type_table(&self) -> &dyn TypeTable {
        &PostgresTypes
    }
}
