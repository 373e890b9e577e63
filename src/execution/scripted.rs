//! In-process relational backend driven by canned responses
//!
//! Each SQL text is bound to a [`Script`]: rows to return, an error to raise, or
//! a statement that blocks until it is cancelled. Counters expose how often the
//! backend was asked to execute and to cancel. Each session has its own cancel
//! signal; a cancel that lands after its session was released is counted as
//! stale.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{BackendError, BinaryReadError};
use crate::execution::backend::{
    BackendSession, CancelHandle, ColumnMeta, NativeObject, QueryBackend, ResultCursor, RowAccess,
};
use crate::types::{BaseType, Value};

/// SQLSTATE Postgres reports for a cancelled statement.
pub const QUERY_CANCELED: &str = "57014";

/// One raw cell as a driver would hold it.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Long(i64),
    Int(i32),
    Double(f64),
    Bool(bool),
    Decimal(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    /// A binary cell whose stream fails to materialize.
    BrokenBinary,
    Array(Vec<Value>),
    /// Backend object: encoding name and textual value.
    Object(String, String),
}

fn mismatch(cell: &Cell, wanted: &str) -> BackendError {
    BackendError::Internal(format!("Cannot read {:?} as {}", cell, wanted))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedRow(pub Vec<Cell>);

impl ScriptedRow {
    fn cell(&self, index: usize) -> Result<&Cell, BackendError> {
        self.0
            .get(index)
            .ok_or_else(|| BackendError::Internal(format!("Column index {} out of range", index)))
    }
}

impl RowAccess for ScriptedRow {
    fn is_null(&self, index: usize) -> Result<bool, BackendError> {
        Ok(matches!(self.cell(index)?, Cell::Null))
    }

    fn get_string(&self, index: usize) -> Result<Option<String>, BackendError> {
        Ok(match self.cell(index)? {
            Cell::Null => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Long(v) => Some(v.to_string()),
            Cell::Int(v) => Some(v.to_string()),
            Cell::Double(v) | Cell::Decimal(v) => Some(v.to_string()),
            Cell::Bool(v) => Some(v.to_string()),
            Cell::Date(v) => Some(v.to_string()),
            Cell::Time(v) => Some(v.to_string()),
            Cell::Timestamp(v) => Some(v.to_rfc3339()),
            Cell::Object(_, text) => Some(text.clone()),
            other => Some(format!("{:?}", other)),
        })
    }

    fn get_long(&self, index: usize) -> Result<i64, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(0),
            Cell::Long(v) => Ok(*v),
            Cell::Int(v) => Ok(i64::from(*v)),
            other => Err(mismatch(other, "LONG")),
        }
    }

    fn get_int(&self, index: usize) -> Result<i32, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(0),
            Cell::Int(v) => Ok(*v),
            other => Err(mismatch(other, "INTEGER")),
        }
    }

    fn get_double(&self, index: usize) -> Result<f64, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(0.0),
            Cell::Double(v) | Cell::Decimal(v) => Ok(*v),
            other => Err(mismatch(other, "DOUBLE")),
        }
    }

    fn get_boolean(&self, index: usize) -> Result<bool, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(false),
            Cell::Bool(v) => Ok(*v),
            other => Err(mismatch(other, "BOOLEAN")),
        }
    }

    fn get_decimal(&self, index: usize) -> Result<Option<f64>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Decimal(v) | Cell::Double(v) => Ok(Some(*v)),
            other => Err(mismatch(other, "DECIMAL")),
        }
    }

    fn get_date(&self, index: usize) -> Result<Option<NaiveDate>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Date(v) => Ok(Some(*v)),
            other => Err(mismatch(other, "DATE")),
        }
    }

    fn get_time(&self, index: usize) -> Result<Option<NaiveTime>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Time(v) => Ok(Some(*v)),
            other => Err(mismatch(other, "TIME")),
        }
    }

    fn get_timestamp(&self, index: usize) -> Result<Option<DateTime<Utc>>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Timestamp(v) => Ok(Some(*v)),
            other => Err(mismatch(other, "TIMESTAMP")),
        }
    }

    fn get_binary(&self, index: usize) -> Result<Option<Vec<u8>>, BinaryReadError> {
        match self.cell(index).map_err(|e| BinaryReadError(e.to_string()))? {
            Cell::Null => Ok(None),
            Cell::Bytes(bytes) => Ok(Some(bytes.clone())),
            Cell::BrokenBinary => Err(BinaryReadError("stream closed".to_string())),
            other => Err(BinaryReadError(format!("{:?} is not binary", other))),
        }
    }

    fn get_array(&self, index: usize, _element: BaseType) -> Result<Option<Vec<Value>>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Array(items) => Ok(Some(items.clone())),
            other => Err(mismatch(other, "ARRAY")),
        }
    }

    fn get_object(&self, index: usize) -> Result<Option<NativeObject>, BackendError> {
        match self.cell(index)? {
            Cell::Null => Ok(None),
            Cell::Object(encoding, text) => Ok(Some(NativeObject {
                encoding: encoding.clone(),
                text: text.clone(),
            })),
            other => Err(mismatch(other, "OBJECT")),
        }
    }
}

/// Cursor over canned rows.
#[derive(Debug, Clone)]
pub struct ScriptedCursor {
    columns: Vec<ColumnMeta>,
    rows: Vec<ScriptedRow>,
    position: usize,
}

impl ScriptedCursor {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().map(ScriptedRow).collect(),
            position: 0,
        }
    }
}

impl ResultCursor for ScriptedCursor {
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

/// Canned response for one SQL text.
#[derive(Debug, Clone)]
pub enum Script {
    Rows {
        columns: Vec<ColumnMeta>,
        rows: Vec<Vec<Cell>>,
    },
    /// Accepted as an update; a query with this script returns no columns.
    Update,
    Fail(BackendError),
    /// Runs until cancelled, then fails the way Postgres reports a cancel.
    BlockUntilCancelled,
    /// Completes on its own after the given time, with no rows.
    Sleep(Duration),
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<HashMap<String, Script>>,
    executions: AtomicUsize,
    cancels: AtomicUsize,
    stale_cancels: AtomicUsize,
    cancel_delay: Mutex<Option<Duration>>,
}

impl Shared {
    fn script(&self, sql: &str) -> Result<Script, BackendError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.scripts.lock().get(sql).cloned().ok_or_else(|| BackendError::Sql {
            message: format!("relation for \"{}\" does not exist", sql),
            sql_state: Some("42P01".to_string()),
            error_code: None,
            position: None,
        })
    }
}

/// Per-session cancel signal.
#[derive(Default)]
struct SessionState {
    cancelled: Notify,
    released: AtomicBool,
}

impl SessionState {
    async fn wait_for_cancel(&self) -> BackendError {
        self.cancelled.notified().await;
        BackendError::Sql {
            message: "canceling statement due to user request".to_string(),
            sql_state: Some(QUERY_CANCELED.to_string()),
            error_code: None,
            position: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    shared: Arc<Shared>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, sql: &str, script: Script) {
        self.shared.scripts.lock().insert(sql.to_string(), script);
    }

    pub fn rows(&self, sql: &str, columns: Vec<ColumnMeta>, rows: Vec<Vec<Cell>>) {
        self.script(sql, Script::Rows { columns, rows });
    }

    /// Statements the backend was asked to run, queries and updates alike.
    pub fn executions(&self) -> usize {
        self.shared.executions.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }

    /// Cancels that arrived after their session had been released.
    pub fn stale_cancels(&self) -> usize {
        self.shared.stale_cancels.load(Ordering::SeqCst)
    }

    /// Delay every cancel by `delay` before it reaches its session.
    pub fn set_cancel_delay(&self, delay: Duration) {
        *self.shared.cancel_delay.lock() = Some(delay);
    }
}

struct ScriptedCancel {
    shared: Arc<Shared>,
    session: Arc<SessionState>,
}

#[async_trait]
impl CancelHandle for ScriptedCancel {
    async fn cancel(&self) -> Result<(), BackendError> {
        let delay = *self.shared.cancel_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
        if self.session.released.load(Ordering::SeqCst) {
            self.shared.stale_cancels.fetch_add(1, Ordering::SeqCst);
        } else {
            self.session.cancelled.notify_one();
        }
        Ok(())
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
    state: Arc<SessionState>,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendSession for ScriptedSession {
    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(ScriptedCancel {
            shared: self.shared.clone(),
            session: self.state.clone(),
        })
    }

    async fn execute_update(&mut self, sql: &str) -> Result<(), BackendError> {
        match self.shared.script(sql)? {
            Script::Fail(err) => Err(err),
            Script::BlockUntilCancelled => Err(self.state.wait_for_cancel().await),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Script::Rows { .. } | Script::Update => Ok(()),
        }
    }

    async fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultCursor>, BackendError> {
        match self.shared.script(sql)? {
            Script::Rows { columns, rows } => Ok(Box::new(ScriptedCursor::new(columns, rows))),
            Script::Update => Ok(Box::new(ScriptedCursor::new(Vec::new(), Vec::new()))),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Box::new(ScriptedCursor::new(Vec::new(), Vec::new())))
            }
            Script::Fail(err) => Err(err),
            Script::BlockUntilCancelled => Err(self.state.wait_for_cancel().await),
        }
    }
}

#[async_trait]
impl QueryBackend for ScriptedBackend {
    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
            state: Arc::new(SessionState::default()),
        }))
    }
}
