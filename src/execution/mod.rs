//! Execution Module - asynchronous SQL queries against the relational backend
//!
//! [`QueryExecutor`] hands out [`QueryExecution`] handles; each one runs on the
//! shared runtime and resolves to a typed [`QueryResult`].

pub mod backend;
pub mod decode;
pub mod query;
pub mod result;
pub mod scripted;

pub use backend::{
    BackendSession, CancelHandle, ColumnMeta, NativeObject, PostgresTypes, QueryBackend, ResultCursor,
    RowAccess, TypeTable,
};
pub use decode::{decode_cursor, DecodedTable};
pub use query::{ExecutionMode, QueryExecution, QueryExecutor, QueryState, QueryStats};
pub use result::{QueryError, QueryResult, EXECUTION_TIME, QUERY};
pub use scripted::{Cell, Script, ScriptedBackend, QUERY_CANCELED};
