use thiserror::Error;

use crate::types::FieldType;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Couldn't provision stream {stream}: {reason}")]
    Provisioning { stream: String, reason: String },

    #[error("Stream {stream} still missing after provisioning")]
    StreamUnavailable { stream: String },

    #[error("Record rejected by stream {stream}: {code}: {message}")]
    RecordRejected {
        stream: String,
        code: String,
        message: String,
    },

    #[error("Bulk load error: {0}")]
    BulkLoad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures while writing or reading the binary event format.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("Record needs {required} bytes but the buffer window holds {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("Value {value} cannot be written as {expected}")]
    TypeMismatch { expected: FieldType, value: String },

    #[error("Event has {values} values for {fields} schema fields")]
    SchemaMismatch { fields: usize, values: usize },

    #[error("Unexpected end of record while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Errors reported by a streaming transport call as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Stream {0} not found")]
    ResourceNotFound(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport IO error: {0}")]
    Io(String),
}

/// Errors raised by the relational backend seam.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{message}")]
    Sql {
        message: String,
        sql_state: Option<String>,
        error_code: Option<i32>,
        /// 1-based character offset into the query text.
        position: Option<usize>,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let position = db_err
                    .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                    .and_then(|pg| match pg.position() {
                        Some(sqlx::postgres::PgErrorPosition::Original(pos)) => Some(pos),
                        _ => None,
                    });
                BackendError::Sql {
                    message: db_err.message().to_string(),
                    sql_state: db_err.code().map(|code| code.into_owned()),
                    error_code: None,
                    position,
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                BackendError::Connection(err.to_string())
            }
            other => BackendError::Internal(other.to_string()),
        }
    }
}

/// Errors while turning a backend cursor into a typed result table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Unsupported native type {type_name}")]
    UnsupportedType { type_name: String },

    #[error("Postgresql type {encoding} is not supported for map columns")]
    UnsupportedMapEncoding { encoding: String },

    #[error("Malformed value in column {column}: {reason}")]
    Malformed { column: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A cell's binary payload could not be materialized.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Error while de-serializing BINARY value: {0}")]
pub struct BinaryReadError(pub String);

pub type Result<T> = std::result::Result<T, PipelineError>;
