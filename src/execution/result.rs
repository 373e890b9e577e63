//! Query Result - terminal outcome of one query execution

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{FieldType, SchemaField, Value};

/// Metadata key: execution time in milliseconds.
pub const EXECUTION_TIME: &str = "executionTime";

/// Metadata key: the query text.
pub const QUERY: &str = "query";

/// Backend error attached to a failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub message: String,
    pub sql_state: Option<String>,
    pub error_code: Option<i32>,
    pub error_line: Option<usize>,
    pub error_column: Option<usize>,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            error_code: None,
            error_line: None,
            error_column: None,
        }
    }

    /// Attach a position given as a 1-based character offset into `query`.
    pub fn with_position(mut self, query: &str, position: usize) -> Self {
        if let Some((line, column)) = line_and_column(query, position) {
            self.error_line = Some(line);
            self.error_column = Some(column);
        }
        self
    }
}

/// 1-based line and column of a 1-based character offset.
fn line_and_column(text: &str, position: usize) -> Option<(usize, usize)> {
    if position == 0 {
        return None;
    }
    let mut line = 1;
    let mut column = 1;
    for (offset, ch) in text.chars().enumerate() {
        if offset + 1 == position {
            return Some((line, column));
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    None
}

/// Either a typed table or an error, plus side metadata. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    columns: Vec<SchemaField>,
    rows: Vec<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<QueryError>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl QueryResult {
    pub fn new(columns: Vec<SchemaField>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(
        columns: Vec<SchemaField>,
        rows: Vec<Vec<Value>>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            metadata,
            ..Self::new(columns, rows)
        }
    }

    pub fn error_result(error: QueryError, query: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(QUERY.to_string(), serde_json::Value::from(query));
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            error: Some(error),
            metadata,
        }
    }

    /// Result of a statement run for its side effect: one `result` column holding `true`.
    pub fn update_succeeded() -> Self {
        Self::new(
            vec![SchemaField::new("result", FieldType::BOOLEAN)],
            vec![vec![Value::Boolean(true)]],
        )
    }

    pub fn columns(&self) -> &[SchemaField] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn execution_time_ms(&self) -> Option<u64> {
        self.metadata.get(EXECUTION_TIME).and_then(|v| v.as_u64())
    }
}
