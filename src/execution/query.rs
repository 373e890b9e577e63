//! Query Execution Engine
//!
//! Every query runs as its own task on the shared runtime, gated by a semaphore.
//! The task writes the result exactly once into a watch channel; any number of
//! callers can await it. Errors are part of the result, never raised.
//!
//! The cancel handle slot is held for the whole of a cancel, and the session
//! is only released after the slot is cleared. A kill therefore never reaches
//! a connection that has moved on to another statement.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueryConfig;
use crate::error::{BackendError, DecodeError};
use crate::execution::backend::{BackendSession, CancelHandle, QueryBackend};
use crate::execution::decode::decode_cursor;
use crate::execution::result::{QueryError, QueryResult, EXECUTION_TIME, QUERY};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Created,
    Running,
    Finished,
    /// The task ended without producing a result.
    Failed,
}

impl QueryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => QueryState::Created,
            1 => QueryState::Running,
            2 => QueryState::Finished,
            _ => QueryState::Failed,
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Created => "CREATED",
            QueryState::Running => "RUNNING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Point-in-time progress report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueryStats {
    pub percentage: Option<u8>,
    pub state: QueryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Query,
    /// Run for side effect; the result is the canonical `result = true` row.
    Update,
}

struct Shared {
    id: Uuid,
    query: String,
    state: AtomicU8,
    statement: Mutex<Option<Arc<dyn CancelHandle>>>,
}

impl Shared {
    fn set_state(&self, state: QueryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    async fn bind_statement(&self, handle: Option<Arc<dyn CancelHandle>>) {
        *self.statement.lock().await = handle;
    }
}

/// Handle to one asynchronous query. Cloning shares the same execution.
#[derive(Clone)]
pub struct QueryExecution {
    shared: Arc<Shared>,
    result: watch::Receiver<Option<Arc<QueryResult>>>,
}

impl QueryExecution {
    /// Schedule `query` on the runtime. Must be called inside a Tokio runtime.
    pub fn start(
        backend: Arc<dyn QueryBackend>,
        limiter: Arc<Semaphore>,
        query: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            query: query.into(),
            state: AtomicU8::new(QueryState::Created as u8),
            statement: Mutex::new(None),
        });
        let (sender, result) = watch::channel(None);

        let task = shared.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                task.set_state(QueryState::Failed);
                return;
            };
            task.set_state(QueryState::Running);
            debug!("Query {} started", task.id);

            let outcome = run(backend.as_ref(), &task, mode).await;
            task.set_state(QueryState::Finished);
            let _ = sender.send(Some(Arc::new(outcome)));
        });

        Self { shared, result }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn query(&self) -> &str {
        &self.shared.query
    }

    pub fn state(&self) -> QueryState {
        QueryState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Progress report: FINISHED at 100% once the execution has ended,
    /// RUNNING with unknown progress before that. [`QueryState::Failed`] is
    /// only visible through [`QueryExecution::state`].
    pub fn current_stats(&self) -> QueryStats {
        if self.is_finished() || self.state() == QueryState::Failed {
            return QueryStats {
                percentage: Some(100),
                state: QueryState::Finished,
            };
        }
        QueryStats {
            percentage: None,
            state: QueryState::Running,
        }
    }

    /// Non-blocking: has the result been written.
    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the result. Every call yields the same value.
    pub async fn get_result(&self) -> Arc<QueryResult> {
        let mut receiver = self.result.clone();
        let waited = receiver.wait_for(Option::is_some).await.map(|slot| slot.clone());
        match waited {
            Ok(Some(result)) => result,
            _ => {
                self.shared.set_state(QueryState::Failed);
                error!("Query {} ended without a result", self.shared.id);
                Arc::new(QueryResult::error_result(
                    QueryError::new("Query execution ended without a result"),
                    &self.shared.query,
                ))
            }
        }
    }

    /// Best-effort cancel of the running statement. Never fails.
    pub async fn kill(&self) {
        let slot = self.shared.statement.lock().await;
        match slot.as_ref() {
            Some(handle) => {
                info!("Cancelling query {}", self.shared.id);
                if let Err(e) = handle.cancel().await {
                    debug!("Cancel of query {} was rejected: {}", self.shared.id, e);
                }
            }
            None => debug!("Query {} has no running statement to cancel", self.shared.id),
        }
    }
}

impl fmt::Debug for QueryExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecution")
            .field("id", &self.shared.id)
            .field("query", &self.shared.query)
            .field("state", &self.state())
            .finish()
    }
}

async fn run(backend: &dyn QueryBackend, shared: &Shared, mode: ExecutionMode) -> QueryResult {
    match execute(backend, shared, mode).await {
        Ok(result) => result,
        Err(err) => {
            debug!("Error while executing query:\n{}", shared.query);
            QueryResult::error_result(to_query_error(err, &shared.query), &shared.query)
        }
    }
}

async fn execute(
    backend: &dyn QueryBackend,
    shared: &Shared,
    mode: ExecutionMode,
) -> Result<QueryResult, DecodeError> {
    let mut session = backend.connect().await?;
    shared.bind_statement(Some(session.cancel_handle())).await;

    let outcome = execute_on(session.as_mut(), backend, shared, mode).await;

    // Waits out an in-flight kill; the session must not be released under it.
    shared.bind_statement(None).await;
    drop(session);
    outcome
}

async fn execute_on(
    session: &mut dyn BackendSession,
    backend: &dyn QueryBackend,
    shared: &Shared,
    mode: ExecutionMode,
) -> Result<QueryResult, DecodeError> {
    match mode {
        ExecutionMode::Update => {
            session.execute_update(&shared.query).await?;
            Ok(QueryResult::update_succeeded())
        }
        ExecutionMode::Query => {
            let started = Instant::now();
            let mut cursor = session.execute_query(&shared.query).await?;
            let table = decode_cursor(cursor.as_mut(), backend.type_table())?;

            let mut metadata = BTreeMap::new();
            metadata.insert(
                EXECUTION_TIME.to_string(),
                serde_json::Value::from(started.elapsed().as_millis() as u64),
            );
            metadata.insert(QUERY.to_string(), serde_json::Value::from(shared.query.as_str()));
            Ok(QueryResult::with_metadata(table.columns, table.rows, metadata))
        }
    }
}

fn to_query_error(err: DecodeError, query: &str) -> QueryError {
    match err {
        DecodeError::Backend(BackendError::Sql {
            message,
            sql_state,
            error_code,
            position,
        }) => {
            warn!(
                "Query error: {} (SQLSTATE {}) in query: {}",
                message,
                sql_state.as_deref().unwrap_or("-"),
                query
            );
            let error = QueryError {
                sql_state,
                error_code,
                ..QueryError::new(message)
            };
            match position {
                Some(position) => error.with_position(query, position),
                None => error,
            }
        }
        other => {
            error!("Internal query execution error: {}", other);
            QueryError::new(other.to_string())
        }
    }
}

/// Creates executions against one backend with a shared concurrency limit.
#[derive(Clone)]
pub struct QueryExecutor {
    backend: Arc<dyn QueryBackend>,
    limiter: Arc<Semaphore>,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn QueryBackend>, config: &QueryConfig) -> Self {
        Self {
            backend,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries.max(1))),
        }
    }

    pub fn execute_raw(&self, sql: &str) -> QueryExecution {
        QueryExecution::start(self.backend.clone(), self.limiter.clone(), sql, ExecutionMode::Query)
    }

    pub fn execute_update(&self, sql: &str) -> QueryExecution {
        QueryExecution::start(self.backend.clone(), self.limiter.clone(), sql, ExecutionMode::Update)
    }
}
