pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod types;

pub use config::{PublisherConfig, QueryConfig};
pub use error::{PipelineError, Result};
pub use execution::{QueryExecution, QueryExecutor, QueryResult};
pub use ingestion::{Event, EventStore, StreamPublisher};
pub use types::{FieldType, SchemaField, Value};
