//! Ingestion Module - Event model and the store-write contract
//!
//! Events reach the columnar store either through the partitioned stream
//! ([`StreamPublisher`]) or through the direct bulk path ([`BulkLoader`]). Both
//! implement [`EventStore`], so the ingestion frontend does not need to know
//! which one it was handed.

pub mod bulk;
pub mod encoder;
pub mod memory;
pub mod publisher;
pub mod transport;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{EncodeError, Result};
use crate::types::{SchemaField, Value};

pub use bulk::{BulkLoader, BulkSink};
pub use encoder::{BufferPool, EncodeBuffer};
pub use memory::{MemorySink, MemoryStream};
pub use publisher::StreamPublisher;
pub use transport::{RecordAck, StreamRecord, StreamTransport};

/// Name of the reserved event time property (epoch milliseconds).
pub const TIME_FIELD: &str = "_time";

/// Failed-index list meaning every event was accepted.
pub const SUCCESSFUL_BATCH: &[usize] = &[];

/// One analytics event.
///
/// `properties` holds exactly one value per `schema` field, in schema order.
/// The encoder relies on that alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub project: String,
    pub collection: String,
    pub schema: Arc<[SchemaField]>,
    pub properties: Vec<Value>,
    /// The `_time` property, if the producer supplied one.
    pub time: Option<i64>,
}

impl Event {
    pub fn new(
        project: impl Into<String>,
        collection: impl Into<String>,
        schema: Arc<[SchemaField]>,
        properties: Vec<Value>,
        time: Option<i64>,
    ) -> Self {
        Self {
            project: project.into(),
            collection: collection.into(),
            schema,
            properties,
            time,
        }
    }

    /// Build an event from a JSON property object, ordering values by `schema`.
    ///
    /// Missing properties become nulls; `_time` is lifted out of the object.
    pub fn from_json_properties(
        project: impl Into<String>,
        collection: impl Into<String>,
        schema: Arc<[SchemaField]>,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<Self, EncodeError> {
        let values = schema
            .iter()
            .map(|field| {
                let json = properties.get(&field.name).unwrap_or(&serde_json::Value::Null);
                Value::from_json(json, field.field_type).ok_or_else(|| EncodeError::TypeMismatch {
                    expected: field.field_type,
                    value: json.to_string(),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let time = properties.get(TIME_FIELD).and_then(|t| t.as_i64());

        Ok(Self::new(project, collection, schema, values, time))
    }

    /// Stream routing key; keeps one collection's events ordered within a partition.
    pub fn partition_key(&self) -> String {
        format!("{}|{}", self.project, self.collection)
    }
}

/// Self-describing JSON form of an event, one per line in ingest files.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub project: String,
    pub collection: String,
    pub schema: Vec<SchemaField>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn into_event(self) -> std::result::Result<Event, EncodeError> {
        Event::from_json_properties(self.project, self.collection, self.schema.into(), &self.properties)
    }
}

/// Store-write contract shared by the stream publisher and the bulk loader.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store one event. Any failure is raised.
    async fn store(&self, event: &Event) -> Result<()>;

    /// Store a batch, returning positions (into `events`) of records that were
    /// rejected. An empty list means every event was accepted; callers retry or
    /// drop exactly those events, never the whole batch.
    async fn store_batch(&self, events: &[Event]) -> Result<Vec<usize>>;

    /// Load events through the direct bulk path.
    async fn store_bulk(&self, events: &[Event]) -> Result<()>;
}
