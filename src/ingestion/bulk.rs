//! Bulk Loader - direct path into the columnar store for backfills
//!
//! Events are grouped per `project|collection` and schema, encoded with the same
//! wire format the stream carries, and handed to a [`BulkSink`] as one body per
//! group. The stream is never involved.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::ingestion::{Event, EventStore};
use crate::types::{wire, SchemaField};

/// Rows for one destination table, encoded back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkBatch {
    pub project: String,
    pub collection: String,
    pub schema: Arc<[SchemaField]>,
    pub rows: usize,
    pub body: Bytes,
}

/// Destination of the direct load path.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn load(&self, batch: BulkBatch) -> Result<()>;
}

pub struct BulkLoader {
    sink: Arc<dyn BulkSink>,
}

impl BulkLoader {
    pub fn new(sink: Arc<dyn BulkSink>) -> Self {
        Self { sink }
    }

    /// Group and encode events. Order within a group follows input order.
    pub fn build_batches(events: &[Event]) -> Result<Vec<BulkBatch>> {
        struct Pending {
            project: String,
            collection: String,
            schema: Arc<[SchemaField]>,
            rows: usize,
            body: BytesMut,
        }

        let mut pending: Vec<Pending> = Vec::new();
        let mut open: HashMap<(&str, &str), usize> = HashMap::new();

        for event in events {
            let key = (event.project.as_str(), event.collection.as_str());
            let index = match open.get(&key) {
                Some(&index) if pending[index].schema == event.schema => index,
                _ => {
                    pending.push(Pending {
                        project: event.project.clone(),
                        collection: event.collection.clone(),
                        schema: event.schema.clone(),
                        rows: 0,
                        body: BytesMut::new(),
                    });
                    open.insert(key, pending.len() - 1);
                    pending.len() - 1
                }
            };

            let group = &mut pending[index];
            wire::write_row(&mut group.body, &event.schema, &event.properties, event.time)?;
            group.rows += 1;
        }

        Ok(pending
            .into_iter()
            .map(|p| BulkBatch {
                project: p.project,
                collection: p.collection,
                schema: p.schema,
                rows: p.rows,
                body: p.body.freeze(),
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for BulkLoader {
    async fn store(&self, event: &Event) -> Result<()> {
        self.store_bulk(std::slice::from_ref(event)).await
    }

    /// The bulk path has no per-record outcome: it either loads everything or fails.
    async fn store_batch(&self, events: &[Event]) -> Result<Vec<usize>> {
        self.store_bulk(events).await?;
        Ok(Vec::new())
    }

    async fn store_bulk(&self, events: &[Event]) -> Result<()> {
        let batches = Self::build_batches(events)?;
        for batch in batches {
            let table = format!("{}.{}", batch.project, batch.collection);
            let rows = batch.rows;
            self.sink
                .load(batch)
                .await
                .map_err(|e| PipelineError::BulkLoad(format!("{}: {}", table, e)))?;
            info!("Bulk loaded {} rows into {}", rows, table);
        }
        Ok(())
    }
}
