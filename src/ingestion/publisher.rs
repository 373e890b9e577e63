//! Batch Stream Publisher
//!
//! Splits a batch into transport-sized chunks, encodes each event and publishes
//! every chunk in one call keyed by `project|collection`. Per-record rejections
//! come back as failed indices relative to the caller's input; they are never
//! retried here. A missing stream is created on demand and the same chunk is
//! replayed exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PublisherConfig;
use crate::error::{PipelineError, Result, TransportError};
use crate::ingestion::bulk::BulkLoader;
use crate::ingestion::encoder::BufferPool;
use crate::ingestion::transport::{RecordAck, StreamRecord, StreamTransport};
use crate::ingestion::{Event, EventStore};

/// Serializes stream creation per destination.
///
/// `generation` counts completed provisionings. A caller that saw a missing
/// stream under generation N skips creating it again if another caller already
/// moved the counter past N while it waited for the lock.
#[derive(Default)]
struct ProvisionSlot {
    lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

pub struct StreamPublisher {
    transport: Arc<dyn StreamTransport>,
    bulk: Arc<BulkLoader>,
    config: PublisherConfig,
    buffers: BufferPool,
    provisioning: DashMap<String, Arc<ProvisionSlot>>,
}

impl StreamPublisher {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        bulk: Arc<BulkLoader>,
        config: PublisherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let buffers = BufferPool::new(config.buffer_capacity, config.buffer_headroom);
        Ok(Self {
            transport,
            bulk,
            config,
            buffers,
            provisioning: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Events per publish call: the configured batch size, capped by the transport limit.
    pub fn chunk_size(&self) -> usize {
        self.config
            .batch_size
            .min(self.transport.max_records_per_call())
            .max(1)
    }

    fn slot(&self, stream: &str) -> Arc<ProvisionSlot> {
        self.provisioning
            .entry(stream.to_string())
            .or_insert_with(Default::default)
            .clone()
    }

    /// Encode `events` into owned transport records.
    fn encode_records(&self, events: &[Event]) -> Result<Vec<StreamRecord>> {
        let mut buffer = self.buffers.checkout();
        let encoded = events
            .iter()
            .map(|event| -> Result<StreamRecord> {
                let bytes = buffer.encode(event)?;
                Ok(StreamRecord {
                    partition_key: event.partition_key(),
                    data: Bytes::copy_from_slice(bytes),
                })
            })
            .collect::<Result<Vec<_>>>();
        self.buffers.checkin(buffer);
        encoded
    }

    fn encode_record(&self, event: &Event) -> Result<StreamRecord> {
        let mut buffer = self.buffers.checkout();
        let record = buffer.encode(event).map(|bytes| StreamRecord {
            partition_key: event.partition_key(),
            data: Bytes::copy_from_slice(bytes),
        });
        self.buffers.checkin(buffer);
        Ok(record?)
    }

    async fn provision(&self, stream: &str, observed_generation: u64) -> Result<()> {
        let slot = self.slot(stream);
        let _guard = slot.lock.lock().await;

        if slot.generation.load(Ordering::Acquire) != observed_generation {
            debug!("Stream {} was provisioned by a concurrent caller", stream);
            return Ok(());
        }

        info!(
            "Stream {} not found, creating it with {} partitions",
            stream, self.config.min_partitions
        );
        self.transport
            .create_and_wait_until_ready(stream, self.config.min_partitions)
            .await
            .map_err(|e| PipelineError::Provisioning {
                stream: stream.to_string(),
                reason: e.to_string(),
            })?;
        slot.generation.fetch_add(1, Ordering::AcqRel);
        info!("Stream {} is ready", stream);
        Ok(())
    }

    /// Run `send`, provisioning the stream and replaying once if it is missing.
    async fn send_with_recovery<R, F, Fut>(&self, mut send: F) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<R, TransportError>>,
    {
        let stream = self.config.stream_name.as_str();
        let generation = self.slot(stream).generation.load(Ordering::Acquire);

        match send().await {
            Ok(response) => Ok(response),
            Err(TransportError::ResourceNotFound(_)) => {
                self.provision(stream, generation).await?;
                match send().await {
                    Ok(response) => Ok(response),
                    Err(TransportError::ResourceNotFound(_)) => Err(PipelineError::StreamUnavailable {
                        stream: stream.to_string(),
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Publish one chunk; returns chunk-local indices of rejected records.
    async fn publish_chunk(&self, chunk: &[Event]) -> Result<Vec<usize>> {
        let records = self.encode_records(chunk)?;
        let stream = self.config.stream_name.as_str();

        let acks = self
            .send_with_recovery(|| self.transport.put_records(stream, records.clone()))
            .await?;

        Ok(collect_failures(stream, chunk.len(), &acks))
    }
}

/// Indices of failed acks. Missing acks count as failures.
fn collect_failures(stream: &str, expected: usize, acks: &[RecordAck]) -> Vec<usize> {
    let mut failed = Vec::new();
    let mut errors: HashMap<&str, usize> = HashMap::new();

    for index in 0..expected {
        match acks.get(index) {
            Some(ack) if !ack.is_failure() => {}
            Some(ack) => {
                failed.push(index);
                let reason = ack
                    .error_message
                    .as_deref()
                    .or(ack.error_code.as_deref())
                    .unwrap_or("unknown");
                *errors.entry(reason).or_insert(0) += 1;
            }
            None => {
                failed.push(index);
                *errors.entry("missing acknowledgement").or_insert(0) += 1;
            }
        }
    }

    if !failed.is_empty() {
        warn!(
            "Error in stream {} publish: {} of {} records failed: {:?}",
            stream,
            failed.len(),
            expected,
            errors
        );
    }
    failed
}

#[async_trait]
impl EventStore for StreamPublisher {
    async fn store(&self, event: &Event) -> Result<()> {
        let record = self.encode_record(event)?;
        let stream = self.config.stream_name.as_str();

        let ack = self
            .send_with_recovery(|| self.transport.put_record(stream, record.clone()))
            .await?;

        match ack.error_code {
            Some(code) => Err(PipelineError::RecordRejected {
                stream: stream.to_string(),
                code,
                message: ack.error_message.unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    async fn store_batch(&self, events: &[Event]) -> Result<Vec<usize>> {
        let chunk_size = self.chunk_size();
        let mut failed = Vec::new();

        for (chunk_index, chunk) in events.chunks(chunk_size).enumerate() {
            let offset = chunk_index * chunk_size;
            let chunk_failed = self.publish_chunk(chunk).await?;
            failed.extend(chunk_failed.into_iter().map(|index| index + offset));
        }

        debug!(
            "Published {} events to {} ({} failed)",
            events.len(),
            self.config.stream_name,
            failed.len()
        );
        Ok(failed)
    }

    async fn store_bulk(&self, events: &[Event]) -> Result<()> {
        self.bulk.store_bulk(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::memory::{MemorySink, MemoryStream};
    use crate::types::{FieldType, SchemaField, Value};

    fn events(n: usize) -> Vec<Event> {
        let schema: Arc<[SchemaField]> = vec![SchemaField::new("n", FieldType::LONG)].into();
        (0..n)
            .map(|i| Event::new("p", "c", schema.clone(), vec![Value::Long(i as i64)], Some(0)))
            .collect()
    }

    fn publisher(stream: Arc<MemoryStream>, batch_size: usize) -> StreamPublisher {
        let bulk = Arc::new(BulkLoader::new(Arc::new(MemorySink::new())));
        let config = PublisherConfig {
            batch_size,
            ..Default::default()
        };
        StreamPublisher::new(stream, bulk, config).unwrap()
    }

    #[tokio::test]
    async fn test_small_batch_is_one_call() {
        let stream = Arc::new(MemoryStream::with_stream("events", 2));
        let publisher = publisher(stream.clone(), 500);

        let failed = publisher.store_batch(&events(20)).await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(stream.put_records_calls(), vec![20]);
    }

    #[tokio::test]
    async fn test_chunk_failures_are_offset() {
        let stream = Arc::new(MemoryStream::with_stream("events", 1));
        stream.set_failure_hook(|call, index| {
            (call == 1 && index == 3).then(|| RecordAck::failure("Throttled", "Rate exceeded"))
        });
        let publisher = publisher(stream.clone(), 500);

        let failed = publisher.store_batch(&events(1200)).await.unwrap();
        assert_eq!(stream.put_records_calls(), vec![500, 500, 200]);
        assert_eq!(failed, vec![503]);
    }

    #[tokio::test]
    async fn test_missing_stream_is_provisioned_once() {
        let stream = Arc::new(MemoryStream::new());
        let publisher = publisher(stream.clone(), 500);

        let failed = publisher.store_batch(&events(3)).await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(stream.provision_calls(), 1);
        assert_eq!(stream.put_records_calls(), vec![3, 3]);
        assert_eq!(stream.record_count("events"), 3);
    }

    #[tokio::test]
    async fn test_second_missing_stream_is_fatal() {
        let stream = Arc::new(MemoryStream::new());
        stream.set_ignore_creates(true);
        let publisher = publisher(stream.clone(), 500);

        let err = publisher.store_batch(&events(3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::StreamUnavailable { .. }));
        assert_eq!(stream.provision_calls(), 1);
        assert_eq!(stream.put_records_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal() {
        let stream = Arc::new(MemoryStream::new());
        stream.set_provisioning_error(Some("LimitExceeded".to_string()));
        let publisher = publisher(stream.clone(), 500);

        let err = publisher.store(&events(1)[0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Provisioning { .. }));
    }

    #[tokio::test]
    async fn test_single_store_recovers_and_replays() {
        let stream = Arc::new(MemoryStream::new());
        let publisher = publisher(stream.clone(), 500);

        publisher.store(&events(1)[0]).await.unwrap();
        assert_eq!(stream.provision_calls(), 1);
        assert_eq!(stream.put_record_calls(), 2);
        assert_eq!(stream.record_count("events"), 1);
    }

    #[tokio::test]
    async fn test_single_store_rejection_is_raised() {
        let stream = Arc::new(MemoryStream::with_stream("events", 1));
        stream.set_failure_hook(|_, _| Some(RecordAck::failure("InternalFailure", "boom")));
        let publisher = publisher(stream, 500);

        let err = publisher.store(&events(1)[0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecordRejected { code, .. } if code == "InternalFailure"));
    }

    #[test]
    fn test_missing_acks_count_as_failures() {
        let acks = vec![RecordAck::success(0, "0")];
        assert_eq!(collect_failures("events", 3, &acks), vec![1, 2]);
    }
}
