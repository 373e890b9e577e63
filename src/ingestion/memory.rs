//! In-process transport and bulk sink
//!
//! Used by the CLI when no external stream is configured and by tests that need
//! to script transport behaviour: rejected records, missing streams, failed
//! provisioning.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::ingestion::bulk::{BulkBatch, BulkSink};
use crate::ingestion::transport::{RecordAck, StreamRecord, StreamTransport};

type FailureHook = Box<dyn Fn(usize, usize) -> Option<RecordAck> + Send + Sync>;

#[derive(Debug, Default)]
struct StoredStream {
    partitions: Vec<Vec<StreamRecord>>,
}

impl StoredStream {
    fn with_partitions(count: u32) -> Self {
        Self {
            partitions: (0..count.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    fn append(&mut self, record: StreamRecord) -> RecordAck {
        let mut hasher = DefaultHasher::new();
        record.partition_key.hash(&mut hasher);
        let partition = (hasher.finish() % self.partitions.len() as u64) as usize;
        let sequence = self.partitions[partition].len();
        self.partitions[partition].push(record);
        RecordAck::success(partition as u32, sequence.to_string())
    }

    fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }
}

/// Partitioned stream kept in memory.
#[derive(Default)]
pub struct MemoryStream {
    streams: Mutex<HashMap<String, StoredStream>>,
    failure_hook: Mutex<Option<FailureHook>>,
    put_records_calls: Mutex<Vec<usize>>,
    put_record_calls: AtomicUsize,
    provision_calls: AtomicUsize,
    ignore_creates: AtomicBool,
    provisioning_error: Mutex<Option<String>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `name` already provisioned.
    pub fn with_stream(name: &str, partitions: u32) -> Self {
        let transport = Self::default();
        transport
            .streams
            .lock()
            .insert(name.to_string(), StoredStream::with_partitions(partitions));
        transport
    }

    /// Decide per record whether it is rejected. Arguments are the 0-based
    /// `put_records` call number and the record index within that call;
    /// `put_record` calls are numbered separately.
    pub fn set_failure_hook<F>(&self, hook: F)
    where
        F: Fn(usize, usize) -> Option<RecordAck> + Send + Sync + 'static,
    {
        *self.failure_hook.lock() = Some(Box::new(hook));
    }

    /// Creation calls succeed but leave the stream missing.
    pub fn set_ignore_creates(&self, ignore: bool) {
        self.ignore_creates.store(ignore, Ordering::SeqCst);
    }

    pub fn set_provisioning_error(&self, error: Option<String>) {
        *self.provisioning_error.lock() = error;
    }

    /// Size of every `put_records` call, including ones that hit a missing stream.
    pub fn put_records_calls(&self) -> Vec<usize> {
        self.put_records_calls.lock().clone()
    }

    pub fn put_record_calls(&self) -> usize {
        self.put_record_calls.load(Ordering::SeqCst)
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn record_count(&self, stream: &str) -> usize {
        self.streams.lock().get(stream).map(StoredStream::len).unwrap_or(0)
    }

    /// Stored records of one partition, in sequence order.
    pub fn partition(&self, stream: &str, partition: usize) -> Vec<StreamRecord> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.partitions.get(partition).cloned())
            .unwrap_or_default()
    }

    fn rejection(&self, call: usize, index: usize) -> Option<RecordAck> {
        self.failure_hook.lock().as_ref().and_then(|hook| hook(call, index))
    }
}

#[async_trait]
impl StreamTransport for MemoryStream {
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<StreamRecord>,
    ) -> std::result::Result<Vec<RecordAck>, TransportError> {
        let call = {
            let mut calls = self.put_records_calls.lock();
            calls.push(records.len());
            calls.len() - 1
        };

        let mut streams = self.streams.lock();
        let target = streams
            .get_mut(stream)
            .ok_or_else(|| TransportError::ResourceNotFound(stream.to_string()))?;

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(index, record)| match self.rejection(call, index) {
                Some(ack) => ack,
                None => target.append(record),
            })
            .collect())
    }

    async fn put_record(
        &self,
        stream: &str,
        record: StreamRecord,
    ) -> std::result::Result<RecordAck, TransportError> {
        let call = self.put_record_calls.fetch_add(1, Ordering::SeqCst);

        let mut streams = self.streams.lock();
        let target = streams
            .get_mut(stream)
            .ok_or_else(|| TransportError::ResourceNotFound(stream.to_string()))?;

        Ok(self.rejection(call, 0).unwrap_or_else(|| target.append(record)))
    }

    async fn create_and_wait_until_ready(
        &self,
        stream: &str,
        min_partitions: u32,
    ) -> std::result::Result<(), TransportError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.provisioning_error.lock().clone() {
            return Err(TransportError::Provisioning(reason));
        }
        if self.ignore_creates.load(Ordering::SeqCst) {
            debug!("Ignoring creation of stream {}", stream);
            return Ok(());
        }

        self.streams
            .lock()
            .entry(stream.to_string())
            .or_insert_with(|| StoredStream::with_partitions(min_partitions));
        Ok(())
    }
}

/// Bulk sink that keeps every loaded batch.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<BulkBatch>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BulkBatch> {
        self.batches.lock().clone()
    }

    pub fn row_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.rows).sum()
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn load(&self, batch: BulkBatch) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}
