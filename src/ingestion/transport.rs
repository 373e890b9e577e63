//! Streaming Transport - the partitioned publish API the publisher writes to

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// One record of a publish call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub partition_key: String,
    pub data: Bytes,
}

/// Per-record acknowledgement. A record failed iff `error_code` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordAck {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub partition: Option<u32>,
    pub sequence_number: Option<String>,
}

impl RecordAck {
    pub fn success(partition: u32, sequence_number: impl Into<String>) -> Self {
        Self {
            partition: Some(partition),
            sequence_number: Some(sequence_number.into()),
            ..Default::default()
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Partitioned streaming transport.
///
/// Calls complete only once the transport has acknowledged them. A missing
/// destination is reported as [`TransportError::ResourceNotFound`].
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Largest number of records accepted by one `put_records` call.
    fn max_records_per_call(&self) -> usize {
        500
    }

    /// Publish a batch. The returned acks line up with `records`.
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<StreamRecord>,
    ) -> Result<Vec<RecordAck>, TransportError>;

    /// Publish a single record.
    async fn put_record(&self, stream: &str, record: StreamRecord) -> Result<RecordAck, TransportError>;

    /// Create `stream` and block until it accepts writes.
    async fn create_and_wait_until_ready(
        &self,
        stream: &str,
        min_partitions: u32,
    ) -> Result<(), TransportError>;
}
