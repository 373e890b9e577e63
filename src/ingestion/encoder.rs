//! Binary Event Encoder
//!
//! Encodes events into a caller-owned [`EncodeBuffer`]. Records are laid out
//! back to back inside one window; when a record does not fit the write position
//! rewinds to the start of the window, at most once per call.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::EncodeError;
use crate::ingestion::Event;
use crate::types::wire;

/// Default window size in bytes.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// Once fewer bytes than this remain after a write, the next record starts at offset 0.
pub const DEFAULT_HEADROOM: usize = 1000;

const MAX_REWINDS: usize = 1;

/// Reusable encode target. One per worker; never shared.
///
/// The slice returned by [`EncodeBuffer::encode`] borrows the buffer, so it has
/// to be consumed (copied or handed to I/O) before the next encode.
#[derive(Debug)]
pub struct EncodeBuffer {
    data: Vec<u8>,
    position: usize,
    capacity: usize,
    headroom: usize,
}

impl EncodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_HEADROOM)
    }

    /// `capacity` bounds the window; backing memory grows on demand up to it.
    pub fn with_capacity(capacity: usize, headroom: usize) -> Self {
        Self {
            data: Vec::new(),
            position: 0,
            capacity,
            headroom: headroom.min(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encode one event and return its bytes.
    ///
    /// Fails with [`EncodeError::BufferTooSmall`] when the record does not fit
    /// even after rewinding, and with a type error for a malformed value.
    pub fn encode(&mut self, event: &Event) -> Result<&[u8], EncodeError> {
        let required = wire::row_len(&event.schema, &event.properties, event.time)?;

        let mut rewinds = 0;
        while self.position + required > self.capacity {
            if rewinds == MAX_REWINDS || required > self.capacity {
                return Err(EncodeError::BufferTooSmall {
                    required,
                    capacity: self.capacity,
                });
            }
            debug!(
                "Rewinding encode buffer at {} of {} bytes for a {} byte record",
                self.position, self.capacity, required
            );
            self.position = 0;
            rewinds += 1;
        }

        let start = self.position;
        let end = start + required;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }

        let mut window = &mut self.data[start..end];
        wire::write_row(&mut window, &event.schema, &event.properties, event.time)?;

        self.position = end;
        if self.capacity - self.position < self.headroom {
            self.position = 0;
        }

        Ok(&self.data[start..end])
    }
}

impl Default for EncodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out exclusive buffers to concurrent callers.
///
/// A buffer is checked out for the duration of one call and returned afterwards,
/// so encoding itself never contends on a lock.
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<EncodeBuffer>>,
    capacity: usize,
    headroom: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, headroom: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            headroom,
        }
    }

    pub fn checkout(&self) -> EncodeBuffer {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| EncodeBuffer::with_capacity(self.capacity, self.headroom))
    }

    pub fn checkin(&self, buffer: EncodeBuffer) {
        self.idle.lock().push(buffer);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, SchemaField, Value};
    use std::sync::Arc;

    fn string_event(len: usize) -> Event {
        let schema: Arc<[SchemaField]> = vec![SchemaField::new("payload", FieldType::STRING)].into();
        Event::new("p", "c", schema, vec![Value::String("x".repeat(len))], Some(0))
    }

    #[test]
    fn test_records_are_laid_out_back_to_back() {
        let mut buffer = EncodeBuffer::with_capacity(4096, 16);
        let first = buffer.encode(&string_event(10)).unwrap().to_vec();
        assert_eq!(buffer.position(), first.len());
        let second_len = buffer.encode(&string_event(10)).unwrap().len();
        assert_eq!(buffer.position(), first.len() + second_len);
    }

    #[test]
    fn test_rewinds_once_when_window_is_full() {
        // Each record: varint(1) + 4-byte date + varint(40) + 40 bytes = 46 bytes.
        let mut buffer = EncodeBuffer::with_capacity(100, 0);
        buffer.encode(&string_event(40)).unwrap();
        buffer.encode(&string_event(40)).unwrap();
        assert_eq!(buffer.position(), 92);

        let bytes = buffer.encode(&string_event(40)).unwrap().to_vec();
        assert_eq!(bytes.len(), 46);
        assert_eq!(buffer.position(), 46);
    }

    #[test]
    fn test_oversized_record_is_fatal() {
        let mut buffer = EncodeBuffer::with_capacity(64, 0);
        let err = buffer.encode(&string_event(200)).unwrap_err();
        assert_eq!(
            err,
            EncodeError::BufferTooSmall {
                required: 207,
                capacity: 64
            }
        );
    }

    #[test]
    fn test_low_headroom_resets_position() {
        let mut buffer = EncodeBuffer::with_capacity(100, 60);
        buffer.encode(&string_event(40)).unwrap();
        assert_eq!(buffer.position(), 0);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(1024, 16);
        let buffer = pool.checkout();
        assert_eq!(pool.idle_count(), 0);
        pool.checkin(buffer);
        assert_eq!(pool.idle_count(), 1);
        let _again = pool.checkout();
        assert_eq!(pool.idle_count(), 0);
    }
}
