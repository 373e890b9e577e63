use analytics_dataplane::error::PipelineError;
use analytics_dataplane::ingestion::{
    BulkLoader, Event, EventStore, MemorySink, MemoryStream, RecordAck, StreamPublisher,
    SUCCESSFUL_BATCH,
};
use analytics_dataplane::types::wire;
use analytics_dataplane::{FieldType, PublisherConfig, SchemaField, Value};
use std::sync::Arc;

fn count_schema() -> Arc<[SchemaField]> {
    vec![SchemaField::new("count", FieldType::INTEGER)].into()
}

fn count_events(n: usize) -> Vec<Event> {
    let schema = count_schema();
    (0..n)
        .map(|i| Event::new("p", "pageview", schema.clone(), vec![Value::Integer(i as i32)], Some(0)))
        .collect()
}

fn publisher(stream: &Arc<MemoryStream>, sink: &Arc<MemorySink>, batch_size: usize) -> StreamPublisher {
    let config = PublisherConfig {
        batch_size,
        ..Default::default()
    };
    StreamPublisher::new(stream.clone(), Arc::new(BulkLoader::new(sink.clone())), config).unwrap()
}

#[tokio::test]
async fn test_count_event_travels_through_the_stream() {
    let stream = Arc::new(MemoryStream::with_stream("events", 1));
    let sink = Arc::new(MemorySink::new());
    let publisher = publisher(&stream, &sink, 500);

    let event = Event::new(
        "p",
        "pageview",
        count_schema(),
        vec![Value::Integer(42)],
        Some(1_700_000_000_000),
    );
    publisher.store(&event).await.unwrap();

    let stored = stream.partition("events", 0);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].partition_key, "p|pageview");

    let mut expected = vec![1u8];
    expected.extend_from_slice(&19675i32.to_le_bytes());
    expected.extend_from_slice(&42i32.to_le_bytes());
    assert_eq!(stored[0].data.as_ref(), expected.as_slice());

    let row = wire::decode_event_row(&stored[0].data, &count_schema()).unwrap();
    assert_eq!(row.day, 19675);
    assert_eq!(row.values, vec![Value::Integer(42)]);
}

#[tokio::test]
async fn test_call_count_is_ceiling_of_batch_limit() {
    let stream = Arc::new(MemoryStream::with_stream("events", 4));
    let sink = Arc::new(MemorySink::new());
    let publisher = publisher(&stream, &sink, 100);

    let failed = publisher.store_batch(&count_events(250)).await.unwrap();
    assert_eq!(failed, SUCCESSFUL_BATCH);
    assert_eq!(stream.put_records_calls(), vec![100, 100, 50]);
    assert_eq!(stream.record_count("events"), 250);
}

#[tokio::test]
async fn test_partial_failures_do_not_abort_later_chunks() {
    let stream = Arc::new(MemoryStream::with_stream("events", 2));
    stream.set_failure_hook(|call, index| {
        (call == 0 && index % 2 == 0).then(|| RecordAck::failure("ProvisionedThroughputExceeded", "Rate exceeded"))
    });
    let sink = Arc::new(MemorySink::new());
    let publisher = publisher(&stream, &sink, 4);

    let events = count_events(10);
    let failed = publisher.store_batch(&events).await.unwrap();
    assert_eq!(failed, vec![0, 2]);
    assert!(failed.iter().all(|&index| index < events.len()));
    assert_eq!(stream.put_records_calls(), vec![4, 4, 2]);
    assert_eq!(stream.record_count("events"), 8);
}

#[tokio::test]
async fn test_transport_limit_caps_chunk_size() {
    let stream = Arc::new(MemoryStream::with_stream("events", 1));
    let sink = Arc::new(MemorySink::new());
    let publisher = publisher(&stream, &sink, 2000);

    assert_eq!(publisher.chunk_size(), 500);
    publisher.store_batch(&count_events(1200)).await.unwrap();
    assert_eq!(stream.put_records_calls(), vec![500, 500, 200]);
}

#[tokio::test]
async fn test_concurrent_callers_provision_once() {
    let stream = Arc::new(MemoryStream::new());
    let sink = Arc::new(MemorySink::new());
    let publisher = Arc::new(publisher(&stream, &sink, 500));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.store_batch(&count_events(5)).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap().is_empty());
    }

    assert_eq!(stream.provision_calls(), 1);
    assert_eq!(stream.record_count("events"), 20);
}

#[tokio::test]
async fn test_store_bulk_bypasses_the_stream() {
    let stream = Arc::new(MemoryStream::with_stream("events", 1));
    let sink = Arc::new(MemorySink::new());
    let publisher = publisher(&stream, &sink, 500);

    publisher.store_bulk(&count_events(3)).await.unwrap();
    assert!(stream.put_records_calls().is_empty());
    assert_eq!(sink.row_count(), 3);
}

#[tokio::test]
async fn test_oversized_event_is_an_encoding_error() {
    let stream = Arc::new(MemoryStream::with_stream("events", 1));
    let sink = Arc::new(MemorySink::new());
    let config = PublisherConfig {
        buffer_capacity: 32,
        buffer_headroom: 0,
        ..Default::default()
    };
    let publisher =
        StreamPublisher::new(stream.clone(), Arc::new(BulkLoader::new(sink)), config).unwrap();

    let schema: Arc<[SchemaField]> = vec![SchemaField::new("payload", FieldType::STRING)].into();
    let event = Event::new("p", "c", schema, vec![Value::String("x".repeat(64))], None);

    let err = publisher.store_batch(&[event]).await.unwrap_err();
    assert!(matches!(err, PipelineError::Encode(_)));
    assert!(stream.put_records_calls().is_empty());
}
