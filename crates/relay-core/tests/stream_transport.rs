//! End-to-end tests over real TCP sockets on localhost.
//!
//! Validates:
//! - queued samples reach the backpressure queue through the stream server
//!   and the ingestion reader, in order
//! - an unserved kind is refused and the reader reports a handshake failure
//! - stopping the stream server ends the reader cleanly
//! - a full chain delivers records to storage and to a TCP viewer

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use relay_common::{
    PipelineName, PipelineRecord, RawTelemetry, SampleValue, StreamKind, TemperatureReading,
};
use relay_config::{PayloadConflictPolicy, RelayConfig, StreamConfig};
use relay_core::{
    connect_upstream, BackpressureQueue, IngestionReader, Normalizer, Pipeline, ReaderExit,
    RelayMetrics, SampleQueue, StreamServer, StreamSource, TransportError, ViewerServer,
};
use relay_telemetry::{MemoryLoader, MemoryTables};

// ============================================================================
// Helpers
// ============================================================================

async fn start_stream_server(sources: Vec<StreamSource>) -> (String, CancellationToken) {
    let mut server = StreamServer::new(StreamConfig::default());
    for source in sources {
        server.add_source(source);
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::new(server).serve(listener, shutdown.clone()));
    (addr, shutdown)
}

fn reader_for(kind: StreamKind) -> (Arc<IngestionReader>, Arc<BackpressureQueue>) {
    let metrics = RelayMetrics::new().expect("metrics");
    let name = PipelineName::for_kind(kind);
    let queue = Arc::new(BackpressureQueue::new(name.clone()));
    let reader = IngestionReader::new(
        Normalizer::new(kind, PayloadConflictPolicy::Reject),
        Arc::clone(&queue),
        metrics.ingest(&name),
    );
    (Arc::new(reader), queue)
}

async fn wait_for_depth(queue: &BackpressureQueue, depth: usize) {
    for _ in 0..400 {
        if queue.depth() >= depth {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected depth {depth}, have {}", queue.depth());
}

fn reading(sensor: &str, seq: i64) -> RawTelemetry {
    RawTelemetry {
        temperature: Some(TemperatureReading {
            sensor_id: Some(sensor.to_string()),
            subsystem: Some("engine".to_string()),
            temperature: Some(71.25),
            unit: Some("celsius".to_string()),
            status_bitmask: Some(0),
            sequence_number: Some(seq),
        }),
        ..Default::default()
    }
}

// ============================================================================
// Stream server → reader
// ============================================================================

#[tokio::test]
async fn test_metric_samples_reach_backpressure_queue_in_order() {
    let samples = Arc::new(SampleQueue::new(StreamKind::Kpm, 10));
    for v in [12i64, 40, 7] {
        samples.put(SampleValue::Int(v));
    }
    let (addr, server_stop) = start_stream_server(vec![StreamSource::Metric(samples)]).await;

    let upstream = connect_upstream(&addr, StreamKind::Kpm).await.expect("connect");
    let (reader, queue) = reader_for(StreamKind::Kpm);
    let stop = CancellationToken::new();
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move { reader.run(upstream, stop).await })
    };

    wait_for_depth(&queue, 3).await;
    let vals: Vec<SampleValue> = std::iter::from_fn(|| queue.try_pop())
        .map(|entry| match PipelineRecord::decode(StreamKind::Kpm, &entry).expect("decode") {
            PipelineRecord::Metric(record) => {
                assert_eq!(record.metric_type, StreamKind::Kpm);
                record.val
            }
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert_eq!(
        vals,
        vec![SampleValue::Int(12), SampleValue::Int(40), SampleValue::Int(7)]
    );

    stop.cancel();
    let exit = task.await.expect("reader task");
    assert!(matches!(exit, ReaderExit::Cancelled { messages: 3 }), "{exit:?}");
    server_stop.cancel();
}

#[tokio::test]
async fn test_unserved_kind_is_a_handshake_failure() {
    let samples = Arc::new(SampleQueue::new(StreamKind::Kpm, 10));
    let (addr, server_stop) = start_stream_server(vec![StreamSource::Metric(samples)]).await;

    let upstream = connect_upstream(&addr, StreamKind::Title).await.expect("connect");
    let (reader, queue) = reader_for(StreamKind::Title);
    let exit = reader.run(upstream, CancellationToken::new()).await;

    match exit {
        ReaderExit::TransportFailed {
            messages: 0,
            error: TransportError::Handshake(reason),
        } => assert!(reason.contains("title"), "{reason}"),
        other => panic!("unexpected exit {other:?}"),
    }
    assert_eq!(queue.depth(), 0);
    server_stop.cancel();
}

#[tokio::test]
async fn test_server_shutdown_closes_reader() {
    let samples = Arc::new(SampleQueue::new(StreamKind::Telemetry, 10));
    samples.put(reading("TEMP_ENG_001", 1));
    let (addr, server_stop) =
        start_stream_server(vec![StreamSource::Telemetry(Arc::clone(&samples))]).await;

    let upstream = connect_upstream(&addr, StreamKind::Telemetry).await.expect("connect");
    let (reader, queue) = reader_for(StreamKind::Telemetry);
    let task = {
        let reader = Arc::clone(&reader);
        tokio::spawn(async move { reader.run(upstream, CancellationToken::new()).await })
    };
    wait_for_depth(&queue, 1).await;

    server_stop.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("reader ended")
        .expect("reader task");
    assert!(matches!(exit, ReaderExit::UpstreamClosed { messages: 1 }), "{exit:?}");

    // The producer side keeps accepting after its consumer went away.
    samples.put(reading("TEMP_ENG_001", 2));
    assert_eq!(samples.len(), 1);
}

// ============================================================================
// Full chain
// ============================================================================

#[tokio::test]
async fn test_full_chain_reaches_storage_and_viewer() {
    let samples = Arc::new(SampleQueue::new(StreamKind::Telemetry, 10));
    for seq in 1..=3 {
        samples.put(reading("TEMP_ENG_001", seq));
    }
    let (stream_addr, stream_stop) =
        start_stream_server(vec![StreamSource::Telemetry(Arc::clone(&samples))]).await;

    let config = RelayConfig::default();
    let metrics = RelayMetrics::new().expect("metrics");
    let tables = MemoryTables::new();
    let pipeline = Pipeline::new(
        StreamKind::Telemetry,
        &config,
        Box::new(MemoryLoader::new(tables.clone())),
        &metrics,
    );
    let broadcaster = Arc::clone(pipeline.broadcaster());

    let mut viewers = ViewerServer::new(config.viewer.session_buffer);
    viewers.add_pipeline(StreamKind::Telemetry, Arc::clone(&broadcaster));
    let viewer_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let viewer_addr = viewer_listener.local_addr().expect("addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::new(viewers).serve(viewer_listener, shutdown.clone()));

    let viewer = TcpStream::connect(viewer_addr).await.expect("viewer connect");
    let (viewer_read, mut viewer_write) = viewer.into_split();
    viewer_write
        .write_all(b"{\"pipeline\":\"telemetry\",\"client_id\":\"wall\"}\n")
        .await
        .expect("viewer handshake");
    for _ in 0..400 {
        if broadcaster.session_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(broadcaster.session_count(), 1);

    let upstream = connect_upstream(&stream_addr, StreamKind::Telemetry)
        .await
        .expect("connect");
    let handle = pipeline.start(upstream, &shutdown);

    let mut lines = BufReader::new(viewer_read).lines();
    for seq in 1..=3 {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("relayed in time")
            .expect("read")
            .expect("line");
        let relayed: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(relayed["telemetry_type"], "TEMPERATURE");
        assert_eq!(relayed["sensor_id"], "TEMP_ENG_001");
        assert_eq!(relayed["sequence_number"], seq);
        assert!(relayed["pressure"].is_null());
    }

    let report = handle.stop().await;
    assert_eq!(report.final_flush.rows, 3);
    assert_eq!(tables.row_count("telemetry_data"), 3);
    shutdown.cancel();
    stream_stop.cancel();
}
