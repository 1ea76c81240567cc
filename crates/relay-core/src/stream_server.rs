//! Per-kind stream server.
//!
//! For each connected consumer the server drains that kind's
//! [`SampleQueue`] for as long as the session stays open:
//! - a sample that is available is forwarded immediately
//! - an empty queue is re-checked after the kind's idle poll interval
//! - liveness is checked before every drain attempt
//!
//! Consumers going away never affects the queue; producers keep writing and
//! drop-oldest bounds it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_common::sample::format_timestamp;
use relay_common::{Error, MetricMessage, RawTelemetry, Sample, SampleValue, StreamKind};
use relay_config::StreamConfig;

use crate::sample_queue::SampleQueue;
use crate::upstream::{refuse, write_line, StreamHandshake, TransportError};

/// Outbound frames buffered per consumer before the drain loop waits.
///
/// Samples stay in the drop-oldest queue while a consumer is slow.
const SESSION_FRAME_BUFFER: usize = 1;

/// A queue the server can stream from.
#[derive(Clone)]
pub enum StreamSource {
    Telemetry(Arc<SampleQueue<RawTelemetry>>),
    Metric(Arc<SampleQueue<SampleValue>>),
}

impl StreamSource {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamSource::Telemetry(q) => q.kind(),
            StreamSource::Metric(q) => q.kind(),
        }
    }

    /// Pop the oldest sample and encode it as a wire frame.
    ///
    /// `None` when the queue is empty.
    pub fn next_frame(&self) -> Option<Result<String, Error>> {
        match self {
            StreamSource::Telemetry(q) => q.get().map(encode_telemetry),
            StreamSource::Metric(q) => q.get().map(|sample| {
                let msg = MetricMessage::from_sample(q.kind(), &sample)?;
                Ok(serde_json::to_string(&msg)?)
            }),
        }
    }
}

fn encode_telemetry(sample: Sample<RawTelemetry>) -> Result<String, Error> {
    let mut frame = sample.value;
    if frame.timestamp.is_none() {
        frame.timestamp = Some(format_timestamp(&sample.timestamp));
    }
    Ok(serde_json::to_string(&frame)?)
}

/// Serves sample queues to remote stream consumers.
pub struct StreamServer {
    sources: BTreeMap<StreamKind, StreamSource>,
    config: StreamConfig,
}

impl StreamServer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            sources: BTreeMap::new(),
            config,
        }
    }

    /// Register a queue. A later source for the same kind replaces the earlier one.
    pub fn add_source(&mut self, source: StreamSource) {
        self.sources.insert(source.kind(), source);
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        self.sources.keys().copied().collect()
    }

    pub fn idle_poll(&self, kind: StreamKind) -> Duration {
        self.config.idle_poll(kind)
    }

    /// Drain `kind`'s queue into `session` until the session closes.
    ///
    /// Returns the number of frames forwarded.
    pub async fn drain_session(
        &self,
        kind: StreamKind,
        session: mpsc::Sender<String>,
    ) -> Result<u64, Error> {
        let source = self
            .sources
            .get(&kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        let idle = self.idle_poll(kind);
        let mut forwarded = 0u64;

        loop {
            let Ok(permit) = session.reserve().await else {
                break;
            };
            match source.next_frame() {
                Some(Ok(frame)) => {
                    permit.send(frame);
                    forwarded += 1;
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "dropping sample that cannot be framed");
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = session.closed() => break,
                    }
                }
            }
        }

        debug!(kind = %kind, forwarded, "stream session drained");
        Ok(forwarded)
    }

    /// Accept consumers until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, kinds = ?self.kinds(), "stream server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "stream server accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        match server.handle_consumer(stream, shutdown).await {
                            Ok(forwarded) => debug!(peer = %peer, forwarded, "stream consumer left"),
                            Err(e) => warn!(peer = %peer, error = %e, "stream session failed"),
                        }
                    });
                }
            }
        }
        info!("stream server stopped");
        Ok(())
    }

    async fn handle_consumer(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<u64, TransportError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let Some(line) = lines.next_line().await? else {
            return Err(TransportError::Handshake(
                "connection closed before handshake".to_string(),
            ));
        };
        let kind = match serde_json::from_str::<StreamHandshake>(&line) {
            Ok(h) if self.sources.contains_key(&h.kind) => h.kind,
            Ok(h) => return Err(refuse(&mut write_half, format!("kind {} is not served", h.kind)).await),
            Err(e) => return Err(refuse(&mut write_half, format!("bad handshake: {}", e)).await),
        };
        info!(kind = %kind, "stream consumer connected");

        let (tx, mut rx) = mpsc::channel::<String>(SESSION_FRAME_BUFFER);
        let pump = async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => write_line(&mut write_half, &frame).await?,
                        None => break,
                    },
                    inbound = lines.next_line() => match inbound {
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            Ok::<(), std::io::Error>(())
        };

        let (drained, pumped) = tokio::join!(self.drain_session(kind, tx), pump);
        pumped?;
        drained.map_err(|e| TransportError::Handshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tokio::time::Instant;

    fn server_with(kind: StreamKind, idle_ms: u64) -> (StreamServer, Arc<SampleQueue>) {
        let config = StreamConfig {
            idle_poll_ms: Map::from([(kind.to_string(), idle_ms)]),
            ..Default::default()
        };
        let queue = Arc::new(SampleQueue::new(kind, 10));
        let mut server = StreamServer::new(config);
        server.add_source(StreamSource::Metric(Arc::clone(&queue)));
        (server, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_samples_forward_immediately() {
        let (server, queue) = server_with(StreamKind::Kpm, 20_000);
        queue.put(SampleValue::Int(3));
        queue.put(SampleValue::Int(4));
        let server = Arc::new(server);

        let (tx, mut rx) = mpsc::channel(8);
        let s = Arc::clone(&server);
        let task = tokio::spawn(async move { s.drain_session(StreamKind::Kpm, tx).await });

        let start = Instant::now();
        let first: MetricMessage = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        let second: MetricMessage = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(first.kpm, Some(3));
        assert_eq!(second.kpm, Some(4));

        drop(rx);
        assert_eq!(task.await.expect("join").expect("drain"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_waits_idle_interval_per_kind() {
        for (kind, idle_ms) in [(StreamKind::Kpm, 20_000u64), (StreamKind::Pxm, 500)] {
            let (server, queue) = server_with(kind, idle_ms);
            let server = Arc::new(server);
            let (tx, mut rx) = mpsc::channel(8);
            let s = Arc::clone(&server);
            let task = tokio::spawn(async move { s.drain_session(kind, tx).await });

            // Let the drain loop find the queue empty and go idle.
            tokio::time::sleep(Duration::from_millis(1)).await;
            queue.put(SampleValue::Int(1));
            let start = Instant::now();
            rx.recv().await.expect("frame");
            let waited = start.elapsed();
            assert!(waited < Duration::from_millis(idle_ms), "{kind}: {waited:?}");
            assert!(
                waited >= Duration::from_millis(idle_ms - 1),
                "{kind}: {waited:?}"
            );

            drop(rx);
            task.await.expect("join").expect("drain");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_stops_drain_but_queue_keeps_accepting() {
        let (server, queue) = server_with(StreamKind::Cpm, 20_000);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        assert_eq!(server.drain_session(StreamKind::Cpm, tx).await.expect("drain"), 0);

        for v in 0..15 {
            queue.put(SampleValue::Int(v));
        }
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_leaves_samples_queued() {
        let (server, queue) = server_with(StreamKind::Kpm, 20_000);
        for v in 0..5 {
            queue.put(SampleValue::Int(v));
        }
        let server = Arc::new(server);
        let (tx, mut rx) = mpsc::channel(SESSION_FRAME_BUFFER);
        let s = Arc::clone(&server);
        let task = tokio::spawn(async move { s.drain_session(StreamKind::Kpm, tx).await });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 5 - SESSION_FRAME_BUFFER);

        // Overflow while stalled is handled by the queue itself.
        for v in 5..15 {
            queue.put(SampleValue::Int(v));
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.evicted_total(), 4);

        let first: MetricMessage = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        assert_eq!(first.kpm, Some(0));
        let next: MetricMessage = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        assert_eq!(next.kpm, Some(5));

        drop(rx);
        task.await.expect("join").expect("drain");
    }

    #[tokio::test]
    async fn test_unknown_kind_is_error() {
        let (server, _queue) = server_with(StreamKind::Cpm, 500);
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            server.drain_session(StreamKind::Title, tx).await,
            Err(Error::UnknownKind(_))
        ));
    }

    #[test]
    fn test_mismatched_sample_is_not_framed() {
        let queue = Arc::new(SampleQueue::new(StreamKind::Kpm, 4));
        queue.put(SampleValue::from("not a count"));
        let source = StreamSource::Metric(queue);
        assert!(matches!(source.next_frame(), Some(Err(_))));
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_telemetry_frame_gets_sample_timestamp() {
        let queue = Arc::new(SampleQueue::new(StreamKind::Telemetry, 4));
        queue.put(RawTelemetry::default());
        let frame = StreamSource::Telemetry(queue)
            .next_frame()
            .expect("frame")
            .expect("encoded");
        let raw: RawTelemetry = serde_json::from_str(&frame).expect("json");
        assert!(raw.timestamp.is_some());
    }
}
