//! Ingestion reader: upstream frames → normalized entries on the
//! backpressure queue.
//!
//! The reader never retries. A transport error or upstream close ends the
//! loop and is reported through [`ReaderExit`]; restarting is up to whoever
//! supervises the pipeline.

use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_common::PipelineName;

use crate::backpressure::BackpressureQueue;
use crate::metrics::IngestMetrics;
use crate::normalize::Normalizer;
use crate::upstream::{StreamRefusal, TransportError};

/// Why a reader loop ended.
#[derive(Debug)]
pub enum ReaderExit {
    /// The upstream closed the stream cleanly.
    UpstreamClosed { messages: u64 },
    /// The upstream failed or refused the session.
    TransportFailed {
        messages: u64,
        error: TransportError,
    },
    /// Shutdown was requested.
    Cancelled { messages: u64 },
}

impl ReaderExit {
    /// Frames received before the loop ended, accepted or not.
    pub fn messages(&self) -> u64 {
        match self {
            ReaderExit::UpstreamClosed { messages }
            | ReaderExit::TransportFailed { messages, .. }
            | ReaderExit::Cancelled { messages } => *messages,
        }
    }
}

/// Reads one pipeline's upstream stream.
pub struct IngestionReader {
    pipeline: PipelineName,
    normalizer: Normalizer,
    queue: Arc<BackpressureQueue>,
    metrics: IngestMetrics,
}

impl IngestionReader {
    pub fn new(normalizer: Normalizer, queue: Arc<BackpressureQueue>, metrics: IngestMetrics) -> Self {
        Self {
            pipeline: queue.pipeline().clone(),
            normalizer,
            queue,
            metrics,
        }
    }

    /// Normalize one frame and push it. Returns whether it was accepted.
    pub fn ingest_line(&self, line: &str) -> bool {
        let timer = self.metrics.normalize.start_timer();
        let normalized = self.normalizer.normalize(line);
        timer.observe_duration();

        let record = match normalized {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    pipeline = %self.pipeline,
                    reason = e.reason(),
                    error = %e,
                    "Dropping malformed upstream message"
                );
                self.metrics.dropped(e.reason());
                return false;
            }
        };

        match record.encode() {
            Ok(entry) => {
                self.queue.push(entry);
                true
            }
            Err(e) => {
                warn!(pipeline = %self.pipeline, error = %e, "Failed to encode record");
                self.metrics.dropped("encode");
                false
            }
        }
    }

    /// Consume `upstream` until it ends, fails, or `shutdown` fires.
    pub async fn run<S>(&self, mut upstream: S, shutdown: CancellationToken) -> ReaderExit
    where
        S: Stream<Item = Result<String, TransportError>> + Unpin,
    {
        let mut messages = 0u64;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(pipeline = %self.pipeline, messages, "Ingestion reader cancelled");
                    return ReaderExit::Cancelled { messages };
                }
                next = upstream.next() => next,
            };

            match next {
                None => {
                    info!(pipeline = %self.pipeline, messages, "Upstream closed");
                    return ReaderExit::UpstreamClosed { messages };
                }
                Some(Err(error)) => {
                    warn!(
                        pipeline = %self.pipeline,
                        messages,
                        error = %error,
                        "Upstream transport failed"
                    );
                    return ReaderExit::TransportFailed { messages, error };
                }
                Some(Ok(line)) => {
                    if messages == 0 {
                        if let Ok(refusal) = serde_json::from_str::<StreamRefusal>(&line) {
                            let error = TransportError::Handshake(refusal.error);
                            warn!(pipeline = %self.pipeline, error = %error, "Upstream refused session");
                            return ReaderExit::TransportFailed { messages, error };
                        }
                    }
                    messages += 1;
                    if self.ingest_line(&line) {
                        debug!(pipeline = %self.pipeline, depth = self.queue.depth(), "Queued record");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use relay_common::{PipelineRecord, StreamKind};
    use relay_config::PayloadConflictPolicy;

    fn reader(kind: StreamKind) -> (IngestionReader, Arc<BackpressureQueue>, IngestMetrics) {
        let metrics = RelayMetrics::new().expect("metrics");
        let name = PipelineName::for_kind(kind);
        let ingest = metrics.ingest(&name);
        let queue = Arc::new(BackpressureQueue::new(name));
        let reader = IngestionReader::new(
            Normalizer::new(kind, PayloadConflictPolicy::Reject),
            Arc::clone(&queue),
            ingest.clone(),
        );
        (reader, queue, ingest)
    }

    fn frames(lines: &[&str]) -> impl Stream<Item = Result<String, TransportError>> + Unpin {
        tokio_stream::iter(
            lines
                .iter()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_valid_frames_are_queued_in_order() {
        let (reader, queue, _) = reader(StreamKind::Kpm);
        let upstream = frames(&[
            r#"{"timestamp":"2026-01-15T00:00:01Z","kpm":1}"#,
            r#"{"timestamp":"2026-01-15T00:00:02Z","kpm":2}"#,
        ]);
        let exit = reader.run(upstream, CancellationToken::new()).await;
        assert!(matches!(exit, ReaderExit::UpstreamClosed { messages: 2 }));

        let first = queue.try_pop().expect("first");
        let record = PipelineRecord::decode(StreamKind::Kpm, &first).expect("decode");
        assert_eq!(record.kind(), StreamKind::Kpm);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_and_counted() {
        let (reader, queue, metrics) = reader(StreamKind::Telemetry);
        let upstream = frames(&[
            "garbage",
            r#"{"timestamp":"2026-01-15T00:00:01Z"}"#,
            r#"{"pressure":{"pressure":201.0,"unit":"bar"}}"#,
        ]);
        let exit = reader.run(upstream, CancellationToken::new()).await;
        assert_eq!(exit.messages(), 3);
        assert_eq!(queue.depth(), 1);
        assert_eq!(metrics.dropped_count("invalid_json"), 1);
        assert_eq!(metrics.dropped_count("no_payload"), 1);
    }

    #[tokio::test]
    async fn test_transport_error_ends_loop() {
        let (reader, queue, _) = reader(StreamKind::Kpm);
        let upstream = tokio_stream::iter(vec![
            Ok(r#"{"timestamp":"2026-01-15T00:00:01Z","kpm":1}"#.to_string()),
            Err(TransportError::Io(std::io::Error::other("reset"))),
            Ok(r#"{"timestamp":"2026-01-15T00:00:02Z","kpm":2}"#.to_string()),
        ]);
        let exit = reader.run(upstream, CancellationToken::new()).await;
        assert!(matches!(exit, ReaderExit::TransportFailed { messages: 1, .. }));
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_refusal_line_is_a_handshake_failure() {
        let (reader, queue, _) = reader(StreamKind::Title);
        let upstream = frames(&[r#"{"error":"no stream for kind title"}"#]);
        match reader.run(upstream, CancellationToken::new()).await {
            ReaderExit::TransportFailed {
                error: TransportError::Handshake(msg),
                ..
            } => assert!(msg.contains("title")),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_reader() {
        let (reader, _, _) = reader(StreamKind::Pxm);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let exit = reader.run(tokio_stream::pending(), shutdown).await;
        assert!(matches!(exit, ReaderExit::Cancelled { messages: 0 }));
    }
}
