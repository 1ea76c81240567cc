//! One pipeline per stream kind.
//!
//! A running pipeline is three tasks:
//! - reader: upstream frames → normalized entries on the backpressure queue
//! - writer: pop → decode → append to the batch → relay to viewers
//! - timer: the accumulator's periodic flush trigger
//!
//! The tasks share a cancellation token that is a child of the process
//! token. A panic in any of them cancels the rest of that pipeline only.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_common::{PipelineName, PipelineRecord, StreamKind};
use relay_config::RelayConfig;
use relay_telemetry::{table_for, BulkLoad, Row};

use crate::accumulator::{BatchAccumulator, FlushReport};
use crate::backpressure::BackpressureQueue;
use crate::broadcast::LiveBroadcaster;
use crate::ingest::{IngestionReader, ReaderExit};
use crate::metrics::{IngestMetrics, RelayMetrics};
use crate::normalize::Normalizer;
use crate::persist::BulkPersister;
use crate::upstream::TransportError;

/// A configured, not yet running pipeline.
pub struct Pipeline {
    kind: StreamKind,
    name: PipelineName,
    queue: Arc<BackpressureQueue>,
    accumulator: Arc<BatchAccumulator>,
    broadcaster: Arc<LiveBroadcaster>,
    reader: Arc<IngestionReader>,
    metrics: IngestMetrics,
    spill_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(
        kind: StreamKind,
        config: &RelayConfig,
        loader: Box<dyn BulkLoad>,
        metrics: &RelayMetrics,
    ) -> Self {
        let name = PipelineName::for_kind(kind);
        let ingest_metrics = metrics.ingest(&name);

        let queue = Arc::new(
            BackpressureQueue::new(name.clone()).with_depth_gauge(metrics.depth_gauge(&name)),
        );
        let persister = BulkPersister::new(
            name.clone(),
            table_for(kind),
            loader,
            metrics.persist(&name),
        );
        let accumulator = Arc::new(BatchAccumulator::new(
            name.clone(),
            &config.batch,
            persister,
        ));
        let broadcaster = Arc::new(
            LiveBroadcaster::new(name.clone(), config.viewer.delivery_timeout())
                .with_metrics(metrics.viewers(&name)),
        );
        let reader = Arc::new(IngestionReader::new(
            Normalizer::new(kind, config.ingest.payload_conflict),
            Arc::clone(&queue),
            ingest_metrics.clone(),
        ));

        Self {
            kind,
            name,
            queue,
            accumulator,
            broadcaster,
            reader,
            metrics: ingest_metrics,
            spill_dir: config.backpressure.spill_dir.clone(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn name(&self) -> &PipelineName {
        &self.name
    }

    pub fn queue(&self) -> &Arc<BackpressureQueue> {
        &self.queue
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    /// Start the pipeline's tasks against `upstream`.
    pub fn start<S>(self, upstream: S, parent: &CancellationToken) -> PipelineHandle
    where
        S: Stream<Item = Result<String, TransportError>> + Unpin + Send + 'static,
    {
        if let Some(dir) = &self.spill_dir {
            if let Err(e) = self.queue.restore(dir) {
                warn!(pipeline = %self.name, error = %e, "Failed to restore spilled entries");
            }
        }

        let token = parent.child_token();
        let writer = Writer {
            kind: self.kind,
            name: self.name.clone(),
            queue: Arc::clone(&self.queue),
            accumulator: Arc::clone(&self.accumulator),
            broadcaster: Arc::clone(&self.broadcaster),
            metrics: self.metrics.clone(),
        };

        let mut tasks = JoinSet::new();
        {
            let reader = Arc::clone(&self.reader);
            let token = token.clone();
            tasks.spawn(async move { TaskExit::Reader(reader.run(upstream, token).await) });
        }
        {
            let writer = writer.clone();
            let token = token.clone();
            tasks.spawn(async move { TaskExit::Writer(writer.run(token).await) });
        }
        {
            let accumulator = Arc::clone(&self.accumulator);
            let token = token.clone();
            tasks.spawn(async move {
                accumulator.run_timer(token).await;
                TaskExit::Timer
            });
        }
        info!(pipeline = %self.name, "Pipeline started");

        let supervisor = tokio::spawn(supervise(self.name.clone(), tasks, token.clone()));
        PipelineHandle {
            name: self.name,
            token,
            supervisor,
            writer,
            spill_dir: self.spill_dir,
        }
    }
}

enum TaskExit {
    Reader(ReaderExit),
    Writer(u64),
    Timer,
}

/// Join every task; the first panic cancels the others.
async fn supervise(
    name: PipelineName,
    mut tasks: JoinSet<TaskExit>,
    token: CancellationToken,
) -> Option<ReaderExit> {
    let mut reader_exit = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(TaskExit::Reader(exit)) => reader_exit = Some(exit),
            Ok(TaskExit::Writer(entries)) => {
                info!(pipeline = %name, entries, "Writer stopped");
            }
            Ok(TaskExit::Timer) => {}
            Err(e) => {
                error!(pipeline = %name, error = %e, "Pipeline task failed, stopping pipeline");
                token.cancel();
            }
        }
    }
    reader_exit
}

/// The writer loop's view of a pipeline.
#[derive(Clone)]
struct Writer {
    kind: StreamKind,
    name: PipelineName,
    queue: Arc<BackpressureQueue>,
    accumulator: Arc<BatchAccumulator>,
    broadcaster: Arc<LiveBroadcaster>,
    metrics: IngestMetrics,
}

impl Writer {
    async fn run(&self, token: CancellationToken) -> u64 {
        let mut entries = 0u64;
        loop {
            let entry = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                entry = self.queue.pop_blocking() => entry,
            };
            let Some(entry) = entry else { break };
            entries += 1;
            self.process(&entry).await;
        }
        entries
    }

    /// Decode one entry, append it to the batch, then relay it.
    async fn process(&self, entry: &str) -> FlushReport {
        let record = match PipelineRecord::decode(self.kind, entry) {
            Ok(record) => record,
            Err(e) => {
                warn!(pipeline = %self.name, error = %e, "Dropping undecodable queue entry");
                self.metrics.dropped("decode");
                return FlushReport::default();
            }
        };
        let report = self.accumulator.append(Row::from(&record)).await;
        self.broadcaster.broadcast(entry).await;
        report
    }
}

/// What a stopped pipeline left behind.
#[derive(Debug)]
pub struct ShutdownReport {
    pub pipeline: PipelineName,
    pub reader: Option<ReaderExit>,
    /// Entries drained from the backpressure queue after the writer stopped.
    pub drained: usize,
    /// Entries written to the spill file instead.
    pub spilled: usize,
    pub final_flush: FlushReport,
}

/// A running pipeline.
pub struct PipelineHandle {
    name: PipelineName,
    token: CancellationToken,
    supervisor: JoinHandle<Option<ReaderExit>>,
    writer: Writer,
    spill_dir: Option<PathBuf>,
}

impl PipelineHandle {
    pub fn name(&self) -> &PipelineName {
        &self.name
    }

    /// Whether the pipeline's tasks have all ended.
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Stop the tasks, then either spill what is left in the backpressure
    /// queue or push it through the batch, and flush.
    pub async fn stop(self) -> ShutdownReport {
        self.token.cancel();
        let reader = match self.supervisor.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(pipeline = %self.name, error = %e, "Pipeline supervisor failed");
                None
            }
        };

        let mut drained = 0;
        let mut spilled = 0;
        if let Some(dir) = &self.spill_dir {
            match self.writer.queue.spill(dir) {
                Ok(n) => spilled = n,
                Err(e) => {
                    warn!(pipeline = %self.name, error = %e, "Spill failed, draining instead");
                }
            }
        }
        while let Some(entry) = self.writer.queue.try_pop() {
            self.writer.process(&entry).await;
            drained += 1;
        }

        let final_flush = self.writer.accumulator.flush_remaining().await;
        info!(
            pipeline = %self.name,
            drained,
            spilled,
            rows = final_flush.rows,
            failed = final_flush.failed,
            "Pipeline stopped"
        );
        ShutdownReport {
            pipeline: self.name,
            reader,
            drained,
            spilled,
            final_flush,
        }
    }
}
