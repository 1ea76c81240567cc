//! Dual-trigger batch accumulator.
//!
//! Two triggers race on one buffer:
//! - size: an append that brings the buffer to `max_rows` flushes at once
//!   and raises the overflow flag
//! - timer: each tick flushes whatever is buffered unless a size flush
//!   already happened in this interval, then lowers the flag
//!
//! Triggers only move rows into an ordered outbox while holding the buffer
//! lock. The outbox is drained behind a separate async gate, so a bulk load
//! never runs under the buffer lock and at most one runs at a time.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_common::PipelineName;
use relay_config::{BatchConfig, FlushFailurePolicy};
use relay_telemetry::Row;

use crate::persist::BulkPersister;

/// Outcome of one trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Batches committed.
    pub batches: usize,
    /// Rows committed.
    pub rows: usize,
    /// Batches whose bulk load failed.
    pub failed: usize,
    /// Rows discarded under the drop policy.
    pub dropped_rows: usize,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        *self == FlushReport::default()
    }

    fn absorb(&mut self, other: FlushReport) {
        self.batches += other.batches;
        self.rows += other.rows;
        self.failed += other.failed;
        self.dropped_rows += other.dropped_rows;
    }
}

#[derive(Default)]
struct Buffer {
    rows: Vec<Row>,
    overflow_flag: bool,
    /// Batches cut by a trigger and not yet committed, oldest first.
    outbox: VecDeque<Vec<Row>>,
}

/// Per-pipeline row buffer with size and timer flush triggers.
pub struct BatchAccumulator {
    pipeline: PipelineName,
    max_rows: usize,
    interval: Duration,
    policy: FlushFailurePolicy,
    buffer: Mutex<Buffer>,
    flush_gate: tokio::sync::Mutex<()>,
    persister: BulkPersister,
}

impl BatchAccumulator {
    pub fn new(pipeline: PipelineName, config: &BatchConfig, persister: BulkPersister) -> Self {
        Self {
            pipeline,
            max_rows: config.max_rows.max(1),
            interval: config.interval(),
            policy: config.failure_policy,
            buffer: Mutex::new(Buffer::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            persister,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rows in the buffer plus rows waiting in the outbox.
    pub fn pending_rows(&self) -> usize {
        let buffer = self.buffer.lock();
        buffer.rows.len() + buffer.outbox.iter().map(Vec::len).sum::<usize>()
    }

    pub fn overflow_flag(&self) -> bool {
        self.buffer.lock().overflow_flag
    }

    /// Append one row; flushes when the buffer reaches `max_rows`.
    pub async fn append(&self, row: Row) -> FlushReport {
        let cut = {
            let mut buffer = self.buffer.lock();
            buffer.rows.push(row);
            if buffer.rows.len() >= self.max_rows {
                let batch = std::mem::take(&mut buffer.rows);
                buffer.outbox.push_back(batch);
                buffer.overflow_flag = true;
                true
            } else {
                false
            }
        };
        if !cut {
            return FlushReport::default();
        }
        debug!(pipeline = %self.pipeline, max_rows = self.max_rows, "Size trigger fired");
        self.drain_outbox().await
    }

    /// One timer tick.
    ///
    /// Skips the buffer if a size flush happened since the last tick, and
    /// skips the bulk load entirely when there is nothing to write. Batches
    /// requeued by an earlier failure are retried either way.
    pub async fn on_timer(&self) -> FlushReport {
        let has_work = {
            let mut buffer = self.buffer.lock();
            if buffer.overflow_flag {
                debug!(pipeline = %self.pipeline, "Timer tick after size flush, skipping");
            } else if !buffer.rows.is_empty() {
                let batch = std::mem::take(&mut buffer.rows);
                buffer.outbox.push_back(batch);
            }
            buffer.overflow_flag = false;
            !buffer.outbox.is_empty()
        };
        if !has_work {
            return FlushReport::default();
        }
        self.drain_outbox().await
    }

    /// Flush everything regardless of the overflow flag. Used on shutdown.
    pub async fn flush_remaining(&self) -> FlushReport {
        {
            let mut buffer = self.buffer.lock();
            if !buffer.rows.is_empty() {
                let batch = std::mem::take(&mut buffer.rows);
                buffer.outbox.push_back(batch);
            }
        }
        self.drain_outbox().await
    }

    /// Run the timer trigger until `shutdown` fires.
    pub async fn run_timer(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            pipeline = %self.pipeline,
            interval_secs = self.interval.as_secs_f64(),
            max_rows = self.max_rows,
            "Batch timer started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.on_timer().await;
                    if !report.is_noop() {
                        debug!(pipeline = %self.pipeline, ?report, "Timer flush");
                    }
                }
            }
        }
        debug!(pipeline = %self.pipeline, "Batch timer stopped");
    }

    async fn drain_outbox(&self) -> FlushReport {
        let _gate = self.flush_gate.lock().await;
        let mut report = FlushReport::default();
        loop {
            let batch = self.buffer.lock().outbox.pop_front();
            let Some(batch) = batch else { break };
            if batch.is_empty() {
                continue;
            }
            match self.persister.flush(batch).await {
                Ok(receipt) => report.absorb(FlushReport {
                    batches: 1,
                    rows: receipt.rows,
                    ..Default::default()
                }),
                Err(failure) => {
                    report.failed += 1;
                    match self.policy {
                        FlushFailurePolicy::Requeue => {
                            warn!(
                                pipeline = %self.pipeline,
                                rows = failure.rows.len(),
                                "Requeued failed batch"
                            );
                            self.buffer.lock().outbox.push_front(failure.rows);
                            break;
                        }
                        FlushFailurePolicy::Drop => {
                            error!(
                                pipeline = %self.pipeline,
                                rows = failure.rows.len(),
                                error = %failure.error,
                                "Dropped failed batch"
                            );
                            report.dropped_rows += failure.rows.len();
                        }
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use chrono::Utc;
    use relay_common::StreamKind;
    use relay_telemetry::{metric_table, CellValue, MemoryLoader, MemoryTables};

    const TABLE: &str = "metric_data_kpm";

    fn row(n: i64) -> Row {
        Row {
            created_at: Utc::now(),
            cells: vec![CellValue::Timestamp(Utc::now()), CellValue::Int(n)],
        }
    }

    fn accumulator(
        tables: &MemoryTables,
        max_rows: usize,
        policy: FlushFailurePolicy,
    ) -> BatchAccumulator {
        let metrics = RelayMetrics::new().expect("metrics");
        let name = PipelineName::for_kind(StreamKind::Kpm);
        let persister = BulkPersister::new(
            name.clone(),
            metric_table(StreamKind::Kpm),
            Box::new(MemoryLoader::new(tables.clone())),
            metrics.persist(&name),
        );
        let config = BatchConfig {
            max_rows,
            interval_secs: 10,
            failure_policy: policy,
        };
        BatchAccumulator::new(name, &config, persister)
    }

    fn values(batch: &[Row]) -> Vec<i64> {
        batch
            .iter()
            .map(|r| match r.cells[1] {
                CellValue::Int(v) => v,
                ref other => panic!("unexpected cell {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_size_trigger_fires_at_max_rows() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 3, FlushFailurePolicy::Requeue);

        assert!(acc.append(row(1)).await.is_noop());
        assert!(acc.append(row(2)).await.is_noop());
        let report = acc.append(row(3)).await;
        assert_eq!(report.batches, 1);
        assert_eq!(report.rows, 3);
        assert!(acc.overflow_flag());
        assert_eq!(acc.pending_rows(), 0);
        assert_eq!(values(&tables.batches(TABLE)[0]), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_timer_skips_interval_with_size_flush() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 2, FlushFailurePolicy::Requeue);
        for n in 1..=3 {
            acc.append(row(n)).await;
        }

        assert!(acc.on_timer().await.is_noop());
        assert!(!acc.overflow_flag());
        assert_eq!(acc.pending_rows(), 1);

        let report = acc.on_timer().await;
        assert_eq!(report.rows, 1);
        let batches = tables.batches(TABLE);
        assert_eq!(batches.len(), 2);
        assert_eq!(values(&batches[1]), vec![3]);
    }

    #[tokio::test]
    async fn test_empty_timer_tick_skips_bulk_load() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 5, FlushFailurePolicy::Requeue);
        assert!(acc.on_timer().await.is_noop());
        assert!(tables.batches(TABLE).is_empty());
        assert_eq!(tables.max_concurrent(), 0);
    }

    #[tokio::test]
    async fn test_requeue_keeps_batch_at_head() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 2, FlushFailurePolicy::Requeue);
        tables.fail_next_commits(1);

        let report = acc.append(row(1)).await;
        assert!(report.is_noop());
        let report = acc.append(row(2)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(acc.pending_rows(), 2);

        acc.append(row(3)).await;
        let report = acc.append(row(4)).await;
        assert_eq!(report.batches, 2);

        let batches = tables.batches(TABLE);
        assert_eq!(values(&batches[0]), vec![1, 2]);
        assert_eq!(values(&batches[1]), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_drop_policy_discards_failed_batch() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 2, FlushFailurePolicy::Drop);
        tables.fail_next_commits(1);

        acc.append(row(1)).await;
        let report = acc.append(row(2)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.dropped_rows, 2);
        assert_eq!(acc.pending_rows(), 0);

        acc.append(row(3)).await;
        acc.flush_remaining().await;
        let batches = tables.batches(TABLE);
        assert_eq!(batches.len(), 1);
        assert_eq!(values(&batches[0]), vec![3]);
    }

    #[tokio::test]
    async fn test_flush_remaining_ignores_overflow_flag() {
        let tables = MemoryTables::new();
        let acc = accumulator(&tables, 2, FlushFailurePolicy::Requeue);
        for n in 1..=3 {
            acc.append(row(n)).await;
        }
        assert!(acc.overflow_flag());
        let report = acc.flush_remaining().await;
        assert_eq!(report.rows, 1);
        assert_eq!(tables.row_count(TABLE), 3);
    }
}
