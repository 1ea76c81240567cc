//! Bulk persister: one flush, one bulk-load transaction.
//!
//! Rows stream through the transaction in append order and commit as a
//! unit. A per-row latency observation (now minus the row's creation
//! instant) is taken just before each row is written. Loader work runs on
//! the blocking pool; the loader itself belongs to this pipeline only.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use relay_common::PipelineName;
use relay_telemetry::{BulkLoad, LoadError, LoadReceipt, Row, TableSpec};

use crate::metrics::PersistMetrics;

/// Errors from a flush.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("bulk load task panicked: {0}")]
    Panicked(String),
}

/// A failed flush, handing the batch back to the caller untouched.
#[derive(Debug, Error)]
#[error("flush of {count} rows failed: {error}", count = .rows.len())]
pub struct PersistFailure {
    #[source]
    pub error: PersistError,
    pub rows: Vec<Row>,
}

/// Persists batches for one pipeline.
pub struct BulkPersister {
    pipeline: PipelineName,
    table: TableSpec,
    loader: Arc<Mutex<Box<dyn BulkLoad>>>,
    metrics: PersistMetrics,
}

impl BulkPersister {
    pub fn new(
        pipeline: PipelineName,
        table: TableSpec,
        loader: Box<dyn BulkLoad>,
        metrics: PersistMetrics,
    ) -> Self {
        Self {
            pipeline,
            table,
            loader: Arc::new(Mutex::new(loader)),
            metrics,
        }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    /// Load `rows` as one transaction.
    ///
    /// On failure nothing is committed and the rows come back in
    /// [`PersistFailure::rows`] in their original order.
    pub async fn flush(&self, rows: Vec<Row>) -> Result<LoadReceipt, PersistFailure> {
        let count = rows.len();
        let rows = Arc::new(rows);
        let started = Instant::now();

        let task = {
            let rows = Arc::clone(&rows);
            let loader = Arc::clone(&self.loader);
            let table = self.table.clone();
            let latency = self.metrics.latency.clone();
            tokio::task::spawn_blocking(move || load_batch(&loader, &table, &rows, &latency))
        };
        let outcome = match task.await {
            Ok(result) => result.map_err(PersistError::from),
            Err(join) => Err(PersistError::Panicked(join.to_string())),
        };

        let elapsed = started.elapsed();
        self.metrics.duration.observe(elapsed.as_secs_f64());

        match outcome {
            Ok(receipt) => {
                self.metrics.rows.inc_by(receipt.rows as u64);
                info!(
                    pipeline = %self.pipeline,
                    table = %self.table.name,
                    rows = receipt.rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flushed batch"
                );
                Ok(receipt)
            }
            Err(error) => {
                self.metrics.failures.inc();
                warn!(
                    pipeline = %self.pipeline,
                    table = %self.table.name,
                    rows = count,
                    error = %error,
                    "Bulk load failed"
                );
                let rows = Arc::try_unwrap(rows).unwrap_or_else(|shared| (*shared).clone());
                Err(PersistFailure { error, rows })
            }
        }
    }
}

fn load_batch(
    loader: &Mutex<Box<dyn BulkLoad>>,
    table: &TableSpec,
    rows: &[Row],
    latency: &prometheus::Histogram,
) -> Result<LoadReceipt, LoadError> {
    let mut loader = loader.lock();
    let mut tx = loader.begin(table)?;
    for row in rows {
        latency.observe(seconds_since(row));
        if let Err(e) = tx.write_row(row) {
            tx.abort();
            return Err(e);
        }
    }
    tx.commit()
}

fn seconds_since(row: &Row) -> f64 {
    let age = Utc::now().signed_duration_since(row.created_at);
    age.to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use chrono::Duration as ChronoDuration;
    use relay_common::StreamKind;
    use relay_telemetry::{metric_table, CellValue, MemoryLoader, MemoryTables};

    fn row(n: i64) -> Row {
        Row {
            created_at: Utc::now() - ChronoDuration::milliseconds(250),
            cells: vec![CellValue::Timestamp(Utc::now()), CellValue::Int(n)],
        }
    }

    fn persister(tables: &MemoryTables) -> (BulkPersister, PersistMetrics) {
        let metrics = RelayMetrics::new().expect("metrics");
        let name = PipelineName::for_kind(StreamKind::Kpm);
        let persist = metrics.persist(&name);
        let persister = BulkPersister::new(
            name,
            metric_table(StreamKind::Kpm),
            Box::new(MemoryLoader::new(tables.clone())),
            persist.clone(),
        );
        (persister, persist)
    }

    #[tokio::test]
    async fn test_flush_commits_in_order_and_observes_latency() {
        let tables = MemoryTables::new();
        let (persister, metrics) = persister(&tables);

        let receipt = persister
            .flush((1..=3).map(row).collect())
            .await
            .expect("flush");
        assert_eq!(receipt.rows, 3);

        let stored = tables.rows("metric_data_kpm");
        let vals: Vec<&CellValue> = stored.iter().map(|r| &r.cells[1]).collect();
        assert_eq!(vals, vec![&CellValue::Int(1), &CellValue::Int(2), &CellValue::Int(3)]);

        assert_eq!(metrics.latency.get_sample_count(), 3);
        assert!(metrics.latency.get_sample_sum() >= 0.75);
        assert_eq!(metrics.duration.get_sample_count(), 1);
        assert_eq!(metrics.rows.get(), 3);
    }

    #[tokio::test]
    async fn test_failed_commit_returns_rows() {
        let tables = MemoryTables::new();
        tables.fail_next_commits(1);
        let (persister, metrics) = persister(&tables);

        let failure = persister
            .flush((1..=2).map(row).collect())
            .await
            .unwrap_err();
        assert_eq!(failure.rows.len(), 2);
        assert_eq!(failure.rows[0].cells[1], CellValue::Int(1));
        assert!(matches!(failure.error, PersistError::Load(LoadError::Rejected(_))));
        assert_eq!(tables.row_count("metric_data_kpm"), 0);
        assert_eq!(metrics.failures.get(), 1);
    }

    #[tokio::test]
    async fn test_bad_row_aborts_whole_batch() {
        let tables = MemoryTables::new();
        let (persister, _) = persister(&tables);

        let mut rows: Vec<Row> = (1..=3).map(row).collect();
        rows[1].cells[1] = CellValue::Text("oops".into());
        let failure = persister.flush(rows).await.unwrap_err();
        assert!(matches!(
            failure.error,
            PersistError::Load(LoadError::TypeMismatch { .. })
        ));
        assert_eq!(tables.row_count("metric_data_kpm"), 0);
    }
}
