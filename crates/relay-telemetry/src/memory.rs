//! In-memory loader for tests.
//!
//! Committed batches are kept per table in a shared [`MemoryTables`] handle
//! that stays inspectable after the loader is moved into a pipeline.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::load::{check_row, BulkLoad, BulkTransaction, LoadError, LoadReceipt};
use crate::row::Row;
use crate::schema::TableSpec;

#[derive(Debug, Default)]
struct MemoryState {
    batches: BTreeMap<String, Vec<Vec<Row>>>,
    fail_commits: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Shared view of everything committed through a [`MemoryLoader`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed batches for a table, in commit order.
    pub fn batches(&self, table: &str) -> Vec<Vec<Row>> {
        self.state
            .lock()
            .batches
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// All committed rows for a table, in commit order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.batches(table).into_iter().flatten().collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .batches
            .get(table)
            .map(|b| b.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().fail_commits = n;
    }

    /// Highest number of transactions that were open at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

/// [`BulkLoad`] that commits into a [`MemoryTables`].
#[derive(Debug, Clone)]
pub struct MemoryLoader {
    tables: MemoryTables,
    commit_delay: Duration,
}

impl MemoryLoader {
    pub fn new(tables: MemoryTables) -> Self {
        Self {
            tables,
            commit_delay: Duration::ZERO,
        }
    }

    /// Block each commit for `delay` before it completes.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }
}

impl BulkLoad for MemoryLoader {
    fn begin<'a>(
        &'a mut self,
        table: &TableSpec,
    ) -> Result<Box<dyn BulkTransaction + 'a>, LoadError> {
        {
            let mut state = self.tables.state.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        Ok(Box::new(MemoryTransaction {
            table: table.clone(),
            rows: Vec::new(),
            tables: self.tables.clone(),
            commit_delay: self.commit_delay,
        }))
    }
}

struct MemoryTransaction {
    table: TableSpec,
    rows: Vec<Row>,
    tables: MemoryTables,
    commit_delay: Duration,
}

impl BulkTransaction for MemoryTransaction {
    fn write_row(&mut self, row: &Row) -> Result<(), LoadError> {
        check_row(&self.table, row)?;
        self.rows.push(row.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<LoadReceipt, LoadError> {
        if !self.commit_delay.is_zero() {
            std::thread::sleep(self.commit_delay);
        }
        let rows = std::mem::take(&mut self.rows);
        let mut state = self.tables.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(LoadError::Rejected("injected commit failure".to_string()));
        }
        let count = rows.len();
        state
            .batches
            .entry(self.table.name.clone())
            .or_default()
            .push(rows);
        Ok(LoadReceipt {
            table: self.table.name.clone(),
            rows: count,
            location: None,
        })
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let mut state = self.tables.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::CellValue;
    use crate::schema::metric_table;
    use chrono::Utc;
    use relay_common::StreamKind;

    fn row(v: i64) -> Row {
        let now = Utc::now();
        Row {
            created_at: now,
            cells: vec![CellValue::Timestamp(now), CellValue::Int(v)],
        }
    }

    #[test]
    fn test_commit_and_injected_failure() {
        let tables = MemoryTables::new();
        let mut loader = MemoryLoader::new(tables.clone());
        let table = metric_table(StreamKind::Kpm);

        tables.fail_next_commits(1);
        let mut tx = loader.begin(&table).expect("begin");
        tx.write_row(&row(1)).expect("write");
        assert!(tx.commit().is_err());
        assert_eq!(tables.row_count("metric_data_kpm"), 0);

        let mut tx = loader.begin(&table).expect("begin");
        tx.write_row(&row(2)).expect("write");
        tx.commit().expect("commit");
        assert_eq!(tables.rows("metric_data_kpm")[0].cells[1], CellValue::Int(2));
        assert_eq!(tables.max_concurrent(), 1);
    }
}
