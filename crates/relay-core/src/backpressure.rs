//! Elastic FIFO between the ingestion reader and the batch writer.
//!
//! The queue is unbounded; its depth is published to a gauge and is never
//! used to shed load. Consumers suspend on [`BackpressureQueue::pop_blocking`]
//! instead of polling.

use chrono::Utc;
use parking_lot::Mutex;
use prometheus::IntGauge;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use relay_common::schema::{is_compatible, SCHEMA_VERSION};
use relay_common::{Error, PipelineName};

/// First line of a spill file.
#[derive(Debug, Serialize, Deserialize)]
struct SpillHeader {
    spill_schema: String,
}

/// Per-pipeline backpressure queue of encoded records.
pub struct BackpressureQueue {
    pipeline: PipelineName,
    entries: Mutex<VecDeque<String>>,
    ready: Notify,
    closed: AtomicBool,
    depth_gauge: Option<IntGauge>,
}

impl BackpressureQueue {
    pub fn new(pipeline: PipelineName) -> Self {
        Self {
            pipeline,
            entries: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            depth_gauge: None,
        }
    }

    /// Publish depth changes to `gauge`.
    pub fn with_depth_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(self.entries.get_mut().len() as i64);
        self.depth_gauge = Some(gauge);
        self
    }

    pub fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    /// Current number of queued entries.
    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    /// Append an entry at the tail.
    pub fn push(&self, entry: String) {
        {
            let mut entries = self.entries.lock();
            entries.push_back(entry);
            self.publish(entries.len());
        }
        self.ready.notify_one();
    }

    /// Remove the head entry if there is one.
    pub fn try_pop(&self) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.pop_front();
        if entry.is_some() {
            self.publish(entries.len());
        }
        entry
    }

    /// Remove the head entry, waiting until one is pushed.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop_blocking(&self) -> Option<String> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop() {
                return Some(entry);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting waits: blocked consumers drain what is left and then
    /// observe the end of the queue.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, depth: usize) {
        if let Some(gauge) = &self.depth_gauge {
            gauge.set(depth as i64);
        }
    }

    // ------------------------------------------------------------------
    // Spill / restore
    // ------------------------------------------------------------------

    /// Spill file for this pipeline under `dir`.
    pub fn spill_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.jsonl", self.pipeline))
    }

    fn rejected_path(&self, dir: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        dir.join(format!("{}.jsonl.rejected-{}", self.pipeline, stamp))
    }

    /// Drain every queued entry into the pipeline's spill file.
    ///
    /// The file starts with a schema header and is replaced atomically.
    /// Nothing is written when the queue is empty.
    pub fn spill(&self, dir: &Path) -> Result<usize, Error> {
        let header = serde_json::to_string(&SpillHeader {
            spill_schema: SCHEMA_VERSION.to_string(),
        })?;
        let drained: Vec<String> = {
            let mut entries = self.entries.lock();
            let drained = entries.drain(..).collect();
            self.publish(0);
            drained
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let path = self.spill_path(dir);
        let tmp = path.with_extension("jsonl.tmp");
        let result = fs::create_dir_all(dir)
            .and_then(|()| write_lines(&tmp, &header, &drained))
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            // Put the entries back so a caller can retry or log them.
            let mut entries = self.entries.lock();
            for entry in drained.into_iter().rev() {
                entries.push_front(entry);
            }
            self.publish(entries.len());
            return Err(e.into());
        }

        info!(
            pipeline = %self.pipeline,
            entries = drained.len(),
            path = %path.display(),
            "Spilled backpressure queue"
        );
        Ok(drained.len())
    }

    /// Load a previous spill ahead of anything already queued, then remove
    /// the spill file.
    ///
    /// A file written under an incompatible schema is moved aside to a
    /// `.rejected-<timestamp>` name, so a later spill cannot replace it, and
    /// reported as malformed.
    pub fn restore(&self, dir: &Path) -> Result<usize, Error> {
        let path = self.spill_path(dir);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(pipeline = %self.pipeline, "No spill file to restore");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut restored = Vec::new();
        let mut refused = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if restored.is_empty() {
                if let Ok(header) = serde_json::from_str::<SpillHeader>(&line) {
                    if !is_compatible(&header.spill_schema) {
                        refused = Some(header.spill_schema);
                        break;
                    }
                    continue;
                }
            }
            restored.push(line);
        }
        if let Some(schema) = refused {
            let rejected = self.rejected_path(dir);
            fs::rename(&path, &rejected)?;
            warn!(
                pipeline = %self.pipeline,
                schema = %schema,
                path = %rejected.display(),
                "Spill file has an incompatible schema, moved aside"
            );
            return Err(Error::Malformed(format!(
                "spill file written with schema {}, moved to {}",
                schema,
                rejected.display()
            )));
        }
        let count = restored.len();
        {
            let mut entries = self.entries.lock();
            for entry in restored.into_iter().rev() {
                entries.push_front(entry);
            }
            self.publish(entries.len());
        }
        fs::remove_file(&path)?;
        if count > 0 {
            self.ready.notify_one();
        }

        info!(
            pipeline = %self.pipeline,
            entries = count,
            "Restored spilled backpressure entries"
        );
        Ok(count)
    }
}

fn write_lines(path: &Path, header: &str, lines: &[String]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_all(header.as_bytes())?;
    out.write_all(b"\n")?;
    for line in lines {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}
