//! Parquet bulk loader.
//!
//! Each committed transaction becomes one Parquet part file under
//! `<root>/<table>/`. Rows are buffered column-wise in memory, written to a
//! hidden temporary file at commit, and renamed into place, so readers only
//! ever see whole batches.

use arrow::array::{
    ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::load::{check_row, BulkLoad, BulkTransaction, LoadError, LoadReceipt};
use crate::row::{CellValue, Row};
use crate::schema::{ColumnType, TableSpec};
use crate::PART_EXTENSION;

/// Compression codec for part files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParquetCompression {
    #[default]
    Zstd,
    Snappy,
    Uncompressed,
}

impl ParquetCompression {
    fn codec(self) -> Compression {
        match self {
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        }
    }
}

/// Configuration for the Parquet loader.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Root directory; one subdirectory per table.
    pub root: PathBuf,
    pub compression: ParquetCompression,
}

impl WriterConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: ParquetCompression::default(),
        }
    }

    pub fn with_compression(mut self, compression: ParquetCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }
}

/// File-backed [`BulkLoad`] writing Parquet parts.
pub struct ParquetLoader {
    config: WriterConfig,
    sequence: u64,
}

impl ParquetLoader {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            sequence: 0,
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

impl BulkLoad for ParquetLoader {
    fn begin<'a>(
        &'a mut self,
        table: &TableSpec,
    ) -> Result<Box<dyn BulkTransaction + 'a>, LoadError> {
        let dir = self.config.table_dir(&table.name);
        fs::create_dir_all(&dir).map_err(|e| LoadError::Io {
            path: dir.clone(),
            source: e,
        })?;
        self.sequence += 1;
        let file_name = format!(
            "part-{}-{:06}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%6f"),
            self.sequence,
            PART_EXTENSION
        );
        Ok(Box::new(ParquetTransaction {
            table: table.clone(),
            columns: table.columns.iter().map(|c| ColumnBuffer::new(c.ty)).collect(),
            rows: 0,
            final_path: dir.join(&file_name),
            temp_path: dir.join(format!(".{}.tmp", file_name)),
            compression: self.config.compression,
        }))
    }
}

enum ColumnBuffer {
    Timestamp(Vec<Option<i64>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
}

impl ColumnBuffer {
    fn new(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Timestamp => ColumnBuffer::Timestamp(Vec::new()),
            ColumnType::Int64 => ColumnBuffer::Int64(Vec::new()),
            ColumnType::Float64 => ColumnBuffer::Float64(Vec::new()),
            ColumnType::Utf8 => ColumnBuffer::Utf8(Vec::new()),
        }
    }

    /// Cells are pre-checked against the column type.
    fn push(&mut self, cell: &CellValue) {
        match (self, cell) {
            (ColumnBuffer::Timestamp(v), CellValue::Timestamp(ts)) => {
                v.push(Some(ts.timestamp_micros()))
            }
            (ColumnBuffer::Int64(v), CellValue::Int(i)) => v.push(Some(*i)),
            (ColumnBuffer::Float64(v), CellValue::Float(f)) => v.push(Some(*f)),
            (ColumnBuffer::Float64(v), CellValue::Int(i)) => v.push(Some(*i as f64)),
            (ColumnBuffer::Utf8(v), CellValue::Text(s)) => v.push(Some(s.clone())),
            (ColumnBuffer::Timestamp(v), _) | (ColumnBuffer::Int64(v), _) => v.push(None),
            (ColumnBuffer::Float64(v), _) => v.push(None),
            (ColumnBuffer::Utf8(v), _) => v.push(None),
        }
    }

    fn finish(self) -> ArrayRef {
        match self {
            ColumnBuffer::Timestamp(v) => {
                Arc::new(TimestampMicrosecondArray::from(v).with_timezone("UTC"))
            }
            ColumnBuffer::Int64(v) => Arc::new(Int64Array::from(v)),
            ColumnBuffer::Float64(v) => Arc::new(Float64Array::from(v)),
            ColumnBuffer::Utf8(v) => Arc::new(StringArray::from(v)),
        }
    }
}

struct ParquetTransaction {
    table: TableSpec,
    columns: Vec<ColumnBuffer>,
    rows: usize,
    final_path: PathBuf,
    temp_path: PathBuf,
    compression: ParquetCompression,
}

impl ParquetTransaction {
    fn write_file(&self, batch: &RecordBatch) -> Result<(), LoadError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| LoadError::Io { path, source: e }
        };

        let mut file = File::create(&self.temp_path).map_err(io_err(&self.temp_path))?;
        let props = WriterProperties::builder()
            .set_compression(self.compression.codec())
            .build();
        let mut writer = ArrowWriter::try_new(&mut file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        file.sync_all().map_err(io_err(&self.temp_path))?;
        fs::rename(&self.temp_path, &self.final_path).map_err(io_err(&self.final_path))?;
        Ok(())
    }
}

impl BulkTransaction for ParquetTransaction {
    fn write_row(&mut self, row: &Row) -> Result<(), LoadError> {
        check_row(&self.table, row)?;
        for (buffer, cell) in self.columns.iter_mut().zip(&row.cells) {
            buffer.push(cell);
        }
        self.rows += 1;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<LoadReceipt, LoadError> {
        if self.rows == 0 {
            return Ok(LoadReceipt {
                table: self.table.name.clone(),
                rows: 0,
                location: None,
            });
        }

        let arrays: Vec<ArrayRef> = std::mem::take(&mut self.columns)
            .into_iter()
            .map(ColumnBuffer::finish)
            .collect();
        let batch = RecordBatch::try_new(self.table.arrow_schema(), arrays)?;

        if let Err(e) = self.write_file(&batch) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(e);
        }

        debug!(
            table = %self.table.name,
            rows = self.rows,
            path = %self.final_path.display(),
            "committed parquet part"
        );
        Ok(LoadReceipt {
            table: self.table.name.clone(),
            rows: self.rows,
            location: Some(self.final_path.clone()),
        })
    }
}

/// Count committed rows of a table under `root`.
///
/// Temporary files from in-flight or crashed commits are ignored.
pub fn count_rows(root: &Path, table: &str) -> Result<usize, LoadError> {
    let dir = root.join(table);
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = fs::read_dir(&dir).map_err(|e| LoadError::Io {
        path: dir.clone(),
        source: e,
    })?;

    let mut total = 0;
    for entry in entries {
        let path = entry
            .map_err(|e| LoadError::Io {
                path: dir.clone(),
                source: e,
            })?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some(PART_EXTENSION) {
            continue;
        }
        let file = File::open(&path).map_err(|e| LoadError::Io {
            path: path.clone(),
            source: e,
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            total += batch?.num_rows();
        }
    }
    Ok(total)
}
