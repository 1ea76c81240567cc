//! Telemetry relay storage.
//!
//! This crate provides:
//! - Column specs and Arrow schemas for the relay's tables
//! - The row tuple handed to bulk loads
//! - The bulk-load transaction protocol
//! - A Parquet loader that commits one file per transaction

pub mod load;
pub mod row;
pub mod schema;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use load::{BulkLoad, BulkTransaction, LoadError, LoadReceipt};
pub use row::{CellValue, Row};
pub use schema::{metric_table, table_for, telemetry_table, ColumnSpec, ColumnType, TableSpec};
pub use writer::{count_rows, ParquetCompression, ParquetLoader, WriterConfig};

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryLoader, MemoryTables};

/// File extension for committed table parts.
pub const PART_EXTENSION: &str = "parquet";
