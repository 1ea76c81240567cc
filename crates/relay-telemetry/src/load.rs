//! Bulk-load transaction protocol.
//!
//! A load is `begin → write_row* → commit`. Dropping an uncommitted
//! transaction aborts it: nothing from it becomes visible in storage.

use std::path::PathBuf;
use thiserror::Error;

use crate::row::{CellValue, Row};
use crate::schema::{ColumnType, TableSpec};

/// Errors from a bulk load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("row has {actual} cells, table {table} has {expected} columns")]
    Arity {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("column {table}.{column} expects {expected}, got {actual}")]
    TypeMismatch {
        table: String,
        column: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("null in non-nullable column {table}.{column}")]
    NullViolation { table: String, column: &'static str },

    #[error("storage rejected the load: {0}")]
    Rejected(String),
}

/// Summary of a committed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReceipt {
    pub table: String,
    pub rows: usize,
    /// Where the rows landed, for file-backed loaders.
    pub location: Option<PathBuf>,
}

/// A storage backend that accepts bulk loads.
pub trait BulkLoad: Send {
    /// Open a transaction against `table`.
    fn begin<'a>(&'a mut self, table: &TableSpec)
        -> Result<Box<dyn BulkTransaction + 'a>, LoadError>;
}

/// One open bulk-load transaction.
pub trait BulkTransaction {
    /// Append a row. Rows must follow the table's column order.
    fn write_row(&mut self, row: &Row) -> Result<(), LoadError>;

    /// Make every written row visible at once.
    fn commit(self: Box<Self>) -> Result<LoadReceipt, LoadError>;

    /// Discard the transaction explicitly. Equivalent to dropping it.
    fn abort(self: Box<Self>) {}
}

/// Check a row against a table's arity, types and nullability.
///
/// Integers are accepted in float columns.
pub fn check_row(table: &TableSpec, row: &Row) -> Result<(), LoadError> {
    if row.cells.len() != table.columns.len() {
        return Err(LoadError::Arity {
            table: table.name.clone(),
            expected: table.columns.len(),
            actual: row.cells.len(),
        });
    }
    for (column, cell) in table.columns.iter().zip(&row.cells) {
        let ok = match (column.ty, cell) {
            (_, CellValue::Null) => {
                if !column.nullable {
                    return Err(LoadError::NullViolation {
                        table: table.name.clone(),
                        column: column.name,
                    });
                }
                true
            }
            (ColumnType::Timestamp, CellValue::Timestamp(_)) => true,
            (ColumnType::Int64, CellValue::Int(_)) => true,
            (ColumnType::Float64, CellValue::Float(_) | CellValue::Int(_)) => true,
            (ColumnType::Utf8, CellValue::Text(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(LoadError::TypeMismatch {
                table: table.name.clone(),
                column: column.name,
                expected: column.ty.as_str(),
                actual: cell.type_name(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{metric_table, telemetry_table};
    use chrono::Utc;
    use relay_common::StreamKind;

    fn metric_row(val: CellValue) -> Row {
        let now = Utc::now();
        Row {
            created_at: now,
            cells: vec![CellValue::Timestamp(now), val],
        }
    }

    #[test]
    fn test_check_row_accepts_int_in_float_column() {
        let table = metric_table(StreamKind::Pxm);
        assert!(check_row(&table, &metric_row(CellValue::Int(3))).is_ok());
        assert!(check_row(&table, &metric_row(CellValue::Float(3.5))).is_ok());
    }

    #[test]
    fn test_check_row_type_mismatch() {
        let table = metric_table(StreamKind::Kpm);
        let err = check_row(&table, &metric_row(CellValue::Text("x".into()))).unwrap_err();
        assert!(matches!(err, LoadError::TypeMismatch { column: "val", .. }));
    }

    #[test]
    fn test_check_row_arity_and_nulls() {
        let table = telemetry_table();
        let err = check_row(&table, &metric_row(CellValue::Int(1))).unwrap_err();
        assert!(matches!(err, LoadError::Arity { expected: 16, actual: 2, .. }));

        let metric = metric_table(StreamKind::Kpm);
        let row = Row {
            created_at: Utc::now(),
            cells: vec![CellValue::Null, CellValue::Int(1)],
        };
        assert!(matches!(
            check_row(&metric, &row),
            Err(LoadError::NullViolation { column: "reading_timestamp", .. })
        ));
    }
}
