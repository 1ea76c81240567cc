//! Table column specs and their Arrow schemas.
//!
//! `telemetry_data` carries the full 16-column flattened record.
//! Each metric kind gets its own two-column table `metric_data_<kind>`.

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use std::sync::Arc;

use relay_common::StreamKind;

/// Storage column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UTC instant, microsecond precision.
    Timestamp,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Timestamp => "timestamp",
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Utf8 => "utf8",
        }
    }

    fn arrow_type(self) -> DataType {
        match self {
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

const fn col(name: &'static str, ty: ColumnType, nullable: bool) -> ColumnSpec {
    ColumnSpec { name, ty, nullable }
}

/// A destination table: its name plus the fixed column list rows must follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Column names in bulk-load order.
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(c.name, c.ty.arrow_type(), c.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

const TELEMETRY_COLUMNS: [ColumnSpec; 16] = [
    col("reading_timestamp", ColumnType::Timestamp, false),
    col("telemetry_type", ColumnType::Utf8, false),
    col("sensor_id", ColumnType::Utf8, true),
    col("subsystem", ColumnType::Utf8, true),
    col("sequence_number", ColumnType::Int64, true),
    col("status_bitmask", ColumnType::Int64, true),
    col("temperature", ColumnType::Float64, true),
    col("temp_unit", ColumnType::Utf8, true),
    col("pressure", ColumnType::Float64, true),
    col("pressure_unit", ColumnType::Utf8, true),
    col("leak_detected", ColumnType::Int64, true),
    col("velocity_x", ColumnType::Float64, true),
    col("velocity_y", ColumnType::Float64, true),
    col("velocity_z", ColumnType::Float64, true),
    col("velocity_unit", ColumnType::Utf8, true),
    col("vibration_magnitude", ColumnType::Float64, true),
];

/// The `telemetry_data` table.
pub fn telemetry_table() -> TableSpec {
    TableSpec {
        name: StreamKind::Telemetry.table_name(),
        columns: TELEMETRY_COLUMNS.to_vec(),
    }
}

/// The `metric_data_<kind>` table for a metric kind.
///
/// `val` is integer for kpm/cpm, float for pxm and text for title.
pub fn metric_table(kind: StreamKind) -> TableSpec {
    let val_type = match kind {
        StreamKind::Kpm | StreamKind::Cpm => ColumnType::Int64,
        StreamKind::Pxm => ColumnType::Float64,
        StreamKind::Title | StreamKind::Telemetry => ColumnType::Utf8,
    };
    TableSpec {
        name: kind.table_name(),
        columns: vec![
            col("reading_timestamp", ColumnType::Timestamp, false),
            col("val", val_type, true),
        ],
    }
}

/// The table a pipeline of `kind` persists into.
pub fn table_for(kind: StreamKind) -> TableSpec {
    if kind.is_metric() {
        metric_table(kind)
    } else {
        telemetry_table()
    }
}
