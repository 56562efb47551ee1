//! Bulk import from Arrow record batches and Parquet files
//!
//! Measurement exports arrive as Parquet; each record batch is flattened to
//! [`RawRow`]s so the regular normalization rules (header aliases, units,
//! placeholders) apply unchanged.

use std::path::Path;

use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use serde_json::Value;

use super::{normalize, Normalized, RawRow};
use crate::{Error, Result};

/// Flatten a record batch into rows keyed by column name.
///
/// # Errors
///
/// Returns a validation error naming the column if its data type is not
/// supported for import.
pub fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<RawRow>> {
    let schema = batch.schema();
    let mut rows: Vec<RawRow> = vec![RawRow::new(); batch.num_rows()];
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let cells = cells(field.name(), column.as_ref())?;
        for (row, cell) in rows.iter_mut().zip(cells) {
            row.insert(field.name().clone(), cell);
        }
    }
    Ok(rows)
}

/// Read every row of a Parquet file.
///
/// # Errors
///
/// Returns error if the file cannot be opened, decoded, or contains an
/// unsupported column type.
pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<RawRow>> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;

    let file = File::open(path.as_ref())?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        rows.extend(rows_from_batch(&batch?)?);
    }
    tracing::info!(path = %path.as_ref().display(), rows = rows.len(), "loaded parquet import");
    Ok(rows)
}

/// Read and normalize a Parquet measurement file.
///
/// # Errors
///
/// Returns error on IO/decoding failure or when normalization rejects the batch.
pub fn import_parquet<P: AsRef<Path>>(path: P, power_tolerance: f64) -> Result<Normalized> {
    normalize(&load_parquet(path)?, power_tolerance)
}

macro_rules! collect_cells {
    ($array:expr, $ty:ty, $map:expr) => {{
        let typed = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| Error::Validation("column type mismatch".to_string()))?;
        (0..typed.len())
            .map(|i| {
                if typed.is_null(i) {
                    Value::Null
                } else {
                    $map(typed.value(i))
                }
            })
            .collect::<Vec<Value>>()
    }};
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn timestamp(dt: Option<DateTime<chrono::Utc>>) -> Value {
    dt.map_or(Value::Null, |dt| Value::String(dt.to_rfc3339()))
}

fn cells(name: &str, array: &dyn Array) -> Result<Vec<Value>> {
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => collect_cells!(array, BooleanArray, Value::Bool),
        DataType::Int16 => collect_cells!(array, Int16Array, |v: i16| Value::from(v)),
        DataType::Int32 => collect_cells!(array, Int32Array, |v: i32| Value::from(v)),
        DataType::Int64 => collect_cells!(array, Int64Array, |v: i64| Value::from(v)),
        DataType::UInt16 => collect_cells!(array, UInt16Array, |v: u16| Value::from(v)),
        DataType::UInt32 => collect_cells!(array, UInt32Array, |v: u32| Value::from(v)),
        DataType::UInt64 => collect_cells!(array, UInt64Array, |v: u64| Value::from(v)),
        DataType::Float32 => collect_cells!(array, Float32Array, |v: f32| number(f64::from(v))),
        DataType::Float64 => collect_cells!(array, Float64Array, number),
        DataType::Utf8 => collect_cells!(array, StringArray, |v: &str| Value::from(v)),
        DataType::LargeUtf8 => collect_cells!(array, LargeStringArray, |v: &str| Value::from(v)),
        DataType::Timestamp(TimeUnit::Second, _) => {
            collect_cells!(array, TimestampSecondArray, |v: i64| timestamp(
                DateTime::from_timestamp(v, 0)
            ))
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            collect_cells!(array, TimestampMillisecondArray, |v: i64| timestamp(
                DateTime::from_timestamp_millis(v)
            ))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            collect_cells!(array, TimestampMicrosecondArray, |v: i64| timestamp(
                DateTime::from_timestamp_micros(v)
            ))
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            collect_cells!(array, TimestampNanosecondArray, |v: i64| timestamp(Some(
                DateTime::from_timestamp_nanos(v)
            )))
        }
        other => {
            return Err(Error::Validation(format!(
                "column {name}: unsupported import type {other}"
            )))
        }
    };
    Ok(values)
}
