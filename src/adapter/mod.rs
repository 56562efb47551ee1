//! Measurement stream adapter
//!
//! Turns heterogeneous rows (live device frames, spreadsheet/CSV/Parquet
//! imports) into the canonical, timestamp-ordered [`Sample`] sequence.
//!
//! ## Partial-success contract
//!
//! * A row without a usable timestamp, or with neither a usable current nor
//!   a usable voltage, fails the whole batch with a validation error.
//! * A row with only one of current/voltage unusable, or with physically
//!   implausible values, is skipped and reported in `warnings`.
//! * Supplied power that disagrees with `current × voltage` beyond the
//!   tolerance keeps the row and adds a warning.
//!
//! ```rust
//! use pvrsd_bench::adapter::{normalize, RawRow};
//! use serde_json::json;
//!
//! let rows: Vec<RawRow> = vec![
//!     serde_json::from_value(json!({"Timestamp": 2, "Current (A)": 0.5, "Voltage (V)": 10})).unwrap(),
//!     serde_json::from_value(json!({"timestamp": 1, "current": 0.4, "VOLTAGE": "abc"})).unwrap(),
//! ];
//! let normalized = normalize(&rows, 0.05).unwrap();
//! assert_eq!(normalized.samples.len(), 1);
//! assert_eq!(normalized.warnings.len(), 1);
//! ```

pub mod columnar;
mod columns;

pub use columns::{resolve as resolve_header, Column};

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{ToleranceWarning, WarningKind};
use crate::sample::{sort_stable, Channel, Sample, UNKNOWN_DEVICE_TYPE};
use crate::stats::{anomalies, AnomalyRule};
use crate::{Error, Result};

/// One input row: header → cell.
pub type RawRow = BTreeMap<String, Value>;

/// Plausibility bounds inherited from the import validator.
const MAX_CURRENT_A: f64 = 1000.0;
const MAX_VOLTAGE_V: f64 = 10_000.0;

/// Output of [`normalize`].
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    /// Samples sorted by timestamp, ties in input order
    pub samples: Vec<Sample>,
    /// Skipped rows and tolerance mismatches
    pub warnings: Vec<ToleranceWarning>,
}

/// Normalize a batch of raw rows.
///
/// `power_tolerance` is the relative tolerance between supplied power and
/// `current × voltage` (see [`crate::config::EngineConfig::power_tolerance`]).
///
/// # Errors
///
/// Returns a validation error naming the first row whose timestamp, or both
/// current and voltage, cannot be read.
pub fn normalize(rows: &[RawRow], power_tolerance: f64) -> Result<Normalized> {
    let mut out = Normalized::default();
    for (index, row) in rows.iter().enumerate() {
        match parse_row(index + 1, row, power_tolerance)? {
            RowOutcome::Sample(sample, warning) => {
                out.samples.push(*sample);
                out.warnings.extend(warning);
            }
            RowOutcome::Skipped(warning) => out.warnings.push(warning),
        }
    }
    sort_stable(&mut out.samples);
    tracing::debug!(
        rows = rows.len(),
        samples = out.samples.len(),
        warnings = out.warnings.len(),
        "normalized batch"
    );
    Ok(out)
}

/// One warning per sample whose `channel` reading is an outlier under `rule`.
///
/// Samples are kept; the warnings let an import be reviewed before it is fed.
#[must_use]
pub fn flag_anomalies(
    samples: &[Sample],
    channel: Channel,
    rule: AnomalyRule,
) -> Vec<ToleranceWarning> {
    let values: Vec<f64> = samples.iter().map(|s| channel.value(s)).collect();
    anomalies(&values, rule)
        .into_iter()
        .map(|i| {
            ToleranceWarning::new(
                WarningKind::Anomaly,
                format!("{channel:?} reading {} is an outlier ({rule:?})", values[i]),
                Some(samples[i].timestamp),
            )
        })
        .collect()
}

enum RowOutcome {
    Sample(Box<Sample>, Option<ToleranceWarning>),
    Skipped(ToleranceWarning),
}

struct Cells<'a> {
    cells: Vec<(Column, f64, &'a Value)>,
}

impl<'a> Cells<'a> {
    fn of(row: &'a RawRow) -> Self {
        let mut cells: Vec<(Column, f64, &Value)> = Vec::with_capacity(row.len());
        for (header, value) in row {
            if let Some((column, scale)) = columns::resolve(header) {
                // first spelling of a column wins
                if !cells.iter().any(|(c, _, _)| *c == column) {
                    cells.push((column, scale, value));
                }
            }
        }
        Self { cells }
    }

    fn raw(&self, column: Column) -> Option<&'a Value> {
        self.cells
            .iter()
            .find(|(c, _, _)| *c == column)
            .map(|(_, _, v)| *v)
    }

    fn number(&self, column: Column) -> Option<f64> {
        self.cells
            .iter()
            .find(|(c, _, _)| *c == column)
            .and_then(|(c, scale, v)| columns::numeric(*c, v, *scale))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_row(row_no: usize, row: &RawRow, power_tolerance: f64) -> Result<RowOutcome> {
    let cells = Cells::of(row);

    let timestamp = cells
        .raw(Column::Timestamp)
        .and_then(columns::timestamp)
        .ok_or_else(|| {
            Error::Validation(format!("row {row_no}: missing or unparseable timestamp"))
        })?;

    let current = cells.number(Column::Current);
    let voltage = cells.number(Column::Voltage);
    let (current, voltage) = match (current, voltage) {
        (Some(i), Some(v)) => (i, v),
        (None, None) => {
            return Err(Error::Validation(format!(
                "row {row_no}: neither current nor voltage is numeric"
            )))
        }
        (None, Some(_)) => return Ok(skip(row_no, "current is missing or not numeric", timestamp)),
        (Some(_), None) => return Ok(skip(row_no, "voltage is missing or not numeric", timestamp)),
    };

    if !(0.0..=MAX_CURRENT_A).contains(&current) {
        return Ok(skip(
            row_no,
            &format!("current {current} A outside 0..={MAX_CURRENT_A} A"),
            timestamp,
        ));
    }
    if !(0.0..=MAX_VOLTAGE_V).contains(&voltage) {
        return Ok(skip(
            row_no,
            &format!("voltage {voltage} V outside 0..={MAX_VOLTAGE_V} V"),
            timestamp,
        ));
    }

    let mut sample = Sample::new(timestamp, current, voltage);
    let mut warning = None;
    if let Some(power) = cells.number(Column::Power) {
        sample.power = power;
        if !sample.power_consistent(power_tolerance) {
            warning = Some(ToleranceWarning::new(
                WarningKind::PowerMismatch,
                format!(
                    "row {row_no}: power {power} W differs from current x voltage = {} W by more than {:.1}%",
                    sample.derived_power(),
                    power_tolerance * 100.0
                ),
                Some(timestamp),
            ));
        }
    }
    sample.temperature = cells.number(Column::Temperature);
    sample.humidity = cells.number(Column::Humidity);
    sample.sequence = cells
        .number(Column::Sequence)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64);
    sample.device_address = cells
        .number(Column::DeviceAddress)
        .filter(|n| *n >= 0.0 && *n <= f64::from(u32::MAX))
        .map_or(1, |n| n as u32);
    sample.device_type = match cells.raw(Column::DeviceType) {
        Some(value) if !columns::is_placeholder(value) => match value {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        },
        _ => UNKNOWN_DEVICE_TYPE.to_string(),
    };

    Ok(RowOutcome::Sample(Box::new(sample), warning))
}

fn skip(row_no: usize, why: &str, at: chrono::DateTime<chrono::Utc>) -> RowOutcome {
    RowOutcome::Skipped(ToleranceWarning::new(
        WarningKind::RowSkipped,
        format!("row {row_no}: {why}; row skipped"),
        Some(at),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_timestamp_fails_batch() {
        let rows = vec![
            row(json!({"timestamp": 1, "current": 1, "voltage": 1})),
            row(json!({"current": 1, "voltage": 1})),
        ];
        let err = normalize(&rows, 0.05).unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_both_channels_unusable_fails_batch() {
        let rows = vec![row(json!({"timestamp": 1, "current": "x", "voltage": "n/a"}))];
        assert!(matches!(normalize(&rows, 0.05), Err(Error::Validation(_))));
    }

    #[test]
    fn test_chinese_headers_and_unknown_device_type() {
        let rows = vec![row(json!({
            "序号": 1, "电流": 0.5, "电压": 20.0, "功率": 10.0,
            "时间戳": "2024-05-01 08:00:00", "设备地址": 3, "设备类型": "未知",
            "温度": 25.5, "湿度": 60
        }))];
        let out = normalize(&rows, 0.05).unwrap();
        let s = &out.samples[0];
        assert_eq!(s.device_address, 3);
        assert_eq!(s.device_type, UNKNOWN_DEVICE_TYPE);
        assert_eq!(s.temperature, Some(25.5));
        assert_eq!(s.humidity, Some(60.0));
        assert_eq!(s.sequence, Some(1));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_power_mismatch_warns_but_keeps_row() {
        let rows = vec![row(json!({"timestamp": 1, "current": 1.0, "voltage": 10.0, "power": 12.0}))];
        let out = normalize(&rows, 0.05).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert!((out.samples[0].power - 12.0).abs() < 1e-12);
        assert_eq!(out.warnings[0].kind, WarningKind::PowerMismatch);
    }

    #[test]
    fn test_implausible_values_skipped() {
        let rows = vec![
            row(json!({"timestamp": 1, "current": -1.0, "voltage": 10.0})),
            row(json!({"timestamp": 2, "current": 1.0, "voltage": 20_000.0})),
            row(json!({"timestamp": 3, "current": 1.0, "voltage": 10.0})),
        ];
        let out = normalize(&rows, 0.05).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.warnings.len(), 2);
    }

    #[test]
    fn test_header_units_convert() {
        let rows = vec![row(json!({"timestamp": 1, "current (mA)": 2.0, "voltage (kV)": 1.5}))];
        let out = normalize(&rows, 0.05).unwrap();
        assert!((out.samples[0].current - 0.002).abs() < 1e-12);
        assert!((out.samples[0].voltage - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn test_output_sorted_stable() {
        let rows = vec![
            row(json!({"timestamp": 5, "current": 0.5, "voltage": 1})),
            row(json!({"timestamp": 1, "current": 0.1, "voltage": 1})),
            row(json!({"timestamp": 5, "current": 0.6, "voltage": 1})),
        ];
        let out = normalize(&rows, 0.05).unwrap();
        let currents: Vec<f64> = out.samples.iter().map(|s| s.current).collect();
        assert_eq!(currents, vec![0.1, 0.5, 0.6]);
    }
}
