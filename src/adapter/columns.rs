//! Header and cell interpretation for bulk-import rows

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Canonical import column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// Row sequence number
    Sequence,
    /// Current (A)
    Current,
    /// Voltage (V)
    Voltage,
    /// Power (W)
    Power,
    /// Timestamp
    Timestamp,
    /// Device bus address
    DeviceAddress,
    /// Device type label
    DeviceType,
    /// Temperature (°C)
    Temperature,
    /// Relative humidity (%RH)
    Humidity,
}

/// Header spellings in normalized form (lower case, no spaces/underscores).
const HEADERS: &[(Column, &[&str])] = &[
    (Column::Sequence, &["seq", "sequence", "sequencenumber", "no", "index", "序号"]),
    (Column::Current, &["current", "i", "电流"]),
    (Column::Voltage, &["voltage", "v", "u", "电压"]),
    (Column::Power, &["power", "p", "功率"]),
    (Column::Timestamp, &["timestamp", "time", "datetime", "ts", "时间戳", "时间"]),
    (Column::DeviceAddress, &["deviceaddress", "address", "addr", "设备地址"]),
    (Column::DeviceType, &["devicetype", "type", "设备类型"]),
    (Column::Temperature, &["temperature", "temp", "t", "温度"]),
    (Column::Humidity, &["humidity", "rh", "hum", "湿度"]),
];

/// Cell text meaning "no value".
const PLACEHOLDERS: &[&str] = &["", "-", "--", "n/a", "na", "nan", "null", "none", "unknown", "未知"];

/// Resolve a header to its column and the scale converting its unit to the
/// canonical one (`"Current (mA)"` → `(Current, 0.001)`).
#[must_use]
pub fn resolve(header: &str) -> Option<(Column, f64)> {
    let (name, unit) = split_unit(header);
    let key: String = name
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    let column = HEADERS
        .iter()
        .find(|(_, names)| names.contains(&key.as_str()))
        .map(|(column, _)| *column)?;
    let scale = unit.and_then(|u| unit_scale(column, u)).unwrap_or(1.0);
    Some((column, scale))
}

/// Split `"Voltage (kV)"`, `"电流（mA）"` or `"power[W]"` into name and unit.
fn split_unit(header: &str) -> (&str, Option<&str>) {
    let header = header.trim();
    let open = header.find(['(', '[', '（']);
    match open {
        Some(start) => {
            let name = &header[..start];
            let rest = &header[start..];
            let unit = rest
                .trim_start_matches(['(', '[', '（'])
                .trim_end_matches([')', ']', '）'])
                .trim();
            (name, Some(unit))
        }
        None => (header, None),
    }
}

/// Scale from `unit` to the column's canonical unit; `None` for unknown units.
fn unit_scale(column: Column, unit: &str) -> Option<f64> {
    let unit = unit.trim();
    let prefix = match column {
        Column::Current => unit.strip_suffix('A')?,
        Column::Voltage => unit.strip_suffix('V')?,
        Column::Power => unit.strip_suffix('W')?,
        _ => return None,
    };
    match prefix {
        "" => Some(1.0),
        "k" | "K" => Some(1e3),
        "m" => Some(1e-3),
        "u" | "µ" | "μ" => Some(1e-6),
        _ => None,
    }
}

/// Whether a cell holds a placeholder for "no value".
#[must_use]
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            PLACEHOLDERS.contains(&s.as_str())
        }
        _ => false,
    }
}

/// Numeric cell in the column's canonical unit.
///
/// Accepts numbers, numeric strings and strings carrying their own unit
/// suffix (`"5 mA"`). `header_scale` applies only when the cell has no unit.
#[must_use]
pub fn numeric(column: Column, value: &Value, header_scale: f64) -> Option<f64> {
    if is_placeholder(value) {
        return None;
    }
    let parsed = match value {
        Value::Number(n) => n.as_f64().map(|v| v * header_scale),
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(v) => Some(v * header_scale),
                Err(_) => {
                    let split = s
                        .char_indices()
                        .find(|(_, c)| c.is_alphabetic())
                        .map(|(i, _)| i)?;
                    let number: f64 = s[..split].trim().parse().ok()?;
                    unit_scale(column, s[split..].trim()).map(|scale| number * scale)
                }
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Timestamp cell: RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) or epoch seconds.
#[must_use]
pub fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if is_placeholder(value) {
        return None;
    }
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_seconds),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            s.parse::<f64>().ok().and_then(epoch_seconds)
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_headers() {
        assert_eq!(resolve("Current (A)"), Some((Column::Current, 1.0)));
        assert_eq!(resolve("VOLTAGE"), Some((Column::Voltage, 1.0)));
        assert_eq!(resolve("电流（mA）"), Some((Column::Current, 1e-3)));
        assert_eq!(resolve("Device_Address"), Some((Column::DeviceAddress, 1.0)));
        assert_eq!(resolve("humidity (%RH)"), Some((Column::Humidity, 1.0)));
        assert_eq!(resolve("voltage[kV]"), Some((Column::Voltage, 1e3)));
        assert_eq!(resolve("comment"), None);
    }

    #[test]
    fn test_numeric_cells() {
        assert_eq!(numeric(Column::Current, &json!(2.5), 1.0), Some(2.5));
        assert_eq!(numeric(Column::Current, &json!("2.5"), 1.0), Some(2.5));
        let ma = numeric(Column::Current, &json!("5 mA"), 1.0).unwrap();
        assert!((ma - 0.005).abs() < 1e-12);
        let kv = numeric(Column::Voltage, &json!("1.2kV"), 1.0).unwrap();
        assert!((kv - 1200.0).abs() < 1e-9);
        assert_eq!(numeric(Column::Voltage, &json!(3), 1e3), Some(3000.0));
        assert_eq!(numeric(Column::Voltage, &json!("abc"), 1.0), None);
        assert_eq!(numeric(Column::Voltage, &json!("unknown"), 1.0), None);
        assert_eq!(numeric(Column::Voltage, &json!(true), 1.0), None);
    }

    #[test]
    fn test_timestamps() {
        let expected = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(timestamp(&json!(1_700_000_000)), Some(expected));
        assert_eq!(timestamp(&json!("2023-11-14T22:13:20Z")), Some(expected));
        assert_eq!(timestamp(&json!("2023-11-14 22:13:20")), Some(expected));
        assert_eq!(
            timestamp(&json!(1_700_000_000.5)),
            Some(DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap())
        );
        assert_eq!(timestamp(&json!("yesterday")), None);
    }
}
