//! Canonical measurement sample
//!
//! Every input path (live device, file import, simulation) ends up as a
//! timestamp-ordered sequence of [`Sample`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel used when a row's device type cannot be resolved.
pub const UNKNOWN_DEVICE_TYPE: &str = "unknown";

/// One electrical measurement.
///
/// Units: current in A, voltage in V, power in W, temperature in °C,
/// humidity in %RH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Measurement instant
    pub timestamp: DateTime<Utc>,
    /// Current (A)
    pub current: f64,
    /// Voltage (V)
    pub voltage: f64,
    /// Power (W), supplied or derived from `current × voltage`
    pub power: f64,
    /// Ambient or device temperature (°C)
    pub temperature: Option<f64>,
    /// Relative humidity (%RH)
    pub humidity: Option<f64>,
    /// Bus address of the reporting device
    pub device_address: u32,
    /// Device type label, `"unknown"` when unresolvable
    pub device_type: String,
    /// Sequence number from the source file, if any
    pub sequence: Option<u64>,
}

impl Sample {
    /// Create a sample with derived power and default device metadata.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, current: f64, voltage: f64) -> Self {
        Self {
            timestamp,
            current,
            voltage,
            power: current * voltage,
            temperature: None,
            humidity: None,
            device_address: 1,
            device_type: UNKNOWN_DEVICE_TYPE.to_string(),
            sequence: None,
        }
    }

    /// Attach an environmental reading.
    #[must_use]
    pub const fn with_environment(mut self, temperature: f64, humidity: f64) -> Self {
        self.temperature = Some(temperature);
        self.humidity = Some(humidity);
        self
    }

    /// Attach a temperature reading.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override the power channel.
    #[must_use]
    pub const fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    /// Set device address and type.
    #[must_use]
    pub fn with_device(mut self, address: u32, device_type: impl Into<String>) -> Self {
        self.device_address = address;
        self.device_type = device_type.into();
        self
    }

    /// Current in milliamperes; leakage limits are expressed in mA.
    #[must_use]
    pub fn current_ma(&self) -> f64 {
        self.current * 1000.0
    }

    /// `current × voltage`
    #[must_use]
    pub fn derived_power(&self) -> f64 {
        self.current * self.voltage
    }

    /// Whether supplied power agrees with `current × voltage` within `tolerance`
    /// (a fraction of the derived value).
    #[must_use]
    pub fn power_consistent(&self, tolerance: f64) -> bool {
        let derived = self.derived_power();
        (self.power - derived).abs() <= derived.abs() * tolerance + f64::EPSILON
    }
}

/// Sort samples by timestamp, keeping arrival order for ties.
pub fn sort_stable(samples: &mut [Sample]) {
    // slice::sort_by_key is stable
    samples.sort_by_key(|s| s.timestamp);
}

/// Channel selector used by statistics and trace comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Current (A)
    Current,
    /// Voltage (V)
    Voltage,
    /// Power (W)
    Power,
}

impl Channel {
    /// The three electrical channels.
    pub const ALL: [Self; 3] = [Self::Current, Self::Voltage, Self::Power];

    /// Read this channel from a sample.
    #[must_use]
    pub fn value(self, sample: &Sample) -> f64 {
        match self {
            Self::Current => sample.current,
            Self::Voltage => sample.voltage,
            Self::Power => sample.power,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_power_is_derived() {
        let s = Sample::new(t(0), 2.0, 10.0);
        assert!((s.power - 20.0).abs() < f64::EPSILON);
        assert!(s.power_consistent(0.0));
        assert_eq!(s.device_type, UNKNOWN_DEVICE_TYPE);
    }

    #[test]
    fn test_power_tolerance() {
        let s = Sample::new(t(0), 2.0, 10.0).with_power(20.9);
        assert!(s.power_consistent(0.05));
        assert!(!s.with_power(21.5).power_consistent(0.05));
    }

    #[test]
    fn test_sort_stable_keeps_ties_in_arrival_order() {
        let mut samples = vec![
            Sample::new(t(2), 1.0, 1.0),
            Sample::new(t(1), 0.1, 1.0),
            Sample::new(t(1), 0.2, 1.0),
            Sample::new(t(0) + Duration::milliseconds(500), 0.3, 1.0),
        ];
        sort_stable(&mut samples);
        let currents: Vec<f64> = samples.iter().map(|s| s.current).collect();
        assert_eq!(currents, vec![0.3, 0.1, 0.2, 1.0]);
    }
}
