//! Simulation engine
//!
//! Generates synthetic traces from a parametric circuit model and measures
//! how far a recorded trace deviates from them. Nothing here touches a clock
//! or a store: the same model, start instant and fault schedule always give
//! the same trace.
//!
//! ## Circuit model
//!
//! ```text
//!   input  ── ramp (slope V/s) ──► steady (± noise) ──► faults
//!   output voltage = input × efficiency × (1 − (T − 25 °C) × 0.002)
//!   output current = input × efficiency
//!   T += input power × (1 − efficiency) × 0.001 × dt,  T ∈ [ambient, 85 °C]
//! ```

mod compare;

pub use compare::{compare, ChannelDeviation, Comparison, DeviationMetrics};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::DeviceParams;
use crate::sample::Sample;
use crate::{Error, Result};

/// Device type written on every synthetic sample.
pub const SIMULATION_DEVICE_TYPE: &str = "simulation";

/// Largest trace [`simulate`] generates.
pub const MAX_SIMULATION_POINTS: usize = 10_000_000;

/// Upper bound of the thermal model (°C).
pub const MAX_TEMPERATURE_C: f64 = 85.0;

const REFERENCE_TEMPERATURE_C: f64 = 25.0;
const VOLTAGE_TEMPERATURE_COEFFICIENT: f64 = 0.002;
const THERMAL_GAIN: f64 = 0.001;
// Fault instants are compared against k × interval, which accumulates rounding.
const TIME_EPSILON: f64 = 1e-9;

/// Parametric description of the device under simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitModel {
    /// Rated voltage (V)
    pub rated_voltage: f64,
    /// Rated current (A), drawn once the ramp reaches the target
    pub rated_current: f64,
    /// Input voltage at the end of the ramp (V)
    pub target_voltage: f64,
    /// Ramp slope (V/s); zero starts directly at the target
    pub ramp_slope: f64,
    /// Uniform noise amplitude as a fraction of the steady value
    pub noise_amplitude: f64,
    /// Noise generator seed
    pub seed: u64,
    /// Time between samples (s)
    pub sample_interval_s: f64,
    /// Conversion efficiency in (0, 1]
    pub efficiency: f64,
    /// Starting and minimum temperature (°C)
    pub ambient_c: f64,
    /// Short-circuit current as a multiple of rated current
    pub short_circuit_multiplier: f64,
    /// Time from a fault until protection zeroes the output (s), if fitted
    pub protection_delay_s: Option<f64>,
}

impl Default for CircuitModel {
    fn default() -> Self {
        Self {
            rated_voltage: 1000.0,
            rated_current: 10.0,
            target_voltage: 1000.0,
            ramp_slope: 100.0,
            noise_amplitude: 0.01,
            seed: 0,
            sample_interval_s: 0.1,
            efficiency: 0.97,
            ambient_c: REFERENCE_TEMPERATURE_C,
            short_circuit_multiplier: 10.0,
            protection_delay_s: None,
        }
    }
}

impl CircuitModel {
    /// Model a device at its ratings with default dynamics.
    #[must_use]
    pub fn for_device(device: &DeviceParams) -> Self {
        Self {
            rated_voltage: device.rated_voltage,
            rated_current: device.rated_current,
            target_voltage: device.rated_voltage,
            ..Self::default()
        }
    }

    /// Set the ramp slope (V/s).
    #[must_use]
    pub const fn with_ramp_slope(mut self, slope: f64) -> Self {
        self.ramp_slope = slope;
        self
    }

    /// Set the noise amplitude and seed.
    #[must_use]
    pub const fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise_amplitude = amplitude;
        self.seed = seed;
        self
    }

    /// Set the sample interval (s).
    #[must_use]
    pub const fn with_sample_interval(mut self, interval_s: f64) -> Self {
        self.sample_interval_s = interval_s;
        self
    }

    /// Set the conversion efficiency.
    #[must_use]
    pub const fn with_efficiency(mut self, efficiency: f64) -> Self {
        self.efficiency = efficiency;
        self
    }

    /// Fit protection that zeroes the output `delay_s` after a fault.
    #[must_use]
    pub const fn with_protection_delay(mut self, delay_s: f64) -> Self {
        self.protection_delay_s = Some(delay_s);
        self
    }

    /// # Errors
    ///
    /// Returns a validation error naming the first out-of-range parameter.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("rated_voltage", self.rated_voltage),
            ("rated_current", self.rated_current),
            ("target_voltage", self.target_voltage),
            ("ramp_slope", self.ramp_slope),
            ("noise_amplitude", self.noise_amplitude),
            ("short_circuit_multiplier", self.short_circuit_multiplier),
            ("protection_delay_s", self.protection_delay_s.unwrap_or(0.0)),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(name, value, "a non-negative number"));
            }
        }
        if !(self.sample_interval_s.is_finite() && self.sample_interval_s > 0.0) {
            return Err(invalid("sample_interval_s", self.sample_interval_s, "positive"));
        }
        if !(self.efficiency > 0.0 && self.efficiency <= 1.0) {
            return Err(invalid("efficiency", self.efficiency, "in (0, 1]"));
        }
        if self.noise_amplitude >= 1.0 {
            return Err(invalid("noise_amplitude", self.noise_amplitude, "below 1"));
        }
        if !(self.ambient_c.is_finite() && self.ambient_c < MAX_TEMPERATURE_C) {
            return Err(invalid("ambient_c", self.ambient_c, "below 85 °C"));
        }
        Ok(())
    }

    /// Input voltage and load current `t` seconds after start, and whether
    /// the ramp has finished.
    fn source_at(&self, t: f64) -> (f64, f64, bool) {
        let voltage = if self.ramp_slope > 0.0 {
            (self.ramp_slope * t).min(self.target_voltage)
        } else {
            self.target_voltage
        };
        let current = if self.target_voltage > 0.0 {
            self.rated_current * voltage / self.target_voltage
        } else {
            0.0
        };
        (voltage, current, voltage >= self.target_voltage)
    }
}

fn invalid(name: &str, value: f64, expected: &str) -> Error {
    Error::Validation(format!("circuit model {name} must be {expected}, got {value}"))
}

/// Kind of an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// Output shorted: voltage collapses, current jumps to the short-circuit level
    Short,
    /// Load current multiplied by `factor`
    Overload {
        /// Multiple of the pre-fault current
        factor: f64,
    },
}

/// A fault applied from `at_s` seconds after start until the next fault.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledFault {
    /// Offset from the trace start (s)
    pub at_s: f64,
    /// What happens
    #[serde(flatten)]
    pub kind: FaultKind,
}

impl ScheduledFault {
    /// Short circuit at `at_s`.
    #[must_use]
    pub const fn short(at_s: f64) -> Self {
        Self {
            at_s,
            kind: FaultKind::Short,
        }
    }

    /// Overload by `factor` at `at_s`.
    #[must_use]
    pub const fn overload(at_s: f64, factor: f64) -> Self {
        Self {
            at_s,
            kind: FaultKind::Overload { factor },
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.at_s.is_finite() && self.at_s >= 0.0) {
            return Err(Error::Validation(format!(
                "fault time must be a non-negative number, got {}",
                self.at_s
            )));
        }
        if let FaultKind::Overload { factor } = self.kind {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(Error::Validation(format!(
                    "overload factor must be positive, got {factor}"
                )));
            }
        }
        Ok(())
    }
}

/// Generate a synthetic trace of `duration_s` seconds starting at `start`.
///
/// One sample is produced every `sample_interval_s`, the first at `start`.
/// The fault in force at any instant is the latest one scheduled at or
/// before it.
///
/// # Errors
///
/// Returns a validation error for an invalid model, duration or fault.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn simulate(
    model: &CircuitModel,
    start: DateTime<Utc>,
    duration_s: f64,
    faults: &[ScheduledFault],
) -> Result<Vec<Sample>> {
    model.validate()?;
    if !(duration_s.is_finite() && duration_s >= 0.0) {
        return Err(Error::Validation(format!(
            "simulation duration must be a non-negative number, got {duration_s}"
        )));
    }
    for fault in faults {
        fault.validate()?;
    }
    let mut schedule = faults.to_vec();
    schedule.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));

    let dt = model.sample_interval_s;
    let steps = (duration_s / dt + TIME_EPSILON).floor();
    if steps >= MAX_SIMULATION_POINTS as f64 {
        return Err(Error::Validation(format!(
            "simulation of {duration_s} s at {dt} s intervals exceeds {MAX_SIMULATION_POINTS} points"
        )));
    }
    timestamp_at(start, duration_s)?;
    let steps = steps as usize;
    let mut rng = StdRng::seed_from_u64(model.seed);
    let mut temperature = model.ambient_c;
    let mut trace = Vec::with_capacity(steps + 1);

    for k in 0..=steps {
        let t = k as f64 * dt;
        let (mut v_in, mut i_in, steady) = model.source_at(t);
        if steady && model.noise_amplitude > 0.0 {
            let a = model.noise_amplitude;
            v_in *= 1.0 + rng.gen_range(-a..=a);
            i_in *= 1.0 + rng.gen_range(-a..=a);
        }

        let temp_factor =
            1.0 - (temperature - REFERENCE_TEMPERATURE_C) * VOLTAGE_TEMPERATURE_COEFFICIENT;
        let mut voltage = v_in * model.efficiency * temp_factor;
        let mut current = i_in * model.efficiency;
        let mut load = i_in;

        let active = schedule.iter().rev().find(|f| f.at_s <= t + TIME_EPSILON);
        if let Some(fault) = active {
            let protected = model
                .protection_delay_s
                .is_some_and(|delay| t + TIME_EPSILON >= fault.at_s + delay);
            if protected {
                voltage = 0.0;
                current = 0.0;
                load = 0.0;
            } else {
                match fault.kind {
                    FaultKind::Short => {
                        voltage = 0.0;
                        current = model.short_circuit_multiplier * model.rated_current;
                        load = current;
                    }
                    FaultKind::Overload { factor } => {
                        current *= factor;
                        load *= factor;
                    }
                }
            }
        }

        let at = timestamp_at(start, t)?;
        trace.push(
            Sample::new(at, current, voltage)
                .with_temperature(temperature)
                .with_device(1, SIMULATION_DEVICE_TYPE),
        );

        let loss = v_in * load * (1.0 - model.efficiency);
        temperature = (temperature + loss * THERMAL_GAIN * dt).clamp(model.ambient_c, MAX_TEMPERATURE_C);
    }

    debug!(
        samples = trace.len(),
        faults = schedule.len(),
        seed = model.seed,
        "Generated synthetic trace"
    );
    Ok(trace)
}

/// `start + offset_s`, rejecting instants outside the representable range.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn timestamp_at(start: DateTime<Utc>, offset_s: f64) -> Result<DateTime<Utc>> {
    let micros = (offset_s * 1e6).round();
    let out_of_range = || {
        Error::Validation(format!(
            "simulation instant {offset_s} s after {} is out of range",
            start.to_rfc3339()
        ))
    };
    if micros.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    start
        .checked_add_signed(Duration::microseconds(micros as i64))
        .ok_or_else(out_of_range)
}

/// Reduce a trace to at most `max_points` samples, evenly spaced by index
/// and always keeping the first and last sample.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn downsample(trace: &[Sample], max_points: usize) -> Vec<Sample> {
    if trace.len() <= max_points {
        return trace.to_vec();
    }
    match max_points {
        0 => Vec::new(),
        1 => trace[..1].to_vec(),
        m => {
            let last = trace.len() - 1;
            (0..m)
                .map(|i| {
                    let idx = (i as f64 * last as f64 / (m - 1) as f64).round() as usize;
                    trace[idx.min(last)].clone()
                })
                .collect()
        }
    }
}

/// One simulation: the model, its synthetic trace, and optionally the
/// reference it was compared with.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    /// Model parameters
    pub model: CircuitModel,
    /// Simulated span (s)
    pub duration_s: f64,
    /// Fault schedule
    pub faults: Vec<ScheduledFault>,
    /// Generated trace
    pub synthetic: Vec<Sample>,
    /// Measured trace used for comparison
    pub reference: Option<Vec<Sample>>,
    /// Deviation of the reference from the synthetic trace
    pub comparison: Option<Comparison>,
}

impl SimulationRun {
    /// Simulate `model` from `start`.
    ///
    /// # Errors
    ///
    /// Propagates [`simulate`] validation errors.
    pub fn generate(
        model: CircuitModel,
        start: DateTime<Utc>,
        duration_s: f64,
        faults: Vec<ScheduledFault>,
    ) -> Result<Self> {
        let synthetic = simulate(&model, start, duration_s, &faults)?;
        Ok(Self {
            model,
            duration_s,
            faults,
            synthetic,
            reference: None,
            comparison: None,
        })
    }

    /// Compare the synthetic trace with a measured one.
    ///
    /// # Errors
    ///
    /// Propagates [`compare`] errors.
    pub fn against(mut self, reference: Vec<Sample>) -> Result<Self> {
        self.comparison = Some(compare(&self.synthetic, &reference)?);
        self.reference = Some(reference);
        Ok(self)
    }

    /// Persistable summary with traces reduced to `max_points`.
    #[must_use]
    pub fn summary(&self, max_points: usize, created_at: DateTime<Utc>) -> SimulationSummary {
        SimulationSummary {
            model: self.model.clone(),
            duration_s: self.duration_s,
            faults: self.faults.clone(),
            metrics: self.comparison.as_ref().map(|c| c.metrics.clone()),
            excluded_points: self.comparison.as_ref().map_or(0, |c| c.excluded_points),
            synthetic: downsample(&self.synthetic, max_points),
            reference: self
                .reference
                .as_deref()
                .map(|r| downsample(r, max_points)),
            created_at,
        }
    }
}

/// What gets attached to an experiment after a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    /// Model parameters
    pub model: CircuitModel,
    /// Simulated span (s)
    pub duration_s: f64,
    /// Fault schedule
    pub faults: Vec<ScheduledFault>,
    /// Deviation metrics, when a reference was compared
    pub metrics: Option<DeviationMetrics>,
    /// Reference points outside the synthetic span
    pub excluded_points: usize,
    /// Downsampled synthetic trace
    pub synthetic: Vec<Sample>,
    /// Downsampled reference trace
    pub reference: Option<Vec<Sample>>,
    /// When the summary was produced
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn quiet() -> CircuitModel {
        CircuitModel::default().with_noise(0.0, 0).with_sample_interval(1.0)
    }

    #[test]
    fn test_sample_count_and_spacing() {
        let trace = simulate(&quiet(), t0(), 20.0, &[]).unwrap();
        assert_eq!(trace.len(), 21);
        assert_eq!(trace[0].timestamp, t0());
        assert_eq!(trace[20].timestamp, t0() + Duration::seconds(20));
        assert!(trace.iter().all(|s| s.device_type == SIMULATION_DEVICE_TYPE));
    }

    #[test]
    fn test_ramp_then_steady() {
        let trace = simulate(&quiet(), t0(), 15.0, &[]).unwrap();
        assert!(trace[0].voltage.abs() < f64::EPSILON);
        // 5 s at 100 V/s: 500 × 0.97, less a fraction of a degree of heating
        assert!((trace[5].voltage - 485.0).abs() < 0.5);
        assert!(trace[5].voltage < 485.0);
        assert!(trace[10].voltage > 960.0);
        assert!(trace[12].voltage <= trace[10].voltage);
        assert!((trace[12].current - 9.7).abs() < 1e-9);
    }

    #[test]
    fn test_same_seed_same_trace() {
        let model = CircuitModel::default().with_noise(0.05, 7);
        let a = simulate(&model, t0(), 30.0, &[]).unwrap();
        let b = simulate(&model, t0(), 30.0, &[]).unwrap();
        assert_eq!(a, b);
        let c = simulate(&model.with_noise(0.05, 8), t0(), 30.0, &[]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_circuit_and_protection() {
        let model = quiet().with_protection_delay(2.0);
        let trace = simulate(&model, t0(), 20.0, &[ScheduledFault::short(15.0)]).unwrap();
        assert!(trace[14].voltage > 900.0);
        assert!(trace[15].voltage.abs() < f64::EPSILON);
        assert!((trace[15].current - 100.0).abs() < 1e-9);
        assert!((trace[16].current - 100.0).abs() < 1e-9);
        assert!(trace[17].current.abs() < f64::EPSILON);
        assert!(trace[17].voltage.abs() < f64::EPSILON);
    }

    #[test]
    fn test_overload_scales_current() {
        let trace = simulate(&quiet(), t0(), 20.0, &[ScheduledFault::overload(12.0, 1.5)]).unwrap();
        assert!((trace[11].current - 9.7).abs() < 1e-9);
        assert!((trace[12].current - 14.55).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_rises_within_bounds() {
        let model = quiet().with_efficiency(0.5);
        let trace = simulate(&model, t0(), 600.0, &[]).unwrap();
        let temps: Vec<f64> = trace.iter().filter_map(|s| s.temperature).collect();
        assert!((temps[0] - 25.0).abs() < f64::EPSILON);
        assert!(temps.windows(2).all(|w| w[1] >= w[0]));
        assert!((temps[temps.len() - 1] - MAX_TEMPERATURE_C).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let bad = quiet().with_sample_interval(0.0);
        assert!(matches!(simulate(&bad, t0(), 1.0, &[]), Err(Error::Validation(_))));
        assert!(simulate(&quiet(), t0(), -1.0, &[]).is_err());
        assert!(simulate(&quiet(), t0(), 1.0, &[ScheduledFault::overload(0.5, 0.0)]).is_err());
        assert!(quiet().with_efficiency(1.2).validate().is_err());
    }

    #[test]
    fn test_oversized_runs_rejected() {
        let err = simulate(&CircuitModel::default(), t0(), 1e20, &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("points")), "{err}");

        // few points, but the last one lies past the calendar
        let sparse = quiet().with_sample_interval(1e12);
        let err = simulate(&sparse, t0(), 8.5e12, &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("out of range")), "{err}");
        let err = simulate(&sparse, t0(), 1e15, &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_downsample_keeps_endpoints() {
        let trace = simulate(&quiet(), t0(), 99.0, &[]).unwrap();
        let reduced = downsample(&trace, 10);
        assert_eq!(reduced.len(), 10);
        assert_eq!(reduced[0], trace[0]);
        assert_eq!(reduced[9], trace[99]);
        assert_eq!(downsample(&trace, 500).len(), 100);
        assert!(downsample(&trace, 0).is_empty());
    }

    #[test]
    fn test_summary_serializes() {
        let run = SimulationRun::generate(quiet(), t0(), 10.0, vec![ScheduledFault::short(5.0)])
            .unwrap();
        let reference = run.synthetic.clone();
        let run = run.against(reference).unwrap();
        let summary = run.summary(4, t0());
        assert_eq!(summary.synthetic.len(), 4);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"kind\":\"short\""));
        let back: SimulationSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.faults, summary.faults);
        assert_eq!(back.synthetic.len(), 4);
        assert_eq!(back.metrics.unwrap().compared_points, 11);
    }
}
