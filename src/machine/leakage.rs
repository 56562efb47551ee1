//! Leakage current across climate conditions
//!
//! For each condition the machine waits in `STABILIZING` until temperature
//! and humidity are within tolerance (or the chamber reports the condition),
//! then accumulates leakage in `MEASURING` for the condition's duration.
//! The verdict is the AND of the per-condition verdicts.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{num, seconds, Core, DeviceParams, FixtureEvent, Flow, Phase, Protocol};
use crate::error::WarningKind;
use crate::evaluation::{evaluate, Criteria, PhaseStats, Verdict, CONDITION_KEY};
use crate::sample::Sample;
use crate::standard::{number, Standard, MAX_DURATION_S};
use crate::stats::RunningStats;
use crate::{Error, Result};

const DEFAULT_CONDITION_DURATION_S: f64 = 30.0;
const DEFAULT_VOLTAGE_FACTOR: f64 = 1.1;
const DEFAULT_VOLTAGE_TOLERANCE: f64 = 0.05;
const DEFAULT_TEMPERATURE_TOLERANCE: f64 = 2.0;
const DEFAULT_HUMIDITY_TOLERANCE: f64 = 5.0;
const DEFAULT_STABILIZATION_TIMEOUT_S: f64 = 1800.0;
const ROOM_TEMPERATURE_LIMIT_MA: f64 = 3.5;
const ELEVATED_TEMPERATURE_LIMIT_MA: f64 = 5.0;
const ROOM_TEMPERATURE_C: f64 = 25.0;

/// One climate condition of the leakage test.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Tag used in criteria keys (`max_leakage_<label>`)
    pub label: String,
    /// Target temperature (°C)
    pub temperature: Option<f64>,
    /// Target relative humidity (%RH)
    pub humidity: Option<f64>,
    /// Measuring window (s)
    pub duration_s: f64,
    /// Leakage limit (mA)
    pub limit_ma: f64,
}

impl Condition {
    fn from_value(index: usize, value: &Value, standard: &Standard) -> Result<Self> {
        let invalid = |why: &str| {
            Error::Validation(format!(
                "standard {}: condition #{}: {why}",
                standard.code(),
                index + 1
            ))
        };
        let object = value.as_object().ok_or_else(|| invalid("not an object"))?;
        let temperature = object
            .get("temperature")
            .or_else(|| object.get("temp"))
            .and_then(number);
        let humidity = object.get("humidity").and_then(number);
        let duration_s = object
            .get("duration")
            .and_then(number)
            .unwrap_or(DEFAULT_CONDITION_DURATION_S);
        if !(duration_s.is_finite() && (0.0..=MAX_DURATION_S).contains(&duration_s)) {
            return Err(invalid(&format!(
                "duration must be between 0 and {MAX_DURATION_S} s, got {duration_s}"
            )));
        }
        let label = match object.get("label").and_then(Value::as_str) {
            Some(label) if !label.trim().is_empty() => label.trim().to_string(),
            _ => match (temperature, humidity) {
                (Some(t), Some(h)) => format!("{t:.0}C_{h:.0}RH"),
                (Some(t), None) => format!("{t:.0}C"),
                _ => return Err(invalid("needs a label or a temperature")),
            },
        };
        let mut condition = Self {
            label,
            temperature,
            humidity,
            duration_s,
            limit_ma: 0.0,
        };
        condition.limit_ma = limit_for(standard, &condition);
        Ok(condition)
    }
}

/// Leakage limit for a condition.
///
/// Lookup order: `max_leakage_<label>`, `max_leakage_<T>C`, the lowest
/// temperature-keyed limit at or above the condition's temperature (else the
/// highest), `max_leakage`, then 3.5 mA up to 25 °C and 5.0 mA above.
fn limit_for(standard: &Standard, condition: &Condition) -> f64 {
    if let Some(limit) = standard.criterion_f64(&format!("max_leakage_{}", condition.label)) {
        return limit;
    }
    if let Some(t) = condition.temperature {
        if let Some(limit) = standard.criterion_f64(&format!("max_leakage_{t:.0}C")) {
            return limit;
        }
        let mut keyed: Vec<(f64, f64)> = standard
            .pass_criteria()
            .iter()
            .filter_map(|(key, value)| {
                let temperature = key
                    .strip_prefix("max_leakage_")?
                    .strip_suffix('C')?
                    .parse::<f64>()
                    .ok()?;
                Some((temperature, number(value)?))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(&(_, limit)) = keyed.iter().find(|(kt, _)| t <= *kt).or(keyed.last()) {
            return limit;
        }
    }
    if let Some(limit) = standard.criterion_f64("max_leakage") {
        return limit;
    }
    if condition.temperature.map_or(true, |t| t <= ROOM_TEMPERATURE_C) {
        ROOM_TEMPERATURE_LIMIT_MA
    } else {
        ELEVATED_TEMPERATURE_LIMIT_MA
    }
}

fn default_conditions() -> Value {
    json!([
        {"label": "25C", "temperature": 25.0, "humidity": 60.0},
        {"label": "40C", "temperature": 40.0, "humidity": 60.0},
        {"label": "60C", "temperature": 60.0, "humidity": 60.0},
        {"label": "25C_93RH", "temperature": 25.0, "humidity": 93.0},
        {"label": "40C_93RH", "temperature": 40.0, "humidity": 93.0}
    ])
}

/// Leakage parameters resolved from a standard and the device ratings.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakageParams {
    /// Conditions in test order, limits resolved
    pub conditions: Vec<Condition>,
    /// Applied voltage (V), default `1.1 × rated voltage`
    pub test_voltage: f64,
    /// Fraction below `test_voltage` tolerated before warning
    pub voltage_tolerance: f64,
    /// Temperature band around the target (°C)
    pub temperature_tolerance: f64,
    /// Humidity band around the target (%RH)
    pub humidity_tolerance: f64,
    /// Time allowed to reach a condition (s)
    pub stabilization_timeout_s: f64,
}

impl LeakageParams {
    /// Resolve parameters, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed or empty condition list or
    /// negative values.
    pub fn resolve(standard: &Standard, device: &DeviceParams) -> Result<Self> {
        let defaults = default_conditions();
        let items = match standard.param("conditions") {
            None => &defaults,
            Some(value @ Value::Array(_)) => value,
            Some(_) => {
                return Err(Error::Validation(format!(
                    "standard {}: parameter conditions must be an array",
                    standard.code()
                )))
            }
        };
        let conditions = items
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Condition::from_value(i, item, standard))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        if conditions.is_empty() {
            return Err(Error::Validation(format!(
                "standard {}: leakage test needs at least one condition",
                standard.code()
            )));
        }
        Ok(Self {
            conditions,
            test_voltage: standard.non_negative_or(
                "test_voltage",
                DEFAULT_VOLTAGE_FACTOR * device.rated_voltage,
            )?,
            voltage_tolerance: standard
                .non_negative_or("voltage_tolerance", DEFAULT_VOLTAGE_TOLERANCE)?,
            temperature_tolerance: standard
                .non_negative_or("temperature_tolerance", DEFAULT_TEMPERATURE_TOLERANCE)?,
            humidity_tolerance: standard
                .non_negative_or("humidity_tolerance", DEFAULT_HUMIDITY_TOLERANCE)?,
            stabilization_timeout_s: standard
                .duration_or("stabilization_timeout", DEFAULT_STABILIZATION_TIMEOUT_S)?,
        })
    }
}

#[derive(Debug)]
struct ConditionResult {
    label: String,
    limit_ma: f64,
    stabilized: bool,
    leakage_ma: RunningStats,
}

#[derive(Debug)]
pub(super) struct Leakage {
    params: LeakageParams,
    index: usize,
    measuring_since: Option<DateTime<Utc>>,
    leakage_ma: RunningStats,
    undervoltage_warned: bool,
    drift_warned: bool,
    results: Vec<ConditionResult>,
}

impl Leakage {
    pub(super) const fn new(params: LeakageParams) -> Self {
        Self {
            params,
            index: 0,
            measuring_since: None,
            leakage_ma: RunningStats::new(),
            undervoltage_warned: false,
            drift_warned: false,
            results: Vec::new(),
        }
    }

    fn condition(&self) -> Option<&Condition> {
        self.params.conditions.get(self.index)
    }

    fn within(&self, condition: &Condition, sample: &Sample) -> bool {
        let near = |target: Option<f64>, reading: Option<f64>, tolerance: f64| match (target, reading)
        {
            (None, _) => true,
            (Some(target), Some(reading)) => (reading - target).abs() <= tolerance,
            (Some(_), None) => false,
        };
        near(
            condition.temperature,
            sample.temperature,
            self.params.temperature_tolerance,
        ) && near(
            condition.humidity,
            sample.humidity,
            self.params.humidity_tolerance,
        )
    }

    fn start_measuring(&mut self, core: &mut Core, at: DateTime<Utc>) {
        let label = self.condition().map(|c| c.label.clone());
        core.stat("stabilization_s", num(core.since_entry(at)));
        core.enter(Phase::Measuring, label, at);
        self.measuring_since = Some(at);
        self.leakage_ma = RunningStats::new();
        self.undervoltage_warned = false;
        self.drift_warned = false;
    }

    fn finish(&mut self, core: &mut Core, at: DateTime<Utc>, stabilized: bool) -> Flow {
        let Some(condition) = self.condition().cloned() else {
            return Flow::Complete;
        };
        let leakage_ma = std::mem::take(&mut self.leakage_ma);
        if let Some(max) = leakage_ma.max() {
            core.stat("max_leakage", num(max));
        }
        core.stat("samples", leakage_ma.count());
        if !stabilized {
            core.warn(
                WarningKind::ConditionDrift,
                format!(
                    "condition {} not reached within {} s",
                    condition.label, self.params.stabilization_timeout_s
                ),
                at,
            );
        }
        self.results.push(ConditionResult {
            label: condition.label,
            limit_ma: condition.limit_ma,
            stabilized,
            leakage_ma,
        });
        self.measuring_since = None;
        self.index += 1;

        match self.condition() {
            Some(next) => {
                let label = Some(next.label.clone());
                core.enter(Phase::Stabilizing, label, at);
                Flow::Continue
            }
            None => Flow::Complete,
        }
    }

    fn measuring_done(&self, at: DateTime<Utc>) -> bool {
        match (self.measuring_since, self.condition()) {
            (Some(since), Some(condition)) => seconds(since, at) >= condition.duration_s,
            _ => false,
        }
    }

    fn stabilization_timed_out(&self, core: &Core, at: DateTime<Utc>) -> bool {
        core.since_entry(at) > self.params.stabilization_timeout_s
    }

    fn measure(&mut self, core: &mut Core, sample: &Sample) {
        self.leakage_ma.push(sample.current_ma());
        let floor = self.params.test_voltage * (1.0 - self.params.voltage_tolerance);
        if sample.voltage < floor && !self.undervoltage_warned {
            self.undervoltage_warned = true;
            core.warn(
                WarningKind::ConditionDrift,
                format!(
                    "applied voltage {:.1} V below test voltage {:.1} V",
                    sample.voltage, self.params.test_voltage
                ),
                sample.timestamp,
            );
        }
        let drifted = self
            .condition()
            .is_some_and(|condition| !self.within(condition, sample));
        if drifted && !self.drift_warned {
            self.drift_warned = true;
            core.warn(
                WarningKind::ConditionDrift,
                format!(
                    "climate drifted from condition {} while measuring",
                    core.label.as_deref().unwrap_or("?")
                ),
                sample.timestamp,
            );
        }
    }
}

impl Protocol for Leakage {
    fn entry(&mut self) -> (Phase, Option<String>) {
        (Phase::Stabilizing, self.condition().map(|c| c.label.clone()))
    }

    fn on_sample(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let at = sample.timestamp;
        match core.phase {
            Phase::Stabilizing => {
                if self.stabilization_timed_out(core, at) {
                    return self.finish(core, at, false);
                }
                let stable = self
                    .condition()
                    .is_some_and(|condition| self.within(condition, sample));
                if stable {
                    self.start_measuring(core, at);
                }
                Flow::Continue
            }
            Phase::Measuring => {
                self.measure(core, sample);
                if self.measuring_done(at) {
                    return self.finish(core, at, true);
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn on_event(&mut self, core: &mut Core, at: DateTime<Utc>, event: &FixtureEvent) -> Flow {
        if core.phase == Phase::Stabilizing && *event == FixtureEvent::ConditionReached {
            self.start_measuring(core, at);
        } else {
            tracing::debug!(phase = %core.phase, ?event, "event ignored");
        }
        Flow::Continue
    }

    fn on_tick(&mut self, core: &mut Core, now: DateTime<Utc>) -> Flow {
        match core.phase {
            Phase::Stabilizing if self.stabilization_timed_out(core, now) => {
                self.finish(core, now, false)
            }
            Phase::Measuring if self.measuring_done(now) => self.finish(core, now, true),
            _ => Flow::Continue,
        }
    }

    fn live_stats(&self) -> PhaseStats {
        let mut stats = PhaseStats::new();
        if let Some(condition) = self.condition() {
            stats.insert(CONDITION_KEY.into(), condition.label.clone().into());
            stats.insert("limit".into(), num(condition.limit_ma));
        }
        if let Some(max) = self.leakage_ma.max() {
            stats.insert("max_leakage".into(), num(max));
        }
        if let Some(mean) = self.leakage_ma.mean() {
            stats.insert("mean_leakage".into(), num(mean));
        }
        stats.insert("conditions_done".into(), self.results.len().into());
        stats
    }

    fn evaluate(&self, declared: &Criteria) -> (PhaseStats, Verdict) {
        let mut stats = PhaseStats::new();
        let mut verdict = Verdict::passed();
        let mut overall = RunningStats::new();

        for result in &self.results {
            stats.insert(
                format!("stabilized_{}", result.label),
                result.stabilized.into(),
            );
            if !result.stabilized {
                verdict = verdict.and(Verdict::failed([format!(
                    "condition {}: not stabilized within {} s",
                    result.label, self.params.stabilization_timeout_s
                )]));
                continue;
            }

            let mut condition_stats = PhaseStats::new();
            condition_stats.insert(CONDITION_KEY.into(), result.label.clone().into());
            if let Some(max) = result.leakage_ma.max() {
                condition_stats.insert("max_leakage".into(), num(max));
                stats.insert(format!("max_leakage_{}", result.label), num(max));
            }
            overall.merge(&result.leakage_ma);
            let mut criteria = Criteria::new();
            criteria.insert(format!("max_leakage_{}", result.label), num(result.limit_ma));
            verdict = verdict.and(evaluate(&condition_stats, &criteria));
        }
        if let Some(max) = overall.max() {
            stats.insert("max_leakage".into(), num(max));
        }
        if let Some(mean) = overall.mean() {
            stats.insert("mean_leakage".into(), num(mean));
        }
        stats.insert(
            "conditions_stabilized".into(),
            self.results.iter().filter(|r| r.stabilized).count().into(),
        );

        // limit keys were folded into the per-condition checks above
        let remaining: Criteria = declared
            .iter()
            .filter(|(key, _)| !is_limit_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        verdict = verdict.and(evaluate(&stats, &remaining));
        (stats, verdict)
    }
}

/// Criteria consumed by [`limit_for`].
fn is_limit_key(key: &str) -> bool {
    key == "max_leakage" || key.starts_with("max_leakage_")
}

#[cfg(test)]
mod tests {
    use super::super::{Finalized, TestMachine};
    use super::*;
    use crate::standard::{defaults, TestType};
    use chrono::Duration;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn two_conditions() -> Standard {
        Standard::new("L", "leakage", TestType::Leakage)
            .with_parameter(
                "conditions",
                json!([
                    {"label": "25C", "temperature": 25.0, "humidity": 60.0, "duration": 10},
                    {"label": "60C", "temperature": 60.0, "humidity": 60.0, "duration": 10}
                ]),
            )
            .with_criterion("max_leakage_25C", 3.5)
            .with_criterion("max_leakage_60C", 5.0)
    }

    fn machine(standard: Standard) -> TestMachine {
        let mut machine = TestMachine::init(
            Arc::new(standard),
            DeviceParams::new(1000.0, 10.0),
            Duration::milliseconds(50),
        )
        .unwrap();
        machine.confirm(t(0)).unwrap();
        machine
    }

    fn run_condition(m: &mut TestMachine, from: i64, temp: f64, leakage_a: f64) {
        for s in from..=from + 10 {
            m.feed(&Sample::new(t(s), leakage_a, 1100.0).with_environment(temp, 60.0))
                .unwrap();
        }
    }

    #[test]
    fn test_limits_resolved_per_condition() {
        let params =
            LeakageParams::resolve(&defaults::leakage(), &DeviceParams::new(1000.0, 1.0)).unwrap();
        let limits: Vec<(String, f64)> = params
            .conditions
            .iter()
            .map(|c| (c.label.clone(), c.limit_ma))
            .collect();
        assert_eq!(
            limits,
            vec![
                ("25C".to_string(), 3.5),
                ("40C".to_string(), 5.0),
                ("60C".to_string(), 5.0),
                ("25C_93RH".to_string(), 3.5),
                ("40C_93RH".to_string(), 5.0),
            ]
        );
        assert!((params.test_voltage - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_generic_and_builtin_limits() {
        let generic = Standard::new("L", "l", TestType::Leakage).with_criterion("max_leakage", 2.0);
        let params = LeakageParams::resolve(&generic, &DeviceParams::default()).unwrap();
        assert!(params.conditions.iter().all(|c| (c.limit_ma - 2.0).abs() < 1e-12));

        let bare = Standard::new("L", "l", TestType::Leakage);
        let params = LeakageParams::resolve(&bare, &DeviceParams::default()).unwrap();
        assert!((params.conditions[0].limit_ma - 3.5).abs() < 1e-12);
        assert!((params.conditions[2].limit_ma - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_every_condition_passes() {
        let mut m = machine(two_conditions());
        run_condition(&mut m, 0, 25.0, 0.003);
        assert_eq!(m.phase(), Phase::Stabilizing);
        run_condition(&mut m, 11, 60.5, 0.0045);
        assert_eq!(m.phase(), Phase::Done);
        assert!(matches!(m.finalize(), Finalized::Verdict(v) if v.pass));
    }

    #[test]
    fn test_one_condition_over_limit_fails_but_all_run() {
        let mut m = machine(two_conditions());
        // 4 mA exceeds 3.5 mA at 25 °C but the 60 °C condition still runs
        run_condition(&mut m, 0, 25.0, 0.004);
        run_condition(&mut m, 11, 60.0, 0.004);
        let Finalized::Verdict(v) = m.finalize() else {
            panic!("running");
        };
        assert!(!v.pass);
        assert_eq!(v.reasons.len(), 1);
        assert!(v.reasons[0].contains("max_leakage_25C"));
    }

    #[test]
    fn test_declared_aggregate_criterion_is_checked() {
        let mut m = machine(two_conditions().with_criterion("max_mean_leakage", 0.001));
        run_condition(&mut m, 0, 25.0, 0.003);
        run_condition(&mut m, 11, 60.0, 0.0045);
        let Finalized::Verdict(v) = m.finalize() else {
            panic!("running");
        };
        assert!(!v.pass);
        assert_eq!(v.reasons.len(), 1);
        assert!(v.reasons[0].contains("max_mean_leakage"), "{v}");

        let stats = &m.phase_records().iter().rev().find(|r| r.phase == Phase::Evaluating).unwrap().stats;
        assert!((stats["mean_leakage"].as_f64().unwrap() - 3.75).abs() < 1e-9);
        assert!((stats["max_leakage"].as_f64().unwrap() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_unmeasured_declared_criterion_fails_by_name() {
        let mut m = machine(two_conditions().with_criterion("min_insulation_resistance", 100));
        run_condition(&mut m, 0, 25.0, 0.003);
        run_condition(&mut m, 11, 60.0, 0.003);
        let Finalized::Verdict(v) = m.finalize() else {
            panic!("running");
        };
        assert!(!v.pass);
        assert!(v.reasons[0].contains("min_insulation_resistance"), "{v}");
    }

    #[test]
    fn test_condition_reached_event_and_timeout() {
        let standard = two_conditions().with_parameter("stabilization_timeout", 100);
        let mut m = machine(standard);
        m.event(t(1), FixtureEvent::ConditionReached).unwrap();
        assert_eq!(m.phase(), Phase::Measuring);
        m.tick(t(11)).unwrap();
        assert_eq!(m.phase(), Phase::Stabilizing);
        // chamber never reaches 60 °C
        m.tick(t(200)).unwrap();
        assert_eq!(m.phase(), Phase::Done);
        let Finalized::Verdict(v) = m.finalize() else {
            panic!("running");
        };
        assert!(!v.pass);
        // no samples for 25C, 60C not stabilized
        assert_eq!(v.reasons.len(), 2);
    }

    #[test]
    fn test_low_voltage_warns() {
        let mut m = machine(two_conditions());
        m.feed(&Sample::new(t(0), 0.001, 1100.0).with_environment(25.0, 60.0))
            .unwrap();
        m.feed(&Sample::new(t(1), 0.001, 900.0).with_environment(25.0, 60.0))
            .unwrap();
        assert_eq!(m.warnings().len(), 1);
        assert_eq!(m.warnings()[0].kind, WarningKind::ConditionDrift);
    }

    #[test]
    fn test_empty_conditions_rejected() {
        let standard =
            Standard::new("L", "l", TestType::Leakage).with_parameter("conditions", json!([]));
        assert!(LeakageParams::resolve(&standard, &DeviceParams::default()).is_err());
    }
}
