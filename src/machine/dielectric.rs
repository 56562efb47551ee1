//! Dielectric withstand: ramp to the test voltage, hold, de-energize
//!
//! Leakage above the limit or a breakdown while energized fails the test
//! on the spot. A clean ramp-down leads to evaluation of `max_leakage`,
//! `breakdown` and `hold_duration_s`.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{num, seconds, Core, DeviceParams, FixtureEvent, Flow, Phase, Protocol};
use crate::error::WarningKind;
use crate::evaluation::{evaluate, merge_criteria, Criteria, PhaseStats, Verdict};
use crate::sample::Sample;
use crate::standard::Standard;
use crate::{Error, Result};

const DEFAULT_BASE_VOLTAGE: f64 = 1000.0;
const DEFAULT_DURATION_S: f64 = 60.0;
const DEFAULT_LEAKAGE_LIMIT_MA: f64 = 5.0;
const DEFAULT_DROP_FRACTION: f64 = 0.2;
const DEFAULT_CURRENT_RATIO: f64 = 2.0;
const DEFAULT_RAMP_DOWN_TIMEOUT_S: f64 = 30.0;
const DEFAULT_DISCHARGE_FRACTION: f64 = 0.01;

/// Dielectric parameters resolved from a standard and the device ratings.
#[derive(Debug, Clone, PartialEq)]
pub struct DielectricParams {
    /// Target voltage (V), default `1000 + 2 × rated voltage`
    pub test_voltage: f64,
    /// Hold time at target (s)
    pub test_duration_s: f64,
    /// Leakage limit (mA)
    pub leakage_limit_ma: f64,
    /// Fraction below target still counted as reaching it
    pub target_tolerance: f64,
    /// Voltage drop between consecutive samples, as a fraction of target,
    /// that counts toward a breakdown
    pub breakdown_drop_fraction: f64,
    /// Current growth between consecutive samples that counts toward a breakdown
    pub breakdown_current_ratio: f64,
    /// Ramp-down time after which a slow-discharge warning is raised (s)
    pub ramp_down_timeout_s: f64,
    /// Voltage at or below which the device counts as discharged (V)
    pub discharge_voltage: f64,
}

impl DielectricParams {
    /// Resolve parameters, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative values or a tolerance of 1 or more.
    pub fn resolve(standard: &Standard, device: &DeviceParams) -> Result<Self> {
        let test_voltage = standard.non_negative_or(
            "test_voltage",
            2.0f64.mul_add(device.rated_voltage, DEFAULT_BASE_VOLTAGE),
        )?;
        if test_voltage <= 0.0 {
            return Err(Error::Validation(format!(
                "standard {}: test_voltage must be positive",
                standard.code()
            )));
        }
        let target_tolerance = standard.non_negative_or("target_tolerance", 0.0)?;
        if target_tolerance >= 1.0 {
            return Err(Error::Validation(format!(
                "standard {}: target_tolerance must be below 1, got {target_tolerance}",
                standard.code()
            )));
        }
        Ok(Self {
            test_voltage,
            test_duration_s: standard.duration_or("test_duration", DEFAULT_DURATION_S)?,
            leakage_limit_ma: standard
                .non_negative_or("leakage_limit", DEFAULT_LEAKAGE_LIMIT_MA)?,
            target_tolerance,
            breakdown_drop_fraction: standard
                .non_negative_or("breakdown_drop_fraction", DEFAULT_DROP_FRACTION)?,
            breakdown_current_ratio: standard
                .non_negative_or("breakdown_current_ratio", DEFAULT_CURRENT_RATIO)?,
            ramp_down_timeout_s: standard
                .duration_or("ramp_down_timeout", DEFAULT_RAMP_DOWN_TIMEOUT_S)?,
            discharge_voltage: standard.non_negative_or(
                "discharge_voltage",
                test_voltage * DEFAULT_DISCHARGE_FRACTION,
            )?,
        })
    }

    /// Voltage at which HOLDING begins.
    #[must_use]
    pub fn holding_threshold(&self) -> f64 {
        self.test_voltage * (1.0 - self.target_tolerance)
    }
}

#[derive(Debug)]
pub(super) struct Dielectric {
    params: DielectricParams,
    previous: Option<Sample>,
    max_leakage_ma: f64,
    peak_voltage: f64,
    hold_started: Option<DateTime<Utc>>,
    hold_duration_s: f64,
    slow_ramp_down_warned: bool,
    rising_current_warned: bool,
}

impl Dielectric {
    pub(super) const fn new(params: DielectricParams) -> Self {
        Self {
            params,
            previous: None,
            max_leakage_ma: 0.0,
            peak_voltage: 0.0,
            hold_started: None,
            hold_duration_s: 0.0,
            slow_ramp_down_warned: false,
            rising_current_warned: false,
        }
    }

    fn breakdown(&self, sample: &Sample) -> Option<String> {
        let previous = self.previous.as_ref()?;
        let drop = previous.voltage - sample.voltage;
        let collapsed = drop > self.params.breakdown_drop_fraction * self.params.test_voltage;
        let spiked = sample.current > previous.current
            && sample.current >= previous.current * self.params.breakdown_current_ratio;
        (collapsed && spiked).then(|| {
            format!(
                "breakdown at {}: voltage collapsed {:.1} V -> {:.1} V while leakage rose {:.3} mA -> {:.3} mA",
                sample.timestamp.to_rfc3339(),
                previous.voltage,
                sample.voltage,
                previous.current_ma(),
                sample.current_ma()
            )
        })
    }

    fn energized(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let leakage = sample.current_ma();
        self.max_leakage_ma = self.max_leakage_ma.max(leakage);
        self.peak_voltage = self.peak_voltage.max(sample.voltage);

        if let Some(reason) = self.breakdown(sample) {
            core.stat("breakdown", true);
            core.stat("breakdown_at", sample.timestamp.to_rfc3339());
            core.stat("max_leakage", num(self.max_leakage_ma));
            return Flow::Fail(reason);
        }
        if leakage > self.params.leakage_limit_ma {
            core.stat("max_leakage", num(self.max_leakage_ma));
            return Flow::Fail(format!(
                "leakage {leakage:.3} mA exceeded limit {} mA during {} at {}",
                self.params.leakage_limit_ma,
                core.phase,
                sample.timestamp.to_rfc3339()
            ));
        }

        match core.phase {
            Phase::Ramping if sample.voltage >= self.params.holding_threshold() => {
                core.stat("max_leakage", num(self.max_leakage_ma));
                core.stat("ramp_time_s", num(core.since_entry(sample.timestamp)));
                core.enter(Phase::Holding, None, sample.timestamp);
                self.hold_started = Some(sample.timestamp);
                Flow::Continue
            }
            Phase::Holding => self.check_hold(core, sample.timestamp),
            _ => Flow::Continue,
        }
    }

    fn check_hold(&mut self, core: &mut Core, at: DateTime<Utc>) -> Flow {
        let Some(started) = self.hold_started else {
            return Flow::Continue;
        };
        let held = seconds(started, at);
        if held >= self.params.test_duration_s {
            self.hold_duration_s = held;
            core.stat("hold_duration_s", num(held));
            core.stat("max_leakage", num(self.max_leakage_ma));
            core.enter(Phase::RampingDown, None, at);
        }
        Flow::Continue
    }

    fn ramping_down(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let rising = self
            .previous
            .as_ref()
            .is_some_and(|previous| sample.current > previous.current);
        if rising && !self.rising_current_warned {
            self.rising_current_warned = true;
            core.warn(
                WarningKind::SlowRampDown,
                format!(
                    "current rose to {:.3} mA during ramp-down",
                    sample.current_ma()
                ),
                sample.timestamp,
            );
        }
        self.check_ramp_down_timeout(core, sample.timestamp);
        if sample.voltage <= self.params.discharge_voltage {
            core.stat("ramp_down_s", num(core.since_entry(sample.timestamp)));
            return Flow::Complete;
        }
        Flow::Continue
    }

    fn check_ramp_down_timeout(&mut self, core: &mut Core, at: DateTime<Utc>) {
        let elapsed = core.since_entry(at);
        if elapsed > self.params.ramp_down_timeout_s && !self.slow_ramp_down_warned {
            self.slow_ramp_down_warned = true;
            core.warn(
                WarningKind::SlowRampDown,
                format!(
                    "device not discharged below {:.1} V after {elapsed:.1} s",
                    self.params.discharge_voltage
                ),
                at,
            );
        }
    }
}

impl Protocol for Dielectric {
    fn entry(&mut self) -> (Phase, Option<String>) {
        (Phase::Ramping, None)
    }

    fn on_sample(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let flow = match core.phase {
            Phase::Ramping | Phase::Holding => self.energized(core, sample),
            Phase::RampingDown => self.ramping_down(core, sample),
            _ => Flow::Continue,
        };
        self.previous = Some(sample.clone());
        flow
    }

    fn on_event(&mut self, core: &mut Core, at: DateTime<Utc>, event: &FixtureEvent) -> Flow {
        match (core.phase, event) {
            // fixture reports the discharge
            (Phase::RampingDown, FixtureEvent::StageComplete) => {
                core.stat("ramp_down_s", num(core.since_entry(at)));
                Flow::Complete
            }
            _ => {
                tracing::debug!(phase = %core.phase, ?event, "event ignored");
                Flow::Continue
            }
        }
    }

    fn on_tick(&mut self, core: &mut Core, now: DateTime<Utc>) -> Flow {
        match core.phase {
            Phase::Holding => self.check_hold(core, now),
            Phase::RampingDown => {
                self.check_ramp_down_timeout(core, now);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn live_stats(&self) -> PhaseStats {
        let mut stats = PhaseStats::new();
        stats.insert("max_leakage".into(), num(self.max_leakage_ma));
        stats.insert("peak_voltage".into(), num(self.peak_voltage));
        stats.insert("target_voltage".into(), num(self.params.test_voltage));
        if let Some(previous) = &self.previous {
            stats.insert("voltage".into(), num(previous.voltage));
            stats.insert("leakage".into(), num(previous.current_ma()));
        }
        stats
    }

    fn evaluate(&self, declared: &Criteria) -> (PhaseStats, Verdict) {
        let mut stats = PhaseStats::new();
        stats.insert("max_leakage".into(), num(self.max_leakage_ma));
        stats.insert("breakdown".into(), false.into());
        stats.insert("hold_duration_s".into(), num(self.hold_duration_s));
        stats.insert("peak_voltage".into(), num(self.peak_voltage));

        let mut defaults = Criteria::new();
        defaults.insert("max_leakage".into(), json!(self.params.leakage_limit_ma));
        defaults.insert("breakdown".into(), false.into());
        defaults.insert(
            "min_hold_duration_s".into(),
            json!(self.params.test_duration_s),
        );
        let verdict = evaluate(&stats, &merge_criteria(defaults, declared));
        (stats, verdict)
    }
}
