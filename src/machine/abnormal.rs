//! Abnormal operation: overload and short-circuit fault steps, then
//! environmental stress
//!
//! Each fault step starts when the fixture injects the fault. The protection
//! trips on a `ProtectionTripped` event or on the first sample whose current
//! falls to the trip threshold. A post-fault window then has to show the
//! device quiescent.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{num, seconds, Core, DeviceParams, FixtureEvent, Flow, Phase, Protocol};
use crate::evaluation::{evaluate, merge_criteria, Criteria, PhaseStats, Verdict};
use crate::sample::Sample;
use crate::standard::{number, Standard, MAX_DURATION_S};
use crate::{Error, Result};

const DEFAULT_TRIP_CURRENT_FRACTION: f64 = 0.05;
const DEFAULT_QUIESCENT_CURRENT_FRACTION: f64 = 0.05;
const DEFAULT_POST_FAULT_WINDOW_S: f64 = 5.0;
const DEFAULT_SHORT_CIRCUIT_WINDOW_S: f64 = 1.0;
const DEFAULT_OVERLOAD_DURATION_S: f64 = 60.0;

/// Kind of injected fault.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Current raised to `factor × rated current`
    Overload {
        /// Overload multiplier
        factor: f64,
    },
    /// Short circuit at a location (output, input, ground)
    ShortCircuit {
        /// Where the short is applied
        location: String,
    },
}

/// One fault step.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultStep {
    /// Tag used in statistic keys (`protection_<label>`)
    pub label: String,
    /// Fault applied
    pub kind: StepKind,
    /// Whether the protection is required to act
    pub should_trip: bool,
    /// Time allowed for the protection to act, or for a non-trip step the
    /// time the device must carry the overload (s)
    pub window_s: f64,
}

impl FaultStep {
    const fn phase(&self) -> Phase {
        match self.kind {
            StepKind::Overload { .. } => Phase::Overload,
            StepKind::ShortCircuit { .. } => Phase::ShortCircuit,
        }
    }
}

fn default_overloads() -> Value {
    json!([
        {"factor": 1.1, "should_trip": false, "duration": 60},
        {"factor": 1.5, "should_trip": true, "duration": 30},
        {"factor": 2.0, "should_trip": true, "duration": 10}
    ])
}

fn default_short_circuits() -> Value {
    json!([
        {"location": "output", "response_time": 0.1},
        {"location": "input", "response_time": 0.05},
        {"location": "ground", "response_time": 0.2}
    ])
}

/// Abnormal-operation parameters resolved from a standard and the device ratings.
#[derive(Debug, Clone, PartialEq)]
pub struct AbnormalParams {
    /// Overload steps followed by short-circuit steps
    pub steps: Vec<FaultStep>,
    /// Rated current the fractions below refer to (A)
    pub rated_current: f64,
    /// Current at or below `fraction × rated` counts as tripped
    pub trip_current_fraction: f64,
    /// Current at or below `fraction × rated` counts as quiescent after a fault
    pub quiescent_current_fraction: f64,
    /// Post-fault observation window (s)
    pub post_fault_window_s: f64,
}

impl AbnormalParams {
    /// Resolve parameters, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero rated current or malformed step lists.
    pub fn resolve(standard: &Standard, device: &DeviceParams) -> Result<Self> {
        if device.rated_current <= 0.0 {
            return Err(Error::Validation(
                "abnormal-operation test needs a positive rated current".into(),
            ));
        }
        let short_window = standard
            .duration_or("short_circuit_window", DEFAULT_SHORT_CIRCUIT_WINDOW_S)?;

        let mut steps = Vec::new();
        for (i, item) in list(standard, "overload_levels", default_overloads())?
            .iter()
            .enumerate()
        {
            let factor = item
                .get("factor")
                .and_then(number)
                .filter(|f| f.is_finite() && *f > 0.0)
                .ok_or_else(|| step_error(standard, "overload_levels", i, "needs a positive factor"))?;
            steps.push(FaultStep {
                label: format!("overload_{factor}x"),
                kind: StepKind::Overload { factor },
                should_trip: item
                    .get("should_trip")
                    .and_then(Value::as_bool)
                    .unwrap_or(factor > 1.0),
                window_s: step_duration(
                    standard,
                    "overload_levels",
                    i,
                    item,
                    "duration",
                    DEFAULT_OVERLOAD_DURATION_S,
                )?,
            });
        }
        for (i, item) in list(standard, "short_circuits", default_short_circuits())?
            .iter()
            .enumerate()
        {
            let location = item
                .get("location")
                .and_then(Value::as_str)
                .filter(|l| !l.trim().is_empty())
                .ok_or_else(|| step_error(standard, "short_circuits", i, "needs a location"))?
                .trim()
                .to_string();
            steps.push(FaultStep {
                label: format!("short_{location}"),
                kind: StepKind::ShortCircuit { location },
                should_trip: true,
                window_s: step_duration(
                    standard,
                    "short_circuits",
                    i,
                    item,
                    "response_time",
                    short_window,
                )?,
            });
        }

        Ok(Self {
            steps,
            rated_current: device.rated_current,
            trip_current_fraction: standard
                .non_negative_or("trip_current_fraction", DEFAULT_TRIP_CURRENT_FRACTION)?,
            quiescent_current_fraction: standard.non_negative_or(
                "quiescent_current_fraction",
                DEFAULT_QUIESCENT_CURRENT_FRACTION,
            )?,
            post_fault_window_s: standard
                .duration_or("post_fault_window", DEFAULT_POST_FAULT_WINDOW_S)?,
        })
    }

    fn trip_current(&self) -> f64 {
        self.trip_current_fraction * self.rated_current
    }

    fn quiescent_current(&self) -> f64 {
        self.quiescent_current_fraction * self.rated_current
    }
}

fn list(standard: &Standard, key: &str, default: Value) -> Result<Vec<Value>> {
    match standard.param(key) {
        None => Ok(default.as_array().cloned().unwrap_or_default()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(Error::Validation(format!(
            "standard {}: parameter {key} must be an array",
            standard.code()
        ))),
    }
}

fn step_error(standard: &Standard, key: &str, index: usize, why: &str) -> Error {
    Error::Validation(format!(
        "standard {}: {key} #{}: {why}",
        standard.code(),
        index + 1
    ))
}

fn step_duration(
    standard: &Standard,
    list: &str,
    index: usize,
    item: &Value,
    key: &str,
    default: f64,
) -> Result<f64> {
    match item.get(key).and_then(number) {
        None => Ok(default),
        Some(d) if d.is_finite() && (0.0..=MAX_DURATION_S).contains(&d) => Ok(d),
        Some(d) => Err(step_error(
            standard,
            list,
            index,
            &format!("{key} must be between 0 and {MAX_DURATION_S} s, got {d}"),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StepState {
    Waiting,
    Applied {
        since: DateTime<Utc>,
    },
    PostFault {
        until: DateTime<Utc>,
        quiescent: bool,
        seen: u32,
    },
}

#[derive(Debug, Clone)]
struct StepOutcome {
    label: String,
    protection_ok: bool,
    trip_time_s: Option<f64>,
    safe_after: bool,
}

#[derive(Debug)]
pub(super) struct Abnormal {
    params: AbnormalParams,
    index: usize,
    state: StepState,
    protection_ok: bool,
    trip_time_s: Option<f64>,
    outcomes: Vec<StepOutcome>,
    env_markers: Vec<(String, bool)>,
}

impl Abnormal {
    pub(super) const fn new(params: AbnormalParams) -> Self {
        Self {
            params,
            index: 0,
            state: StepState::Waiting,
            protection_ok: false,
            trip_time_s: None,
            outcomes: Vec::new(),
            env_markers: Vec::new(),
        }
    }

    fn step(&self) -> Option<&FaultStep> {
        self.params.steps.get(self.index)
    }

    fn trip(&mut self, core: &mut Core, since: DateTime<Utc>, at: DateTime<Utc>) -> Flow {
        let Some((label, should_trip, window)) = self
            .step()
            .map(|step| (step.label.clone(), step.should_trip, step.window_s))
        else {
            return Flow::Continue;
        };
        let trip_time = seconds(since, at).max(0.0);
        self.protection_ok = should_trip && trip_time <= window;
        self.trip_time_s = Some(trip_time);
        core.stat("trip_time_s", num(trip_time));
        tracing::info!(step = %label, trip_time, ok = self.protection_ok, "protection tripped");
        self.post_fault(at);
        Flow::Continue
    }

    fn expire(&mut self, core: &mut Core, at: DateTime<Utc>) -> Flow {
        let Some((label, should_trip, window)) = self
            .step()
            .map(|step| (step.label.clone(), step.should_trip, step.window_s))
        else {
            return Flow::Continue;
        };
        if should_trip {
            tracing::info!(step = %label, window, "protection did not trip");
            self.protection_ok = false;
            self.post_fault(at);
            Flow::Continue
        } else {
            // carried the overload without tripping
            self.protection_ok = true;
            self.advance(core, at, true)
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn post_fault(&mut self, at: DateTime<Utc>) {
        let window =
            chrono::Duration::microseconds((self.params.post_fault_window_s * 1e6).round() as i64);
        self.state = StepState::PostFault {
            until: at.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC),
            quiescent: true,
            seen: 0,
        };
    }

    fn advance(&mut self, core: &mut Core, at: DateTime<Utc>, safe_after: bool) -> Flow {
        let Some(step) = self.step() else {
            return Flow::Continue;
        };
        let outcome = StepOutcome {
            label: step.label.clone(),
            protection_ok: self.protection_ok,
            trip_time_s: self.trip_time_s.take(),
            safe_after,
        };
        core.stat("protection_ok", outcome.protection_ok);
        core.stat("safe_after", outcome.safe_after);
        self.outcomes.push(outcome);
        self.protection_ok = false;
        self.state = StepState::Waiting;
        self.index += 1;

        let (phase, label) = self.entry();
        core.enter(phase, label, at);
        Flow::Continue
    }

    fn close_post_fault(&mut self, core: &mut Core, at: DateTime<Utc>) -> Flow {
        if let StepState::PostFault { quiescent, seen, .. } = self.state {
            core.stat("post_fault_samples", seen);
            return self.advance(core, at, quiescent && seen > 0);
        }
        Flow::Continue
    }
}

impl Protocol for Abnormal {
    fn entry(&mut self) -> (Phase, Option<String>) {
        self.step().map_or((Phase::EnvStress, None), |step| {
            (step.phase(), Some(step.label.clone()))
        })
    }

    fn on_sample(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let at = sample.timestamp;
        match self.state {
            StepState::Applied { since } if at >= since => {
                if sample.current <= self.params.trip_current() {
                    return self.trip(core, since, at);
                }
                let expired = self
                    .step()
                    .is_some_and(|step| seconds(since, at) >= step.window_s);
                if expired {
                    return self.expire(core, at);
                }
                Flow::Continue
            }
            StepState::PostFault {
                until,
                quiescent,
                seen,
            } => {
                if at <= until {
                    self.state = StepState::PostFault {
                        until,
                        quiescent: quiescent && sample.current <= self.params.quiescent_current(),
                        seen: seen + 1,
                    };
                }
                if at >= until {
                    return self.close_post_fault(core, at);
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn on_event(&mut self, core: &mut Core, at: DateTime<Utc>, event: &FixtureEvent) -> Flow {
        match (core.phase, self.state, event) {
            (
                Phase::Overload | Phase::ShortCircuit,
                StepState::Waiting,
                FixtureEvent::FaultInjected { kind },
            ) => {
                if let (Some(kind), Some(step)) = (kind, self.step()) {
                    if *kind != step.label {
                        tracing::debug!(fixture = %kind, step = %step.label, "fault label differs");
                    }
                }
                self.state = StepState::Applied { since: at };
                Flow::Continue
            }
            (_, StepState::Applied { since }, FixtureEvent::ProtectionTripped) => {
                self.trip(core, since, at)
            }
            (Phase::EnvStress, _, FixtureEvent::EnvMarker { name, passed }) => {
                core.stat(format!("env_{name}"), *passed);
                self.env_markers.push((name.clone(), *passed));
                Flow::Continue
            }
            (Phase::EnvStress, _, FixtureEvent::StageComplete) => Flow::Complete,
            _ => {
                tracing::debug!(phase = %core.phase, ?event, "event ignored");
                Flow::Continue
            }
        }
    }

    fn on_tick(&mut self, core: &mut Core, now: DateTime<Utc>) -> Flow {
        match self.state {
            StepState::Applied { since } => {
                let expired = self
                    .step()
                    .is_some_and(|step| seconds(since, now) >= step.window_s);
                if expired {
                    return self.expire(core, now);
                }
                Flow::Continue
            }
            StepState::PostFault { until, .. } if now >= until => self.close_post_fault(core, now),
            _ => Flow::Continue,
        }
    }

    fn live_stats(&self) -> PhaseStats {
        let mut stats = PhaseStats::new();
        if let Some(step) = self.step() {
            stats.insert("step".into(), step.label.clone().into());
            let state = match self.state {
                StepState::Waiting => "waiting",
                StepState::Applied { .. } => "applied",
                StepState::PostFault { .. } => "post_fault",
            };
            stats.insert("step_state".into(), state.into());
        }
        stats.insert("steps_done".into(), self.outcomes.len().into());
        stats.insert("env_markers".into(), self.env_markers.len().into());
        stats
    }

    fn evaluate(&self, declared: &Criteria) -> (PhaseStats, Verdict) {
        let mut stats = PhaseStats::new();
        let mut defaults = Criteria::new();
        for outcome in &self.outcomes {
            let label = &outcome.label;
            stats.insert(format!("protection_{label}"), outcome.protection_ok.into());
            stats.insert(format!("safe_after_{label}"), outcome.safe_after.into());
            if let Some(trip) = outcome.trip_time_s {
                stats.insert(format!("trip_time_{label}_s"), num(trip));
            }
            defaults.insert(format!("protection_{label}"), true.into());
            defaults.insert(format!("safe_after_{label}"), true.into());
        }
        for (name, passed) in &self.env_markers {
            stats.insert(format!("env_{name}"), (*passed).into());
        }
        let env_passed = self.env_markers.iter().all(|(_, passed)| *passed);
        stats.insert("env_stress_passed".into(), env_passed.into());
        defaults.insert("env_stress_passed".into(), true.into());

        let verdict = evaluate(&stats, &merge_criteria(defaults, declared));
        (stats, verdict)
    }
}
