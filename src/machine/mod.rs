//! Test state machines
//!
//! One [`TestMachine`] drives one experiment through the phases of its test
//! type. The four test types share the machine and differ only in their
//! protocol: the phase list, the guards that move between phases and the
//! terminal evaluation hook.
//!
//! ## Lifecycle
//!
//! ```text
//! PRECHECK ──confirm──> <protocol phases> ──> EVALUATING ──> DONE
//!                              │
//!                              └──> FAILED        (any) ──cancel──> CANCELLED
//! ```
//!
//! Samples fed during `PRECHECK` are buffered and replayed on confirmation.
//! Durations are measured between sample/event timestamps; [`TestMachine::tick`]
//! lets a clock drive time-based guards when no sample arrives.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{DateTime, Duration};
//! use pvrsd_bench::machine::{DeviceParams, Finalized, TestMachine};
//! use pvrsd_bench::sample::Sample;
//! use pvrsd_bench::standard::defaults;
//!
//! let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
//! let mut machine = TestMachine::init(
//!     Arc::new(defaults::dielectric()),
//!     DeviceParams::new(600.0, 10.0),
//!     Duration::milliseconds(50),
//! )
//! .unwrap();
//! machine.confirm(t0).unwrap();
//! // 7 mA at full voltage exceeds the 5 mA limit
//! machine.feed(&Sample::new(t0, 0.007, 2200.0)).unwrap();
//! match machine.finalize() {
//!     Finalized::Verdict(v) => assert!(!v.pass),
//!     Finalized::Running => unreachable!(),
//! }
//! ```

mod abnormal;
mod dielectric;
mod leakage;
mod normal;

pub use abnormal::{AbnormalParams, FaultStep, StepKind};
pub use dielectric::DielectricParams;
pub use leakage::{Condition, LeakageParams};
pub use normal::NormalParams;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ToleranceWarning, WarningKind};
use crate::evaluation::{Criteria, PhaseStats, Verdict};
use crate::sample::Sample;
use crate::standard::{Standard, TestType};
use crate::{Error, Result};

/// Rated values of the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Rated voltage (V)
    pub rated_voltage: f64,
    /// Rated current (A)
    pub rated_current: f64,
    /// Rated power (W)
    pub rated_power: f64,
}

impl DeviceParams {
    /// Rated voltage and current; rated power is their product.
    #[must_use]
    pub fn new(rated_voltage: f64, rated_current: f64) -> Self {
        Self {
            rated_voltage,
            rated_current,
            rated_power: rated_voltage * rated_current,
        }
    }

    /// Override the rated power.
    #[must_use]
    pub const fn with_rated_power(mut self, rated_power: f64) -> Self {
        self.rated_power = rated_power;
        self
    }

    /// # Errors
    ///
    /// Returns a validation error if any rating is negative or non-finite.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("rated_voltage", self.rated_voltage),
            ("rated_current", self.rated_current),
            ("rated_power", self.rated_power),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Validation(format!(
                    "device {name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Signal from the test fixture or operator, as opposed to a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FixtureEvent {
    /// Climate chamber reports the requested condition
    ConditionReached,
    /// Result of one communication probe
    CommunicationProbe {
        /// Whether the device answered
        ok: bool,
    },
    /// Result of one remote on/off command
    RemoteCommand {
        /// Whether the device acted on the command
        acknowledged: bool,
    },
    /// Device restarted by itself after a fault cleared
    RestartObserved {
        /// Time from fault clearance to restart
        seconds: f64,
    },
    /// Functional checks finished
    FunctionalDone,
    /// Shutdown signal sent to the device
    ShutdownCommand,
    /// Conversion efficiency measured at one load point
    EfficiencyPoint {
        /// Load as a fraction of rated power
        load_fraction: f64,
        /// Measured efficiency (%)
        efficiency_pct: f64,
    },
    /// Fixture applied the next fault
    FaultInjected {
        /// Optional fixture label of the fault
        kind: Option<String>,
    },
    /// Fixture observed the protection acting
    ProtectionTripped,
    /// Outcome of one environmental stress step
    EnvMarker {
        /// Stress step name (thermal cycle, vibration, ...)
        name: String,
        /// Whether the device survived it
        passed: bool,
    },
    /// Current stage finished
    StageComplete,
}

/// Phase of a test machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Awaiting confirmation; samples are buffered
    Precheck,
    /// Dielectric: voltage rising toward target
    Ramping,
    /// Dielectric: target voltage held
    Holding,
    /// Dielectric: de-energizing
    RampingDown,
    /// Leakage: waiting for the climate condition
    Stabilizing,
    /// Leakage: accumulating leakage for one condition
    Measuring,
    /// Normal: communication and remote-control checks
    FunctionalCheck,
    /// Normal: shutdown latency measurement
    ResponseTiming,
    /// Normal: steady-state sampling
    Performance,
    /// Abnormal: overload steps
    Overload,
    /// Abnormal: short-circuit steps
    ShortCircuit,
    /// Abnormal: environmental stress markers
    EnvStress,
    /// Computing the verdict
    Evaluating,
    /// Terminal: evaluated
    Done,
    /// Terminal: failed on the short-circuit path
    Failed,
    /// Terminal: aborted
    Cancelled,
}

impl Phase {
    /// Upper-case phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Precheck => "PRECHECK",
            Self::Ramping => "RAMPING",
            Self::Holding => "HOLDING",
            Self::RampingDown => "RAMPING_DOWN",
            Self::Stabilizing => "STABILIZING",
            Self::Measuring => "MEASURING",
            Self::FunctionalCheck => "FUNCTIONAL_CHECK",
            Self::ResponseTiming => "RESPONSE_TIMING",
            Self::Performance => "PERFORMANCE",
            Self::Overload => "OVERLOAD",
            Self::ShortCircuit => "SHORT_CIRCUIT",
            Self::EnvStress => "ENV_STRESS",
            Self::Evaluating => "EVALUATING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether no further input is accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One visited phase with the statistics gathered while in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase name
    pub phase: Phase,
    /// Condition or fault step the phase ran for
    pub label: Option<String>,
    /// Timestamp of the sample/event that entered the phase
    pub entered_at: DateTime<Utc>,
    /// Statistics accumulated in the phase
    pub stats: PhaseStats,
}

/// Point-in-time view of a running machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current phase
    pub phase: Phase,
    /// Condition or fault step of the current phase
    pub label: Option<String>,
    /// Seconds between phase entry and the latest input
    pub elapsed_s: f64,
    /// Running statistics
    pub live_stats: PhaseStats,
}

/// Outcome of [`TestMachine::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// Terminal state reached
    Verdict(Verdict),
    /// Still running
    Running,
}

/// What a protocol step asks the machine to do next.
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Fail(String),
    Complete,
}

/// Bookkeeping shared by every protocol: phase, records and warnings.
#[derive(Debug)]
struct Core {
    phase: Phase,
    label: Option<String>,
    entered_at: Option<DateTime<Utc>>,
    records: Vec<PhaseRecord>,
    warnings: Vec<ToleranceWarning>,
}

impl Core {
    const fn new() -> Self {
        Self {
            phase: Phase::Precheck,
            label: None,
            entered_at: None,
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase, label: Option<String>, at: DateTime<Utc>) {
        tracing::info!(from = %self.phase, to = %phase, label = ?label, at = %at, "phase transition");
        self.records.push(PhaseRecord {
            phase,
            label: label.clone(),
            entered_at: at,
            stats: PhaseStats::new(),
        });
        self.phase = phase;
        self.label = label;
        self.entered_at = Some(at);
    }

    fn since_entry(&self, at: DateTime<Utc>) -> f64 {
        self.entered_at.map_or(0.0, |entered| seconds(entered, at))
    }

    /// Record a statistic on the current phase.
    fn stat(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(record) = self.records.last_mut() {
            record.stats.insert(key.into(), value.into());
        }
    }

    fn warn(&mut self, kind: WarningKind, message: impl Into<String>, at: DateTime<Utc>) {
        self.warnings
            .push(ToleranceWarning::new(kind, message, Some(at)));
    }
}

/// Seconds from `from` to `to`, negative if `to` is earlier.
#[allow(clippy::cast_precision_loss)]
fn seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    delta.num_microseconds().map_or_else(
        || delta.num_milliseconds() as f64 / 1e3,
        |us| us as f64 / 1e6,
    )
}

/// JSON number, `null` for non-finite values.
fn num(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Phase table of one test type.
trait Protocol {
    /// First active phase, entered on confirmation.
    fn entry(&mut self) -> (Phase, Option<String>);

    fn on_sample(&mut self, core: &mut Core, sample: &Sample) -> Flow;

    fn on_event(&mut self, core: &mut Core, at: DateTime<Utc>, event: &FixtureEvent) -> Flow;

    /// Time-based guards evaluated against an external clock.
    fn on_tick(&mut self, core: &mut Core, now: DateTime<Utc>) -> Flow;

    fn live_stats(&self) -> PhaseStats;

    /// Final statistics and verdict against the standard's declared criteria.
    fn evaluate(&self, declared: &Criteria) -> (PhaseStats, Verdict);
}

#[derive(Debug)]
enum Variant {
    Dielectric(dielectric::Dielectric),
    Leakage(leakage::Leakage),
    Normal(normal::Normal),
    Abnormal(abnormal::Abnormal),
}

impl Variant {
    fn new(standard: &Standard, device: &DeviceParams) -> Result<Self> {
        Ok(match standard.test_type() {
            TestType::Dielectric => Self::Dielectric(dielectric::Dielectric::new(
                DielectricParams::resolve(standard, device)?,
            )),
            TestType::Leakage => {
                Self::Leakage(leakage::Leakage::new(LeakageParams::resolve(standard, device)?))
            }
            TestType::Normal => {
                Self::Normal(normal::Normal::new(NormalParams::resolve(standard)?))
            }
            TestType::Abnormal => Self::Abnormal(abnormal::Abnormal::new(
                AbnormalParams::resolve(standard, device)?,
            )),
        })
    }

    fn protocol(&self) -> &dyn Protocol {
        match self {
            Self::Dielectric(p) => p,
            Self::Leakage(p) => p,
            Self::Normal(p) => p,
            Self::Abnormal(p) => p,
        }
    }

    fn protocol_mut(&mut self) -> &mut dyn Protocol {
        match self {
            Self::Dielectric(p) => p,
            Self::Leakage(p) => p,
            Self::Normal(p) => p,
            Self::Abnormal(p) => p,
        }
    }
}

#[derive(Debug)]
enum Input {
    Sample(Sample),
    Event(DateTime<Utc>, FixtureEvent),
}

/// State machine for one experiment.
#[derive(Debug)]
pub struct TestMachine {
    standard: Arc<Standard>,
    jitter: Duration,
    core: Core,
    variant: Variant,
    pending: Vec<Input>,
    last_seen: Option<DateTime<Utc>>,
    verdict: Option<Verdict>,
}

impl TestMachine {
    /// Create a machine in `PRECHECK` for the standard's test type.
    ///
    /// `jitter` is how far a sample may precede the latest accepted
    /// timestamp before it is a protocol violation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid device ratings or standard
    /// parameters.
    pub fn init(standard: Arc<Standard>, device: DeviceParams, jitter: Duration) -> Result<Self> {
        device.validate()?;
        let variant = Variant::new(&standard, &device)?;
        Ok(Self {
            standard,
            jitter,
            core: Core::new(),
            variant,
            pending: Vec::new(),
            last_seen: None,
            verdict: None,
        })
    }

    /// Test type driven by this machine.
    #[must_use]
    pub fn test_type(&self) -> TestType {
        self.standard.test_type()
    }

    /// Standard in force.
    #[must_use]
    pub fn standard(&self) -> &Arc<Standard> {
        &self.standard
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.core.phase
    }

    /// Whether a terminal phase was reached.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.core.phase.is_terminal()
    }

    /// Phases visited so far, in order.
    #[must_use]
    pub fn phase_records(&self) -> &[PhaseRecord] {
        &self.core.records
    }

    /// Tolerance warnings recorded so far.
    #[must_use]
    pub fn warnings(&self) -> &[ToleranceWarning] {
        &self.core.warnings
    }

    /// Confirm the precheck and replay buffered input.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the machine is terminal or already confirmed.
    pub fn confirm(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.ensure_live()?;
        if self.core.phase != Phase::Precheck {
            return Err(Error::ProtocolViolation(format!(
                "precheck already confirmed, machine is in {}",
                self.core.phase
            )));
        }
        let (phase, label) = self.variant.protocol_mut().entry();
        self.core.enter(phase, label, at);

        let buffered = std::mem::take(&mut self.pending);
        tracing::debug!(replayed = buffered.len(), "precheck confirmed");
        for input in buffered {
            // input buffered behind a terminal transition is dropped
            if self.is_terminal() {
                break;
            }
            match input {
                Input::Sample(sample) => self.apply_sample(&sample),
                Input::Event(at, event) => self.apply_event(at, &event),
            }
        }
        Ok(())
    }

    /// Feed one measurement.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` after a terminal state, or when the
    /// sample precedes the latest accepted timestamp by more than the
    /// jitter tolerance; the latter also cancels the machine.
    pub fn feed(&mut self, sample: &Sample) -> Result<()> {
        self.ensure_live()?;
        self.check_order(sample.timestamp)?;
        if self.core.phase == Phase::Precheck {
            self.pending.push(Input::Sample(sample.clone()));
        } else {
            self.apply_sample(sample);
        }
        Ok(())
    }

    /// Deliver a fixture event.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` after a terminal state.
    pub fn event(&mut self, at: DateTime<Utc>, event: FixtureEvent) -> Result<()> {
        self.ensure_live()?;
        if self.core.phase == Phase::Precheck {
            self.pending.push(Input::Event(at, event));
        } else {
            self.last_seen = Some(self.last_seen.map_or(at, |last| last.max(at)));
            self.apply_event(at, &event);
        }
        Ok(())
    }

    /// Evaluate time-based guards against `now`.
    ///
    /// A no-op before confirmation and after a terminal state.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible so clock-driven checks can report
    /// protocol errors.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.core.phase == Phase::Precheck || self.is_terminal() {
            return Ok(());
        }
        let flow = self.variant.protocol_mut().on_tick(&mut self.core, now);
        self.settle(flow, now);
        Ok(())
    }

    /// Abort the test. Returns `false` if it was already terminal.
    pub fn cancel(&mut self, at: DateTime<Utc>, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.pending.clear();
        self.core.enter(Phase::Cancelled, None, at);
        self.core.stat("reason", reason);
        tracing::warn!(reason, "test cancelled");
        self.verdict = Some(Verdict::failed([format!("cancelled: {reason}")]));
        true
    }

    /// Current phase, elapsed time and running statistics.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let elapsed_s = match (self.core.entered_at, self.last_seen) {
            (Some(entered), Some(last)) => seconds(entered, last).max(0.0),
            _ => 0.0,
        };
        Snapshot {
            phase: self.core.phase,
            label: self.core.label.clone(),
            elapsed_s,
            live_stats: self.variant.protocol().live_stats(),
        }
    }

    /// The verdict once terminal; the same value on every call.
    #[must_use]
    pub fn finalize(&self) -> Finalized {
        self.verdict
            .clone()
            .map_or(Finalized::Running, Finalized::Verdict)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::ProtocolViolation(format!(
                "input after terminal state {}",
                self.core.phase
            )));
        }
        Ok(())
    }

    fn check_order(&mut self, at: DateTime<Utc>) -> Result<()> {
        if let Some(last) = self.last_seen {
            // no lower bound once the allowance reaches past the calendar start
            let earliest = last.checked_sub_signed(self.jitter);
            if earliest.is_some_and(|earliest| at < earliest) {
                let message = format!(
                    "sample at {} precedes last accepted sample at {} by more than {} ms",
                    at.to_rfc3339(),
                    last.to_rfc3339(),
                    self.jitter.num_milliseconds()
                );
                self.cancel(last, &message);
                return Err(Error::ProtocolViolation(message));
            }
        }
        self.last_seen = Some(self.last_seen.map_or(at, |last| last.max(at)));
        Ok(())
    }

    fn apply_sample(&mut self, sample: &Sample) {
        let flow = self.variant.protocol_mut().on_sample(&mut self.core, sample);
        self.settle(flow, sample.timestamp);
    }

    fn apply_event(&mut self, at: DateTime<Utc>, event: &FixtureEvent) {
        let flow = self.variant.protocol_mut().on_event(&mut self.core, at, event);
        self.settle(flow, at);
    }

    fn settle(&mut self, flow: Flow, at: DateTime<Utc>) {
        match flow {
            Flow::Continue => {}
            Flow::Fail(reason) => {
                self.core.enter(Phase::Failed, None, at);
                self.core.stat("reason", reason.as_str());
                tracing::info!(standard = self.standard.code(), %reason, "test failed");
                self.verdict = Some(Verdict::failed([reason]));
            }
            Flow::Complete => {
                self.core.enter(Phase::Evaluating, None, at);
                let (stats, verdict) = self
                    .variant
                    .protocol()
                    .evaluate(self.standard.pass_criteria());
                if let Some(record) = self.core.records.last_mut() {
                    record.stats = stats;
                }
                self.core.enter(Phase::Done, None, at);
                tracing::info!(standard = self.standard.code(), %verdict, "test evaluated");
                self.verdict = Some(verdict);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard::defaults;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn dielectric() -> TestMachine {
        TestMachine::init(
            Arc::new(defaults::dielectric()),
            DeviceParams::new(500.0, 10.0),
            Duration::milliseconds(50),
        )
        .unwrap()
    }

    #[test]
    fn test_precheck_buffers_and_replays() {
        let mut machine = dielectric();
        machine.feed(&Sample::new(t(0), 0.001, 2000.0)).unwrap();
        assert_eq!(machine.phase(), Phase::Precheck);
        machine.confirm(t(0)).unwrap();
        // 2000 V = 1000 + 2 × 500 reaches the target during replay
        assert_eq!(machine.phase(), Phase::Holding);
    }

    #[test]
    fn test_out_of_order_beyond_jitter_cancels() {
        let mut machine = dielectric();
        machine.confirm(t(0)).unwrap();
        machine.feed(&Sample::new(t(5), 0.001, 100.0)).unwrap();
        // within jitter
        machine
            .feed(&Sample::new(t(5) - Duration::milliseconds(40), 0.001, 110.0))
            .unwrap();
        let err = machine.feed(&Sample::new(t(4), 0.001, 120.0)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(machine.phase(), Phase::Cancelled);
        assert!(matches!(machine.finalize(), Finalized::Verdict(v) if !v.pass));
    }

    #[test]
    fn test_unbounded_jitter_accepts_any_order() {
        let mut machine = TestMachine::init(
            Arc::new(defaults::dielectric()),
            DeviceParams::new(500.0, 10.0),
            Duration::milliseconds(i64::MAX),
        )
        .unwrap();
        machine.confirm(t(0)).unwrap();
        machine.feed(&Sample::new(t(5), 0.001, 100.0)).unwrap();
        machine.feed(&Sample::new(t(1), 0.001, 110.0)).unwrap();
        assert_eq!(machine.phase(), Phase::Ramping);
    }

    #[test]
    fn test_feed_after_terminal_is_violation() {
        let mut machine = dielectric();
        machine.confirm(t(0)).unwrap();
        assert!(machine.cancel(t(1), "operator abort"));
        assert!(!machine.cancel(t(2), "again"));
        assert!(matches!(
            machine.feed(&Sample::new(t(3), 0.0, 0.0)),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(machine.tick(t(4)).is_ok());
    }

    #[test]
    fn test_double_confirm_rejected() {
        let mut machine = dielectric();
        machine.confirm(t(0)).unwrap();
        assert!(matches!(machine.confirm(t(1)), Err(Error::ProtocolViolation(_))));
        assert!(!machine.is_terminal());
    }

    #[test]
    fn test_snapshot_elapsed_from_latest_input() {
        let mut machine = dielectric();
        machine.confirm(t(0)).unwrap();
        machine.feed(&Sample::new(t(3), 0.001, 500.0)).unwrap();
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.phase, Phase::Ramping);
        assert!((snapshot.elapsed_s - 3.0).abs() < 1e-9);
        assert!(snapshot.live_stats.contains_key("max_leakage"));
    }

    #[test]
    fn test_invalid_device_rejected() {
        let result = TestMachine::init(
            Arc::new(defaults::dielectric()),
            DeviceParams::new(-1.0, 1.0),
            Duration::milliseconds(50),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::RampingDown.to_string(), "RAMPING_DOWN");
        assert_eq!(serde_json::to_string(&Phase::EnvStress).unwrap(), "\"ENV_STRESS\"");
        let event: FixtureEvent =
            serde_json::from_str(r#"{"event": "communication_probe", "ok": true}"#).unwrap();
        assert_eq!(event, FixtureEvent::CommunicationProbe { ok: true });
    }
}
