//! Normal operation: functional checks, shutdown response, performance
//!
//! Sub-checks never abort the test. Each one is recorded and the verdict
//! is the AND over all of them. Only a shutdown command that never
//! arrives ends the test early.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{num, seconds, Core, FixtureEvent, Flow, Phase, Protocol};
use crate::evaluation::{evaluate, merge_criteria, Criteria, PhaseStats, Verdict};
use crate::sample::Sample;
use crate::standard::Standard;
use crate::stats::RunningStats;
use crate::Result;

const DEFAULT_SHUTDOWN_TIME_S: f64 = 30.0;
const DEFAULT_ZERO_OUTPUT_V: f64 = 30.0;
const DEFAULT_FUNCTIONAL_WINDOW_S: f64 = 35.0;
const DEFAULT_PERFORMANCE_DURATION_S: f64 = 60.0;
const DEFAULT_COMMAND_TIMEOUT_S: f64 = 120.0;
const MIN_COMMUNICATION_PCT: f64 = 95.0;
const MIN_REMOTE_RESPONSE_PCT: f64 = 100.0;
const MAX_RESTART_S: f64 = 60.0;
const MIN_POWER_STABILITY_PCT: f64 = 95.0;
const MIN_EFFICIENCY_PCT: f64 = 95.0;
const MAX_TEMPERATURE_RISE_C: f64 = 40.0;

/// Normal-operation parameters resolved from a standard.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalParams {
    /// Bound on shutdown-command to zero-output latency (s)
    pub shutdown_time_s: f64,
    /// Output voltage counted as "off" (V)
    pub zero_output_voltage: f64,
    /// Longest functional-check phase before timing starts anyway (s)
    pub functional_window_s: f64,
    /// Steady-state sampling window (s)
    pub performance_duration_s: f64,
    /// Longest wait in `RESPONSE_TIMING` for the shutdown command (s)
    pub command_timeout_s: f64,
}

impl NormalParams {
    /// Resolve parameters, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative values.
    pub fn resolve(standard: &Standard) -> Result<Self> {
        Ok(Self {
            shutdown_time_s: standard.duration_or("shutdown_time", DEFAULT_SHUTDOWN_TIME_S)?,
            zero_output_voltage: standard
                .non_negative_or("zero_output_voltage", DEFAULT_ZERO_OUTPUT_V)?,
            functional_window_s: standard
                .duration_or("functional_window", DEFAULT_FUNCTIONAL_WINDOW_S)?,
            performance_duration_s: standard
                .duration_or("performance_duration", DEFAULT_PERFORMANCE_DURATION_S)?,
            command_timeout_s: standard
                .duration_or("command_timeout", DEFAULT_COMMAND_TIMEOUT_S)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    ok: u32,
    total: u32,
}

impl Tally {
    fn record(&mut self, ok: bool) {
        self.total += 1;
        if ok {
            self.ok += 1;
        }
    }

    fn percent(self) -> Option<f64> {
        (self.total > 0).then(|| f64::from(self.ok) / f64::from(self.total) * 100.0)
    }
}

#[derive(Debug)]
pub(super) struct Normal {
    params: NormalParams,
    communication: Tally,
    remote: Tally,
    restart_s: Option<f64>,
    command_at: Option<DateTime<Utc>>,
    response_time_s: Option<f64>,
    power: RunningStats,
    temperature: RunningStats,
    efficiency: Vec<(f64, f64)>,
}

impl Normal {
    pub(super) const fn new(params: NormalParams) -> Self {
        Self {
            params,
            communication: Tally { ok: 0, total: 0 },
            remote: Tally { ok: 0, total: 0 },
            restart_s: None,
            command_at: None,
            response_time_s: None,
            power: RunningStats::new(),
            temperature: RunningStats::new(),
            efficiency: Vec::new(),
        }
    }

    fn leave_functional(&self, core: &mut Core, at: DateTime<Utc>) {
        if let Some(pct) = self.communication.percent() {
            core.stat("communication_success_pct", num(pct));
        }
        if let Some(pct) = self.remote.percent() {
            core.stat("remote_response_pct", num(pct));
        }
        if let Some(restart) = self.restart_s {
            core.stat("restart_time_s", num(restart));
        }
        core.enter(Phase::ResponseTiming, None, at);
    }

    fn respond(&mut self, core: &mut Core, at: DateTime<Utc>, latency: f64) {
        self.response_time_s = Some(latency);
        core.stat("response_time_s", num(latency));
        if latency > self.params.shutdown_time_s {
            core.stat("shutdown_timed_out", true);
            tracing::info!(
                latency,
                bound = self.params.shutdown_time_s,
                "shutdown response exceeded bound"
            );
        }
        core.enter(Phase::Performance, None, at);
    }

    /// Latency so far once the bound is exceeded without reaching zero output.
    fn response_timeout(&self, at: DateTime<Utc>) -> Option<f64> {
        let command = self.command_at?;
        let elapsed = seconds(command, at);
        (elapsed > self.params.shutdown_time_s).then_some(elapsed)
    }

    /// Failure once `RESPONSE_TIMING` outlasts the command timeout with no command.
    fn command_missing(&self, core: &Core, at: DateTime<Utc>) -> Option<Flow> {
        let waited = core.since_entry(at);
        (self.command_at.is_none() && waited > self.params.command_timeout_s).then(|| {
            Flow::Fail(format!(
                "no shutdown command within {} s of {}",
                self.params.command_timeout_s, core.phase
            ))
        })
    }

    fn performance_done(&self, core: &Core, at: DateTime<Utc>) -> bool {
        core.since_entry(at) >= self.params.performance_duration_s
    }

    fn power_stability_pct(&self) -> Option<f64> {
        let mean = self.power.mean()?;
        let std_dev = self.power.std_dev().unwrap_or(0.0);
        if mean <= 0.0 {
            return Some(0.0);
        }
        Some(((1.0 - std_dev / mean) * 100.0).clamp(0.0, 100.0))
    }

    fn temperature_rise_c(&self) -> Option<f64> {
        Some(self.temperature.max()? - self.temperature.first()?)
    }

    fn min_efficiency_pct(&self) -> Option<f64> {
        self.efficiency
            .iter()
            .map(|(_, pct)| *pct)
            .reduce(f64::min)
    }
}

impl Protocol for Normal {
    fn entry(&mut self) -> (Phase, Option<String>) {
        (Phase::FunctionalCheck, None)
    }

    fn on_sample(&mut self, core: &mut Core, sample: &Sample) -> Flow {
        let at = sample.timestamp;
        match core.phase {
            Phase::FunctionalCheck => {
                if core.since_entry(at) >= self.params.functional_window_s {
                    self.leave_functional(core, at);
                }
                Flow::Continue
            }
            Phase::ResponseTiming => {
                if let Some(command) = self.command_at.filter(|c| at >= *c) {
                    if sample.voltage <= self.params.zero_output_voltage {
                        self.respond(core, at, seconds(command, at));
                    } else if let Some(elapsed) = self.response_timeout(at) {
                        self.respond(core, at, elapsed);
                    }
                } else if let Some(fail) = self.command_missing(core, at) {
                    return fail;
                }
                Flow::Continue
            }
            Phase::Performance => {
                self.power.push(sample.power);
                if let Some(temperature) = sample.temperature {
                    self.temperature.push(temperature);
                }
                if self.performance_done(core, at) {
                    return Flow::Complete;
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn on_event(&mut self, core: &mut Core, at: DateTime<Utc>, event: &FixtureEvent) -> Flow {
        match (core.phase, event) {
            (Phase::FunctionalCheck, FixtureEvent::CommunicationProbe { ok }) => {
                self.communication.record(*ok);
            }
            (Phase::FunctionalCheck, FixtureEvent::RemoteCommand { acknowledged }) => {
                self.remote.record(*acknowledged);
            }
            (Phase::FunctionalCheck, FixtureEvent::RestartObserved { seconds: restart }) => {
                self.restart_s = Some(*restart);
            }
            (Phase::FunctionalCheck, FixtureEvent::FunctionalDone | FixtureEvent::StageComplete) => {
                self.leave_functional(core, at);
            }
            (Phase::FunctionalCheck, FixtureEvent::ShutdownCommand) => {
                self.leave_functional(core, at);
                self.command_at = Some(at);
            }
            (Phase::ResponseTiming, FixtureEvent::ShutdownCommand) => {
                self.command_at.get_or_insert(at);
            }
            (_, FixtureEvent::EfficiencyPoint { load_fraction, efficiency_pct }) => {
                self.efficiency.push((*load_fraction, *efficiency_pct));
            }
            _ => tracing::debug!(phase = %core.phase, ?event, "event ignored"),
        }
        Flow::Continue
    }

    fn on_tick(&mut self, core: &mut Core, now: DateTime<Utc>) -> Flow {
        match core.phase {
            Phase::FunctionalCheck if core.since_entry(now) >= self.params.functional_window_s => {
                self.leave_functional(core, now);
            }
            Phase::ResponseTiming => {
                if let Some(fail) = self.command_missing(core, now) {
                    return fail;
                }
                if let Some(elapsed) = self.response_timeout(now) {
                    self.respond(core, now, elapsed);
                }
            }
            Phase::Performance if self.performance_done(core, now) => return Flow::Complete,
            _ => {}
        }
        Flow::Continue
    }

    fn live_stats(&self) -> PhaseStats {
        let mut stats = PhaseStats::new();
        stats.insert("communication_probes".into(), self.communication.total.into());
        stats.insert("remote_commands".into(), self.remote.total.into());
        if let Some(response) = self.response_time_s {
            stats.insert("response_time_s".into(), num(response));
        }
        if let Some(mean) = self.power.mean() {
            stats.insert("mean_power".into(), num(mean));
        }
        if let Some(rise) = self.temperature_rise_c() {
            stats.insert("temperature_rise_c".into(), num(rise));
        }
        stats
    }

    fn evaluate(&self, declared: &Criteria) -> (PhaseStats, Verdict) {
        let mut stats = PhaseStats::new();
        let mut insert = |key: &str, value: Option<f64>| {
            if let Some(value) = value {
                stats.insert(key.to_string(), num(value));
            }
        };
        insert("response_time_s", self.response_time_s);
        insert("communication_success_pct", self.communication.percent());
        insert("remote_response_pct", self.remote.percent());
        insert("restart_time_s", self.restart_s);
        insert("power_stability_pct", self.power_stability_pct());
        insert("temperature_rise_c", self.temperature_rise_c());
        insert("efficiency_pct", self.min_efficiency_pct());
        insert("mean_power", self.power.mean());

        let mut defaults = Criteria::new();
        defaults.insert(
            "max_response_time_s".into(),
            json!(self.params.shutdown_time_s),
        );
        defaults.insert(
            "min_communication_success_pct".into(),
            json!(MIN_COMMUNICATION_PCT),
        );
        defaults.insert("min_remote_response_pct".into(), json!(MIN_REMOTE_RESPONSE_PCT));
        defaults.insert("min_power_stability_pct".into(), json!(MIN_POWER_STABILITY_PCT));
        defaults.insert("max_temperature_rise_c".into(), json!(MAX_TEMPERATURE_RISE_C));
        if self.restart_s.is_some() {
            defaults.insert("max_restart_time_s".into(), json!(MAX_RESTART_S));
        }
        if !self.efficiency.is_empty() {
            defaults.insert("min_efficiency_pct".into(), json!(MIN_EFFICIENCY_PCT));
        }
        let verdict = evaluate(&stats, &merge_criteria(defaults, declared));
        (stats, verdict)
    }
}
