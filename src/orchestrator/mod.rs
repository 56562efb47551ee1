//! Experiment orchestrator
//!
//! Owns the lifecycle of every experiment: creates the record, drives its
//! [`TestMachine`], persists accepted samples and writes the terminal
//! status/result exactly once.
//!
//! ## Concurrency
//!
//! ```text
//!  live: DashMap<id, Arc<LiveEntry>>      one Mutex<TestMachine> per id
//!         │
//!         ├─ lock ─► feed / event / tick ─► unlock      (sync, never awaits)
//!         └────────► store.append_samples / update_terminal  (awaited after unlock)
//! ```
//!
//! Different ids never share mutable state. Calls for the same id
//! serialize on its mutex, so samples for one id are processed in
//! submission order. `cancel` raises a flag that the next feed or poll
//! observes.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pvrsd_bench::experiment::MemoryStore;
//! use pvrsd_bench::machine::DeviceParams;
//! use pvrsd_bench::orchestrator::{Device, Orchestrator, Outcome};
//! use pvrsd_bench::sample::Sample;
//! use pvrsd_bench::standard::{defaults, TestType};
//!
//! # async fn example() -> pvrsd_bench::Result<()> {
//! let store = Arc::new(MemoryStore::with_standards(defaults::builtin()));
//! let bench = Orchestrator::builder(store).operator("alice").build().await?;
//!
//! let device = Device::new("rsd-01", DeviceParams::new(1000.0, 10.0));
//! let id = bench.start(TestType::Dielectric, &device, defaults::DIELECTRIC).await?;
//! let t0 = chrono::Utc::now();
//! bench.confirm(&id, t0).await?;
//! bench.ingest(&id, &[Sample::new(t0, 0.007, 1500.0)]).await?;
//!
//! let Outcome::Decided(verdict) = bench.result(&id)? else { unreachable!() };
//! assert!(!verdict.pass);
//! # Ok(())
//! # }
//! ```

mod live;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use self::live::{Closing, LiveEntry};
use crate::adapter::{self, RawRow};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{ToleranceWarning, WarningKind};
use crate::evaluation::Verdict;
use crate::experiment::{Experiment, ExperimentId, MeasurementStore, NewExperiment};
use crate::machine::{DeviceParams, Finalized, FixtureEvent, Snapshot, TestMachine};
use crate::sample::Sample;
use crate::simulation::{CircuitModel, ScheduledFault, SimulationRun};
use crate::standard::{StandardRegistry, TestType};
use crate::{Error, Result};

/// Device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier as stored on the experiment
    pub id: String,
    /// Ratings the protocols derive their defaults from
    pub rated: DeviceParams,
}

impl Device {
    /// Create a device.
    #[must_use]
    pub fn new(id: impl Into<String>, rated: DeviceParams) -> Self {
        Self {
            id: id.into(),
            rated,
        }
    }
}

/// What happened to one `ingest` batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Samples handed to the machine and persisted
    pub accepted: usize,
    /// Samples held for an id that is not live yet
    pub buffered: usize,
    /// Samples discarded (finished experiment, full buffer, or after a violation)
    pub dropped: usize,
    /// Warnings raised while handling the batch
    pub warnings: Vec<ToleranceWarning>,
}

/// Verdict status of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "verdict", rename_all = "snake_case")]
pub enum Outcome {
    /// Machine still running
    Pending,
    /// Terminal verdict
    Decided(Verdict),
}

#[derive(Debug, Clone)]
struct Finished {
    verdict: Verdict,
    snapshot: Snapshot,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder<S> {
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    operator: String,
    registry: Option<StandardRegistry>,
}

impl<S: MeasurementStore> OrchestratorBuilder<S> {
    /// Engine configuration (defaults otherwise).
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for lifecycle stamps and polling (wall clock otherwise).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Operator recorded on created experiments.
    #[must_use]
    pub fn operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    /// Use this registry instead of loading standards from the store.
    #[must_use]
    pub fn registry(mut self, registry: StandardRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and load the registry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings, or propagates
    /// the store's error when loading standards fails.
    pub async fn build(self) -> Result<Orchestrator<S>> {
        self.config.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => StandardRegistry::load(self.store.as_ref()).await?,
        };
        Ok(Orchestrator {
            store: self.store,
            registry: Arc::new(registry),
            config: self.config,
            clock: self.clock,
            operator: self.operator,
            live: DashMap::new(),
            orphans: DashMap::new(),
            finished: DashMap::new(),
        })
    }
}

/// Façade over live experiments and the persistence collaborator.
pub struct Orchestrator<S> {
    store: Arc<S>,
    registry: Arc<StandardRegistry>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    operator: String,
    live: DashMap<ExperimentId, Arc<LiveEntry>>,
    orphans: DashMap<ExperimentId, Vec<Sample>>,
    finished: DashMap<ExperimentId, Finished>,
}

impl<S: MeasurementStore> Orchestrator<S> {
    /// Start building an orchestrator over `store`.
    #[must_use]
    pub fn builder(store: Arc<S>) -> OrchestratorBuilder<S> {
        OrchestratorBuilder {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            operator: String::new(),
            registry: None,
        }
    }

    /// Standards in force.
    #[must_use]
    pub fn registry(&self) -> &StandardRegistry {
        &self.registry
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of experiments with a running machine.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Samples buffered for an id that is not live.
    #[must_use]
    pub fn buffered(&self, id: &ExperimentId) -> usize {
        self.orphans.get(id).map_or(0, |s| s.len())
    }

    /// Create an experiment and its machine in `PRECHECK`.
    ///
    /// Samples buffered for the new id are replayed into the machine.
    ///
    /// # Errors
    ///
    /// * `NotFound` for an unknown standard code
    /// * `Validation` if the standard is for another test type, or the
    ///   device ratings or standard parameters are invalid
    /// * the store's error if the experiment cannot be created
    pub async fn start(
        &self,
        test_type: TestType,
        device: &Device,
        standard_code: &str,
    ) -> Result<ExperimentId> {
        let standard = self.registry.get(standard_code)?;
        if standard.test_type() != test_type {
            return Err(Error::Validation(format!(
                "standard {standard_code} is a {} standard, not {test_type}",
                standard.test_type()
            )));
        }
        let machine = TestMachine::init(standard, device.rated, self.config.jitter())?;

        let new = NewExperiment::builder(test_type, device.id.as_str(), standard_code)
            .operator(self.operator.as_str())
            .start_time(self.clock.now())
            .build();
        let id = self.store.create_experiment(new).await?;
        let entry = Arc::new(LiveEntry::new(&id, machine));
        info!(parent: entry.span(), device = %device.id, "experiment started");

        // Going live under the orphan slot lock keeps concurrent ingests
        // from buffering into a slot nobody will drain.
        let replay = {
            let slot = self.orphans.entry(id.clone());
            self.live.insert(id.clone(), Arc::clone(&entry));
            match slot {
                Entry::Occupied(occupied) => occupied.remove(),
                Entry::Vacant(_) => Vec::new(),
            }
        };
        if !replay.is_empty() {
            debug!(parent: entry.span(), count = replay.len(), "replaying buffered samples");
            self.feed_live(&id, &entry, &replay).await?;
        }
        Ok(id)
    }

    /// Confirm the precheck for `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id; `ProtocolViolation` if the experiment
    /// already finished or was already confirmed.
    pub async fn confirm(&self, id: &ExperimentId, at: DateTime<Utc>) -> Result<()> {
        let entry = self.live_entry(id)?;
        let (outcome, closing) = entry.drive(self.clock.now(), |_, state| state.machine.confirm(at));
        self.finish(id, &entry, closing).await?;
        outcome
    }

    /// Feed samples to a live experiment, buffer them for an id that is
    /// not live yet, or drop them for a finished one.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` when a sample is out of order beyond the jitter
    /// tolerance (the experiment is cancelled and persisted first), or the
    /// store's error.
    pub async fn ingest(&self, id: &ExperimentId, samples: &[Sample]) -> Result<IngestReport> {
        loop {
            if let Some(entry) = self.entry(id) {
                return self.feed_live(id, &entry, samples).await;
            }
            if let Some(report) = self.ingest_detached(id, samples) {
                return Ok(report);
            }
            // went live between the two lookups
        }
    }

    /// Normalize raw rows and ingest the resulting samples.
    ///
    /// # Errors
    ///
    /// Propagates [`adapter::normalize`] and [`Self::ingest`] errors.
    pub async fn import(&self, id: &ExperimentId, rows: &[RawRow]) -> Result<IngestReport> {
        let normalized = adapter::normalize(rows, self.config.power_tolerance)?;
        let mut report = self.ingest(id, &normalized.samples).await?;
        let mut warnings = normalized.warnings;
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        Ok(report)
    }

    /// Deliver a fixture event. Events for a finished experiment are
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, or the store's error when the event
    /// ends the test.
    pub async fn event(&self, id: &ExperimentId, at: DateTime<Utc>, event: FixtureEvent) -> Result<()> {
        let Some(entry) = self.entry(id) else {
            return if self.finished.contains_key(id) {
                warn!(%id, ?event, "event after terminal state ignored");
                Ok(())
            } else {
                Err(Error::experiment_not_found(id))
            };
        };
        let ((), closing) = entry.drive(self.clock.now(), |_, state| {
            if let Err(err) = state.machine.event(at, event) {
                warn!(%err, "event after terminal state ignored");
            }
        });
        self.finish(id, &entry, closing).await
    }

    /// Run time-based phase checks for `id` against the clock.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, or the store's error when the check
    /// ends the test.
    pub async fn poll(&self, id: &ExperimentId) -> Result<Outcome> {
        let Some(entry) = self.entry(id) else {
            return self.result(id);
        };
        let now = self.clock.now();
        let (ticked, closing) = entry.drive(now, |_, state| state.machine.tick(now));
        let decided = closing.as_ref().map(|c| c.verdict.clone());
        self.finish(id, &entry, closing).await?;
        ticked?;
        Ok(decided.map_or(Outcome::Pending, Outcome::Decided))
    }

    /// Poll every live experiment; returns how many reached a verdict.
    ///
    /// # Errors
    ///
    /// Every experiment is polled; the first error encountered is returned.
    pub async fn poll_all(&self) -> Result<usize> {
        let ids: Vec<ExperimentId> = self.live.iter().map(|e| e.key().clone()).collect();
        let mut decided = 0;
        let mut first_err = None;
        for id in ids {
            match self.poll(&id).await {
                Ok(Outcome::Decided(_)) => decided += 1,
                Ok(Outcome::Pending) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(decided), Err)
    }

    /// Request cancellation. Applied at once when the experiment is idle,
    /// otherwise by the ingest or poll currently holding it. Returns
    /// `false` if the experiment had already finished.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, or the store's error.
    pub async fn cancel(&self, id: &ExperimentId, reason: &str) -> Result<bool> {
        let Some(entry) = self.entry(id) else {
            return if self.finished.contains_key(id) {
                Ok(false)
            } else {
                Err(Error::experiment_not_found(id))
            };
        };
        entry.request_cancel(reason);
        let closing = entry.try_settle_cancel(self.clock.now());
        self.finish(id, &entry, closing).await?;
        Ok(true)
    }

    /// Verdict if decided.
    ///
    /// # Errors
    ///
    /// `NotFound` for an id this orchestrator does not know.
    pub fn result(&self, id: &ExperimentId) -> Result<Outcome> {
        if let Some(finished) = self.finished.get(id) {
            return Ok(Outcome::Decided(finished.verdict.clone()));
        }
        let entry = self.entry(id).ok_or_else(|| Error::experiment_not_found(id))?;
        Ok(entry.inspect(|state| match state.machine.finalize() {
            Finalized::Verdict(verdict) => Outcome::Decided(verdict),
            Finalized::Running => Outcome::Pending,
        }))
    }

    /// Current phase and running statistics; the final snapshot once finished.
    ///
    /// # Errors
    ///
    /// `NotFound` for an id this orchestrator does not know.
    pub fn snapshot(&self, id: &ExperimentId) -> Result<Snapshot> {
        if let Some(entry) = self.entry(id) {
            return Ok(entry.inspect(|state| state.machine.snapshot()));
        }
        self.finished
            .get(id)
            .map(|f| f.snapshot.clone())
            .ok_or_else(|| Error::experiment_not_found(id))
    }

    /// Experiment record from the store.
    ///
    /// # Errors
    ///
    /// `NotFound` if the store has no such experiment, or the store's error.
    pub async fn experiment(&self, id: &ExperimentId) -> Result<Experiment> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or_else(|| Error::experiment_not_found(id))
    }

    /// Persisted samples with `from <= timestamp <= to`, timestamp-ordered.
    ///
    /// # Errors
    ///
    /// Propagates the store's error.
    pub async fn samples(
        &self,
        id: &ExperimentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Sample>> {
        self.store.sample_range(id, from, to).await
    }

    /// Simulate `model` over the span of the experiment's recorded samples,
    /// compare, and attach the summary to the experiment.
    ///
    /// The synthetic trace starts at the first recorded sample in range.
    ///
    /// # Errors
    ///
    /// Validation errors from the simulation or comparison, or the store's
    /// error.
    pub async fn simulate_against(
        &self,
        id: &ExperimentId,
        model: CircuitModel,
        duration_s: f64,
        faults: Vec<ScheduledFault>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<SimulationRun> {
        let reference = self.store.sample_range(id, from, to).await?;
        let start = reference
            .first()
            .map(|s| s.timestamp)
            .or(from)
            .unwrap_or_else(|| self.clock.now());
        let run = SimulationRun::generate(model, start, duration_s, faults)?.against(reference)?;
        let summary = run.summary(self.config.downsample_points, self.clock.now());
        if let Some(metrics) = &summary.metrics {
            info!(
                %id,
                mean_abs_error = metrics.mean_abs_error,
                time_offset_s = metrics.time_offset_s,
                excluded = summary.excluded_points,
                "simulation compared"
            );
        }
        self.store.attach_simulation(id, summary).await?;
        Ok(run)
    }

    fn entry(&self, id: &ExperimentId) -> Option<Arc<LiveEntry>> {
        self.live.get(id).map(|e| Arc::clone(e.value()))
    }

    fn live_entry(&self, id: &ExperimentId) -> Result<Arc<LiveEntry>> {
        if let Some(entry) = self.entry(id) {
            return Ok(entry);
        }
        if self.finished.contains_key(id) {
            Err(Error::ProtocolViolation(format!(
                "experiment {id} already reached a terminal state"
            )))
        } else {
            Err(Error::experiment_not_found(id))
        }
    }

    async fn feed_live(
        &self,
        id: &ExperimentId,
        entry: &Arc<LiveEntry>,
        samples: &[Sample],
    ) -> Result<IngestReport> {
        let now = self.clock.now();
        let ((mut report, accepted, violation), closing) = entry.drive(now, |entry, state| {
            let mut report = IngestReport::default();
            let mut accepted = Vec::with_capacity(samples.len());
            let mut violation = None;
            for (i, sample) in samples.iter().enumerate() {
                if state.machine.is_terminal() || entry.observe_cancel(state, now) {
                    report.dropped += samples.len() - i;
                    report.warnings.push(state.drop_late(samples.len() - i, sample.timestamp));
                    break;
                }
                match state.machine.feed(sample) {
                    Ok(()) => accepted.push(sample.clone()),
                    Err(err) => {
                        report.dropped += samples.len() - i;
                        violation = Some(err);
                        break;
                    }
                }
            }
            (report, accepted, violation)
        });
        report.accepted = accepted.len();

        if !accepted.is_empty() {
            self.store
                .append_samples(id, &accepted)
                .instrument(entry.span().clone())
                .await?;
        }
        self.finish(id, entry, closing).await?;
        violation.map_or(Ok(report), Err)
    }

    /// Buffer or drop samples for an id without a live machine. `None`
    /// if the id went live meanwhile.
    fn ingest_detached(&self, id: &ExperimentId, samples: &[Sample]) -> Option<IngestReport> {
        let mut report = IngestReport::default();
        if self.finished.contains_key(id) {
            report.dropped = samples.len();
            if let Some(first) = samples.first() {
                report.warnings.push(ToleranceWarning::new(
                    WarningKind::LateSampleDropped,
                    format!("{} sample(s) dropped: experiment {id} already finished", samples.len()),
                    Some(first.timestamp),
                ));
            }
            return Some(report);
        }

        let slot = self.orphans.entry(id.clone());
        if self.live.contains_key(id) {
            return None;
        }
        let mut slot = slot.or_default();
        let room = self.config.orphan_buffer_limit.saturating_sub(slot.len());
        let kept = room.min(samples.len());
        slot.extend_from_slice(&samples[..kept]);
        report.buffered = kept;
        if kept < samples.len() {
            report.dropped = samples.len() - kept;
            report.warnings.push(ToleranceWarning::new(
                WarningKind::LateSampleDropped,
                format!(
                    "orphan buffer for {id} full ({} samples), {} dropped",
                    self.config.orphan_buffer_limit, report.dropped
                ),
                Some(samples[kept].timestamp),
            ));
        }
        debug!(%id, buffered = kept, "samples buffered for experiment not yet live");
        Some(report)
    }

    /// Retire a terminal experiment and persist its status exactly once.
    async fn finish(
        &self,
        id: &ExperimentId,
        entry: &LiveEntry,
        closing: Option<Closing>,
    ) -> Result<()> {
        let Some(closing) = closing else {
            return Ok(());
        };
        self.finished.insert(
            id.clone(),
            Finished {
                verdict: closing.verdict.clone(),
                snapshot: closing.snapshot,
            },
        );
        self.live.remove(id);
        info!(
            parent: entry.span(),
            status = ?closing.update.status,
            pass = closing.verdict.pass,
            reasons = closing.verdict.reasons.len(),
            "experiment finished"
        );
        self.store
            .update_terminal(id, closing.update)
            .instrument(entry.span().clone())
            .await
    }
}
