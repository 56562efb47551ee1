//! Persistence contract and the in-memory store
//!
//! The relational store holding measurement rows, experiments and standards
//! is an external collaborator. The engine reaches it only through
//! [`MeasurementStore`]; its calls are the engine's only suspension points.
//! [`MemoryStore`] implements the contract in memory and is what tests and
//! single-process deployments use. Data is lost on process restart.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{Experiment, ExperimentId, NewExperiment, TerminalUpdate};
use crate::sample::{sort_stable, Sample};
use crate::simulation::SimulationSummary;
use crate::standard::Standard;
use crate::{Error, Result};

/// Read/write contract with the persistence collaborator.
///
/// Failures are propagated as-is; the engine never retries.
pub trait MeasurementStore: Send + Sync {
    /// Every standard definition.
    fn load_standards(&self) -> impl Future<Output = Result<Vec<Standard>>> + Send;

    /// Insert an experiment in `running`/`pending` and return its id.
    fn create_experiment(
        &self,
        new: NewExperiment,
    ) -> impl Future<Output = Result<ExperimentId>> + Send;

    /// Record the terminal status, result and notes.
    fn update_terminal(
        &self,
        id: &ExperimentId,
        update: TerminalUpdate,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Append measurement rows for an experiment.
    fn append_samples(
        &self,
        id: &ExperimentId,
        samples: &[Sample],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Samples with `from <= timestamp <= to` (open bounds when `None`), timestamp-ordered.
    fn sample_range(
        &self,
        id: &ExperimentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<Sample>>> + Send;

    /// Experiment record, `None` if unknown.
    fn get_experiment(
        &self,
        id: &ExperimentId,
    ) -> impl Future<Output = Result<Option<Experiment>>> + Send;

    /// Attach a simulation summary to an experiment.
    fn attach_simulation(
        &self,
        id: &ExperimentId,
        summary: SimulationSummary,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// In-memory store backed by `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    standards: Vec<Standard>,
    experiments: DashMap<ExperimentId, Experiment>,
    samples: DashMap<ExperimentId, Vec<Sample>>,
    simulations: DashMap<ExperimentId, Vec<SimulationSummary>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store without standards.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store serving the given standard definitions.
    #[must_use]
    pub fn with_standards(standards: Vec<Standard>) -> Self {
        Self {
            standards,
            ..Self::default()
        }
    }

    /// Number of experiments.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Number of stored samples for an experiment.
    #[must_use]
    pub fn sample_count(&self, id: &ExperimentId) -> usize {
        self.samples.get(id).map_or(0, |s| s.len())
    }

    /// Simulation summaries attached to an experiment.
    #[must_use]
    pub fn simulations(&self, id: &ExperimentId) -> Vec<SimulationSummary> {
        self.simulations
            .get(id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    fn require(&self, id: &ExperimentId) -> Result<()> {
        if self.experiments.contains_key(id) {
            Ok(())
        } else {
            Err(Error::experiment_not_found(id))
        }
    }
}

impl MeasurementStore for MemoryStore {
    async fn load_standards(&self) -> Result<Vec<Standard>> {
        Ok(self.standards.clone())
    }

    async fn create_experiment(&self, new: NewExperiment) -> Result<ExperimentId> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = ExperimentId::new(format!("exp-{n:06}"));
        self.experiments
            .insert(id.clone(), Experiment::created(id.clone(), new));
        Ok(id)
    }

    async fn update_terminal(&self, id: &ExperimentId, update: TerminalUpdate) -> Result<()> {
        let mut experiment = self
            .experiments
            .get_mut(id)
            .ok_or_else(|| Error::experiment_not_found(id))?;
        experiment.complete(&update);
        Ok(())
    }

    async fn append_samples(&self, id: &ExperimentId, samples: &[Sample]) -> Result<()> {
        self.require(id)?;
        self.samples
            .entry(id.clone())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    async fn sample_range(
        &self,
        id: &ExperimentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Sample>> {
        self.require(id)?;
        let mut selected: Vec<Sample> = self
            .samples
            .get(id)
            .map(|rows| {
                rows.iter()
                    .filter(|s| from.map_or(true, |f| s.timestamp >= f))
                    .filter(|s| to.map_or(true, |t| s.timestamp <= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_stable(&mut selected);
        Ok(selected)
    }

    async fn get_experiment(&self, id: &ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|e| e.value().clone()))
    }

    async fn attach_simulation(&self, id: &ExperimentId, summary: SimulationSummary) -> Result<()> {
        self.require(id)?;
        self.simulations.entry(id.clone()).or_default().push(summary);
        Ok(())
    }
}
