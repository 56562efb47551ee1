//! Experiment Record - lifecycle entity for one test execution

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::standard::TestType;

/// Identifier assigned by the store when an experiment is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Wrap an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExperimentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// State machine is live.
    Running,
    /// State machine reached a verdict.
    Completed,
    /// Aborted externally or by a protocol violation.
    Cancelled,
}

impl ExperimentStatus {
    /// Whether no further samples are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Test result as stored alongside the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    /// Verdict passed.
    Pass,
    /// Verdict failed (including cancellation).
    Fail,
    /// No verdict yet.
    Pending,
}

impl TestResult {
    /// Map a verdict outcome.
    #[must_use]
    pub const fn from_pass(pass: bool) -> Self {
        if pass {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

/// Experiment record as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    id: ExperimentId,
    test_type: TestType,
    device_id: String,
    operator_id: String,
    standard_code: String,
    status: ExperimentStatus,
    result: TestResult,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    notes: String,
}

impl Experiment {
    /// Materialize a freshly created experiment: `running` / `pending`.
    #[must_use]
    pub fn created(id: ExperimentId, new: NewExperiment) -> Self {
        Self {
            id,
            test_type: new.test_type,
            device_id: new.device_id,
            operator_id: new.operator_id,
            standard_code: new.standard_code,
            status: ExperimentStatus::Running,
            result: TestResult::Pending,
            start_time: new.start_time,
            end_time: None,
            notes: new.notes,
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub const fn id(&self) -> &ExperimentId {
        &self.id
    }

    /// Get the test type.
    #[must_use]
    pub const fn test_type(&self) -> TestType {
        self.test_type
    }

    /// Get the device under test.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Get the operator.
    #[must_use]
    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// Get the standard code.
    #[must_use]
    pub fn standard_code(&self) -> &str {
        &self.standard_code
    }

    /// Get the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the stored result.
    #[must_use]
    pub const fn result(&self) -> TestResult {
        self.result
    }

    /// Get the start timestamp.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Get the end timestamp, if terminal.
    #[must_use]
    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Get the notes.
    #[must_use]
    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Apply a terminal update.
    pub fn complete(&mut self, update: &TerminalUpdate) {
        self.status = update.status;
        self.result = update.result;
        self.end_time = Some(update.end_time);
        if !update.notes.is_empty() {
            if !self.notes.is_empty() {
                self.notes.push('\n');
            }
            self.notes.push_str(&update.notes);
        }
    }
}

/// Terminal transition handed to the store exactly once per experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalUpdate {
    /// `completed` or `cancelled`
    pub status: ExperimentStatus,
    /// `pass` or `fail`
    pub result: TestResult,
    /// Folded phase records, verdict reasons and coalesced warnings
    pub notes: String,
    /// When the terminal state was reached
    pub end_time: DateTime<Utc>,
}

/// Fields supplied when creating an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    /// Test type
    pub test_type: TestType,
    /// Device under test
    pub device_id: String,
    /// Operator starting the test
    pub operator_id: String,
    /// Standard the test follows
    pub standard_code: String,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// Free-form notes
    pub notes: String,
}

impl NewExperiment {
    /// Create a builder with required fields.
    #[must_use]
    pub fn builder(
        test_type: TestType,
        device_id: impl Into<String>,
        standard_code: impl Into<String>,
    ) -> NewExperimentBuilder {
        NewExperimentBuilder::new(test_type, device_id, standard_code)
    }
}

/// Builder for `NewExperiment`.
#[derive(Debug)]
pub struct NewExperimentBuilder {
    inner: NewExperiment,
}

impl NewExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        test_type: TestType,
        device_id: impl Into<String>,
        standard_code: impl Into<String>,
    ) -> Self {
        Self {
            inner: NewExperiment {
                test_type,
                device_id: device_id.into(),
                operator_id: String::new(),
                standard_code: standard_code.into(),
                start_time: Utc::now(),
                notes: String::new(),
            },
        }
    }

    /// Set the operator.
    #[must_use]
    pub fn operator(mut self, operator_id: impl Into<String>) -> Self {
        self.inner.operator_id = operator_id.into();
        self
    }

    /// Set a custom start timestamp (clock-driven or testing).
    #[must_use]
    pub const fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.inner.start_time = start_time;
        self
    }

    /// Set notes.
    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.inner.notes = notes.into();
        self
    }

    /// Build the `NewExperiment`.
    #[must_use]
    pub fn build(self) -> NewExperiment {
        self.inner
    }
}
