//! Error types for pvrsd-bench
//!
//! Every error names the offending input so an operator can act on it
//! without reading the source.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// pvrsd-bench error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input row, unusable batch, or missing/invalid standard parameter
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown standard code or experiment id
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("standard", "experiment")
        kind: &'static str,
        /// The identifier that did not resolve
        id: String,
    },

    /// State machine misuse (fed after a terminal state, out-of-order samples)
    #[error("Protocol violation: {0}\nThe experiment is cancelled.")]
    ProtocolViolation(String),

    /// Failure reported by the persistence collaborator, propagated unchanged
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an unknown standard code.
    pub fn standard_not_found(code: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "standard",
            id: code.into(),
        }
    }

    /// Shorthand for an unknown experiment id.
    pub fn experiment_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: "experiment",
            id: id.to_string(),
        }
    }
}

/// Category of a non-blocking anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Supplied power disagrees with `current × voltage`
    PowerMismatch,
    /// Input row skipped during normalization
    RowSkipped,
    /// Device did not de-energize within the ramp-down bound
    SlowRampDown,
    /// Late sample dropped (orphan buffer full or experiment finished)
    LateSampleDropped,
    /// Measured condition drifted from what the phase expects
    ConditionDrift,
    /// Value flagged as an outlier within its channel
    Anomaly,
}

/// A tolerance warning: recorded and logged, never blocks progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceWarning {
    /// Warning category
    pub kind: WarningKind,
    /// Human-readable detail
    pub message: String,
    /// Timestamp of the sample or event that triggered it, if any
    pub at: Option<DateTime<Utc>>,
}

impl ToleranceWarning {
    /// Create a warning and emit it on the `tracing` warn level.
    pub fn new(kind: WarningKind, message: impl Into<String>, at: Option<DateTime<Utc>>) -> Self {
        let message = message.into();
        tracing::warn!(?kind, at = ?at, "{message}");
        Self { kind, message, at }
    }
}

impl fmt::Display for ToleranceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at {
            Some(at) => write!(f, "{:?} at {}: {}", self.kind, at.to_rfc3339(), self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_the_id() {
        let err = Error::standard_not_found("IEC-X");
        assert_eq!(err.to_string(), "standard not found: IEC-X");

        let err = Error::experiment_not_found(42);
        assert_eq!(err.to_string(), "experiment not found: 42");
    }

    #[test]
    fn test_warning_display() {
        let w = ToleranceWarning::new(WarningKind::RowSkipped, "row 3: voltage not numeric", None);
        assert!(w.to_string().contains("row 3"));
    }
}
