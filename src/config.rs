//! Engine configuration
//!
//! Knobs that are properties of the test bench rather than of a standard.
//! Standard-specific limits live in [`crate::standard::Standard`] parameters.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default clock-jitter allowance for out-of-order samples (milliseconds)
pub const DEFAULT_JITTER_MS: i64 = 50;

/// Largest accepted jitter allowance (one minute)
pub const MAX_JITTER_MS: i64 = 60_000;

/// Default per-experiment bound on samples buffered for an id that is not live
pub const DEFAULT_ORPHAN_BUFFER_LIMIT: usize = 1024;

/// Default relative tolerance between supplied and derived power (5 %)
pub const DEFAULT_POWER_TOLERANCE: f64 = 0.05;

/// Default number of points kept when persisting simulated traces
pub const DEFAULT_DOWNSAMPLE_POINTS: usize = 500;

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Samples earlier than the last accepted one by more than this are a protocol violation.
    pub jitter_ms: i64,
    /// Samples buffered per unknown experiment id before dropping.
    pub orphan_buffer_limit: usize,
    /// Relative tolerance for `power` vs `current × voltage`.
    pub power_tolerance: f64,
    /// Point budget for traces attached to simulation summaries.
    pub downsample_points: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jitter_ms: DEFAULT_JITTER_MS,
            orphan_buffer_limit: DEFAULT_ORPHAN_BUFFER_LIMIT,
            power_tolerance: DEFAULT_POWER_TOLERANCE,
            downsample_points: DEFAULT_DOWNSAMPLE_POINTS,
        }
    }
}

impl EngineConfig {
    /// Create a builder starting from defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid JSON or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read overrides from `PVRSD_JITTER_MS`, `PVRSD_ORPHAN_BUFFER_LIMIT`,
    /// `PVRSD_POWER_TOLERANCE` and `PVRSD_DOWNSAMPLE_POINTS`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
            raw.map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("{key}={value} is not a valid value")))
            })
            .transpose()
        }

        let mut config = Self::default();
        if let Some(v) = parse("PVRSD_JITTER_MS", lookup("PVRSD_JITTER_MS"))? {
            config.jitter_ms = v;
        }
        if let Some(v) = parse("PVRSD_ORPHAN_BUFFER_LIMIT", lookup("PVRSD_ORPHAN_BUFFER_LIMIT"))? {
            config.orphan_buffer_limit = v;
        }
        if let Some(v) = parse("PVRSD_POWER_TOLERANCE", lookup("PVRSD_POWER_TOLERANCE"))? {
            config.power_tolerance = v;
        }
        if let Some(v) = parse("PVRSD_DOWNSAMPLE_POINTS", lookup("PVRSD_DOWNSAMPLE_POINTS"))? {
            config.downsample_points = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns error on jitter outside `0..=MAX_JITTER_MS`, non-finite or
    /// negative tolerance, or a downsample budget below 2.
    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_JITTER_MS).contains(&self.jitter_ms) {
            return Err(Error::Config(format!(
                "jitter_ms must be between 0 and {MAX_JITTER_MS}, got {}",
                self.jitter_ms
            )));
        }
        if !self.power_tolerance.is_finite() || self.power_tolerance < 0.0 {
            return Err(Error::Config(format!(
                "power_tolerance must be a finite non-negative fraction, got {}",
                self.power_tolerance
            )));
        }
        if self.downsample_points < 2 {
            return Err(Error::Config(
                "downsample_points must keep at least the first and last point".to_string(),
            ));
        }
        Ok(())
    }

    /// Jitter allowance as a `chrono` duration.
    #[must_use]
    pub fn jitter(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.jitter_ms)
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the out-of-order jitter allowance in milliseconds.
    #[must_use]
    pub const fn jitter_ms(mut self, jitter_ms: i64) -> Self {
        self.config.jitter_ms = jitter_ms;
        self
    }

    /// Set the per-id orphan buffer bound.
    #[must_use]
    pub const fn orphan_buffer_limit(mut self, limit: usize) -> Self {
        self.config.orphan_buffer_limit = limit;
        self
    }

    /// Set the power tolerance fraction.
    #[must_use]
    pub const fn power_tolerance(mut self, tolerance: f64) -> Self {
        self.config.power_tolerance = tolerance;
        self
    }

    /// Set the downsample point budget.
    #[must_use]
    pub const fn downsample_points(mut self, points: usize) -> Self {
        self.config.downsample_points = points;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
