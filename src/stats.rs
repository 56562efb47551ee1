//! Descriptive statistics over measurement channels
//!
//! [`RunningStats`] accumulates in O(1) memory while a phase is live
//! (Welford's online variance). [`anomalies`] flags outliers in a finished
//! channel with the z-score or IQR rule.

use serde::{Deserialize, Serialize};

/// Online mean/variance/min/max accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    first: f64,
    last: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    /// Empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            first: f64::NAN,
            last: f64::NAN,
        }
    }

    /// Add one observation; non-finite values are ignored.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.count == 0 {
            self.first = value;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
    }

    /// Fold another accumulator into this one (Chan's parallel update).
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let (n_a, n_b) = (self.count as f64, other.count as f64);
        let total = n_a + n_b;
        let delta = other.mean - self.mean;
        self.mean += delta * n_b / total;
        self.m2 += other.m2 + delta * delta * n_a * n_b / total;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.last = other.last;
    }

    /// Number of observations.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Whether nothing was observed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Mean, `None` when empty.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample standard deviation, `None` with fewer than two observations.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn std_dev(&self) -> Option<f64> {
        (self.count > 1).then(|| (self.m2 / (self.count - 1) as f64).sqrt())
    }

    /// Minimum, `None` when empty.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Maximum, `None` when empty.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// First observation, `None` when empty.
    #[must_use]
    pub fn first(&self) -> Option<f64> {
        (self.count > 0).then_some(self.first)
    }

    /// Most recent observation, `None` when empty.
    #[must_use]
    pub fn last(&self) -> Option<f64> {
        (self.count > 0).then_some(self.last)
    }
}

/// Rule used by [`anomalies`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnomalyRule {
    /// `|value - mean| > k × std-dev`
    ZScore(f64),
    /// Outside `[Q1 - k × IQR, Q3 + k × IQR]`
    Iqr(f64),
}

impl Default for AnomalyRule {
    fn default() -> Self {
        Self::ZScore(3.0)
    }
}

/// Indices of anomalous values. Non-finite values are always reported.
#[must_use]
pub fn anomalies(values: &[f64], rule: AnomalyRule) -> Vec<usize> {
    let (low, high) = match rule {
        AnomalyRule::ZScore(k) => {
            let mut stats = RunningStats::new();
            values.iter().for_each(|v| stats.push(*v));
            match (stats.mean(), stats.std_dev()) {
                (Some(mean), Some(sd)) if sd > 0.0 => (k.mul_add(-sd, mean), k.mul_add(sd, mean)),
                _ => (f64::NEG_INFINITY, f64::INFINITY),
            }
        }
        AnomalyRule::Iqr(k) => {
            let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                (f64::NEG_INFINITY, f64::INFINITY)
            } else {
                finite.sort_by(f64::total_cmp);
                let q1 = quantile(&finite, 0.25);
                let q3 = quantile(&finite, 0.75);
                let iqr = q3 - q1;
                (k.mul_add(-iqr, q1), k.mul_add(iqr, q3))
            }
        }
    };
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_finite() || **v < low || **v > high)
        .map(|(i, _)| i)
        .collect()
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    (sorted[hi] - sorted[lo]).mul_add(pos - lo as f64, sorted[lo])
}
