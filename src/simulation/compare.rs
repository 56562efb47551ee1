//! Deviation between a synthetic and a reference trace
//!
//! The synthetic trace is resampled onto the reference timestamps by linear
//! interpolation (exact at shared timestamps). Reference points outside the
//! synthetic span are excluded from every metric and counted.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::sample::{sort_stable, Channel, Sample};
use crate::{Error, Result};

/// Widest lag searched, in reference grid steps.
const MAX_LAG_STEPS: i64 = 50;

/// Error statistics for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelDeviation {
    /// Mean of |synthetic − reference|
    pub mean_abs_error: f64,
    /// Largest |synthetic − reference|
    pub max_abs_error: f64,
    /// Root mean square error
    pub rmse: f64,
    /// Σ|error| / Σ|reference| × 100; `None` when the reference is all zero
    /// but the synthetic trace is not
    pub relative_error_pct: Option<f64>,
}

/// Deviation of a reference trace from a synthetic one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationMetrics {
    /// Voltage mean absolute error (V)
    pub mean_abs_error: f64,
    /// Voltage maximum absolute error (V)
    pub max_abs_error: f64,
    /// Lag (s) minimizing voltage mean absolute error; positive when the
    /// reference runs behind the synthetic trace
    pub time_offset_s: f64,
    /// Per-channel statistics
    pub per_channel: BTreeMap<Channel, ChannelDeviation>,
    /// Reference points that entered the metrics
    pub compared_points: usize,
}

/// Result of [`compare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Deviation metrics
    pub metrics: DeviationMetrics,
    /// Reference points outside the synthetic span
    pub excluded_points: usize,
}

/// Synthetic trace as seconds-since-origin plus channel columns.
struct Resampler {
    origin: DateTime<Utc>,
    times: Vec<f64>,
    values: Vec<[f64; 3]>,
}

impl Resampler {
    fn new(trace: &[Sample]) -> Option<Self> {
        let origin = trace.first()?.timestamp;
        Some(Self {
            origin,
            times: trace.iter().map(|s| offset(origin, s.timestamp)).collect(),
            values: trace.iter().map(columns).collect(),
        })
    }

    /// Interpolated channels at `t`, `None` outside the span.
    fn at(&self, t: f64) -> Option<[f64; 3]> {
        let first = *self.times.first()?;
        let last = *self.times.last()?;
        if t < first || t > last {
            return None;
        }
        let idx = self.times.partition_point(|&x| x < t);
        if idx == self.times.len() {
            return self.values.last().copied();
        }
        if self.times[idx] == t || idx == 0 {
            return Some(self.values[idx]);
        }
        let (t0, t1) = (self.times[idx - 1], self.times[idx]);
        let (a, b) = (self.values[idx - 1], self.values[idx]);
        let frac = (t - t0) / (t1 - t0);
        Some(std::array::from_fn(|i| a[i] + (b[i] - a[i]) * frac))
    }
}

#[allow(clippy::cast_precision_loss)]
fn offset(origin: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    let delta = at - origin;
    delta
        .num_microseconds()
        .map_or_else(|| delta.num_milliseconds() as f64 / 1e3, |us| us as f64 / 1e6)
}

fn columns(sample: &Sample) -> [f64; 3] {
    Channel::ALL.map(|c| c.value(sample))
}

const fn slot(channel: Channel) -> usize {
    match channel {
        Channel::Current => 0,
        Channel::Voltage => 1,
        Channel::Power => 2,
    }
}

fn ordered(trace: &[Sample]) -> Cow<'_, [Sample]> {
    if trace.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        Cow::Borrowed(trace)
    } else {
        let mut owned = trace.to_vec();
        sort_stable(&mut owned);
        Cow::Owned(owned)
    }
}

/// Compare `reference` against `synthetic`.
///
/// Neither trace needs to be sorted. Produces metrics only, never a
/// verdict.
///
/// # Errors
///
/// Returns a validation error if `synthetic` is empty or no reference point
/// falls inside its span.
pub fn compare(synthetic: &[Sample], reference: &[Sample]) -> Result<Comparison> {
    let synthetic = ordered(synthetic);
    let reference = ordered(reference);
    let resampler = Resampler::new(&synthetic)
        .ok_or_else(|| Error::Validation("synthetic trace is empty".into()))?;

    let ref_times: Vec<f64> = reference
        .iter()
        .map(|s| offset(resampler.origin, s.timestamp))
        .collect();

    let mut pairs = Vec::with_capacity(reference.len());
    for (sample, &t) in reference.iter().zip(&ref_times) {
        if let Some(resampled) = resampler.at(t) {
            pairs.push((resampled, columns(sample)));
        }
    }
    if pairs.is_empty() {
        return Err(Error::Validation(format!(
            "none of {} reference points lies within the synthetic span",
            reference.len()
        )));
    }
    let excluded_points = reference.len() - pairs.len();

    let per_channel = channel_deviations(&pairs);
    let voltage = per_channel[&Channel::Voltage];
    let time_offset_s = best_lag(&resampler, &reference, &ref_times, pairs.len());

    Ok(Comparison {
        metrics: DeviationMetrics {
            mean_abs_error: voltage.mean_abs_error,
            max_abs_error: voltage.max_abs_error,
            time_offset_s,
            per_channel,
            compared_points: pairs.len(),
        },
        excluded_points,
    })
}

type Pair = ([f64; 3], [f64; 3]);

#[cfg(feature = "rayon")]
fn channel_deviations(pairs: &[Pair]) -> BTreeMap<Channel, ChannelDeviation> {
    Channel::ALL
        .par_iter()
        .map(|&c| (c, deviation(slot(c), pairs)))
        .collect()
}

#[cfg(not(feature = "rayon"))]
fn channel_deviations(pairs: &[Pair]) -> BTreeMap<Channel, ChannelDeviation> {
    Channel::ALL
        .iter()
        .map(|&c| (c, deviation(slot(c), pairs)))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn deviation(i: usize, pairs: &[Pair]) -> ChannelDeviation {
    let n = pairs.len() as f64;
    let (mut sum, mut sum_sq, mut max, mut magnitude) = (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
    for (synthetic, reference) in pairs {
        let e = (synthetic[i] - reference[i]).abs();
        sum += e;
        sum_sq += e * e;
        max = max.max(e);
        magnitude += reference[i].abs();
    }
    let relative_error_pct = if magnitude > 0.0 {
        Some(sum / magnitude * 100.0)
    } else if sum == 0.0 {
        Some(0.0)
    } else {
        None
    };
    ChannelDeviation {
        mean_abs_error: sum / n,
        max_abs_error: max,
        rmse: (sum_sq / n).sqrt(),
        relative_error_pct,
    }
}

/// Median positive spacing of the reference grid.
fn grid_step(times: &[f64]) -> Option<f64> {
    let mut steps: Vec<f64> = times
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > 0.0)
        .collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_by(f64::total_cmp);
    Some(steps[steps.len() / 2])
}

/// Candidate lags in search order: 0, +1, −1, +2, −2, …
fn lag_candidates(max_steps: i64) -> Vec<i64> {
    std::iter::once(0)
        .chain((1..=max_steps).flat_map(|k| [k, -k]))
        .collect()
}

/// Voltage mean absolute error with the reference shifted back by `lag`,
/// `None` when fewer than half of the aligned points overlap.
#[allow(clippy::cast_precision_loss)]
fn lagged_error(
    resampler: &Resampler,
    reference: &[Sample],
    ref_times: &[f64],
    lag: f64,
    aligned: usize,
) -> Option<f64> {
    let voltage = slot(Channel::Voltage);
    let (mut sum, mut count) = (0.0, 0_usize);
    for (sample, &t) in reference.iter().zip(ref_times) {
        if let Some(resampled) = resampler.at(t - lag) {
            sum += (resampled[voltage] - sample.voltage).abs();
            count += 1;
        }
    }
    (count > 0 && count * 2 >= aligned).then(|| sum / count as f64)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn best_lag(resampler: &Resampler, reference: &[Sample], ref_times: &[f64], aligned: usize) -> f64 {
    let Some(step) = grid_step(ref_times) else {
        return 0.0;
    };
    let max_steps = (reference.len() as i64 / 4).min(MAX_LAG_STEPS);
    let candidates = lag_candidates(max_steps);

    let score = |&k: &i64| {
        let lag = k as f64 * step;
        (lag, lagged_error(resampler, reference, ref_times, lag, aligned))
    };
    #[cfg(feature = "rayon")]
    let scored: Vec<(f64, Option<f64>)> = candidates.par_iter().map(score).collect();
    #[cfg(not(feature = "rayon"))]
    let scored: Vec<(f64, Option<f64>)> = candidates.iter().map(score).collect();

    // Strict improvement only, so ties keep the smaller magnitude.
    let mut best: Option<(f64, f64)> = None;
    for (lag, error) in scored {
        if let Some(error) = error {
            if best.map_or(true, |(_, e)| error < e) {
                best = Some((lag, error));
            }
        }
    }
    best.map_or(0.0, |(lag, _)| lag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn wave(len: i64, step_ms: i64, shift_ms: i64) -> Vec<Sample> {
        (0..len)
            .map(|k| {
                let x = (k * step_ms) as f64 / 1000.0;
                let v = 500.0 + 100.0 * (x * 0.7).sin();
                Sample::new(t(k * step_ms + shift_ms), 2.0 + (x * 0.3).cos(), v)
            })
            .collect()
    }

    #[test]
    fn test_identical_traces_have_zero_deviation() {
        let trace = wave(40, 100, 0);
        let cmp = compare(&trace, &trace).unwrap();
        assert_eq!(cmp.excluded_points, 0);
        assert_eq!(cmp.metrics.compared_points, 40);
        assert!(cmp.metrics.mean_abs_error.abs() < f64::EPSILON);
        assert!(cmp.metrics.max_abs_error.abs() < f64::EPSILON);
        assert!(cmp.metrics.time_offset_s.abs() < f64::EPSILON);
        for dev in cmp.metrics.per_channel.values() {
            assert!(dev.rmse.abs() < f64::EPSILON);
            assert_eq!(dev.relative_error_pct, Some(0.0));
        }
        assert_eq!(cmp.metrics.per_channel.len(), 3);
    }

    #[test]
    fn test_interpolates_between_nodes() {
        let synthetic = vec![Sample::new(t(0), 0.0, 0.0), Sample::new(t(1000), 2.0, 100.0)];
        let reference = vec![Sample::new(t(250), 0.5, 30.0)];
        let cmp = compare(&synthetic, &reference).unwrap();
        // resampled voltage 25 V
        assert!((cmp.metrics.mean_abs_error - 5.0).abs() < 1e-9);
        let current = cmp.metrics.per_channel[&Channel::Current];
        assert!(current.mean_abs_error.abs() < 1e-9);
    }

    #[test]
    fn test_points_outside_span_are_excluded() {
        let synthetic = wave(10, 100, 0);
        let mut reference = wave(10, 100, 0);
        reference.push(Sample::new(t(-500), 1.0, 1.0));
        reference.push(Sample::new(t(5000), 1.0, 1.0));
        let cmp = compare(&synthetic, &reference).unwrap();
        assert_eq!(cmp.excluded_points, 2);
        assert_eq!(cmp.metrics.compared_points, 10);
        assert!(cmp.metrics.max_abs_error.abs() < f64::EPSILON);
    }

    #[test]
    fn test_recovers_time_offset() {
        let synthetic = wave(200, 100, 0);
        // the same waveform arriving 300 ms late
        let reference: Vec<Sample> = wave(150, 100, 300);
        let cmp = compare(&synthetic, &reference).unwrap();
        assert!((cmp.metrics.time_offset_s - 0.3).abs() < 1e-9);
        assert!(cmp.metrics.mean_abs_error > 0.0);
    }

    #[test]
    fn test_no_overlap_is_rejected() {
        let synthetic = wave(5, 100, 0);
        let reference = wave(5, 100, 10_000);
        assert!(matches!(
            compare(&synthetic, &reference),
            Err(Error::Validation(_))
        ));
        assert!(compare(&[], &synthetic).is_err());
    }

    #[test]
    fn test_zero_reference_relative_error() {
        let synthetic = vec![Sample::new(t(0), 1.0, 0.0), Sample::new(t(100), 1.0, 0.0)];
        let reference = vec![Sample::new(t(0), 0.0, 0.0), Sample::new(t(100), 0.0, 0.0)];
        let cmp = compare(&synthetic, &reference).unwrap();
        assert_eq!(cmp.metrics.per_channel[&Channel::Current].relative_error_pct, None);
        assert_eq!(cmp.metrics.per_channel[&Channel::Voltage].relative_error_pct, Some(0.0));
    }
}
