//! RMS and DC-offset estimation over one batch of calibrated samples.
//!
//! Every function here is pure: the batch is borrowed immutably, nothing is
//! retained between calls and nothing is logged. Sample sums are accumulated
//! exactly in `i64`; everything derived from them is `f64`.

use serde::{Deserialize, Serialize};

use crate::error::EstimateError;

pub const DEFAULT_SMOOTHING: usize = 5;

/// How the DC reference is chosen before squared deviations are summed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimatorPolicy {
    /// Two passes: arithmetic mean, then deviations from it.
    #[default]
    MeanDeviation,
    /// Median of a sorted copy as the reference. Rejects outlier spikes.
    MedianOffset,
    /// Mean as the reference, RMS only between the first and last rising
    /// zero crossings. Assumes a periodic waveform.
    ZeroCrossing,
}

impl EstimatorPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeanDeviation => "MEAN_DEVIATION",
            Self::MedianOffset => "MEDIAN_OFFSET",
            Self::ZeroCrossing => "ZERO_CROSSING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MEAN_DEVIATION" | "MEAN" => Some(Self::MeanDeviation),
            "MEDIAN_OFFSET" | "MEDIAN" => Some(Self::MedianOffset),
            "ZERO_CROSSING" | "ZERO" => Some(Self::ZeroCrossing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RmsResult {
    #[serde(rename = "rmsMv")]
    pub rms_mv: f64,
    #[serde(rename = "meanMv")]
    pub mean_mv: f64,
}

impl RmsResult {
    pub const ZERO: Self = Self {
        rms_mv: 0.0,
        mean_mv: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmsEstimator {
    policy: EstimatorPolicy,
    smoothing: usize,
}

impl Default for RmsEstimator {
    fn default() -> Self {
        Self::new(EstimatorPolicy::default())
    }
}

impl RmsEstimator {
    pub fn new(policy: EstimatorPolicy) -> Self {
        Self {
            policy,
            smoothing: DEFAULT_SMOOTHING,
        }
    }

    /// Moving-average width used by [`EstimatorPolicy::ZeroCrossing`].
    pub fn with_smoothing(mut self, smoothing: usize) -> Self {
        self.smoothing = smoothing.max(1);
        self
    }

    pub fn policy(&self) -> EstimatorPolicy {
        self.policy
    }

    pub fn smoothing(&self) -> usize {
        self.smoothing
    }

    /// An empty batch yields [`RmsResult::ZERO`] under every policy.
    pub fn estimate(&self, samples: &[i32]) -> Result<RmsResult, EstimateError> {
        match self.policy {
            EstimatorPolicy::MeanDeviation => Ok(mean_deviation(samples)),
            EstimatorPolicy::MedianOffset => Ok(median_offset(samples)),
            EstimatorPolicy::ZeroCrossing => zero_crossing(samples, self.smoothing),
        }
    }
}

pub fn mean_deviation(samples: &[i32]) -> RmsResult {
    let mean_mv = mean(samples);
    RmsResult {
        rms_mv: rms_about(samples, mean_mv),
        mean_mv,
    }
}

/// Sorts a copy; the caller's ordering is left untouched.
pub fn median_offset(samples: &[i32]) -> RmsResult {
    if samples.is_empty() {
        return RmsResult::ZERO;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let median = f64::from(sorted[sorted.len() / 2]);

    RmsResult {
        rms_mv: rms_about(samples, median),
        mean_mv: mean(samples),
    }
}

/// RMS over whole cycles, bounded by the first and last rising crossings.
///
/// A rising crossing sits at `i + w` when the `w`-sample average over
/// `[i, i + w)` is strictly below the batch mean and the one over
/// `[i + w, i + 2w)` is strictly above it.
pub fn zero_crossing(samples: &[i32], smoothing: usize) -> Result<RmsResult, EstimateError> {
    if samples.is_empty() {
        return Ok(RmsResult::ZERO);
    }

    let window = smoothing.max(1);
    let prefix = prefix_sums(samples);
    let total = prefix[samples.len()];
    let count = samples.len();

    let Some(last_start) = count.checked_sub(2 * window) else {
        return Err(EstimateError::NoCrossingFound { samples: count });
    };
    let crossing = |i: usize| is_rising_crossing(&prefix, i, window, total, count);

    let Some(first) = (0..=last_start).find(|&i| crossing(i)) else {
        return Err(EstimateError::NoCrossingFound { samples: count });
    };
    let last = (first..=last_start)
        .rev()
        .find(|&i| crossing(i))
        .unwrap_or(first);

    let first = first + window;
    let last = last + window;
    if last <= first {
        return Err(EstimateError::IncompleteCycle {
            crossing: first,
            samples: count,
        });
    }

    let mean_mv = total as f64 / count as f64;
    Ok(RmsResult {
        rms_mv: rms_about(&samples[first..last], mean_mv),
        mean_mv,
    })
}

fn mean(samples: &[i32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: i64 = samples.iter().map(|&sample| i64::from(sample)).sum();
    sum as f64 / samples.len() as f64
}

fn rms_about(samples: &[i32], reference: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&sample| {
            let deviation = f64::from(sample) - reference;
            deviation * deviation
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt()
}

fn prefix_sums(samples: &[i32]) -> Vec<i64> {
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    let mut running = 0_i64;
    prefix.push(running);
    for &sample in samples {
        running += i64::from(sample);
        prefix.push(running);
    }
    prefix
}

/// Compares `sum(window) / width` against `total / count` without dividing.
fn window_sign(prefix: &[i64], start: usize, width: usize, total: i64, count: usize) -> i8 {
    let window_sum = i128::from(prefix[start + width] - prefix[start]);
    let lhs = window_sum * count as i128;
    let rhs = i128::from(total) * width as i128;
    match lhs.cmp(&rhs) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn is_rising_crossing(prefix: &[i64], i: usize, width: usize, total: i64, count: usize) -> bool {
    window_sign(prefix, i, width, total, count) < 0
        && window_sign(prefix, i + width, width, total, count) > 0
}
