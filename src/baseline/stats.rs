//! Incremental moments and per-metric summary statistics.

use serde::{Deserialize, Serialize};

use crate::model::aggregate::percentile;

/// Running count / sum / sum-of-squares supporting removal, so a sliding
/// window can be maintained without rescanning.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMoments {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl RunningMoments {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    pub fn remove(&mut self, x: f64) {
        if self.count == 0 {
            return;
        }
        self.count -= 1;
        if self.count == 0 {
            // Reset instead of subtracting to shed accumulated rounding error.
            *self = Self::default();
            return;
        }
        self.sum -= x;
        self.sum_sq -= x * x;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Population variance, clamped at zero.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        (self.sum_sq / n - self.mean().powi(2)).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Published summary for one metric of one baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p95: f64,
}

impl MetricStats {
    /// Moments come from the running sums; percentiles from the raw values.
    pub fn from_moments(moments: &RunningMoments, values: &mut [f64]) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        Self {
            count: moments.count(),
            mean: moments.mean(),
            std_dev: moments.std_dev(),
            p50: percentile(values, 0.5),
            p95: percentile(values, 0.95),
        }
    }

    /// Z-score of `value` against this metric. A constant baseline maps any
    /// deviation to infinity and an exact match to zero.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std_dev <= f64::EPSILON {
            if (value - self.mean).abs() > f64::EPSILON {
                return f64::INFINITY;
            }
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }
}
