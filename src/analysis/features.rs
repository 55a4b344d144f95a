//! Feature extraction for the outlier model.

use serde::{Deserialize, Serialize};

use crate::model::BehavioralAggregate;

pub const FEATURE_COUNT: usize = 12;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "event_rate_per_hour",
    "distinct_regions",
    "hour_spread",
    "otp_ratio",
    "failure_ratio",
    "mean_retries",
    "log_median_session_ms",
    "dominant_weekday",
    "burstiness",
    "device_switch_rate",
    "provider_diversity",
    "weekend_flag",
];

/// Fixed-order numeric view of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_COUNT])
    }

    /// Missing inputs map to 0.0 so every aggregate yields a full vector.
    pub fn from_aggregate(agg: &BehavioralAggregate) -> Self {
        let weekday = agg.dominant_weekday();
        Self([
            agg.event_rate_per_hour,
            agg.distinct_regions as f64,
            agg.hour_spread(),
            agg.otp_ratio().unwrap_or(0.0),
            agg.failure_share().unwrap_or(0.0),
            agg.mean_retries().unwrap_or(0.0),
            agg.median_session_ms().map(|ms| (1.0 + ms).log10()).unwrap_or(0.0),
            weekday.map(|d| d as f64 / 6.0).unwrap_or(0.0),
            agg.burstiness.unwrap_or(0.0),
            agg.device_switch_rate(),
            agg.provider_diversity(),
            if weekday.is_some_and(|d| d >= 5) { 1.0 } else { 0.0 },
        ])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, i: usize) -> f64 {
        self.0[i]
    }

    /// (name, value) pairs in feature order.
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        FEATURE_NAMES.iter().copied().zip(self.0.iter().copied()).collect()
    }
}
