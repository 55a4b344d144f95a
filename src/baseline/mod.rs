//! Context-specific behavioral baselines and the system learning mode.

pub mod learner;
pub mod mode;
pub mod stats;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextKey;
use crate::model::BehavioralAggregate;

pub use mode::{ModeStatus, ModeTracker, SystemMode};
pub use stats::{MetricStats, RunningMoments};
pub use store::BaselineStore;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("no baseline tracked for context {0}")]
    UnknownContext(String),
    #[error("tolerance factor must be >= 1.0, got {0}")]
    InvalidFactor(f64),
}

/// One entity-hour observation folded into a context baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSample {
    pub observed_at: DateTime<Utc>,
    pub auth_rate: f64,
    pub failure_rate: f64,
    pub retry_avg: f64,
    pub session_duration_ms: Option<f64>,
    pub otp_ratio: f64,
}

impl BaselineSample {
    /// `None` for an aggregate without events.
    pub fn from_aggregate(aggregate: &BehavioralAggregate) -> Option<Self> {
        if aggregate.event_count == 0 {
            return None;
        }
        Some(Self {
            observed_at: aggregate.window.start,
            auth_rate: aggregate.event_rate_per_hour,
            failure_rate: aggregate.failure_share().unwrap_or(0.0),
            retry_avg: aggregate.mean_retries().unwrap_or(0.0),
            session_duration_ms: aggregate.median_session_ms(),
            otp_ratio: aggregate.otp_ratio().unwrap_or(0.0),
        })
    }
}

/// Metrics tracked per baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AuthRate,
    FailureRate,
    RetryAvg,
    SessionDurationMs,
    OtpRatio,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::AuthRate,
        Metric::FailureRate,
        Metric::RetryAvg,
        Metric::SessionDurationMs,
        Metric::OtpRatio,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn sample_value(self, s: &BaselineSample) -> Option<f64> {
        match self {
            Metric::AuthRate => Some(s.auth_rate),
            Metric::FailureRate => Some(s.failure_rate),
            Metric::RetryAvg => Some(s.retry_avg),
            Metric::SessionDurationMs => s.session_duration_ms,
            Metric::OtpRatio => Some(s.otp_ratio),
        }
    }

    /// The value of this metric observed in an aggregate, if it has one.
    pub fn observed(self, a: &BehavioralAggregate) -> Option<f64> {
        match self {
            Metric::AuthRate => (a.event_count > 0).then_some(a.event_rate_per_hour),
            Metric::FailureRate => a.failure_share(),
            Metric::RetryAvg => a.mean_retries(),
            Metric::SessionDurationMs => a.median_session_ms(),
            Metric::OtpRatio => a.otp_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineState {
    Learning,
    Ready,
}

/// Immutable published baseline for one context key.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub context_key: ContextKey,
    pub sample_count: u64,
    pub metrics: BTreeMap<Metric, MetricStats>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Oldest sample still inside the window.
    pub oldest_sample: Option<DateTime<Utc>>,
    pub learning_started: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
    pub state: BaselineState,
    /// Deviation tolerance; starts at 1.0 and only the equity guardrail widens it.
    pub tolerance: f64,
}

/// How far a context is from READY.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningProgress {
    pub context_key: Option<ContextKey>,
    pub sample_count: u64,
    pub required_samples: u64,
    pub age_hours: f64,
    pub required_age_hours: f64,
    /// min(age fraction, sample fraction), in [0, 1].
    pub completion: f64,
}

impl LearningProgress {
    pub fn new(
        context_key: Option<ContextKey>,
        sample_count: u64,
        required_samples: u64,
        age_hours: f64,
        required_age_hours: f64,
    ) -> Self {
        let sample_frac = if required_samples == 0 {
            1.0
        } else {
            sample_count as f64 / required_samples as f64
        };
        let age_frac = if required_age_hours <= 0.0 {
            1.0
        } else {
            age_hours / required_age_hours
        };
        Self {
            context_key,
            sample_count,
            required_samples,
            age_hours,
            required_age_hours,
            completion: sample_frac.min(age_frac).clamp(0.0, 1.0),
        }
    }
}

/// Result of a baseline read.
#[derive(Debug, Clone)]
pub enum BaselineLookup {
    Ready(Arc<Baseline>),
    NotReady(LearningProgress),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_min_of_fractions() {
        let p = LearningProgress::new(None, 50, 100, 24.0 * 7.0, 24.0 * 14.0);
        assert!((p.completion - 0.5).abs() < 1e-9);
        let p = LearningProgress::new(None, 100, 100, 24.0, 24.0 * 14.0);
        assert!((p.completion - 1.0 / 14.0).abs() < 1e-9);
        let p = LearningProgress::new(None, 500, 100, 24.0 * 30.0, 24.0 * 14.0);
        assert_eq!(p.completion, 1.0);
    }

    #[test]
    fn test_metric_indices_are_dense() {
        for (i, m) in Metric::ALL.iter().enumerate() {
            assert_eq!(m.index(), i);
        }
    }
}
