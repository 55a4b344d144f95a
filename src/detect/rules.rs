//! Fixed, weighted rule set evaluated against a behavioral aggregate.
//!
//! Each rule reads only the aggregate. A rule whose input is missing reports
//! INDETERMINATE and contributes nothing; it is never defaulted either way.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RuleThresholds;
use crate::model::BehavioralAggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleId {
    HighFrequency,
    GeographicVelocity,
    OtpFallbackAbuse,
    AbnormalRetries,
    OffHoursActivity,
    HighFailureRate,
    SessionDurationAnomaly,
}

impl RuleId {
    pub const ALL: [RuleId; 7] = [
        RuleId::HighFrequency,
        RuleId::GeographicVelocity,
        RuleId::OtpFallbackAbuse,
        RuleId::AbnormalRetries,
        RuleId::OffHoursActivity,
        RuleId::HighFailureRate,
        RuleId::SessionDurationAnomaly,
    ];

    pub fn weight(self) -> u32 {
        match self {
            RuleId::HighFrequency => 15,
            RuleId::GeographicVelocity => 18,
            RuleId::OtpFallbackAbuse => 12,
            RuleId::AbnormalRetries => 10,
            RuleId::OffHoursActivity => 15,
            RuleId::HighFailureRate => 12,
            RuleId::SessionDurationAnomaly => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::HighFrequency => "HIGH_FREQUENCY",
            RuleId::GeographicVelocity => "GEOGRAPHIC_VELOCITY",
            RuleId::OtpFallbackAbuse => "OTP_FALLBACK_ABUSE",
            RuleId::AbnormalRetries => "ABNORMAL_RETRIES",
            RuleId::OffHoursActivity => "OFF_HOURS_ACTIVITY",
            RuleId::HighFailureRate => "HIGH_FAILURE_RATE",
            RuleId::SessionDurationAnomaly => "SESSION_DURATION_ANOMALY",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Triggered,
    NotTriggered,
    Indeterminate,
}

/// Outcome of one rule. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule_id: RuleId,
    pub status: RuleStatus,
    pub triggered: bool,
    pub weight: u32,
    pub contribution: f64,
    pub observed: Option<f64>,
    pub explanation: String,
}

impl RuleResult {
    fn decided(rule_id: RuleId, triggered: bool, observed: f64, explanation: String) -> Self {
        Self {
            rule_id,
            status: if triggered {
                RuleStatus::Triggered
            } else {
                RuleStatus::NotTriggered
            },
            triggered,
            weight: rule_id.weight(),
            contribution: if triggered { rule_id.weight() as f64 } else { 0.0 },
            observed: Some(observed),
            explanation,
        }
    }

    fn indeterminate(rule_id: RuleId, missing: &str) -> Self {
        Self {
            rule_id,
            status: RuleStatus::Indeterminate,
            triggered: false,
            weight: rule_id.weight(),
            contribution: 0.0,
            observed: None,
            explanation: format!("no {} in window", missing),
        }
    }
}

/// Sum of triggered weights, capped at 100.
pub fn rule_score(results: &[RuleResult]) -> f64 {
    results.iter().map(|r| r.contribution).sum::<f64>().min(100.0)
}

pub fn triggered(results: &[RuleResult]) -> Vec<RuleId> {
    results.iter().filter(|r| r.triggered).map(|r| r.rule_id).collect()
}

pub struct RuleEvaluator {
    thresholds: RuleThresholds,
}

/// Thresholds after widening by a context's tolerance.
#[derive(Debug, Clone, Copy)]
struct Limits {
    rate: f64,
    regions: f64,
    otp_fallback_share: f64,
    retry_avg: f64,
    off_hours_share: f64,
    failure_share: f64,
    session_min_ms: f64,
    session_max_ms: f64,
}

impl Limits {
    fn widened(t: &RuleThresholds, tolerance: f64) -> Self {
        let k = tolerance.max(1.0);
        Self {
            rate: t.high_frequency_per_hour * k,
            regions: t.max_regions_per_hour as f64 * k,
            otp_fallback_share: (t.otp_fallback_share * k).min(1.0),
            retry_avg: t.retry_avg * k,
            off_hours_share: (t.off_hours_share * k).min(1.0),
            failure_share: (t.failure_share * k).min(1.0),
            session_min_ms: t.session_min_ms / k,
            session_max_ms: t.session_max_ms * k,
        }
    }
}

impl RuleEvaluator {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluate all rules at the configured thresholds, in `RuleId::ALL` order.
    pub fn evaluate(&self, agg: &BehavioralAggregate) -> Vec<RuleResult> {
        self.evaluate_with_tolerance(agg, 1.0)
    }

    /// Evaluate with every threshold widened by `tolerance` (the context
    /// baseline's equity tolerance, >= 1.0). Weights never change.
    pub fn evaluate_with_tolerance(&self, agg: &BehavioralAggregate, tolerance: f64) -> Vec<RuleResult> {
        let limits = Limits::widened(&self.thresholds, tolerance);
        RuleId::ALL.iter().map(|&id| evaluate_one(&limits, id, agg)).collect()
    }
}

fn evaluate_one(l: &Limits, id: RuleId, agg: &BehavioralAggregate) -> RuleResult {
    match id {
        RuleId::HighFrequency => {
            let rate = agg.event_rate_per_hour;
            let hit = rate > l.rate;
            RuleResult::decided(
                id,
                hit,
                rate,
                format!(
                    "{:.1} events in the busiest hour {} limit {:.1}",
                    rate,
                    if hit { "exceeds" } else { "within" },
                    l.rate
                ),
            )
        }
        RuleId::GeographicVelocity => {
            let peak = agg.peak_regions_per_hour;
            let hit = peak as f64 > l.regions;
            RuleResult::decided(
                id,
                hit,
                peak as f64,
                format!("{} distinct regions within one hour (limit {:.1})", peak, l.regions),
            )
        }
        RuleId::OtpFallbackAbuse => share_rule(id, agg.otp_fallback_share(), l.otp_fallback_share, "OTP fallback", "events"),
        RuleId::AbnormalRetries => match agg.mean_retries() {
            Some(avg) => {
                let hit = avg > l.retry_avg;
                RuleResult::decided(
                    id,
                    hit,
                    avg,
                    format!("average {:.2} retries per attempt (limit {:.2})", avg, l.retry_avg),
                )
            }
            None => RuleResult::indeterminate(id, "retry data"),
        },
        RuleId::OffHoursActivity => share_rule(id, agg.off_hours_share(), l.off_hours_share, "off-hours (23:00-05:59)", "events"),
        RuleId::HighFailureRate => share_rule(id, agg.failure_share(), l.failure_share, "failed", "events"),
        RuleId::SessionDurationAnomaly => match agg.median_session_ms() {
            Some(ms) => {
                let hit = ms < l.session_min_ms || ms > l.session_max_ms;
                RuleResult::decided(
                    id,
                    hit,
                    ms,
                    format!(
                        "median session {:.0} ms ({} {:.0}-{:.0} ms)",
                        ms,
                        if hit { "outside" } else { "inside" },
                        l.session_min_ms,
                        l.session_max_ms
                    ),
                )
            }
            None => RuleResult::indeterminate(id, "session durations"),
        },
    }
}

fn share_rule(id: RuleId, share: Option<f64>, limit: f64, what: &str, missing: &str) -> RuleResult {
    match share {
        Some(s) => {
            let hit = s > limit;
            RuleResult::decided(
                id,
                hit,
                s,
                format!("{:.0}% {} (limit {:.0}%)", s * 100.0, what, limit * 100.0),
            )
        }
        None => RuleResult::indeterminate(id, missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::aggregate::test_support::{event, ist, DEVICE};
    use crate::model::{AuthEvent, AuthStatus, EntityRef, TimeWindow};
    use chrono::Duration;

    fn evaluator() -> RuleEvaluator {
        RuleEvaluator::new(RuleThresholds::default())
    }

    fn one_hour(events: &[AuthEvent]) -> BehavioralAggregate {
        let start = ist(2024, 3, 4, 10, 0);
        let window = TimeWindow::new(start, start + Duration::hours(1)).unwrap();
        BehavioralAggregate::from_events(EntityRef::device(DEVICE).unwrap(), window, events)
    }

    fn spaced(n: usize) -> Vec<AuthEvent> {
        let start = ist(2024, 3, 4, 10, 0);
        (0..n)
            .map(|i| event(start + Duration::seconds((i as i64) * 3600 / n as i64)))
            .collect()
    }

    fn result(results: &[RuleResult], id: RuleId) -> &RuleResult {
        results.iter().find(|r| r.rule_id == id).unwrap()
    }

    #[test]
    fn test_weights() {
        let total: u32 = RuleId::ALL.iter().map(|r| r.weight()).sum();
        assert_eq!(total, 90);
    }

    #[test]
    fn test_high_frequency_only() {
        let results = evaluator().evaluate(&one_hour(&spaced(25)));
        assert_eq!(triggered(&results), vec![RuleId::HighFrequency]);
        assert_eq!(rule_score(&results), 15.0);
    }

    #[test]
    fn test_combined_attack_pattern() {
        let mut events = spaced(22);
        for (i, ev) in events.iter_mut().enumerate() {
            ev.state_code = ["MH", "KA", "DL"][i % 3].to_string();
            ev.retry_count = 3;
            if i < 8 {
                ev.is_fallback = true;
            }
        }
        let results = evaluator().evaluate(&one_hour(&events));
        let mut hit = triggered(&results);
        hit.sort();
        assert_eq!(
            hit,
            vec![
                RuleId::HighFrequency,
                RuleId::GeographicVelocity,
                RuleId::OtpFallbackAbuse,
                RuleId::AbnormalRetries
            ]
        );
        assert_eq!(rule_score(&results), 55.0);
    }

    #[test]
    fn test_tolerance_widens_thresholds() {
        let mut events = spaced(22);
        for (i, ev) in events.iter_mut().enumerate() {
            ev.state_code = ["MH", "KA", "DL"][i % 3].to_string();
            ev.retry_count = 3;
            if i < 8 {
                ev.is_fallback = true;
            }
        }
        let agg = one_hour(&events);
        assert_eq!(evaluator().evaluate_with_tolerance(&agg, 1.0), evaluator().evaluate(&agg));

        // Limits become 25/h, 2.5 regions, 37.5% fallback, 2.5 retries.
        let widened = evaluator().evaluate_with_tolerance(&agg, 1.25);
        assert_eq!(
            triggered(&widened),
            vec![RuleId::GeographicVelocity, RuleId::AbnormalRetries]
        );
        assert_eq!(rule_score(&widened), 28.0);

        // Below 1.0 is treated as 1.0.
        assert_eq!(rule_score(&evaluator().evaluate_with_tolerance(&agg, 0.5)), 55.0);
    }

    #[test]
    fn test_missing_session_data_is_indeterminate() {
        let mut events = spaced(3);
        for ev in &mut events {
            ev.session_duration_ms = None;
        }
        let results = evaluator().evaluate(&one_hour(&events));
        let r = result(&results, RuleId::SessionDurationAnomaly);
        assert_eq!(r.status, RuleStatus::Indeterminate);
        assert_eq!(r.contribution, 0.0);
        assert!(!r.triggered);
    }

    #[test]
    fn test_empty_aggregate_shares_are_indeterminate() {
        let results = evaluator().evaluate(&one_hour(&[]));
        for id in [
            RuleId::OtpFallbackAbuse,
            RuleId::AbnormalRetries,
            RuleId::OffHoursActivity,
            RuleId::HighFailureRate,
            RuleId::SessionDurationAnomaly,
        ] {
            assert_eq!(result(&results, id).status, RuleStatus::Indeterminate);
        }
        assert_eq!(rule_score(&results), 0.0);
    }

    #[test]
    fn test_failure_and_session_bounds() {
        let mut events = spaced(10);
        for ev in events.iter_mut().take(4) {
            ev.status = AuthStatus::Failure;
        }
        for ev in &mut events {
            ev.session_duration_ms = Some(120);
        }
        let results = evaluator().evaluate(&one_hour(&events));
        assert!(result(&results, RuleId::HighFailureRate).triggered);
        assert!(result(&results, RuleId::SessionDurationAnomaly).triggered);
        assert_eq!(rule_score(&results), 20.0);
    }

    #[test]
    fn test_score_is_capped_and_bounded() {
        let all: Vec<RuleResult> = RuleId::ALL
            .iter()
            .chain(RuleId::ALL.iter())
            .map(|&id| RuleResult::decided(id, true, 1.0, String::new()))
            .collect();
        assert_eq!(rule_score(&all), 100.0);
    }
}
