//! Fusion of rule and anomaly outputs into one explainable score.

use crate::analysis::scorer::AnomalyScore;
use crate::config::ScoringConfig;
use crate::detect::rules::{rule_score, RuleId, RuleResult};
use crate::detect::{ActionTier, CompositeRiskScore, Severity};

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct CompositeScorer {
    config: ScoringConfig,
}

impl CompositeScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Fuse rule results with an anomaly score. `None` means the scorer was
    /// unavailable and the result falls back to rules only.
    pub fn fuse(&self, rules: &[RuleResult], anomaly: Option<&AnomalyScore>) -> CompositeRiskScore {
        let rule = rule_score(rules);
        let (anomaly_100, composite, confidence, rule_only) = match anomaly {
            Some(a) => {
                let a100 = (a.score * 100.0).clamp(0.0, 100.0);
                let composite = self.config.rule_weight * rule + self.config.anomaly_weight * a100;
                (a100, composite, agreement(rule, a100), false)
            }
            None => {
                let confidence = agreement(rule, 0.0).min(self.config.fallback_confidence_ceiling);
                (0.0, rule, confidence, true)
            }
        };
        let composite = round2(composite.clamp(0.0, 100.0));
        let severity = Severity::from_score(composite);
        let action_tier = self.action_tier(severity, confidence, rules);
        CompositeRiskScore {
            rule_score: rule,
            anomaly_score: round2(anomaly_100),
            composite,
            severity,
            confidence: round2(confidence),
            action_tier,
            rule_only,
        }
    }

    fn action_tier(&self, severity: Severity, confidence: f64, rules: &[RuleResult]) -> ActionTier {
        let fired = |id: RuleId| rules.iter().any(|r| r.rule_id == id && r.triggered);
        match severity {
            Severity::Critical if confidence >= self.config.high_confidence => {
                if fired(RuleId::HighFrequency) {
                    ActionTier::DeviceBlacklist
                } else if fired(RuleId::GeographicVelocity) {
                    ActionTier::EscalateRegional
                } else {
                    ActionTier::ImmediateResponse
                }
            }
            Severity::Critical | Severity::High => ActionTier::EscalateRegional,
            Severity::Medium => ActionTier::EnhancedReview,
            Severity::Low => ActionTier::MonitorOnly,
        }
    }
}

/// 1 - |rule/100 - anomaly/100|, in [0, 1].
fn agreement(rule: f64, anomaly: f64) -> f64 {
    (1.0 - (rule / 100.0 - anomaly / 100.0).abs()).clamp(0.0, 1.0)
}
