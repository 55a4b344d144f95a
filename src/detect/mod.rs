//! Rule evaluation, score fusion and the analyze orchestration.

pub mod composite;
pub mod engine;
pub mod rules;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::{AlertError, AlertOutcome};
use crate::analysis::scorer::AnomalyScore;
use crate::baseline::LearningProgress;
use crate::context::ContextKey;
use crate::model::{EntityRef, TimeWindow, ValidationError};
use crate::source::SourceError;

pub use composite::CompositeScorer;
pub use engine::RiskEngine;
pub use rules::{RuleEvaluator, RuleId, RuleResult, RuleStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("behavioral data unavailable: {0}")]
    DataUnavailable(#[from] SourceError),
    #[error(transparent)]
    Alert(#[from] AlertError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Monotonic banding of a 0-100 composite.
    pub fn from_score(composite: f64) -> Self {
        if composite >= 80.0 {
            Severity::Critical
        } else if composite >= 60.0 {
            Severity::High
        } else if composite >= 30.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(ValidationError::InvalidField {
                field: "severity",
                reason: format!("unknown severity {:?}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTier {
    MonitorOnly,
    EnhancedReview,
    EscalateRegional,
    DeviceBlacklist,
    ImmediateResponse,
}

impl ActionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionTier::MonitorOnly => "MONITOR_ONLY",
            ActionTier::EnhancedReview => "ENHANCED_REVIEW",
            ActionTier::EscalateRegional => "ESCALATE_REGIONAL",
            ActionTier::DeviceBlacklist => "DEVICE_BLACKLIST",
            ActionTier::ImmediateResponse => "IMMEDIATE_RESPONSE",
        }
    }
}

impl std::str::FromStr for ActionTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MONITOR_ONLY" => Ok(ActionTier::MonitorOnly),
            "ENHANCED_REVIEW" => Ok(ActionTier::EnhancedReview),
            "ESCALATE_REGIONAL" => Ok(ActionTier::EscalateRegional),
            "DEVICE_BLACKLIST" => Ok(ActionTier::DeviceBlacklist),
            "IMMEDIATE_RESPONSE" => Ok(ActionTier::ImmediateResponse),
            other => Err(ValidationError::InvalidField {
                field: "action_tier",
                reason: format!("unknown action tier {:?}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRiskScore {
    pub rule_score: f64,
    pub anomaly_score: f64,
    pub composite: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub action_tier: ActionTier,
    pub rule_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScorerStatus {
    Available,
    Unavailable,
    TimedOut,
}

/// Full, explainable result of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub entity: EntityRef,
    pub window: TimeWindow,
    pub context_key: Option<ContextKey>,
    pub score: CompositeRiskScore,
    pub rules: Vec<RuleResult>,
    pub anomaly: Option<AnomalyScore>,
    pub scorer_status: ScorerStatus,
    pub baseline_deviation: f64,
    pub baseline_version: u64,
    /// Equity tolerance the rule thresholds were widened by.
    pub baseline_tolerance: f64,
    pub alert: AlertOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Scored(Box<RiskAssessment>),
    InsufficientBaseline(LearningProgress),
    NoActivity { entity: EntityRef, window: TimeWindow },
}

impl AnalysisOutcome {
    pub fn assessment(&self) -> Option<&RiskAssessment> {
        match self {
            AnalysisOutcome::Scored(a) => Some(a),
            _ => None,
        }
    }
}
