//! Alert records, their lifecycle, and persistence.

pub mod actions;
pub mod lifecycle;
pub mod manager;
pub mod repository;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::features::FeatureVector;
use crate::context::ContextKey;
use crate::detect::rules::RuleId;
use crate::detect::{CompositeRiskScore, Severity};
use crate::model::{EntityType, ValidationError};

pub use manager::AlertManager;
pub use repository::AlertRepository;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: AlertStatus, to: AlertStatus },
    #[error("feedback already recorded for alert {0}")]
    FeedbackAlreadyRecorded(String),
    #[error("alert {0} is resolved; feedback is closed")]
    FeedbackOnResolved(String),
    #[error("analyst confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),
    #[error("alert {0} changed concurrently")]
    ConcurrentUpdateConflict(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn invalid(field: &'static str, value: &str) -> ValidationError {
    ValidationError::InvalidField {
        field,
        reason: format!("unknown value {:?}", value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    VelocityAttack,
    GeographicAnomaly,
    BiometricFailureSpike,
    OffHoursSpike,
    ServiceProviderAnomaly,
    BehavioralAnomaly,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::VelocityAttack => "VELOCITY_ATTACK",
            AlertType::GeographicAnomaly => "GEOGRAPHIC_ANOMALY",
            AlertType::BiometricFailureSpike => "BIOMETRIC_FAILURE_SPIKE",
            AlertType::OffHoursSpike => "OFF_HOURS_SPIKE",
            AlertType::ServiceProviderAnomaly => "SERVICE_PROVIDER_ANOMALY",
            AlertType::BehavioralAnomaly => "BEHAVIORAL_ANOMALY",
        }
    }

    /// First matching rule wins.
    pub fn classify(triggered: &[RuleId], entity_type: EntityType) -> Self {
        let has = |id| triggered.contains(&id);
        if has(RuleId::HighFrequency) {
            AlertType::VelocityAttack
        } else if has(RuleId::GeographicVelocity) {
            AlertType::GeographicAnomaly
        } else if has(RuleId::OtpFallbackAbuse) || has(RuleId::HighFailureRate) {
            AlertType::BiometricFailureSpike
        } else if has(RuleId::OffHoursActivity) {
            AlertType::OffHoursSpike
        } else if entity_type == EntityType::ServiceProvider {
            AlertType::ServiceProviderAnomaly
        } else {
            AlertType::BehavioralAnomaly
        }
    }
}

impl FromStr for AlertType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VELOCITY_ATTACK" => Ok(AlertType::VelocityAttack),
            "GEOGRAPHIC_ANOMALY" => Ok(AlertType::GeographicAnomaly),
            "BIOMETRIC_FAILURE_SPIKE" => Ok(AlertType::BiometricFailureSpike),
            "OFF_HOURS_SPIKE" => Ok(AlertType::OffHoursSpike),
            "SERVICE_PROVIDER_ANOMALY" => Ok(AlertType::ServiceProviderAnomaly),
            "BEHAVIORAL_ANOMALY" => Ok(AlertType::BehavioralAnomaly),
            _ => Err(invalid("alert_type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AlertStatus::Active),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            _ => Err(invalid("status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Feedback {
    FalsePositive,
    ConfirmedThreat,
    PartiallyRelevant,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Feedback::FalsePositive => "FALSE_POSITIVE",
            Feedback::ConfirmedThreat => "CONFIRMED_THREAT",
            Feedback::PartiallyRelevant => "PARTIALLY_RELEVANT",
        }
    }
}

impl FromStr for Feedback {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FALSE_POSITIVE" => Ok(Feedback::FalsePositive),
            "CONFIRMED_THREAT" => Ok(Feedback::ConfirmedThreat),
            "PARTIALLY_RELEVANT" => Ok(Feedback::PartiallyRelevant),
            _ => Err(invalid("feedback", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub alert_type: AlertType,
    pub title: String,
    pub description: String,
    pub score: CompositeRiskScore,
    pub region: Option<String>,
    pub context_key: Option<ContextKey>,
    pub status: AlertStatus,
    pub reason_codes: Vec<RuleId>,
    pub suggested_actions: Vec<String>,
    pub feedback: Option<Feedback>,
    pub analyst_confidence: Option<f64>,
    pub feedback_notes: Option<String>,
    pub feedback_by: Option<String>,
    pub acknowledged_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub feedback_at: Option<DateTime<Utc>>,
    pub active_until: DateTime<Utc>,
    pub evaluation_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
    pub version: u64,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// Analyst feedback payload.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackInput {
    pub feedback: Feedback,
    pub analyst_confidence: Option<f64>,
    pub notes: Option<String>,
    pub analyst: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub alert_type: Option<AlertType>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPage {
    pub alerts: Vec<Alert>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStatistics {
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub open_critical: u64,
    pub open_high: u64,
    pub feedback: BTreeMap<String, u64>,
    /// Alerts created per local day, oldest first, last 7 days.
    pub trend: Vec<DailyCount>,
}

/// What an evaluation did to the alert store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlertOutcome {
    Created { alert_id: String },
    Updated { alert_id: String, evaluation_count: u32 },
    BelowThreshold,
    SuppressedLearning,
}

impl AlertOutcome {
    pub fn alert_id(&self) -> Option<&str> {
        match self {
            AlertOutcome::Created { alert_id } | AlertOutcome::Updated { alert_id, .. } => Some(alert_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_precedence() {
        use RuleId::*;
        let dev = EntityType::Device;
        assert_eq!(
            AlertType::classify(&[GeographicVelocity, HighFrequency], dev),
            AlertType::VelocityAttack
        );
        assert_eq!(AlertType::classify(&[GeographicVelocity], dev), AlertType::GeographicAnomaly);
        assert_eq!(AlertType::classify(&[HighFailureRate], dev), AlertType::BiometricFailureSpike);
        assert_eq!(
            AlertType::classify(&[OffHoursActivity, OtpFallbackAbuse], dev),
            AlertType::BiometricFailureSpike
        );
        assert_eq!(AlertType::classify(&[OffHoursActivity], dev), AlertType::OffHoursSpike);
        assert_eq!(
            AlertType::classify(&[AbnormalRetries], EntityType::ServiceProvider),
            AlertType::ServiceProviderAnomaly
        );
        assert_eq!(AlertType::classify(&[], dev), AlertType::BehavioralAnomaly);
    }

    #[test]
    fn test_enum_strings_roundtrip() {
        for s in ["ACTIVE", "ACKNOWLEDGED", "RESOLVED"] {
            assert_eq!(s.parse::<AlertStatus>().unwrap().as_str(), s);
        }
        assert_eq!("false_positive".parse::<Feedback>().unwrap(), Feedback::FalsePositive);
        assert!("MAYBE".parse::<Feedback>().is_err());
    }

    #[test]
    fn test_page_limits() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(10_000, 5).limit, Page::MAX_LIMIT);
    }
}
