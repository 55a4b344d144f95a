//! System-wide learning mode.
//!
//! The system starts in BASELINE_LEARNING and moves to ACTIVE_MONITORING once
//! every tracked context is READY. The move is one-way; only an audited
//! operator reset returns the system to learning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::store::BaselineStore;
use crate::audit::{AuditEntry, AuditEventType, AuditLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    BaselineLearning,
    ActiveMonitoring,
}

impl SystemMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::BaselineLearning => "BASELINE_LEARNING",
            SystemMode::ActiveMonitoring => "ACTIVE_MONITORING",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: SystemMode,
    /// Minimum completion across tracked contexts, 0-100.
    pub completion_percentage: f64,
    pub contexts_ready: usize,
    pub contexts_tracked: usize,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("a reset requires a non-empty justification")]
    MissingJustification,
    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

struct ModeInner {
    mode: SystemMode,
    activated_at: Option<DateTime<Utc>>,
}

pub struct ModeTracker {
    store: Arc<BaselineStore>,
    audit: Arc<AuditLog>,
    inner: RwLock<ModeInner>,
}

impl ModeTracker {
    pub fn new(store: Arc<BaselineStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            audit,
            inner: RwLock::new(ModeInner {
                mode: SystemMode::BaselineLearning,
                activated_at: None,
            }),
        }
    }

    /// Mode without re-evaluating readiness.
    pub fn current(&self) -> SystemMode {
        self.inner.read().mode
    }

    /// Evaluate readiness at `now`, performing the LEARNING -> ACTIVE
    /// transition when every tracked context is READY.
    pub async fn status(&self, now: DateTime<Utc>) -> ModeStatus {
        let progress = self.store.progress_all(now);
        let tracked = progress.len();
        let ready = progress.iter().filter(|p| p.completion >= 1.0).count();
        let completion = if tracked == 0 {
            0.0
        } else {
            progress
                .iter()
                .map(|p| p.completion)
                .fold(f64::INFINITY, f64::min)
        };

        let transitioned = {
            let mut inner = self.inner.write();
            if inner.mode == SystemMode::BaselineLearning && tracked > 0 && ready == tracked {
                inner.mode = SystemMode::ActiveMonitoring;
                inner.activated_at = Some(now);
                true
            } else {
                false
            }
        };

        if transitioned {
            info!(contexts = tracked, "all contexts ready, entering ACTIVE_MONITORING");
            let entry = AuditEntry::new(AuditEventType::ModeTransition, "system")
                .with_transition(
                    SystemMode::BaselineLearning.as_str(),
                    SystemMode::ActiveMonitoring.as_str(),
                )
                .with_params(serde_json::json!({ "contexts_ready": ready }));
            if let Err(e) = self.audit.log(entry).await {
                warn!(error = %e, "failed to audit mode transition");
            }
        }

        let inner = self.inner.read();
        ModeStatus {
            mode: inner.mode,
            completion_percentage: match inner.mode {
                SystemMode::ActiveMonitoring => 100.0,
                SystemMode::BaselineLearning => (completion * 100.0).clamp(0.0, 100.0),
            },
            contexts_ready: ready,
            contexts_tracked: tracked,
            activated_at: inner.activated_at,
        }
    }

    /// Return to BASELINE_LEARNING. Baselines keep learning; only gating
    /// changes.
    pub async fn reset(&self, actor: &str, justification: &str, now: DateTime<Utc>) -> Result<ModeStatus, ModeError> {
        if justification.trim().is_empty() {
            return Err(ModeError::MissingJustification);
        }
        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.mode;
            inner.mode = SystemMode::BaselineLearning;
            inner.activated_at = None;
            previous
        };
        warn!(actor, from = previous.as_str(), "system mode reset to BASELINE_LEARNING");
        self.audit
            .log(
                AuditEntry::new(AuditEventType::ModeReset, actor)
                    .with_transition(previous.as_str(), SystemMode::BaselineLearning.as_str())
                    .with_justification(justification),
            )
            .await?;

        // Report without re-running the transition check.
        let progress = self.store.progress_all(now);
        let tracked = progress.len();
        let ready = progress.iter().filter(|p| p.completion >= 1.0).count();
        let completion = progress
            .iter()
            .map(|p| p.completion)
            .fold(if tracked == 0 { 0.0 } else { f64::INFINITY }, f64::min);
        Ok(ModeStatus {
            mode: SystemMode::BaselineLearning,
            completion_percentage: (completion * 100.0).clamp(0.0, 100.0),
            contexts_ready: ready,
            contexts_tracked: tracked,
            activated_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineSample;
    use crate::config::BaselineConfig;
    use crate::context::{ContextKey, DayType, HourBand};
    use crate::model::ServiceCategory;
    use chrono::Duration;

    fn key(region: &str) -> ContextKey {
        ContextKey::new(region, ServiceCategory::Banking, HourBand::Morning, DayType::Weekday).unwrap()
    }

    fn fill(store: &BaselineStore, key: &ContextKey, now: DateTime<Utc>, days: i64, n: i64) {
        let span = Duration::days(days).num_seconds();
        let samples = (0..n).map(|i| BaselineSample {
            observed_at: now - Duration::seconds(span - i * span / n),
            auth_rate: 5.0,
            failure_rate: 0.05,
            retry_avg: 0.1,
            session_duration_ms: Some(2_000.0),
            otp_ratio: 0.2,
        });
        store.update_many(key, samples, now);
    }

    async fn tracker(dir: &tempfile::TempDir) -> (Arc<BaselineStore>, ModeTracker) {
        let store = Arc::new(BaselineStore::new(BaselineConfig::default()));
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")).await.unwrap());
        (Arc::clone(&store), ModeTracker::new(store, audit))
    }

    #[tokio::test]
    async fn test_empty_store_is_learning_at_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_, tracker) = tracker(&dir).await;
        let status = tracker.status(Utc::now()).await;
        assert_eq!(status.mode, SystemMode::BaselineLearning);
        assert_eq!(status.completion_percentage, 0.0);
        assert_eq!(status.contexts_tracked, 0);
    }

    #[tokio::test]
    async fn test_completion_is_minimum_and_transition_is_one_way() {
        let dir = tempfile::TempDir::new().unwrap();
        let (store, tracker) = tracker(&dir).await;
        let now = Utc::now();
        fill(&store, &key("MH"), now, 13, 200);
        fill(&store, &key("KA"), now, 2, 200);

        let status = tracker.status(now).await;
        assert_eq!(status.mode, SystemMode::BaselineLearning);
        assert_eq!(status.contexts_tracked, 2);
        // KA is two days into a fourteen-day requirement.
        assert!((status.completion_percentage - 100.0 * 2.0 / 14.0).abs() < 0.5);

        // Thirteen days later KA's history has aged past readiness too, while
        // MH keeps enough samples inside the window.
        let later = now + Duration::days(12) + Duration::hours(1);
        fill(&store, &key("MH"), later, 12, 200);
        fill(&store, &key("KA"), later, 12, 200);
        let status = tracker.status(later).await;
        assert_eq!(status.mode, SystemMode::ActiveMonitoring);
        assert_eq!(status.completion_percentage, 100.0);

        // A new, empty context does not push the system back to learning.
        fill(&store, &key("DL"), later, 1, 5);
        let status = tracker.status(later).await;
        assert_eq!(status.mode, SystemMode::ActiveMonitoring);
    }

    #[tokio::test]
    async fn test_reset_requires_justification_and_is_audited() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_, tracker) = tracker(&dir).await;
        assert!(matches!(
            tracker.reset("ops-1", "  ", Utc::now()).await,
            Err(ModeError::MissingJustification)
        ));
        let status = tracker
            .reset("ops-1", "new districts onboarded", Utc::now())
            .await
            .unwrap();
        assert_eq!(status.mode, SystemMode::BaselineLearning);

        let audit = AuditLog::new(dir.path().join("audit.jsonl")).await.unwrap();
        let entries = audit.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::ModeReset);
        assert_eq!(entries[0].justification.as_deref(), Some("new districts onboarded"));
    }
}
