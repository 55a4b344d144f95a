//! Alert creation, deduplication and lifecycle operations.
//!
//! Create/update for one dedup key (entity_type, entity_id, alert_type) is
//! single-writer: a per-key async mutex serializes in-process callers, and
//! every row write is a compare-and-swap on `version` so a lost race is
//! detected and retried against the freshest row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::actions;
use super::lifecycle::{apply_feedback, apply_transition};
use super::repository::AlertRepository;
use super::{
    Alert, AlertError, AlertFilter, AlertOutcome, AlertPage, AlertStatistics, AlertStatus, AlertType, FeedbackInput,
    Page,
};
use crate::analysis::features::FeatureVector;
use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::baseline::SystemMode;
use crate::config::AlertConfig;
use crate::context::ContextKey;
use crate::detect::rules::{triggered, RuleId, RuleResult};
use crate::detect::{CompositeRiskScore, Severity};
use crate::equity::GuardrailEvent;
use crate::model::{EntityRef, EntityType};

type DedupKey = (EntityType, String, AlertType);

/// Everything the manager needs from one evaluation.
pub struct Evaluation<'a> {
    pub entity: &'a EntityRef,
    pub context_key: Option<&'a ContextKey>,
    pub region: Option<String>,
    pub score: &'a CompositeRiskScore,
    pub rules: &'a [RuleResult],
    pub features: Option<FeatureVector>,
    pub deviation: f64,
}

pub struct AlertManager {
    repo: AlertRepository,
    audit: Arc<AuditLog>,
    config: AlertConfig,
    locks: DashMap<DedupKey, Arc<Mutex<()>>>,
    guardrail: Option<mpsc::Sender<GuardrailEvent>>,
}

fn new_alert_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("ALR-{}", hex[..8].to_ascii_uppercase())
}

impl AlertManager {
    pub fn new(repo: AlertRepository, audit: Arc<AuditLog>, config: AlertConfig) -> Self {
        Self {
            repo,
            audit,
            config,
            locks: DashMap::new(),
            guardrail: None,
        }
    }

    /// Forward creations and feedback to the equity guardrail.
    pub fn with_guardrail(mut self, tx: mpsc::Sender<GuardrailEvent>) -> Self {
        self.guardrail = Some(tx);
        self
    }

    pub fn repository(&self) -> &AlertRepository {
        &self.repo
    }

    async fn notify(&self, event: GuardrailEvent) {
        if let Some(tx) = &self.guardrail {
            if tx.send(event).await.is_err() {
                warn!("equity guardrail channel closed; event dropped");
            }
        }
    }

    fn key_lock(&self, key: DedupKey) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).value())
    }

    /// Create or fold an alert for one evaluation.
    pub async fn record(
        &self,
        eval: Evaluation<'_>,
        mode: SystemMode,
        now: DateTime<Utc>,
    ) -> Result<AlertOutcome, AlertError> {
        if eval.score.severity < Severity::Medium {
            return Ok(AlertOutcome::BelowThreshold);
        }
        if mode == SystemMode::BaselineLearning && self.config.suppress_while_learning {
            info!(
                entity = %eval.entity.entity_id(),
                composite = eval.score.composite,
                "alert suppressed during baseline learning"
            );
            return Ok(AlertOutcome::SuppressedLearning);
        }

        let reasons = triggered(eval.rules);
        let entity_type = eval.entity.entity_type();
        let alert_type = AlertType::classify(&reasons, entity_type);
        let key: DedupKey = (entity_type, eval.entity.entity_id().to_string(), alert_type);
        let lock = self.key_lock(key.clone());
        let outcome = {
            let _guard = lock.lock().await;
            self.upsert(eval, reasons, alert_type, now).await
        };
        drop(lock);
        // Only the map holds the lock now unless another caller is waiting on it.
        self.locks.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        outcome
    }

    /// Fold into the open alert for the key or create one. Caller holds the key lock.
    async fn upsert(
        &self,
        eval: Evaluation<'_>,
        reasons: Vec<RuleId>,
        alert_type: AlertType,
        now: DateTime<Utc>,
    ) -> Result<AlertOutcome, AlertError> {
        let entity_type = eval.entity.entity_type();
        let window = Duration::hours(self.config.dedup_window_hours);
        let suggested = actions::suggested_actions(alert_type, eval.score.action_tier);
        let description = actions::description(eval.entity, eval.score, eval.rules, eval.deviation);

        for attempt in 0..=self.config.max_update_retries {
            let open = self
                .repo
                .find_open(entity_type, eval.entity.entity_id(), alert_type)
                .await?
                .filter(|a| now < a.active_until);

            let Some(existing) = open else {
                let alert = Alert {
                    id: new_alert_id(),
                    entity_type,
                    entity_id: eval.entity.entity_id().to_string(),
                    alert_type,
                    title: actions::title(alert_type).to_string(),
                    description,
                    score: eval.score.clone(),
                    region: eval.region.clone(),
                    context_key: eval.context_key.cloned(),
                    status: AlertStatus::Active,
                    reason_codes: reasons,
                    suggested_actions: suggested,
                    feedback: None,
                    analyst_confidence: None,
                    feedback_notes: None,
                    feedback_by: None,
                    acknowledged_by: None,
                    created_at: now,
                    updated_at: now,
                    acknowledged_at: None,
                    resolved_at: None,
                    feedback_at: None,
                    active_until: now + window,
                    evaluation_count: 1,
                    features: eval.features,
                    version: 1,
                };
                let id = alert.id.clone();
                self.repo.insert(alert).await?;
                self.audit
                    .log(
                        AuditEntry::new(AuditEventType::AlertCreated, "system")
                            .with_subject(&id)
                            .with_params(json!({
                                "alert_type": alert_type.as_str(),
                                "entity_type": entity_type.as_str(),
                                "severity": eval.score.severity.as_str(),
                                "composite": eval.score.composite,
                            })),
                    )
                    .await?;
                if let Some(key) = eval.context_key {
                    self.notify(GuardrailEvent::AlertCreated {
                        context_key: key.clone(),
                    })
                    .await;
                }
                info!(alert_id = %id, alert_type = alert_type.as_str(), severity = eval.score.severity.as_str(), "alert created");
                return Ok(AlertOutcome::Created { alert_id: id });
            };

            let expected = existing.version;
            let mut updated = existing;
            updated.score = eval.score.clone();
            updated.description = description.clone();
            updated.suggested_actions = suggested.clone();
            for r in &reasons {
                if !updated.reason_codes.contains(r) {
                    updated.reason_codes.push(*r);
                }
            }
            updated.active_until = updated.active_until.max(now + window);
            updated.evaluation_count += 1;
            if eval.features.is_some() {
                updated.features = eval.features;
            }
            updated.updated_at = now;
            updated.version = expected + 1;

            let id = updated.id.clone();
            let count = updated.evaluation_count;
            if self.repo.update_cas(updated, expected).await? {
                self.audit
                    .log(
                        AuditEntry::new(AuditEventType::AlertUpdated, "system")
                            .with_subject(&id)
                            .with_params(json!({
                                "evaluation_count": count,
                                "severity": eval.score.severity.as_str(),
                                "composite": eval.score.composite,
                            })),
                    )
                    .await?;
                debug!(alert_id = %id, evaluation_count = count, "alert updated");
                return Ok(AlertOutcome::Updated {
                    alert_id: id,
                    evaluation_count: count,
                });
            }
            warn!(alert_id = %id, attempt, "concurrent alert update; retrying");
        }
        Err(AlertError::ConcurrentUpdateConflict(format!(
            "{}:{}:{}",
            entity_type.as_str(),
            eval.entity.entity_id(),
            alert_type.as_str()
        )))
    }

    /// Read-modify-CAS loop shared by transitions and feedback.
    async fn mutate<F>(&self, id: &str, now: DateTime<Utc>, mut change: F) -> Result<(Alert, Alert), AlertError>
    where
        F: FnMut(&mut Alert) -> Result<(), AlertError>,
    {
        for attempt in 0..=self.config.max_update_retries {
            let before = self
                .repo
                .get(id)
                .await?
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            let mut after = before.clone();
            change(&mut after)?;
            after.updated_at = now;
            after.version = before.version + 1;
            if self.repo.update_cas(after.clone(), before.version).await? {
                return Ok((before, after));
            }
            warn!(alert_id = %id, attempt, "concurrent alert update; retrying");
        }
        Err(AlertError::ConcurrentUpdateConflict(id.to_string()))
    }

    pub async fn transition(
        &self,
        id: &str,
        to: AlertStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        let (before, after) = self.mutate(id, now, |a| apply_transition(a, to, actor, now)).await?;
        let event = match to {
            AlertStatus::Resolved => AuditEventType::AlertResolved,
            _ => AuditEventType::AlertAcknowledged,
        };
        self.audit
            .log(
                AuditEntry::new(event, actor)
                    .with_subject(id)
                    .with_transition(before.status.as_str(), after.status.as_str()),
            )
            .await?;
        info!(alert_id = %id, from = before.status.as_str(), to = after.status.as_str(), "alert transitioned");
        Ok(after)
    }

    pub async fn record_feedback(
        &self,
        id: &str,
        input: FeedbackInput,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        let (_, after) = self.mutate(id, now, |a| apply_feedback(a, &input, now)).await?;
        let mut entry = AuditEntry::new(AuditEventType::FeedbackRecorded, input.analyst.as_str())
            .with_subject(id)
            .with_params(json!({
                "feedback": input.feedback.as_str(),
                "analyst_confidence": input.analyst_confidence,
            }));
        if let Some(notes) = &input.notes {
            entry = entry.with_justification(notes.as_str());
        }
        self.audit.log(entry).await?;

        if let Some(key) = &after.context_key {
            self.notify(GuardrailEvent::Feedback {
                context_key: key.clone(),
                feedback: input.feedback,
            })
            .await;
        }
        info!(alert_id = %id, feedback = input.feedback.as_str(), "feedback recorded");
        Ok(after)
    }

    pub async fn get(&self, id: &str) -> Result<Alert, AlertError> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| AlertError::NotFound(id.to_string()))
    }

    pub async fn list(&self, filter: AlertFilter, page: Page) -> Result<AlertPage, AlertError> {
        Ok(self.repo.list(filter, page).await?)
    }

    pub async fn statistics(&self, now: DateTime<Utc>) -> Result<AlertStatistics, AlertError> {
        Ok(self.repo.statistics(now).await?)
    }
}
