use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::composite::CompositeScorer;
use super::rules::RuleEvaluator;
use super::{AnalysisOutcome, EngineError, RiskAssessment, ScorerStatus};
use crate::alerts::manager::Evaluation;
use crate::alerts::AlertManager;
use crate::analysis::features::FeatureVector;
use crate::analysis::scorer::{AnomalyScorer, ModelRegistry, ScorerError};
use crate::baseline::{BaselineLookup, BaselineStore, ModeTracker};
use crate::config::EngineConfig;
use crate::context::ContextKeyResolver;
use crate::model::{EntityRef, EntityType, TimeWindow};
use crate::source::{bounded, EventSource};

/// Orchestrates one evaluation: aggregate, gate on baseline readiness, run
/// rules and the anomaly scorer side by side, fuse, and record the alert.
pub struct RiskEngine {
    source: Arc<dyn EventSource>,
    store: Arc<BaselineStore>,
    mode: Arc<ModeTracker>,
    rules: RuleEvaluator,
    scorer: AnomalyScorer,
    composite: CompositeScorer,
    alerts: Arc<AlertManager>,
    query_timeout_ms: u64,
    default_window_hours: i64,
}

impl RiskEngine {
    pub fn new(
        config: &EngineConfig,
        source: Arc<dyn EventSource>,
        store: Arc<BaselineStore>,
        mode: Arc<ModeTracker>,
        registry: Arc<ModelRegistry>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            source,
            store,
            mode,
            rules: RuleEvaluator::new(config.rules.clone()),
            scorer: AnomalyScorer::new(registry, config.scoring.scorer_timeout_ms),
            composite: CompositeScorer::new(config.scoring.clone()),
            alerts,
            query_timeout_ms: config.source.query_timeout_ms,
            default_window_hours: config.alerts.default_window_hours,
        }
    }

    pub async fn analyze(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        window: Option<TimeWindow>,
    ) -> Result<AnalysisOutcome, EngineError> {
        self.analyze_at(entity_type, entity_id, window, Utc::now()).await
    }

    /// `analyze` against an explicit clock. Without a window, the trailing
    /// `alerts.default_window_hours` ending at `now` is used.
    pub async fn analyze_at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        window: Option<TimeWindow>,
        now: DateTime<Utc>,
    ) -> Result<AnalysisOutcome, EngineError> {
        let entity = EntityRef::new(entity_type, entity_id)?;
        let window = match window {
            Some(w) => w,
            None => TimeWindow::trailing(now, self.default_window_hours)?,
        };

        let aggregate = bounded(self.query_timeout_ms, self.source.aggregate(&entity, window))
            .await
            .map_err(|e| {
                warn!(entity = %entity.entity_id(), error = %e, "behavioral data unavailable");
                e
            })?;
        if aggregate.event_count == 0 {
            debug!(entity = %entity.entity_id(), "no activity in window");
            return Ok(AnalysisOutcome::NoActivity { entity, window });
        }

        let Some(key) = ContextKeyResolver::for_aggregate(&aggregate) else {
            return Ok(AnalysisOutcome::NoActivity { entity, window });
        };
        let baseline = match self.store.get(&key, now) {
            BaselineLookup::Ready(b) => b,
            BaselineLookup::NotReady(progress) => {
                debug!(context = %key, completion = progress.completion, "baseline not ready");
                return Ok(AnalysisOutcome::InsufficientBaseline(progress));
            }
        };

        // Join point: both branches finish before fusion.
        let features = FeatureVector::from_aggregate(&aggregate);
        let (rule_results, scored) = tokio::join!(
            async { self.rules.evaluate_with_tolerance(&aggregate, baseline.tolerance) },
            self.scorer.score(features)
        );
        let (anomaly, scorer_status) = match scored {
            Ok(a) => (Some(a), ScorerStatus::Available),
            Err(ScorerError::TimedOut(ms)) => {
                warn!(entity = %entity.entity_id(), timeout_ms = ms, "anomaly scorer timed out; rules only");
                (None, ScorerStatus::TimedOut)
            }
            Err(e) => {
                warn!(entity = %entity.entity_id(), error = %e, "anomaly scorer unavailable; rules only");
                (None, ScorerStatus::Unavailable)
            }
        };

        let score = self.composite.fuse(&rule_results, anomaly.as_ref());
        let deviation = BaselineStore::deviation(&baseline, &aggregate);
        let mode = self.mode.status(now).await.mode;
        let region = match entity.entity_type() {
            EntityType::Region => Some(entity.entity_id().to_string()),
            _ => aggregate.dominant_region.clone(),
        };

        let alert = self
            .alerts
            .record(
                Evaluation {
                    entity: &entity,
                    context_key: Some(&key),
                    region,
                    score: &score,
                    rules: &rule_results,
                    features: Some(features),
                    deviation,
                },
                mode,
                now,
            )
            .await?;

        info!(
            entity_type = entity.entity_type().as_str(),
            entity = %entity.entity_id(),
            context = %key,
            composite = score.composite,
            severity = score.severity.as_str(),
            rule_only = score.rule_only,
            "entity analyzed"
        );

        Ok(AnalysisOutcome::Scored(Box::new(RiskAssessment {
            entity,
            window,
            context_key: Some(key),
            score,
            rules: rule_results,
            anomaly,
            scorer_status,
            baseline_deviation: deviation,
            baseline_version: baseline.version,
            baseline_tolerance: baseline.tolerance,
            alert,
        })))
    }

    pub fn store(&self) -> &Arc<BaselineStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertRepository;
    use crate::audit::AuditLog;
    use crate::model::aggregate::test_support::{event, ist, DEVICE};
    use crate::model::ValidationError;
    use crate::source::SqliteEventSource;
    use crate::storage::open_memory_pool;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> (RiskEngine, SqliteEventSource) {
        let config = EngineConfig::default();
        let pool = open_memory_pool().unwrap();
        let source = SqliteEventSource::new(pool.clone());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")).await.unwrap());
        let store = Arc::new(BaselineStore::new(config.baseline.clone()));
        let mode = Arc::new(ModeTracker::new(Arc::clone(&store), Arc::clone(&audit)));
        let alerts = Arc::new(AlertManager::new(
            AlertRepository::new(pool),
            audit,
            config.alerts.clone(),
        ));
        let engine = RiskEngine::new(
            &config,
            Arc::new(source.clone()),
            store,
            mode,
            Arc::new(ModelRegistry::new()),
            alerts,
        );
        (engine, source)
    }

    #[tokio::test]
    async fn test_rejects_aadhaar_shaped_id() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir).await;
        let err = engine
            .analyze(EntityType::ServiceProvider, "123456789012", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::RawIdentifier)));
    }

    #[tokio::test]
    async fn test_no_activity_is_not_scored() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir).await;
        let out = engine
            .analyze_at(EntityType::Device, DEVICE, None, ist(2024, 3, 4, 12, 0))
            .await
            .unwrap();
        assert!(matches!(out, AnalysisOutcome::NoActivity { .. }));
    }

    #[tokio::test]
    async fn test_unknown_context_is_insufficient_baseline() {
        let dir = TempDir::new().unwrap();
        let (engine, source) = engine(&dir).await;
        source.ingest(&[event(ist(2024, 3, 4, 10, 0))]).unwrap();
        let out = engine
            .analyze_at(EntityType::Device, DEVICE, None, ist(2024, 3, 4, 12, 0))
            .await
            .unwrap();
        match out {
            AnalysisOutcome::InsufficientBaseline(p) => {
                assert_eq!(p.sample_count, 0);
                assert_eq!(p.completion, 0.0);
            }
            other => panic!("expected insufficient baseline, got {:?}", other),
        }
    }
}
