//! Periodic retraining of the outlier model from known-normal behavior.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::features::FeatureVector;
use super::forest::IsolationForest;
use super::scorer::ModelRegistry;
use crate::alerts::AlertRepository;
use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::baseline::{BaselineLookup, BaselineStore};
use crate::config::AnomalyConfig;
use crate::context::ContextKeyResolver;
use crate::model::event::local_hour_start;
use crate::model::TimeWindow;
use crate::source::{bounded, EventSource};
use crate::storage::{ts_from_sql, ts_to_sql, Pool};

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub published_version: Option<u64>,
    pub training_vectors: usize,
    pub labeled_normals: usize,
    pub excluded_flagged: usize,
    pub excluded_not_ready: usize,
    /// Set when the previous model stays published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

pub struct ModelTrainer {
    source: Arc<dyn EventSource>,
    store: Arc<BaselineStore>,
    registry: Arc<ModelRegistry>,
    alerts: AlertRepository,
    pool: Pool,
    audit: Arc<AuditLog>,
    config: AnomalyConfig,
    query_timeout_ms: u64,
}

impl ModelTrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<BaselineStore>,
        registry: Arc<ModelRegistry>,
        alerts: AlertRepository,
        pool: Pool,
        audit: Arc<AuditLog>,
        config: AnomalyConfig,
        query_timeout_ms: u64,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            alerts,
            pool,
            audit,
            config,
            query_timeout_ms,
        }
    }

    /// Build the training set, fit, publish and persist.
    pub async fn train(&self, now: DateTime<Utc>) -> Result<TrainingReport> {
        let end = local_hour_start(now);
        let window = TimeWindow::new(end - Duration::days(self.config.training_window_days as i64), end)?;
        let aggregates = bounded(
            self.query_timeout_ms,
            self.source.entity_hour_aggregates(window, self.config.max_training_vectors),
        )
        .await?;
        let flagged = self.alerts.flagged_entities().await?;

        let mut vectors: Vec<FeatureVector> = Vec::with_capacity(aggregates.len());
        let mut excluded_flagged = 0;
        let mut excluded_not_ready = 0;
        for agg in &aggregates {
            let entity = (agg.entity.entity_type(), agg.entity.entity_id().to_string());
            if flagged.contains(&entity) {
                excluded_flagged += 1;
                continue;
            }
            let ready = ContextKeyResolver::for_aggregate(agg)
                .is_some_and(|key| matches!(self.store.get(&key, now), BaselineLookup::Ready(_)));
            if !ready {
                excluded_not_ready += 1;
                continue;
            }
            vectors.push(FeatureVector::from_aggregate(agg));
        }

        let normals = self.alerts.false_positive_features().await?;
        let labeled_normals = normals.len();
        vectors.extend(normals);

        let mut report = TrainingReport {
            published_version: None,
            training_vectors: vectors.len(),
            labeled_normals,
            excluded_flagged,
            excluded_not_ready,
            skipped: None,
        };
        if vectors.len() < self.config.min_training_vectors {
            let reason = format!(
                "{} training vectors, need {}",
                vectors.len(),
                self.config.min_training_vectors
            );
            warn!(reason = %reason, "model retraining skipped; previous model stays published");
            report.skipped = Some(reason);
            return Ok(report);
        }

        let (trees, subsample, seed) = (self.config.trees, self.config.subsample, self.config.seed);
        let forest = tokio::task::spawn_blocking(move || IsolationForest::fit(&vectors, trees, subsample, seed))
            .await??;

        let model_json = serde_json::to_string(&forest)?;
        let median = forest.calibration_median();
        let count = forest.training_vectors();
        let version = self.registry.publish(Arc::new(forest), count, now);
        save_model(&self.pool, version, now, count, labeled_normals, median, model_json).await?;

        self.audit
            .log(
                AuditEntry::new(AuditEventType::ModelPublished, "system")
                    .with_subject(version.to_string())
                    .with_params(json!({
                        "training_vectors": count,
                        "labeled_normals": labeled_normals,
                        "calibration_median": median,
                    })),
            )
            .await?;
        info!(version, training_vectors = count, labeled_normals, "anomaly model retrained");
        report.published_version = Some(version);
        Ok(report)
    }
}

async fn save_model(
    pool: &Pool,
    version: u64,
    trained_at: DateTime<Utc>,
    training_vectors: usize,
    labeled_normals: usize,
    calibration_median: f64,
    model_json: String,
) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO model_versions
                (version, trained_at, training_vectors, labeled_normals, calibration_median, model_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version as i64,
                ts_to_sql(trained_at),
                training_vectors as i64,
                labeled_normals as i64,
                calibration_median,
                model_json
            ],
        )
        .context("failed to persist model version")?;
        Ok(())
    })
    .await?
}

/// Reinstall the newest persisted model. Returns its version, if any.
pub async fn restore_latest(pool: &Pool, registry: &ModelRegistry) -> Result<Option<u64>> {
    let pool = pool.clone();
    let row = tokio::task::spawn_blocking(move || -> Result<Option<(i64, String, i64, String)>> {
        let conn = pool.get()?;
        Ok(conn
            .query_row(
                "SELECT version, trained_at, training_vectors, model_json
                 FROM model_versions ORDER BY version DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?)
    })
    .await??;

    let Some((version, trained_at, vectors, json)) = row else {
        return Ok(None);
    };
    let forest: IsolationForest =
        serde_json::from_str(&json).with_context(|| format!("model version {} is corrupt", version))?;
    let version = version as u64;
    registry.restore(version, Arc::new(forest), vectors as usize, ts_from_sql(&trained_at)?);
    Ok(Some(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scorer::AnomalyScorer;
    use crate::config::BaselineConfig;
    use crate::model::aggregate::test_support::{event, ist};
    use crate::source::SqliteEventSource;
    use crate::storage::open_memory_pool;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pool: Pool,
        trainer: ModelTrainer,
        registry: Arc<ModelRegistry>,
    }

    async fn fixture(min_samples: u64, min_training_vectors: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = open_memory_pool().unwrap();
        let source = SqliteEventSource::new(pool.clone());

        // Weekday mornings across two weeks, two devices.
        let mut events = Vec::new();
        for day in 4..16u32 {
            for hour in 7..11u32 {
                let mut e = event(ist(2024, 3, day, hour, 10));
                if day % 2 == 0 {
                    e.device_hash = "b1b2c3d4e5f60718293a4b5c6d7e8f90".into();
                }
                events.push(e);
            }
        }
        source.ingest(&events).unwrap();

        let store = Arc::new(BaselineStore::new(BaselineConfig {
            min_samples,
            min_learning_days: 0,
            ..BaselineConfig::default()
        }));
        let now = ist(2024, 3, 16, 12, 0);
        let learner = crate::baseline::learner::BaselineLearner::new(Arc::new(source.clone()), Arc::clone(&store), 2_000);
        learner.run(now).await.unwrap();

        let registry = Arc::new(ModelRegistry::new());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")).await.unwrap());
        let config = AnomalyConfig {
            trees: 20,
            subsample: 32,
            min_training_vectors,
            ..AnomalyConfig::default()
        };
        let trainer = ModelTrainer::new(
            Arc::new(source),
            store,
            Arc::clone(&registry),
            AlertRepository::new(pool.clone()),
            pool.clone(),
            audit,
            config,
            2_000,
        );
        Fixture {
            _dir: dir,
            pool,
            trainer,
            registry,
        }
    }

    #[tokio::test]
    async fn test_train_publishes_and_restores() {
        let f = fixture(5, 10).await;
        let report = f.trainer.train(ist(2024, 3, 16, 12, 0)).await.unwrap();
        assert_eq!(report.published_version, Some(1));
        assert!(report.training_vectors >= 10);
        assert!(f.registry.current().is_some());

        let fresh = ModelRegistry::new();
        assert_eq!(restore_latest(&f.pool, &fresh).await.unwrap(), Some(1));
        let scorer = AnomalyScorer::new(Arc::new(fresh), 250);
        let s = scorer.score(FeatureVector::zeros()).await.unwrap();
        assert_eq!(s.model_version, 1);
    }

    #[tokio::test]
    async fn test_too_few_vectors_keeps_previous_model() {
        let f = fixture(5, 10_000).await;
        let report = f.trainer.train(ist(2024, 3, 16, 12, 0)).await.unwrap();
        assert!(report.published_version.is_none());
        assert!(report.skipped.is_some());
        assert!(f.registry.current().is_none());
        assert_eq!(restore_latest(&f.pool, &ModelRegistry::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contexts_not_ready_are_excluded() {
        let f = fixture(10_000, 1).await;
        let report = f.trainer.train(ist(2024, 3, 16, 12, 0)).await.unwrap();
        assert_eq!(report.training_vectors, 0);
        assert!(report.excluded_not_ready > 0);
        assert!(report.skipped.is_some());
    }
}
