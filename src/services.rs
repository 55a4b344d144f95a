//! Wiring of every engine component from one `EngineConfig`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::{AlertManager, AlertRepository};
use crate::analysis::trainer::restore_latest;
use crate::analysis::{ModelRegistry, ModelTrainer};
use crate::audit::AuditLog;
use crate::baseline::learner::{BaselineLearner, LearningReport};
use crate::baseline::{BaselineStore, ModeStatus, ModeTracker};
use crate::config::EngineConfig;
use crate::detect::RiskEngine;
use crate::equity::EquityGuardrail;
use crate::source::{EventSource, SqliteEventSource};
use crate::storage::{open_pool, Pool};

const GUARDRAIL_CHANNEL: usize = 1024;

pub struct Services {
    pub config: EngineConfig,
    pub pool: Pool,
    pub source: SqliteEventSource,
    pub audit: Arc<AuditLog>,
    pub store: Arc<BaselineStore>,
    pub mode: Arc<ModeTracker>,
    pub registry: Arc<ModelRegistry>,
    pub alerts: Arc<AlertManager>,
    pub equity: Arc<EquityGuardrail>,
    pub engine: Arc<RiskEngine>,
    pub learner: Arc<BaselineLearner>,
    pub trainer: Arc<ModelTrainer>,
}

impl Services {
    /// Open the configured database and build everything on top of it.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let path = config.server.database_path.to_string_lossy().into_owned();
        let pool = open_pool(&path)?;
        Self::build(config, pool).await
    }

    /// Build on an existing pool. Restores the latest persisted model, seeds
    /// the equity guardrail from stored alerts and starts its consumer task.
    pub async fn build(config: EngineConfig, pool: Pool) -> Result<Self> {
        let audit = Arc::new(
            AuditLog::new(config.logging.audit_log_path.clone())
                .await
                .context("failed to open audit log")?,
        );
        let source = SqliteEventSource::new(pool.clone());
        let shared_source: Arc<dyn EventSource> = Arc::new(source.clone());
        let store = Arc::new(BaselineStore::new(config.baseline.clone()));
        let mode = Arc::new(ModeTracker::new(Arc::clone(&store), Arc::clone(&audit)));

        let registry = Arc::new(ModelRegistry::new());
        match restore_latest(&pool, &registry).await {
            Ok(Some(version)) => info!(version, "restored anomaly model"),
            Ok(None) => info!("no anomaly model persisted yet; scoring falls back to rules"),
            Err(e) => warn!(error = %e, "failed to restore anomaly model"),
        }

        let repo = AlertRepository::new(pool.clone());
        let equity = Arc::new(EquityGuardrail::new(
            config.equity.clone(),
            Arc::clone(&store),
            Arc::clone(&audit),
        ));
        equity.seed(repo.context_feedback().await?, Utc::now());
        let (tx, rx) = mpsc::channel(GUARDRAIL_CHANNEL);
        tokio::spawn(Arc::clone(&equity).run(rx));

        let alerts = Arc::new(
            AlertManager::new(repo.clone(), Arc::clone(&audit), config.alerts.clone()).with_guardrail(tx),
        );
        let engine = Arc::new(RiskEngine::new(
            &config,
            Arc::clone(&shared_source),
            Arc::clone(&store),
            Arc::clone(&mode),
            Arc::clone(&registry),
            Arc::clone(&alerts),
        ));
        let learner = Arc::new(BaselineLearner::new(
            Arc::clone(&shared_source),
            Arc::clone(&store),
            config.source.query_timeout_ms,
        ));
        let trainer = Arc::new(ModelTrainer::new(
            shared_source,
            Arc::clone(&store),
            Arc::clone(&registry),
            repo,
            pool.clone(),
            Arc::clone(&audit),
            config.anomaly.clone(),
            config.source.query_timeout_ms,
        ));

        Ok(Self {
            config,
            pool,
            source,
            audit,
            store,
            mode,
            registry,
            alerts,
            equity,
            engine,
            learner,
            trainer,
        })
    }

    /// Rebuild in-memory baselines from the event store and evaluate the mode.
    pub async fn warm_up(&self, now: DateTime<Utc>) -> Result<(LearningReport, ModeStatus)> {
        let report = self.learner.run(now).await?;
        let status = self.mode.status(now).await;
        info!(
            contexts = report.contexts_tracked,
            mode = status.mode.as_str(),
            completion = status.completion_percentage,
            "baselines warmed up"
        );
        Ok((report, status))
    }
}
