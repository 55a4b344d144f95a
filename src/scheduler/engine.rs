use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use super::{Job, Scheduler};
use crate::alerts::AlertOutcome;
use crate::detect::AnalysisOutcome;
use crate::model::{EntityType, TimeWindow};
use crate::services::Services;
use crate::source::{bounded, EventSource};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub entities: usize,
    pub scored: usize,
    pub insufficient_baseline: usize,
    pub alerts_created: usize,
    pub alerts_updated: usize,
    pub failed: usize,
}

/// Analyze every entity active in the trailing sweep window, with bounded
/// concurrency.
pub async fn run_sweep(services: &Services, now: DateTime<Utc>) -> Result<SweepReport> {
    let cfg = &services.config.scheduler;
    let window = TimeWindow::trailing(now, cfg.sweep_window_hours)?;
    let timeout = services.config.source.query_timeout_ms;

    let mut entities = Vec::new();
    for entity_type in [EntityType::Device, EntityType::Region, EntityType::ServiceProvider] {
        let found = bounded(
            timeout,
            services.source.active_entities(entity_type, window, cfg.sweep_min_events),
        )
        .await?;
        entities.extend(found);
    }

    let total = entities.len();
    let engine = Arc::clone(&services.engine);
    let outcomes: Vec<_> = stream::iter(entities)
        .map(|entity| {
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .analyze_at(entity.entity_type(), entity.entity_id(), Some(window), now)
                    .await
            }
        })
        .buffer_unordered(cfg.sweep_concurrency.max(1))
        .collect()
        .await;

    let mut report = SweepReport {
        entities: total,
        ..SweepReport::default()
    };
    for outcome in outcomes {
        match outcome {
            Ok(AnalysisOutcome::Scored(a)) => {
                report.scored += 1;
                match a.alert {
                    AlertOutcome::Created { .. } => report.alerts_created += 1,
                    AlertOutcome::Updated { .. } => report.alerts_updated += 1,
                    _ => {}
                }
            }
            Ok(AnalysisOutcome::InsufficientBaseline(_)) => report.insufficient_baseline += 1,
            Ok(AnalysisOutcome::NoActivity { .. }) => {}
            Err(e) => {
                report.failed += 1;
                warn!(error = %e, "sweep evaluation failed");
            }
        }
    }
    info!(
        entities = report.entities,
        scored = report.scored,
        alerts_created = report.alerts_created,
        failed = report.failed,
        "analysis sweep complete"
    );
    Ok(report)
}

async fn run_job(services: &Services, job: Job, now: DateTime<Utc>) -> Result<()> {
    match job {
        Job::Learning => {
            services.learner.run(now).await?;
            let status = services.mode.status(now).await;
            info!(
                mode = status.mode.as_str(),
                completion = status.completion_percentage,
                "system mode evaluated"
            );
        }
        Job::Retrain => {
            services.trainer.train(now).await?;
        }
        Job::Sweep => {
            run_sweep(services, now).await?;
        }
    }
    Ok(())
}

/// Main scheduler execution loop.
/// One task per job sleeps until its next cron fire time, runs, and repeats.
/// Runs of the same job never overlap.
pub async fn run_scheduler_loop(scheduler: Scheduler, services: Arc<Services>) {
    info!("Scheduler engine started");
    let mut handles = Vec::new();
    for job in scheduler.jobs().collect::<Vec<_>>() {
        let scheduler = scheduler.clone();
        let services = Arc::clone(&services);
        handles.push(tokio::spawn(async move {
            loop {
                let Some(next) = scheduler.next_fire(job, Utc::now()) else {
                    warn!(job = job.as_str(), "no upcoming fire time; job stopped");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                info!(job = job.as_str(), "job due");
                if let Err(e) = run_job(&services, job, Utc::now()).await {
                    error!(job = job.as_str(), "job failed: {:#}", e);
                }
            }
        }));
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!("scheduler task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::aggregate::test_support::{event, ist};
    use crate::storage::open_memory_pool;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_runs_on_a_spawned_task() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.logging.audit_log_path = dir.path().join("audit.jsonl");
        let services = Arc::new(Services::build(config, open_memory_pool().unwrap()).await.unwrap());

        let start = ist(2024, 3, 4, 10, 5);
        let events: Vec<_> = (0..6).map(|i| event(start + Duration::minutes(4 * i))).collect();
        services.source.ingest(&events).unwrap();

        let now = ist(2024, 3, 4, 11, 0);
        let task = {
            let services = Arc::clone(&services);
            tokio::spawn(async move { run_sweep(&services, now).await })
        };
        let report = task.await.unwrap().unwrap();

        // One device, one region, one provider; nothing learned yet.
        assert_eq!(report.entities, 3);
        assert_eq!(report.insufficient_baseline, 3);
        assert_eq!(report.scored, 0);
        assert_eq!(report.failed, 0);
    }
}
