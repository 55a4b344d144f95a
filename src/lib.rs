//! AMEWS -- Aadhaar misuse early-warning risk engine.
//!
//! This crate provides the core library for context-specific baseline
//! learning, rule and anomaly scoring, composite risk fusion, the alert
//! lifecycle and the equity guardrail, over anonymized authentication events.

pub mod alerts;
pub mod analysis;
pub mod api;
pub mod audit;
pub mod baseline;
pub mod config;
pub mod context;
pub mod detect;
pub mod equity;
pub mod model;
pub mod scheduler;
pub mod services;
pub mod source;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::EngineConfig;
use crate::services::Services;

/// Start the AMEWS daemon: API server and scheduled jobs.
pub async fn serve(config: EngineConfig) -> Result<()> {
    // 1. Initialize storage and services
    tracing::info!(db_path = %config.server.database_path.display(), "Initializing database");
    let services = Arc::new(Services::open(config).await?);

    // 2. Rebuild baselines from the event store
    if let Err(e) = services.warm_up(Utc::now()).await {
        tracing::warn!(error = %e, "baseline warm-up failed; continuing in learning mode");
    }

    // 3. Start scheduler engine (background task)
    if services.config.scheduler.enabled {
        let scheduler = scheduler::Scheduler::from_config(&services.config.scheduler)?;
        let scheduler_services = Arc::clone(&services);
        tokio::spawn(async move {
            scheduler::run_scheduler_loop(scheduler, scheduler_services).await;
        });
    }

    // 4. Start API server
    let addr: std::net::SocketAddr = services.config.server.bind.parse()?;
    let app = api::router(api::state::AppState::new(Arc::clone(&services)));

    tracing::info!(%addr, "AMEWS listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
