//! Event store contract consumed by the engine.
//!
//! The engine never touches raw storage; everything it learns or scores is
//! derived through [`EventSource`]. Calls are bounded by
//! `source.query_timeout_ms` via [`bounded`].

pub mod sqlite;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::baseline::BaselineSample;
use crate::context::ContextKey;
use crate::model::{BehavioralAggregate, EntityRef, EntityType, TimeWindow};

pub use sqlite::SqliteEventSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error("event store query timed out after {0} ms")]
    Timeout(u64),
}

impl From<anyhow::Error> for SourceError {
    fn from(e: anyhow::Error) -> Self {
        SourceError::Unavailable(format!("{:#}", e))
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Behavioral summary for one entity over one window.
    async fn aggregate(&self, entity: &EntityRef, window: TimeWindow) -> Result<BehavioralAggregate, SourceError>;

    /// Entity-hour samples whose events fall in `key`'s bucket.
    async fn recent_samples(&self, key: &ContextKey, window: TimeWindow) -> Result<Vec<BaselineSample>, SourceError>;

    /// Context keys with at least one event in the window.
    async fn active_contexts(&self, window: TimeWindow) -> Result<Vec<ContextKey>, SourceError>;

    /// Per-device, per-local-hour aggregates, newest first, at most `limit`.
    async fn entity_hour_aggregates(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<BehavioralAggregate>, SourceError>;

    /// Entities of `entity_type` with at least `min_events` events in the window.
    async fn active_entities(
        &self,
        entity_type: EntityType,
        window: TimeWindow,
        min_events: u64,
    ) -> Result<Vec<EntityRef>, SourceError>;
}

/// Run a source call under a deadline; a miss becomes `SourceError::Timeout`.
pub async fn bounded<T, F>(timeout_ms: u64, fut: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(timeout_ms)),
    }
}
