//! Incremental learning pass: folds completed entity-hours into the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::store::BaselineStore;
use crate::model::event::local_hour_start;
use crate::model::TimeWindow;
use crate::source::{bounded, EventSource, SourceError};

#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub window: Option<TimeWindow>,
    pub contexts_updated: usize,
    pub samples_folded: usize,
    pub contexts_tracked: usize,
}

/// Pulls samples for hours not yet folded. A watermark keeps repeated passes
/// from counting the same entity-hour twice.
pub struct BaselineLearner {
    source: Arc<dyn EventSource>,
    store: Arc<BaselineStore>,
    query_timeout_ms: u64,
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl BaselineLearner {
    pub fn new(source: Arc<dyn EventSource>, store: Arc<BaselineStore>, query_timeout_ms: u64) -> Self {
        Self {
            source,
            store,
            query_timeout_ms,
            watermark: Mutex::new(None),
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock()
    }

    /// Fold every completed local hour since the last pass.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<LearningReport, SourceError> {
        let cutoff = local_hour_start(now);
        let earliest = cutoff - Duration::days(self.store.config().window_days as i64);
        let start = self.watermark().map_or(earliest, |w| w.max(earliest));

        if start >= cutoff {
            debug!("no completed hours since last learning pass");
            // Still let stale contexts age out.
            let tracked = self.store.snapshots(now).len();
            return Ok(LearningReport {
                window: None,
                contexts_updated: 0,
                samples_folded: 0,
                contexts_tracked: tracked,
            });
        }

        let window = TimeWindow::new(start, cutoff)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let contexts = bounded(self.query_timeout_ms, self.source.active_contexts(window)).await?;

        let mut samples_folded = 0;
        let mut contexts_updated = 0;
        for key in &contexts {
            let samples = bounded(self.query_timeout_ms, self.source.recent_samples(key, window)).await?;
            if samples.is_empty() {
                continue;
            }
            samples_folded += samples.len();
            contexts_updated += 1;
            self.store.update_many(key, samples, now);
        }
        *self.watermark.lock() = Some(cutoff);

        let tracked = self.store.snapshots(now).len();
        info!(
            contexts_updated,
            samples_folded,
            contexts_tracked = tracked,
            "learning pass complete"
        );
        Ok(LearningReport {
            window: Some(window),
            contexts_updated,
            samples_folded,
            contexts_tracked: tracked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaselineConfig;
    use crate::model::aggregate::test_support::{event, ist};
    use crate::source::SqliteEventSource;
    use crate::storage::open_memory_pool;

    #[tokio::test]
    async fn test_passes_do_not_double_count() {
        let src = SqliteEventSource::new(open_memory_pool().unwrap());
        let events: Vec<_> = (0..4).map(|h| event(ist(2024, 3, 4, 9 + h, 10))).collect();
        src.ingest(&events).unwrap();

        let store = Arc::new(BaselineStore::new(BaselineConfig::default()));
        let learner = BaselineLearner::new(Arc::new(src.clone()), Arc::clone(&store), 2_000);

        let now = ist(2024, 3, 4, 13, 30);
        let first = learner.run(now).await.unwrap();
        assert_eq!(first.samples_folded, 4);
        assert_eq!(first.contexts_updated, 2); // MORNING and AFTERNOON

        // Same hour again: nothing new.
        let second = learner.run(ist(2024, 3, 4, 13, 50)).await.unwrap();
        assert_eq!(second.samples_folded, 0);
        assert!(second.window.is_none());

        // A later event in a completed hour is picked up exactly once.
        src.ingest(&[event(ist(2024, 3, 4, 13, 40))]).unwrap();
        let third = learner.run(ist(2024, 3, 4, 14, 5)).await.unwrap();
        assert_eq!(third.samples_folded, 1);

        let total: u64 = store.snapshots(ist(2024, 3, 4, 14, 5)).iter().map(|b| b.sample_count).sum();
        assert_eq!(total, 5);
    }
}
