//! Versioned model snapshots and time-bounded anomaly scoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::features::FeatureVector;
use super::forest::IsolationForest;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("no anomaly model published")]
    Unavailable,
    #[error("anomaly scoring exceeded {0} ms")]
    TimedOut(u64),
    #[error("anomaly scoring failed: {0}")]
    Failed(String),
}

/// Any model that maps a feature vector to an outlier score.
pub trait OutlierModel: Send + Sync {
    /// Returns (calibrated score in [0, 1], raw score).
    fn score(&self, features: &FeatureVector) -> (f64, f64);
}

impl OutlierModel for IsolationForest {
    fn score(&self, features: &FeatureVector) -> (f64, f64) {
        let raw = self.raw_score(features);
        (self.calibrate(raw), raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub score: f64,
    pub raw_score: f64,
    pub model_version: u64,
    pub features: FeatureVector,
}

/// A published, read-only model.
#[derive(Clone)]
pub struct ModelSnapshot {
    pub version: u64,
    pub published_at: DateTime<Utc>,
    pub training_vectors: usize,
    pub model: Arc<dyn OutlierModel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub version: u64,
    pub published_at: DateTime<Utc>,
    pub training_vectors: usize,
}

/// Holds the latest model. Publishing swaps an `Arc`; in-flight evaluations
/// keep scoring against the snapshot they already cloned.
#[derive(Default)]
pub struct ModelRegistry {
    current: RwLock<Option<Arc<ModelSnapshot>>>,
    last_version: AtomicU64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish under the next version number.
    pub fn publish(&self, model: Arc<dyn OutlierModel>, training_vectors: usize, now: DateTime<Utc>) -> u64 {
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.install(version, model, training_vectors, now);
        version
    }

    /// Reinstall a previously persisted model under its original version.
    pub fn restore(&self, version: u64, model: Arc<dyn OutlierModel>, training_vectors: usize, published_at: DateTime<Utc>) {
        self.last_version.fetch_max(version, Ordering::SeqCst);
        self.install(version, model, training_vectors, published_at);
    }

    fn install(&self, version: u64, model: Arc<dyn OutlierModel>, training_vectors: usize, at: DateTime<Utc>) {
        let snapshot = Arc::new(ModelSnapshot {
            version,
            published_at: at,
            training_vectors,
            model,
        });
        *self.current.write() = Some(snapshot);
        info!(version, training_vectors, "anomaly model published");
    }

    pub fn current(&self) -> Option<Arc<ModelSnapshot>> {
        self.current.read().clone()
    }

    /// Highest version ever assigned, published or restored.
    pub fn last_version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.current().map(|s| ModelInfo {
            version: s.version,
            published_at: s.published_at,
            training_vectors: s.training_vectors,
        })
    }
}

pub struct AnomalyScorer {
    registry: Arc<ModelRegistry>,
    timeout_ms: u64,
}

impl AnomalyScorer {
    pub fn new(registry: Arc<ModelRegistry>, timeout_ms: u64) -> Self {
        Self { registry, timeout_ms }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Score on the blocking pool against the current snapshot.
    pub async fn score(&self, features: FeatureVector) -> Result<AnomalyScore, ScorerError> {
        let snapshot = self.registry.current().ok_or(ScorerError::Unavailable)?;
        let version = snapshot.version;
        let task = tokio::task::spawn_blocking(move || snapshot.model.score(&features));

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), task).await {
            Ok(Ok((score, raw_score))) => Ok(AnomalyScore {
                score: score.clamp(0.0, 1.0),
                raw_score,
                model_version: version,
                features,
            }),
            Ok(Err(e)) => Err(ScorerError::Failed(e.to_string())),
            Err(_) => Err(ScorerError::TimedOut(self.timeout_ms)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_models {
    use super::*;

    /// Always returns the same score.
    pub struct FixedModel(pub f64);

    impl OutlierModel for FixedModel {
        fn score(&self, _: &FeatureVector) -> (f64, f64) {
            (self.0, self.0)
        }
    }

    /// Blocks longer than any sensible scoring deadline.
    pub struct SlowModel(pub u64);

    impl OutlierModel for SlowModel {
        fn score(&self, _: &FeatureVector) -> (f64, f64) {
            std::thread::sleep(Duration::from_millis(self.0));
            (1.0, 1.0)
        }
    }
}
