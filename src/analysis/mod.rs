//! Statistical outlier scoring, independent of the rule set.

pub mod features;
pub mod forest;
pub mod scorer;
pub mod trainer;

pub use features::{FeatureVector, FEATURE_NAMES};
pub use forest::IsolationForest;
pub use scorer::{AnomalyScore, AnomalyScorer, ModelInfo, ModelRegistry, OutlierModel, ScorerError};
pub use trainer::{ModelTrainer, TrainingReport};
