//! Isolation forest outlier model.
//!
//! Trees are stored as flat node arrays so a fitted forest serializes to JSON
//! and can be restored from `model_versions` without refitting.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::features::{FeatureVector, FEATURE_COUNT};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("need at least 2 training vectors, got {0}")]
    TooFewVectors(usize),
    #[error("tree count must be positive")]
    NoTrees,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Tree>,
    subsample: usize,
    /// Median raw score over the training set.
    calibration_median: f64,
    training_vectors: usize,
}

/// Average path length of an unsuccessful BST search over `n` points.
pub fn c_factor(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

impl IsolationForest {
    pub fn fit(data: &[FeatureVector], n_trees: usize, subsample: usize, seed: u64) -> Result<Self, ForestError> {
        if data.len() < 2 {
            return Err(ForestError::TooFewVectors(data.len()));
        }
        if n_trees == 0 {
            return Err(ForestError::NoTrees);
        }
        let psi = subsample.clamp(2, data.len());
        let height_limit = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_trees)
            .map(|_| {
                let rows: Vec<usize> = rand::seq::index::sample(&mut rng, data.len(), psi).into_vec();
                let mut nodes = Vec::new();
                grow(data, rows, 0, height_limit, &mut rng, &mut nodes);
                Tree { nodes }
            })
            .collect();

        let mut forest = Self {
            trees,
            subsample: psi,
            calibration_median: 0.0,
            training_vectors: data.len(),
        };
        let mut raw: Vec<f64> = data.iter().map(|x| forest.raw_score(x)).collect();
        raw.sort_by(|a, b| a.total_cmp(b));
        forest.calibration_median = crate::model::aggregate::percentile(&raw, 0.5);
        Ok(forest)
    }

    /// 2^(-E[h(x)] / c(psi)), in (0, 1].
    pub fn raw_score(&self, x: &FeatureVector) -> f64 {
        let mean_path =
            self.trees.iter().map(|t| path_length(&t.nodes, x)).sum::<f64>() / self.trees.len().max(1) as f64;
        let c = c_factor(self.subsample);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }

    /// Raw score rescaled so the training median maps to 0.
    pub fn calibrate(&self, raw: f64) -> f64 {
        let m = self.calibration_median;
        if m >= 1.0 {
            return 0.0;
        }
        ((raw - m) / (1.0 - m)).clamp(0.0, 1.0)
    }

    pub fn calibration_median(&self) -> f64 {
        self.calibration_median
    }

    pub fn training_vectors(&self) -> usize {
        self.training_vectors
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

fn grow(
    data: &[FeatureVector],
    rows: Vec<usize>,
    depth: usize,
    limit: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<Node>,
) -> usize {
    let idx = nodes.len();
    if depth >= limit || rows.len() <= 1 {
        nodes.push(Node::Leaf { size: rows.len() });
        return idx;
    }

    // Only features that still vary inside this node can split it.
    let ranges: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                let v = data[r].get(f);
                (lo.min(v), hi.max(v))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if ranges.is_empty() {
        nodes.push(Node::Leaf { size: rows.len() });
        return idx;
    }

    let (feature, lo, hi) = ranges[rng.gen_range(0..ranges.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.into_iter().partition(|&r| data[r].get(feature) < threshold);

    nodes.push(Node::Leaf { size: 0 });
    let left = grow(data, left_rows, depth + 1, limit, rng, nodes);
    let right = grow(data, right_rows, depth + 1, limit, rng, nodes);
    nodes[idx] = Node::Split {
        feature,
        threshold,
        left,
        right,
    };
    idx
}

fn path_length(nodes: &[Node], x: &FeatureVector) -> f64 {
    let mut idx = 0;
    let mut depth = 0.0;
    while let Some(node) = nodes.get(idx) {
        match node {
            Node::Leaf { size } => return depth + c_factor(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                idx = if x.get(*feature) < *threshold { *left } else { *right };
                depth += 1.0;
            }
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::FEATURE_COUNT;

    fn normal_cloud(n: usize) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                let mut v = [0.0; FEATURE_COUNT];
                v[0] = 4.0 + rng.gen_range(-1.0..1.0);
                v[1] = 1.0;
                v[2] = 1.5 + rng.gen_range(-0.5..0.5);
                v[3] = 0.2 + rng.gen_range(-0.1..0.1);
                v[4] = 0.05 + rng.gen_range(-0.03..0.03);
                v[5] = 0.3 + rng.gen_range(-0.2..0.2);
                v[6] = 3.3 + rng.gen_range(-0.1..0.1);
                v[7] = rng.gen_range(0.0..0.66);
                v[8] = rng.gen_range(-0.3..0.3);
                v[10] = 1.0;
                FeatureVector(v)
            })
            .collect()
    }

    fn attack() -> FeatureVector {
        let mut v = [0.0; FEATURE_COUNT];
        v[0] = 22.0;
        v[1] = 3.0;
        v[2] = 0.0;
        v[3] = 0.9;
        v[4] = 0.4;
        v[5] = 3.0;
        v[6] = 2.0;
        v[8] = 0.9;
        v[9] = 0.5;
        v[10] = 0.2;
        FeatureVector(v)
    }

    #[test]
    fn test_c_factor() {
        assert_eq!(c_factor(1), 0.0);
        assert_eq!(c_factor(2), 1.0);
        // c(256) ~ 10.24
        assert!((c_factor(256) - 10.24).abs() < 0.05);
    }

    #[test]
    fn test_outlier_scores_above_normal() {
        let data = normal_cloud(400);
        let forest = IsolationForest::fit(&data, 100, 256, 42).unwrap();
        let normal = forest.calibrate(forest.raw_score(&data[0]));
        let outlier = forest.calibrate(forest.raw_score(&attack()));
        assert!(outlier > 0.25, "outlier scored {}", outlier);
        assert!(normal < outlier);
        assert!(forest.raw_score(&attack()) > forest.calibration_median());
        assert!((0.0..=1.0).contains(&normal));
    }

    #[test]
    fn test_seeded_fit_is_deterministic() {
        let data = normal_cloud(100);
        let a = IsolationForest::fit(&data, 20, 64, 42).unwrap();
        let b = IsolationForest::fit(&data, 20, 64, 42).unwrap();
        assert_eq!(a.raw_score(&attack()), b.raw_score(&attack()));
    }

    #[test]
    fn test_json_roundtrip_preserves_scores() {
        let data = normal_cloud(60);
        let forest = IsolationForest::fit(&data, 10, 32, 1).unwrap();
        let json = serde_json::to_string(&forest).unwrap();
        let back: IsolationForest = serde_json::from_str(&json).unwrap();
        assert_eq!(forest.raw_score(&attack()), back.raw_score(&attack()));
        assert_eq!(back.calibration_median(), forest.calibration_median());
    }

    #[test]
    fn test_rejects_tiny_training_set() {
        assert!(matches!(
            IsolationForest::fit(&[FeatureVector::zeros()], 10, 8, 1),
            Err(ForestError::TooFewVectors(1))
        ));
    }

    #[test]
    fn test_identical_vectors_do_not_panic() {
        let data = vec![FeatureVector::zeros(); 20];
        let forest = IsolationForest::fit(&data, 5, 16, 3).unwrap();
        let s = forest.calibrate(forest.raw_score(&FeatureVector::zeros()));
        assert!((0.0..=1.0).contains(&s));
    }
}
