//! The accumulating gradient boosted trees model and its on-disk payload.
//!
//! The model grows monotonically: the iteration driver appends `K` trees and
//! one training-log entry per successful iteration, and nothing is ever
//! removed. Persistence goes through a version-tagged postcard payload so the
//! format can evolve by adding variants.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::tree::Tree;

/// One line of the training log, recorded at the end of each iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogEntry {
    /// Number of completed boosting iterations.
    pub num_iters: u32,
    pub training_loss: f64,
    pub training_secondary_metrics: Vec<f64>,
    /// Reserved; validation evaluation is not implemented.
    pub validation_secondary_metrics: Vec<f64>,
}

/// The gradient boosted trees ensemble under construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedModel {
    /// All grown trees, `num_trees_per_iter` per iteration, grouped by
    /// iteration then by weak model index.
    pub trees: Vec<Tree>,
    /// Constant predictions before the first tree, one per weak model.
    pub initial_predictions: Vec<f32>,
    /// Trees grown per boosting iteration (1, or the class count).
    pub num_trees_per_iter: usize,
    pub secondary_metric_names: Vec<String>,
    pub training_logs: Vec<TrainingLogEntry>,
}

/// Version-tagged serialized form of [`GradientBoostedModel`].
#[derive(Debug, Serialize, Deserialize)]
enum ModelPayload {
    V1(GradientBoostedModel),
}

impl GradientBoostedModel {
    /// Number of completed boosting iterations.
    pub fn num_iters(&self) -> usize {
        if self.num_trees_per_iter == 0 {
            0
        } else {
            self.trees.len() / self.num_trees_per_iter
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = postcard::to_allocvec(&ModelPayload::V1(self.clone()))?;
        fs::write(path, raw).map_err(|e| TrainError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| TrainError::io(path, e))?;
        let ModelPayload::V1(model) = postcard::from_bytes(&raw)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::GradStats;
    use crate::tree::{LeafSetter, Split, SplitCondition, TreeBuilder};
    use tempfile::TempDir;

    fn sample_tree() -> Tree {
        let mut builder = TreeBuilder::new(LeafSetter::new(0.1));
        builder.set_root_stats(&GradStats {
            count: 10,
            sum_gradient: 1.0,
            sum_hessian: 10.0,
        });
        builder
            .apply_splits(
                &[Split {
                    feature: Some(2),
                    condition: SplitCondition::HigherThan { threshold: 1.0 },
                    gain: 0.7,
                    worker: 0,
                    negative: GradStats {
                        count: 5,
                        sum_gradient: 2.0,
                        sum_hessian: 5.0,
                    },
                    positive: GradStats {
                        count: 5,
                        sum_gradient: -1.0,
                        sum_hessian: 5.0,
                    },
                }],
                0.0,
            )
            .unwrap();
        builder.finish()
    }

    #[test]
    fn num_iters_counts_tree_groups() {
        let mut model = GradientBoostedModel {
            num_trees_per_iter: 3,
            ..Default::default()
        };
        assert_eq!(model.num_iters(), 0);
        for _ in 0..6 {
            model.trees.push(sample_tree());
        }
        assert_eq!(model.num_iters(), 2);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model");

        let model = GradientBoostedModel {
            trees: vec![sample_tree(), sample_tree()],
            initial_predictions: vec![0.5],
            num_trees_per_iter: 1,
            secondary_metric_names: vec!["rmse".to_string()],
            training_logs: vec![TrainingLogEntry {
                num_iters: 1,
                training_loss: 0.25,
                training_secondary_metrics: vec![0.5],
                validation_secondary_metrics: vec![0.0],
            }],
        };
        model.save(&path).unwrap();
        let reloaded = GradientBoostedModel::load(&path).unwrap();
        assert_eq!(model, reloaded);
    }
}
