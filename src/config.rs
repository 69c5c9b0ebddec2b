//! Training and deployment configuration.
//!
//! [`TrainingConfig`] is created once per run and stays immutable for its
//! duration. [`Deployment`] describes where the run stores its state and how
//! large the worker pool is; the transport itself is abstracted behind
//! [`crate::distribute::ManagerFactory`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Learning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Regression,
    Classification { num_classes: u32 },
    Ranking,
}

/// Loss to optimize. `num_trees_per_iter` and the initial predictions derive
/// from the loss; see [`crate::loss::Loss`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Squared error, for regression.
    Squared,
    /// Binary cross-entropy, for two-class classification.
    BinaryLogLoss,
    /// Softmax cross-entropy, for multiclass classification.
    MultinomialLogLoss,
}

impl LossKind {
    /// Default loss for a task, mirroring the convention of selecting the
    /// loss from the label column when none is configured.
    pub fn default_for(task: Task) -> Result<Self> {
        match task {
            Task::Regression => Ok(Self::Squared),
            Task::Classification { num_classes: 2 } => Ok(Self::BinaryLogLoss),
            Task::Classification { num_classes } if num_classes > 2 => {
                Ok(Self::MultinomialLogLoss)
            }
            Task::Classification { num_classes } => Err(TrainError::config(format!(
                "classification requires at least 2 classes, got {num_classes}"
            ))),
            Task::Ranking => Err(TrainError::config(
                "ranking has no default loss; set TrainingConfig.loss explicitly",
            )),
        }
    }
}

/// Number of candidate features examined per (weak model, open node).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CandidateFeatures {
    /// Examine every input feature.
    All,
    /// Examine exactly this many features, sampled without replacement.
    Count(usize),
    /// Examine `ceil(ratio * num_features)` features.
    Ratio(f64),
}

/// Configuration of one distributed training run. Immutable once training
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning task.
    pub task: Task,
    /// Column index of the label in the dataset cache.
    pub label: usize,
    /// Column indices of the input features.
    pub features: Vec<usize>,
    /// Loss to optimize. `None` selects the default for the task.
    pub loss: Option<LossKind>,
    /// Shrinkage (learning rate) applied to every leaf.
    pub shrinkage: f32,
    /// Number of boosting iterations.
    pub num_trees: u32,
    /// Maximum tree depth. Depth 1 is a stump.
    pub max_depth: u32,
    /// Minimum number of training examples in each child of a split.
    pub min_examples: u64,
    /// Candidate feature sampling per (weak model, open node).
    pub candidate_features: CandidateFeatures,
    /// Minimum gain for a split to be applied.
    pub min_split_gain: f64,
    /// Create a checkpoint every this many trees. Negative disables the
    /// tree-count trigger.
    pub checkpoint_interval_trees: i64,
    /// Create a checkpoint when this much wall-clock time elapsed since the
    /// last one. Negative disables the time trigger.
    pub checkpoint_interval_seconds: i64,
    /// Seed of the training random generator. Per-iteration generators are
    /// derived from this seed and the iteration index only, so a replayed
    /// iteration is identical to its first run.
    pub seed: u64,
    /// Assign every feature to every worker. Debug only.
    pub replicate_features_to_all_workers: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            task: Task::Regression,
            label: 0,
            features: Vec::new(),
            loss: None,
            shrinkage: 0.1,
            num_trees: 100,
            max_depth: 6,
            min_examples: 5,
            candidate_features: CandidateFeatures::All,
            min_split_gain: 0.0,
            checkpoint_interval_trees: -1,
            checkpoint_interval_seconds: 600,
            seed: 42,
            replicate_features_to_all_workers: false,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration. Called by the training driver before any
    /// file is touched.
    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(TrainError::config("the feature list is empty"));
        }
        if self.features.contains(&self.label) {
            return Err(TrainError::config(format!(
                "label column {} is also listed as a feature",
                self.label
            )));
        }
        if self.num_trees == 0 {
            return Err(TrainError::config("num_trees must be > 0"));
        }
        if self.max_depth == 0 {
            return Err(TrainError::config("max_depth must be >= 1"));
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(TrainError::config(format!(
                "shrinkage must be in (0, 1], got {}",
                self.shrinkage
            )));
        }
        if self.min_examples == 0 {
            return Err(TrainError::config("min_examples must be >= 1"));
        }
        match self.candidate_features {
            CandidateFeatures::Count(n) => {
                if n == 0 || n > self.features.len() {
                    return Err(TrainError::config(format!(
                        "cannot sample {n} candidate features from {}",
                        self.features.len()
                    )));
                }
            }
            CandidateFeatures::Ratio(r) => {
                if !(r > 0.0 && r <= 1.0) {
                    return Err(TrainError::config(format!(
                        "candidate feature ratio must be in (0, 1], got {r}"
                    )));
                }
            }
            CandidateFeatures::All => {}
        }
        Ok(())
    }

    /// Loss actually optimized, applying the per-task default.
    pub fn resolved_loss(&self) -> Result<LossKind> {
        match self.loss {
            Some(kind) => Ok(kind),
            None => LossKind::default_for(self.task),
        }
    }
}

/// Where a training run stores its state and how large the worker pool is.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Root directory for the run: work directory, checkpoints, and scratch
    /// space all live under it. Must be non-empty.
    pub cache_path: PathBuf,
    /// Resume training from the checkpoints already present in `cache_path`
    /// instead of starting a fresh work subdirectory.
    pub try_resume_training: bool,
    /// Number of workers in the pool.
    pub num_workers: usize,
    /// In-flight request budget per worker, forwarded to the transport.
    pub parallel_execution_per_worker: usize,
    /// Transport-level working directory override. Must be unset; the driver
    /// derives the transport directory from `cache_path`.
    pub transport_working_directory: Option<PathBuf>,
}

impl Deployment {
    pub fn new(cache_path: impl Into<PathBuf>, num_workers: usize) -> Self {
        Self {
            cache_path: cache_path.into(),
            try_resume_training: false,
            num_workers,
            parallel_execution_per_worker: 10,
            transport_working_directory: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.cache_path.as_os_str().is_empty() {
            return Err(TrainError::config(
                "deployment.cache_path is empty; distributed training requires \
                 a cache directory",
            ));
        }
        if self.transport_working_directory.is_some() {
            return Err(TrainError::config(
                "deployment.transport_working_directory must be unset; use \
                 deployment.cache_path to choose the cache directory",
            ));
        }
        if self.num_workers == 0 {
            return Err(TrainError::config("deployment.num_workers must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TrainingConfig {
        TrainingConfig {
            task: Task::Regression,
            label: 0,
            features: vec![1, 2, 3],
            ..Default::default()
        }
    }

    #[test]
    fn default_config_rejects_empty_features() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn label_listed_as_feature_is_rejected() {
        let mut config = valid_config();
        config.features.push(config.label);
        assert!(config.validate().is_err());
    }

    #[test]
    fn candidate_count_bounds() {
        let mut config = valid_config();
        config.candidate_features = CandidateFeatures::Count(3);
        assert!(config.validate().is_ok());
        config.candidate_features = CandidateFeatures::Count(4);
        assert!(config.validate().is_err());
        config.candidate_features = CandidateFeatures::Ratio(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_losses() {
        assert_eq!(
            LossKind::default_for(Task::Regression).unwrap(),
            LossKind::Squared
        );
        assert_eq!(
            LossKind::default_for(Task::Classification { num_classes: 2 }).unwrap(),
            LossKind::BinaryLogLoss
        );
        assert_eq!(
            LossKind::default_for(Task::Classification { num_classes: 5 }).unwrap(),
            LossKind::MultinomialLogLoss
        );
        assert!(LossKind::default_for(Task::Ranking).is_err());
    }

    #[test]
    fn deployment_rejects_empty_cache_path() {
        let deployment = Deployment::new("", 2);
        assert!(deployment.validate().is_err());
    }

    #[test]
    fn deployment_rejects_transport_override() {
        let mut deployment = Deployment::new("/tmp/run", 2);
        deployment.transport_working_directory = Some("/tmp/other".into());
        assert!(deployment.validate().is_err());
    }
}
