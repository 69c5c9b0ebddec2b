//! End-to-end distributed training scenarios over the in-process transport.

use std::path::PathBuf;

use tempfile::TempDir;

use treeline::cache::build_cache;
use treeline::distribute::{ManagerFactory, MultiThreadFactory, WorkerHandler};
use treeline::protocol::{RequestEnvelope, WorkerReply, WorkerRequest, WorkerWelcome};
use treeline::testing::{synthetic_binary, synthetic_multiclass, synthetic_regression};
use treeline::worker::TrainingWorker;
use treeline::{
    assign_features_to_workers, train, CacheMetadata, DatasetSource, Deployment, RawColumn,
    RawDataset, Task, TrainError, TrainingConfig,
};

/// Build a cache for `dataset` and return `(cache_dir, run_dir)` rooted in
/// `dir`. The run directory doubles as the work directory by resuming, which
/// keeps checkpoint locations predictable for assertions.
fn setup(dir: &TempDir, dataset: &RawDataset) -> (PathBuf, PathBuf) {
    let cache_dir = dir.path().join("cache");
    let run_dir = dir.path().join("run");
    build_cache(dataset, &cache_dir).unwrap();
    (cache_dir, run_dir)
}

fn deployment(run_dir: &PathBuf, num_workers: usize) -> Deployment {
    let mut deployment = Deployment::new(run_dir.clone(), num_workers);
    deployment.try_resume_training = true;
    deployment
}

fn checkpoint_indices(run_dir: &PathBuf) -> Vec<u32> {
    let mut indices: Vec<u32> = std::fs::read_dir(run_dir.join("checkpoint"))
        .unwrap()
        .filter_map(|entry| entry.unwrap().file_name().to_str()?.parse().ok())
        .collect();
    indices.sort_unstable();
    indices
}

// =============================================================================
// S1: binary classification with checkpoints and resume
// =============================================================================

#[test]
fn binary_classification_checkpoints_and_resumes() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_binary(200, 4, 11);
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        task: Task::Classification { num_classes: 2 },
        label: 0,
        features: vec![1, 2, 3, 4],
        num_trees: 50,
        max_depth: 3,
        checkpoint_interval_trees: 10,
        checkpoint_interval_seconds: -1,
        ..Default::default()
    };

    let model = train(
        &config,
        &DatasetSource::Cache(cache_dir.clone()),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();

    assert_eq!(model.num_trees_per_iter, 1);
    assert_eq!(model.trees.len(), 50);
    assert_eq!(model.training_logs.len(), 50);
    assert_eq!(checkpoint_indices(&run_dir), vec![10, 20, 30, 40, 50]);

    // All worker state is gone (fresh pool); resuming from the same work
    // directory returns the full 50-tree model without retraining.
    let resumed = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();
    assert_eq!(resumed.trees.len(), 50);
    assert_eq!(resumed, model);
}

// =============================================================================
// S2: regression on one worker
// =============================================================================

#[test]
fn regression_single_worker_owns_everything_and_improves() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_regression(150, 2, 5, 0.05);
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        label: 0,
        features: vec![1, 2],
        num_trees: 10,
        max_depth: 4,
        ..Default::default()
    };

    // The single worker owns the full feature set.
    let metadata = CacheMetadata::load(&cache_dir).unwrap();
    let ownership = assign_features_to_workers(&config, &config.features, 1, &metadata).unwrap();
    let mut owned = ownership.worker_to_features[0].clone();
    owned.sort_unstable();
    assert_eq!(owned, vec![1, 2]);
    assert_eq!(ownership.feature_to_workers[1], vec![0]);
    assert_eq!(ownership.feature_to_workers[2], vec![0]);

    let model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 1),
        &MultiThreadFactory,
    )
    .unwrap();

    assert_eq!(model.trees.len(), 10);
    let losses: Vec<f64> = model
        .training_logs
        .iter()
        .map(|entry| entry.training_loss)
        .collect();
    assert!(
        losses[0] > losses[1] && losses[1] > losses[2],
        "training loss should strictly decrease over the first 3 iterations: {losses:?}"
    );
}

// =============================================================================
// S3: three-class classification grows K=3 trees per iteration
// =============================================================================

#[test]
fn multiclass_grows_one_tree_per_class_per_iteration() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_multiclass(120, 2, 3, 9);
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        task: Task::Classification { num_classes: 3 },
        label: 0,
        features: vec![1, 2],
        num_trees: 6,
        max_depth: 3,
        ..Default::default()
    };

    let model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 3),
        &MultiThreadFactory,
    )
    .unwrap();

    assert_eq!(model.num_trees_per_iter, 3);
    assert_eq!(model.initial_predictions.len(), 3);
    assert_eq!(model.trees.len(), 3 * 6);
    assert_eq!(model.num_iters(), 6);
}

// =============================================================================
// S4 + data-loss idempotence: a worker restart mid-FindSplits
// =============================================================================

/// Wraps a [`TrainingWorker`] and simulates a process restart: at the first
/// `FindSplits` of the configured iteration it drops all volatile state and
/// raises `request_restart_iter`.
struct RestartingWorker {
    inner: TrainingWorker,
    welcome: WorkerWelcome,
    worker_idx: usize,
    fault_iter: u32,
    current_iter: Option<u32>,
    triggered: bool,
}

impl WorkerHandler for RestartingWorker {
    fn handle(&mut self, envelope: &RequestEnvelope) -> treeline::Result<WorkerReply> {
        if let WorkerRequest::StartNewIter { iter_idx, .. } = &envelope.request {
            self.current_iter = Some(*iter_idx);
        }
        if !self.triggered
            && self.current_iter == Some(self.fault_iter)
            && matches!(envelope.request, WorkerRequest::FindSplits { .. })
        {
            self.triggered = true;
            self.inner = TrainingWorker::new(self.welcome.clone(), self.worker_idx);
            return Ok(WorkerReply::restart_iter(
                self.worker_idx,
                envelope.request_id,
            ));
        }
        self.inner.handle(envelope)
    }
}

struct RestartingFactory {
    fault_iter: u32,
    faulty_worker: usize,
}

impl ManagerFactory for RestartingFactory {
    fn create(
        &self,
        welcome: &WorkerWelcome,
        parallel_execution_per_worker: usize,
    ) -> treeline::Result<Box<dyn treeline::AbstractManager>> {
        let handlers = (0..welcome.owned_features.len())
            .map(|worker_idx| {
                if worker_idx == self.faulty_worker {
                    Box::new(RestartingWorker {
                        inner: TrainingWorker::new(welcome.clone(), worker_idx),
                        welcome: welcome.clone(),
                        worker_idx,
                        fault_iter: self.fault_iter,
                        current_iter: None,
                        triggered: false,
                    }) as Box<dyn WorkerHandler>
                } else {
                    Box::new(TrainingWorker::new(welcome.clone(), worker_idx))
                        as Box<dyn WorkerHandler>
                }
            })
            .collect();
        Ok(Box::new(treeline::MultiThreadManager::new(
            handlers,
            parallel_execution_per_worker,
        )?))
    }
}

#[test]
fn worker_restart_mid_find_splits_recovers_from_checkpoint() {
    let fault_dir = TempDir::new().unwrap();
    let clean_dir = TempDir::new().unwrap();
    let dataset = synthetic_regression(100, 3, 21, 0.1);

    let config = TrainingConfig {
        label: 0,
        features: vec![1, 2, 3],
        num_trees: 10,
        max_depth: 3,
        checkpoint_interval_trees: 5,
        checkpoint_interval_seconds: -1,
        ..Default::default()
    };

    // Faulty run: worker 1 restarts during FindSplits of iteration 7, after
    // the checkpoint of iteration 5.
    let (cache_dir, run_dir) = setup(&fault_dir, &dataset);
    let faulty_model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &RestartingFactory {
            fault_iter: 7,
            faulty_worker: 1,
        },
    )
    .unwrap();
    assert_eq!(faulty_model.trees.len(), 10);

    // Failure-free run on the same data: the injected restart must be
    // invisible in the final model.
    let (cache_dir, run_dir) = setup(&clean_dir, &dataset);
    let clean_model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();
    assert_eq!(faulty_model, clean_model);
}

#[test]
fn data_loss_without_checkpoint_is_a_descriptive_error() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_regression(60, 2, 33, 0.1);
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        label: 0,
        features: vec![1, 2],
        num_trees: 5,
        checkpoint_interval_trees: -1,
        checkpoint_interval_seconds: -1,
        ..Default::default()
    };

    let err = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &RestartingFactory {
            fault_iter: 2,
            faulty_worker: 0,
        },
    )
    .unwrap_err();
    assert!(err.is_data_loss());
    assert!(err.to_string().contains("no checkpoint"));
}

// =============================================================================
// Checkpoint round-trip: resume equals straight-through training
// =============================================================================

#[test]
fn resumed_training_matches_uninterrupted_training() {
    let resumed_dir = TempDir::new().unwrap();
    let straight_dir = TempDir::new().unwrap();
    let dataset = synthetic_regression(80, 2, 77, 0.1);

    let base_config = TrainingConfig {
        label: 0,
        features: vec![1, 2],
        max_depth: 3,
        checkpoint_interval_trees: 5,
        checkpoint_interval_seconds: -1,
        ..Default::default()
    };

    // First leg: 5 iterations, ending in a final checkpoint at 5.
    let (cache_dir, run_dir) = setup(&resumed_dir, &dataset);
    let first_leg = TrainingConfig {
        num_trees: 5,
        ..base_config.clone()
    };
    train(
        &first_leg,
        &DatasetSource::Cache(cache_dir.clone()),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();

    // Second leg: a fresh driver resumes at 5 and continues to 10.
    let full = TrainingConfig {
        num_trees: 10,
        ..base_config.clone()
    };
    let resumed_model = train(
        &full,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();

    // Reference: the same 10 iterations without any restart.
    let (cache_dir, run_dir) = setup(&straight_dir, &dataset);
    let straight_model = train(
        &full,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();

    assert_eq!(resumed_model, straight_model);
}

// =============================================================================
// Termination: iterations without valid splits still append stumps
// =============================================================================

#[test]
fn constant_labels_yield_stumps_but_complete_iterations() {
    let dir = TempDir::new().unwrap();
    let dataset = RawDataset {
        columns: vec![
            RawColumn::Numerical(vec![3.0; 40]),
            RawColumn::Numerical((0..40).map(|i| i as f32).collect()),
            RawColumn::Boolean((0..40).map(|i| i % 2 == 0).collect()),
        ],
    };
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        label: 0,
        features: vec![1, 2],
        num_trees: 3,
        max_depth: 3,
        ..Default::default()
    };

    let model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap();

    // Every iteration still appends its tree and records a log entry, even
    // though no split is ever valid.
    assert_eq!(model.trees.len(), 3);
    assert_eq!(model.training_logs.len(), 3);
    for tree in &model.trees {
        assert_eq!(tree.num_nodes(), 1, "constant labels should give stumps");
    }
    for entry in &model.training_logs {
        assert!(entry.training_loss.is_finite());
    }
}

// =============================================================================
// S5 / S6: rejected configurations
// =============================================================================

#[test]
fn in_memory_dataset_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_regression(10, 2, 1, 0.0);
    let run_dir = dir.path().join("run");

    let config = TrainingConfig {
        label: 0,
        features: vec![1, 2],
        ..Default::default()
    };
    let err = train(
        &config,
        &DatasetSource::InMemory(dataset),
        &deployment(&run_dir, 2),
        &MultiThreadFactory,
    )
    .unwrap_err();
    assert!(matches!(err, TrainError::Unsupported { .. }));
    assert!(!run_dir.exists());
}

#[test]
fn empty_cache_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        label: 0,
        features: vec![1],
        ..Default::default()
    };
    let err = train(
        &config,
        &DatasetSource::Cache(PathBuf::new()),
        &deployment(&dir.path().join("run"), 2),
        &MultiThreadFactory,
    )
    .unwrap_err();
    assert!(matches!(err, TrainError::Config { .. }));
}

// =============================================================================
// Iteration monotonicity across a full run
// =============================================================================

#[test]
fn model_grows_k_trees_per_iteration() {
    let dir = TempDir::new().unwrap();
    let dataset = synthetic_binary(90, 3, 17);
    let (cache_dir, run_dir) = setup(&dir, &dataset);

    let config = TrainingConfig {
        task: Task::Classification { num_classes: 2 },
        label: 0,
        features: vec![1, 2, 3],
        num_trees: 7,
        max_depth: 2,
        ..Default::default()
    };

    let model = train(
        &config,
        &DatasetSource::Cache(cache_dir),
        &deployment(&run_dir, 3),
        &MultiThreadFactory,
    )
    .unwrap();

    assert_eq!(model.trees.len(), 7);
    for (idx, entry) in model.training_logs.iter().enumerate() {
        assert_eq!(entry.num_iters, idx as u32 + 1);
    }
}
