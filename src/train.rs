//! Top-level training driver.
//!
//! Drives one run end to end: validate the configuration, resolve the work
//! directory, load the cache metadata, plan feature ownership, prime the
//! worker pool with the welcome blob, initialize or restore the model, loop
//! the boosting iterations with checkpointing, and finalize.
//!
//! Data loss is the only recovered failure: the driver rolls back to the
//! most recent complete checkpoint, re-emits `RestoreCheckpoint`, and replays
//! iterations from there. Every other error aborts the run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::cache::{CacheMetadata, DatasetSource};
use crate::checkpoint::{
    add_snapshot, checkpoint_dir, checkpoint_root, greatest_complete_snapshot, model_file,
    restore_manager_checkpoint, should_create_checkpoint, CheckpointMeta, TMP_DIR,
};
use crate::config::{Deployment, TrainingConfig};
use crate::distribute::{AbstractManager, ManagerFactory};
use crate::emitters::{
    emit_create_checkpoint, emit_get_label_statistics, emit_restore_checkpoint,
    emit_set_initial_predictions, emit_start_training,
};
use crate::error::{Result, TrainError};
use crate::iteration::{run_iteration, training_log};
use crate::loss::Loss;
use crate::model::GradientBoostedModel;
use crate::monitoring::{Monitoring, Stage};
use crate::ownership::assign_features_to_workers;
use crate::protocol::{TrainingEvaluation, WorkerWelcome};
use crate::stats::LabelStatistics;

/// Train a gradient boosted trees model over a pool of feature-sharded
/// workers.
pub fn train(
    config: &TrainingConfig,
    dataset: &DatasetSource,
    deployment: &Deployment,
    factory: &dyn ManagerFactory,
) -> Result<GradientBoostedModel> {
    config.validate()?;
    deployment.validate()?;

    // Everything above runs before any file is touched, so a rejected run
    // leaves no trace on disk.
    let cache_path = match dataset {
        DatasetSource::InMemory(_) => {
            return Err(TrainError::unsupported(
                "the distributed gradient boosted trees learner does not train \
                 from in-memory datasets. If the dataset is small, use a \
                 single-machine learner; if it is large, build a dataset cache \
                 and pass its path",
            ));
        }
        DatasetSource::Cache(path) => {
            if path.as_os_str().is_empty() {
                return Err(TrainError::config("the dataset cache path is empty"));
            }
            path.clone()
        }
    };

    let work_directory = resolve_work_directory(deployment);
    initialize_directory_structure(&work_directory)?;

    // The cache itself was built by the external cache builder; a metadata
    // descriptor that does not load is fatal here.
    let metadata = CacheMetadata::load(&cache_path)?;
    let loss = Loss::new(config.resolved_loss()?, config.task)?;
    let ownership = assign_features_to_workers(
        config,
        &config.features,
        deployment.num_workers,
        &metadata,
    )?;

    let welcome = WorkerWelcome {
        work_directory: work_directory.clone(),
        cache_path,
        config: config.clone(),
        loss: config.resolved_loss()?,
        owned_features: ownership.worker_to_features.clone(),
    };
    let mut manager = factory.create(&welcome, deployment.parallel_execution_per_worker)?;
    let manager = manager.as_mut();

    let mut monitoring = Monitoring::new();
    emit_start_training(manager, &mut monitoring)?;

    // Initialize a new model, or resume from the latest complete snapshot.
    let mut iter_idx: u32 = 0;
    let mut minimum_iter_for_new_checkpoint: u32 = 0;
    let mut last_checkpoint_idx = greatest_complete_snapshot(&work_directory, None)?;
    let mut model;
    let mut label_statistics;

    if let Some(snapshot) = last_checkpoint_idx {
        info!("resume training from iteration #{snapshot}");
        iter_idx = snapshot;
        minimum_iter_for_new_checkpoint = snapshot + 1;
        let (restored, meta) = restore_manager_checkpoint(&work_directory, snapshot)?;
        model = restored;
        label_statistics = meta.label_statistics.clone();
        emit_restore_checkpoint(
            manager,
            &mut monitoring,
            snapshot,
            meta.num_shards,
            model.num_trees_per_iter as u32,
        )?;
    } else {
        model = GradientBoostedModel {
            num_trees_per_iter: loss.num_trees_per_iter(),
            secondary_metric_names: loss.secondary_metric_names(),
            ..Default::default()
        };

        info!("asking one worker for the initial label statistics");
        label_statistics = emit_get_label_statistics(manager, &mut monitoring)?;

        let initial_predictions = loss.initial_predictions(&label_statistics)?;
        model.initial_predictions = initial_predictions.clone();
        emit_set_initial_predictions(manager, &mut monitoring, &initial_predictions)?;
    }

    let mut evaluation = TrainingEvaluation {
        loss: f64::NAN,
        metrics: Vec::new(),
    };
    let mut time_last_checkpoint = Instant::now();

    info!("start training");
    while iter_idx < config.num_trees {
        if iter_idx >= minimum_iter_for_new_checkpoint
            && should_create_checkpoint(iter_idx, time_last_checkpoint, config)
            && last_checkpoint_idx.map_or(true, |last| iter_idx > last)
        {
            time_last_checkpoint = Instant::now();
            create_checkpoint(
                iter_idx,
                &model,
                &work_directory,
                &label_statistics,
                manager,
                &mut monitoring,
            )?;
            last_checkpoint_idx = Some(iter_idx);
        }

        match run_iteration(
            iter_idx,
            config,
            &loss,
            &config.features,
            &ownership,
            &mut model,
            &mut evaluation,
            manager,
            &mut monitoring,
        ) {
            Ok(()) => {
                iter_idx += 1;
            }
            Err(err) if err.is_data_loss() => {
                warn!("iteration issue: {err}");
                warn!("re-synchronizing the workers");

                // TODO(restart): when no snapshot exists, restart training
                // from scratch without rebooting the driver.
                let resync_iter_idx = greatest_complete_snapshot(&work_directory, None)?
                    .ok_or_else(|| {
                        TrainError::data_loss(
                            "a worker lost its state and no checkpoint exists to \
                             restore from",
                        )
                    })?;

                iter_idx = resync_iter_idx;
                let (restored, meta) =
                    restore_manager_checkpoint(&work_directory, resync_iter_idx)?;
                model = restored;
                label_statistics = meta.label_statistics.clone();
                emit_restore_checkpoint(
                    manager,
                    &mut monitoring,
                    resync_iter_idx,
                    meta.num_shards,
                    model.num_trees_per_iter as u32,
                )?;
                minimum_iter_for_new_checkpoint = resync_iter_idx + 1;
            }
            Err(err) => return Err(err),
        }
    }

    if last_checkpoint_idx.map_or(true, |last| iter_idx > last) {
        create_checkpoint(
            iter_idx,
            &model,
            &work_directory,
            &label_statistics,
            manager,
            &mut monitoring,
        )?;
    }

    info!(
        "training done. final model: {}",
        training_log(&model, &evaluation, config, &monitoring)
    );

    manager.done()?;
    Ok(model)
}

/// Fresh work subdirectory under the cache path, unless the run resumes an
/// earlier one.
fn resolve_work_directory(deployment: &Deployment) -> PathBuf {
    if deployment.try_resume_training {
        deployment.cache_path.clone()
    } else {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros());
        deployment
            .cache_path
            .join(format!("{:08x}_{micros}", rand::random::<u32>()))
    }
}

fn initialize_directory_structure(work_directory: &Path) -> Result<()> {
    for dir in [
        work_directory.to_path_buf(),
        checkpoint_root(work_directory),
        work_directory.join(TMP_DIR),
    ] {
        fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;
    }
    Ok(())
}

/// Create the checkpoint of `iter_idx`: model file, prediction shards via
/// sharded dispatch, metadata, then the snapshot-index append that commits
/// the checkpoint.
fn create_checkpoint(
    iter_idx: u32,
    model: &GradientBoostedModel,
    work_directory: &Path,
    label_statistics: &LabelStatistics,
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::CreateCheckpoint);
    info!("start creating checkpoint for iteration {iter_idx}");
    let begin = Instant::now();

    // More shards spread the cost across workers but raise the chance of
    // hitting an interrupted one.
    let num_shards = (manager.num_workers() / 4).max(1) as u32;

    let dir = checkpoint_dir(work_directory, iter_idx);
    fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;
    model.save(&model_file(&dir))?;

    emit_create_checkpoint(
        manager,
        iter_idx,
        label_statistics.count(),
        num_shards,
        work_directory,
    )?;

    CheckpointMeta {
        label_statistics: label_statistics.clone(),
        num_shards,
    }
    .save(&dir)?;
    add_snapshot(work_directory, iter_idx)?;

    info!(
        "checkpoint created in {:.2?} for iteration {iter_idx}",
        begin.elapsed()
    );
    monitoring.end_stage(Stage::CreateCheckpoint);
    Ok(())
}
