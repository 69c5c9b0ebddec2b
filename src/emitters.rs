//! Protocol emitters: one function per worker message type.
//!
//! Every emitter is a fan-out over the asynchronous request primitive
//! followed by a fan-in that drains exactly as many replies as it sent, and
//! brackets its body in monitoring stage timings. Three shapes exist:
//!
//! - **broadcast/ack**: send to every worker, collect every ack. A reply
//!   carrying `request_restart_iter` is contagious: the remaining replies are
//!   drained and the distinguished data-loss error is returned.
//! - **single worker query**: the transport's round-robin blocking request.
//! - **sharded dispatch**: `S` requests without worker binding; a shard
//!   refused by a restarted worker is reissued to the round-robin next
//!   worker, bounded by `3 * S` total retries.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::checkpoint::{checkpoint_dir, prediction_shard_name, shard_example_range};
use crate::distribute::AbstractManager;
use crate::error::{Result, TrainError};
use crate::monitoring::{Monitoring, Stage};
use crate::protocol::{
    FeaturesPerWeakModel, RequestEnvelope, TrainingEvaluation, WorkerReply, WorkerReplyBody,
    WorkerRequest,
};
use crate::stats::{GradStats, LabelStatistics};
use crate::tree::{merge_best_splits, Split};

/// Drain and discard `count` pending asynchronous replies so the queue stays
/// matched with the requests already sent.
fn skip_async_replies(manager: &mut dyn AbstractManager, count: usize) -> Result<()> {
    for _ in 0..count {
        manager.next_async_reply()?;
    }
    Ok(())
}

fn data_loss_from(reply: &WorkerReply) -> TrainError {
    TrainError::data_loss(format!(
        "worker {} lost its state and requested an iteration restart",
        reply.worker
    ))
}

fn unexpected(expected: &'static str, reply: &WorkerReply) -> TrainError {
    TrainError::protocol(expected, reply.body.variant_name())
}

/// Broadcast one request per worker and drain one reply per worker.
/// `request_for` builds the per-worker request; `check_restart` enables the
/// contagious data-loss handling; `on_reply` consumes each reply.
fn broadcast(
    manager: &mut dyn AbstractManager,
    request_for: impl Fn(usize) -> WorkerRequest,
    check_restart: bool,
    mut on_reply: impl FnMut(WorkerReply) -> Result<()>,
) -> Result<()> {
    let num_workers = manager.num_workers();
    for worker in 0..num_workers {
        manager.async_request(RequestEnvelope::new(request_for(worker)), Some(worker))?;
    }
    for reply_idx in 0..num_workers {
        let reply = manager.next_async_reply()?;
        if check_restart && reply.request_restart_iter {
            skip_async_replies(manager, num_workers - reply_idx - 1)?;
            return Err(data_loss_from(&reply));
        }
        on_reply(reply)?;
    }
    Ok(())
}

/// Ask every worker to load its dataset cache shards. Loading dominates the
/// wall clock of this stage, so progress is logged at most once per minute.
pub fn emit_start_training(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::StartTraining);
    let begin = Instant::now();
    let num_workers = manager.num_workers();

    let mut loaded = 0usize;
    let mut last_progress_log = Instant::now();
    broadcast(
        manager,
        |_| WorkerRequest::StartTraining,
        false,
        |reply| {
            if !matches!(reply.body, WorkerReplyBody::StartTraining) {
                return Err(unexpected("StartTraining", &reply));
            }
            loaded += 1;
            if last_progress_log.elapsed() >= Duration::from_secs(60) {
                last_progress_log = Instant::now();
                info!(
                    "loading dataset in workers {loaded} / {num_workers} \
                     [duration: {:.2?}]",
                    begin.elapsed()
                );
            }
            Ok(())
        },
    )?;
    info!("workers ready to train in {:.2?}", begin.elapsed());
    monitoring.end_stage(Stage::StartTraining);
    Ok(())
}

/// Query one worker for the label statistics of the training dataset.
pub fn emit_get_label_statistics(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
) -> Result<LabelStatistics> {
    monitoring.begin_stage(Stage::GetLabelStatistics);
    let reply = manager.blocking_request(WorkerRequest::GetLabelStatistics)?;
    let WorkerReplyBody::GetLabelStatistics { statistics } = reply.body else {
        return Err(unexpected("GetLabelStatistics", &reply));
    };
    monitoring.end_stage(Stage::GetLabelStatistics);
    Ok(statistics)
}

/// Install the constant predictions of the empty model on every worker.
pub fn emit_set_initial_predictions(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    initial_predictions: &[f32],
) -> Result<()> {
    monitoring.begin_stage(Stage::SetInitialPredictions);
    broadcast(
        manager,
        |_| WorkerRequest::SetInitialPredictions {
            initial_predictions: initial_predictions.to_vec(),
        },
        false,
        |reply| match reply.body {
            WorkerReplyBody::SetInitialPredictions => Ok(()),
            _ => Err(unexpected("SetInitialPredictions", &reply)),
        },
    )?;
    monitoring.end_stage(Stage::SetInitialPredictions);
    Ok(())
}

/// Open iteration `iter_idx` on every worker and collect the per-weak-model
/// root statistics. All workers report identical statistics; the first reply
/// wins and the rest are only checked for the restart flag.
pub fn emit_start_new_iter(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    iter_idx: u32,
    iter_uid: u64,
    seed: u64,
) -> Result<Vec<GradStats>> {
    monitoring.begin_stage(Stage::StartNewIter);
    let mut root_stats: Vec<GradStats> = Vec::new();
    broadcast(
        manager,
        |_| WorkerRequest::StartNewIter {
            iter_idx,
            iter_uid,
            seed,
        },
        true,
        |reply| {
            let WorkerReplyBody::StartNewIter { root_stats: stats } = reply.body else {
                return Err(unexpected("StartNewIter", &reply));
            };
            if root_stats.is_empty() {
                root_stats = stats;
            }
            Ok(())
        },
    )?;
    monitoring.end_stage(Stage::StartNewIter);
    Ok(root_stats)
}

/// Fan the sampled candidate features out to their owning workers and merge
/// the returned proposals into the best split per (weak model, open node).
pub fn emit_find_splits(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    features_per_worker: &[FeaturesPerWeakModel],
    num_open_per_weak_model: &[usize],
) -> Result<Vec<Vec<Split>>> {
    monitoring.begin_stage(Stage::FindSplits);
    let begin = Instant::now();
    let num_workers = manager.num_workers();
    for worker in 0..num_workers {
        manager.async_request(
            RequestEnvelope::new(WorkerRequest::FindSplits {
                features_per_weak_model: features_per_worker[worker].clone(),
            }),
            Some(worker),
        )?;
    }

    let mut merged: Vec<Vec<Split>> = num_open_per_weak_model
        .iter()
        .map(|&num_open| vec![Split::none(); num_open])
        .collect();
    for reply_idx in 0..num_workers {
        let reply = manager.next_async_reply()?;
        if reply.request_restart_iter {
            skip_async_replies(manager, num_workers - reply_idx - 1)?;
            return Err(data_loss_from(&reply));
        }
        monitoring.find_split_reply_time(reply.worker, begin.elapsed());
        let WorkerReplyBody::FindSplits {
            splits_per_weak_model,
        } = reply.body
        else {
            return Err(unexpected("FindSplits", &reply));
        };
        if splits_per_weak_model.len() != merged.len() {
            return Err(TrainError::transport(format!(
                "worker replied with {} weak models, expected {}",
                splits_per_weak_model.len(),
                merged.len()
            )));
        }
        for (proposals, best) in splits_per_weak_model.iter().zip(merged.iter_mut()) {
            merge_best_splits(proposals, best)?;
        }
    }
    monitoring.end_stage(Stage::FindSplits);
    Ok(merged)
}

/// Send each active worker the subset of chosen splits it owns. Returns the
/// active worker set of the layer.
pub fn emit_evaluate_splits(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    splits_per_weak_model: &[Vec<Split>],
    active_workers: &BTreeMap<usize, Vec<Vec<usize>>>,
) -> Result<Vec<usize>> {
    monitoring.begin_stage(Stage::EvaluateSplits);
    let active_worker_idxs: Vec<usize> = active_workers.keys().copied().collect();

    for (&worker, split_idxs_per_weak_model) in active_workers {
        let request_splits: Vec<Vec<(usize, Split)>> = split_idxs_per_weak_model
            .iter()
            .enumerate()
            .map(|(weak_idx, split_idxs)| {
                split_idxs
                    .iter()
                    .map(|&split_idx| {
                        (split_idx, splits_per_weak_model[weak_idx][split_idx].clone())
                    })
                    .collect()
            })
            .collect();
        manager.async_request(
            RequestEnvelope::new(WorkerRequest::EvaluateSplits {
                splits_per_weak_model: request_splits,
            }),
            Some(worker),
        )?;
    }

    for reply_idx in 0..active_worker_idxs.len() {
        let reply = manager.next_async_reply()?;
        if reply.request_restart_iter {
            skip_async_replies(manager, active_worker_idxs.len() - reply_idx - 1)?;
            return Err(data_loss_from(&reply));
        }
        if !matches!(reply.body, WorkerReplyBody::EvaluateSplits) {
            return Err(unexpected("EvaluateSplits", &reply));
        }
    }
    monitoring.end_stage(Stage::EvaluateSplits);
    Ok(active_worker_idxs)
}

/// Broadcast the chosen splits plus the active worker list, so every worker
/// advances its example→node maps from the shared evaluations.
pub fn emit_share_splits(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    splits_per_weak_model: &[Vec<Split>],
    active_workers: &[usize],
) -> Result<()> {
    monitoring.begin_stage(Stage::ShareSplits);
    broadcast(
        manager,
        |_| WorkerRequest::ShareSplits {
            splits_per_weak_model: splits_per_weak_model.to_vec(),
            active_workers: active_workers.to_vec(),
        },
        true,
        |reply| match reply.body {
            WorkerReplyBody::ShareSplits => Ok(()),
            _ => Err(unexpected("ShareSplits", &reply)),
        },
    )?;
    monitoring.end_stage(Stage::ShareSplits);
    Ok(())
}

/// Close the iteration on every worker; worker zero computes the training
/// loss and secondary metrics.
pub fn emit_end_iter(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    iter_idx: u32,
) -> Result<TrainingEvaluation> {
    monitoring.begin_stage(Stage::EndIter);
    let mut evaluation: Option<TrainingEvaluation> = None;
    broadcast(
        manager,
        |worker| WorkerRequest::EndIter {
            iter_idx,
            compute_training_loss: worker == 0,
        },
        true,
        |reply| {
            let WorkerReplyBody::EndIter {
                evaluation: worker_evaluation,
            } = reply.body
            else {
                return Err(unexpected("EndIter", &reply));
            };
            if let Some(worker_evaluation) = worker_evaluation {
                evaluation = Some(worker_evaluation);
            }
            Ok(())
        },
    )?;
    let evaluation = evaluation
        .ok_or_else(|| TrainError::protocol("EndIter with a training evaluation", "EndIter"))?;
    monitoring.end_stage(Stage::EndIter);
    Ok(evaluation)
}

/// Dispatch the `num_shards` prediction-shard requests of a checkpoint and
/// rename each returned temp file into the checkpoint directory. Shards are
/// not bound to workers; a worker that lost its prediction state is skipped
/// by reissuing its shard to the next worker, at most `3 * num_shards` times.
pub fn emit_create_checkpoint(
    manager: &mut dyn AbstractManager,
    iter_idx: u32,
    num_examples: u64,
    num_shards: u32,
    work_directory: &Path,
) -> Result<()> {
    let max_retries = 3 * num_shards;
    let mut retries = 0u32;

    for shard in 0..num_shards {
        let (begin_example, end_example) = shard_example_range(shard, num_shards, num_examples);
        manager.async_request(
            RequestEnvelope::with_id(
                WorkerRequest::CreateCheckpoint {
                    shard,
                    num_shards,
                    begin_example,
                    end_example,
                },
                shard as u64,
            ),
            None,
        )?;
    }

    let dir = checkpoint_dir(work_directory, iter_idx);
    let mut committed = 0;
    while committed < num_shards {
        let reply = manager.next_async_reply()?;
        if reply.request_restart_iter {
            let shard = reply.request_id.ok_or_else(|| {
                TrainError::protocol("CreateCheckpoint echoing its request id", "Empty")
            })? as u32;
            let next_worker = (reply.worker + 1) % manager.num_workers();
            warn!(
                "worker #{} does not have the data to create checkpoint shard \
                 {shard}; trying worker #{next_worker} instead",
                reply.worker
            );
            retries += 1;
            if retries > max_retries {
                return Err(TrainError::data_loss(format!(
                    "impossible to create a checkpoint for iteration {iter_idx}: \
                     none of the workers hold the prediction state"
                )));
            }
            let (begin_example, end_example) =
                shard_example_range(shard, num_shards, num_examples);
            manager.async_request(
                RequestEnvelope::with_id(
                    WorkerRequest::CreateCheckpoint {
                        shard,
                        num_shards,
                        begin_example,
                        end_example,
                    },
                    shard as u64,
                ),
                Some(next_worker),
            )?;
            continue;
        }

        let WorkerReplyBody::CreateCheckpoint { shard, temp_path } = reply.body else {
            return Err(unexpected("CreateCheckpoint", &reply));
        };
        let target = dir.join(prediction_shard_name(shard, num_shards));
        fs::rename(&temp_path, &target).map_err(|e| TrainError::io(&target, e))?;
        committed += 1;
    }
    Ok(())
}

/// Broadcast a checkpoint restore; workers re-read the prediction shards
/// from the shared work directory.
pub fn emit_restore_checkpoint(
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
    iter_idx: u32,
    num_shards: u32,
    num_weak_models: u32,
) -> Result<()> {
    monitoring.begin_stage(Stage::RestoreCheckpoint);
    broadcast(
        manager,
        |_| WorkerRequest::RestoreCheckpoint {
            iter_idx,
            num_shards,
            num_weak_models,
        },
        false,
        |reply| match reply.body {
            WorkerReplyBody::RestoreCheckpoint => Ok(()),
            _ => Err(unexpected("RestoreCheckpoint", &reply)),
        },
    )?;
    monitoring.end_stage(Stage::RestoreCheckpoint);
    Ok(())
}
