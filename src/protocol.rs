//! Wire contract between the manager and the workers.
//!
//! Requests and replies are tagged unions with one variant per protocol
//! message. Every reply carries the worker's index and the
//! `request_restart_iter` flag a worker raises after losing its state; the
//! optional `request_id` set by the manager on sharded dispatches echoes in
//! the reply so a failed shard can be reassigned.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{LossKind, TrainingConfig};
use crate::stats::{GradStats, LabelStatistics};
use crate::tree::Split;

/// One-time payload pushed to every worker when the manager is initialized,
/// before the first request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerWelcome {
    pub work_directory: PathBuf,
    pub cache_path: PathBuf,
    pub config: TrainingConfig,
    /// Loss resolved from the configuration and the task.
    pub loss: LossKind,
    /// Features owned by each worker, indexed by worker.
    pub owned_features: Vec<Vec<usize>>,
}

/// Candidate features for one worker: per weak model, per open node, the
/// features the worker must score.
pub type FeaturesPerWeakModel = Vec<Vec<Vec<usize>>>;

/// Training loss and secondary metrics computed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEvaluation {
    pub loss: f64,
    pub metrics: Vec<f64>,
}

/// Request sent by the manager to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Load the dataset cache shards and get ready to train.
    StartTraining,
    /// Report the label statistics of the full training dataset.
    GetLabelStatistics,
    /// Install the constant predictions of the empty model.
    SetInitialPredictions { initial_predictions: Vec<f32> },
    /// Open boosting iteration `iter_idx`: compute the weak-learner targets
    /// and report the per-weak-model root statistics.
    StartNewIter { iter_idx: u32, iter_uid: u64, seed: u64 },
    /// Score the given candidate features and propose the best split per
    /// (weak model, open node).
    FindSplits {
        features_per_weak_model: FeaturesPerWeakModel,
    },
    /// Evaluate the chosen splits this worker owns: per weak model, pairs of
    /// (open node position, split).
    EvaluateSplits {
        splits_per_weak_model: Vec<Vec<(usize, Split)>>,
    },
    /// Install the chosen splits of the layer on every worker. Non-active
    /// workers consume the evaluations shared by `active_workers`.
    ShareSplits {
        splits_per_weak_model: Vec<Vec<Split>>,
        active_workers: Vec<usize>,
    },
    /// Close the iteration: fold the finished weak models into the local
    /// predictions. Worker zero additionally computes the training loss.
    EndIter {
        iter_idx: u32,
        compute_training_loss: bool,
    },
    /// Write the prediction shard covering `[begin_example, end_example)` to
    /// a temp file.
    CreateCheckpoint {
        shard: u32,
        num_shards: u32,
        begin_example: u64,
        end_example: u64,
    },
    /// Re-hydrate worker state from the checkpoint of `iter_idx`.
    RestoreCheckpoint {
        iter_idx: u32,
        num_shards: u32,
        num_weak_models: u32,
    },
}

impl WorkerRequest {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::StartTraining => "StartTraining",
            Self::GetLabelStatistics => "GetLabelStatistics",
            Self::SetInitialPredictions { .. } => "SetInitialPredictions",
            Self::StartNewIter { .. } => "StartNewIter",
            Self::FindSplits { .. } => "FindSplits",
            Self::EvaluateSplits { .. } => "EvaluateSplits",
            Self::ShareSplits { .. } => "ShareSplits",
            Self::EndIter { .. } => "EndIter",
            Self::CreateCheckpoint { .. } => "CreateCheckpoint",
            Self::RestoreCheckpoint { .. } => "RestoreCheckpoint",
        }
    }
}

/// A request plus the manager-assigned id echoed by the reply. The id is set
/// only on sharded dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: Option<u64>,
    pub request: WorkerRequest,
}

impl RequestEnvelope {
    pub fn new(request: WorkerRequest) -> Self {
        Self {
            request_id: None,
            request,
        }
    }

    pub fn with_id(request: WorkerRequest, request_id: u64) -> Self {
        Self {
            request_id: Some(request_id),
            request,
        }
    }
}

/// Reply payload, one variant per request variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerReplyBody {
    /// Carried by replies that only signal `request_restart_iter`.
    Empty,
    StartTraining,
    GetLabelStatistics {
        statistics: LabelStatistics,
    },
    SetInitialPredictions,
    StartNewIter {
        /// Root statistics of each weak model.
        root_stats: Vec<GradStats>,
    },
    FindSplits {
        /// Best split proposal per (weak model, open node).
        splits_per_weak_model: Vec<Vec<Split>>,
    },
    EvaluateSplits,
    ShareSplits,
    EndIter {
        evaluation: Option<TrainingEvaluation>,
    },
    CreateCheckpoint {
        shard: u32,
        temp_path: PathBuf,
    },
    RestoreCheckpoint,
}

impl WorkerReplyBody {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::StartTraining => "StartTraining",
            Self::GetLabelStatistics { .. } => "GetLabelStatistics",
            Self::SetInitialPredictions => "SetInitialPredictions",
            Self::StartNewIter { .. } => "StartNewIter",
            Self::FindSplits { .. } => "FindSplits",
            Self::EvaluateSplits => "EvaluateSplits",
            Self::ShareSplits => "ShareSplits",
            Self::EndIter { .. } => "EndIter",
            Self::CreateCheckpoint { .. } => "CreateCheckpoint",
            Self::RestoreCheckpoint => "RestoreCheckpoint",
        }
    }
}

/// Reply envelope: sender index, echoed request id, data-loss flag, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub worker: usize,
    pub request_id: Option<u64>,
    /// The worker lost its state; the manager must abandon the iteration and
    /// restore the last checkpoint.
    pub request_restart_iter: bool,
    pub body: WorkerReplyBody,
}

impl WorkerReply {
    /// A normal reply.
    pub fn ack(worker: usize, request_id: Option<u64>, body: WorkerReplyBody) -> Self {
        Self {
            worker,
            request_id,
            request_restart_iter: false,
            body,
        }
    }

    /// A reply whose only content is the restart-iter signal.
    pub fn restart_iter(worker: usize, request_id: Option<u64>) -> Self {
        Self {
            worker,
            request_id,
            request_restart_iter: true,
            body: WorkerReplyBody::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids() {
        let plain = RequestEnvelope::new(WorkerRequest::StartTraining);
        assert_eq!(plain.request_id, None);

        let sharded = RequestEnvelope::with_id(
            WorkerRequest::CreateCheckpoint {
                shard: 3,
                num_shards: 4,
                begin_example: 30,
                end_example: 40,
            },
            3,
        );
        assert_eq!(sharded.request_id, Some(3));
    }

    #[test]
    fn restart_reply_raises_flag() {
        let reply = WorkerReply::restart_iter(2, Some(7));
        assert!(reply.request_restart_iter);
        assert_eq!(reply.worker, 2);
        assert_eq!(reply.request_id, Some(7));
    }

    #[test]
    fn wire_round_trip() {
        let request = RequestEnvelope::new(WorkerRequest::StartNewIter {
            iter_idx: 4,
            iter_uid: 0xDEAD,
            seed: 99,
        });
        let bytes = postcard::to_allocvec(&request).unwrap();
        let decoded: RequestEnvelope = postcard::from_bytes(&bytes).unwrap();
        assert!(matches!(
            decoded.request,
            WorkerRequest::StartNewIter { iter_idx: 4, .. }
        ));
    }
}
