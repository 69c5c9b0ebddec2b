//! Feature-to-worker assignment.
//!
//! Each worker owns the cache shards of the features assigned to it and is
//! the only one able to find or evaluate splits on them. The planner balances
//! the expensive features (numerical, then categorical/discretized, then
//! boolean) evenly across the pool by scoring each feature and dealing them
//! out round-robin in descending score order.

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheMetadata, ColumnMeta};
use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};

/// Which workers own which features, and the reverse mapping.
///
/// Invariant: the union of `worker_to_features` equals the input feature set;
/// every feature has at least one owner, exactly one unless replication is
/// enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureOwnership {
    pub worker_to_features: Vec<Vec<usize>>,
    pub feature_to_workers: Vec<Vec<usize>>,
}

impl FeatureOwnership {
    /// Pick one owner of `feature`, uniformly at random when the feature is
    /// replicated.
    pub fn select_owner<R: Rng>(&self, feature: usize, rng: &mut R) -> Result<usize> {
        let owners = self
            .feature_to_workers
            .get(feature)
            .filter(|owners| !owners.is_empty())
            .ok_or_else(|| {
                TrainError::config(format!("feature {feature} has no owning worker"))
            })?;
        if owners.len() == 1 {
            Ok(owners[0])
        } else {
            Ok(owners[rng.gen_range(0..owners.len())])
        }
    }
}

/// Complexity score of one feature. Numerical features dominate categorical
/// and discretized ones, which dominate booleans; within a class, the value
/// or bucket count orders the work.
fn feature_score(meta: &ColumnMeta) -> i64 {
    match meta {
        ColumnMeta::Boolean => 0,
        ColumnMeta::Categorical { num_values } => *num_values as i64 + (1 << 32),
        ColumnMeta::DiscretizedNumerical { boundaries } => {
            (boundaries.len() as i64 + 1) + (1 << 32)
        }
        ColumnMeta::Numerical { num_unique_values } => *num_unique_values as i64 + (2 << 32),
    }
}

/// Assign every input feature to a worker.
///
/// Workers may end up with empty feature lists when the pool is larger than
/// the feature set; that is legal.
pub fn assign_features_to_workers(
    config: &TrainingConfig,
    features: &[usize],
    num_workers: usize,
    metadata: &CacheMetadata,
) -> Result<FeatureOwnership> {
    let max_feature = features.iter().copied().max().unwrap_or(0);
    let mut ownership = FeatureOwnership {
        worker_to_features: vec![Vec::new(); num_workers],
        feature_to_workers: vec![Vec::new(); max_feature + 1],
    };

    if config.replicate_features_to_all_workers {
        warn!(
            "assigning all {} features to all {num_workers} workers; this \
             replication mode is for debugging only",
            features.len()
        );
        for &feature in features {
            for worker in 0..num_workers {
                ownership.worker_to_features[worker].push(feature);
                ownership.feature_to_workers[feature].push(worker);
            }
        }
        return Ok(ownership);
    }

    let mut scored: Vec<(i64, usize)> = features
        .iter()
        .map(|&feature| Ok((feature_score(metadata.column(feature)?), feature)))
        .collect::<Result<_>>()?;
    scored.sort_unstable_by(|a, b| b.cmp(a));

    for (rank, &(_, feature)) in scored.iter().enumerate() {
        let worker = rank % num_workers;
        ownership.worker_to_features[worker].push(feature);
        ownership.feature_to_workers[feature].push(worker);
    }
    Ok(ownership)
}
