//! Per-iteration driver: layer-by-layer split finding, evaluation, sharing.
//!
//! One boosting iteration grows `K = num_trees_per_iter` weak models in
//! lockstep. The manager owns one [`TreeBuilder`] per weak model; at every
//! depth layer it samples candidate features per open node, fans them out to
//! the owning workers, merges the returned proposals, applies the winning
//! splits locally, and has the owners evaluate and share them. On success the
//! finished trees move into the model.
//!
//! Determinism: the iteration RNG is derived from the run seed and the
//! iteration index alone, so a replayed iteration (after a checkpoint
//! restore) makes exactly the same choices as its first run.

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use log::info;

use crate::config::{CandidateFeatures, TrainingConfig};
use crate::distribute::AbstractManager;
use crate::emitters::{
    emit_end_iter, emit_evaluate_splits, emit_find_splits, emit_share_splits,
    emit_start_new_iter,
};
use crate::error::{Result, TrainError};
use crate::loss::Loss;
use crate::model::{GradientBoostedModel, TrainingLogEntry};
use crate::monitoring::Monitoring;
use crate::ownership::FeatureOwnership;
use crate::protocol::{FeaturesPerWeakModel, TrainingEvaluation};
use crate::tree::{num_valid_splits, Split, TreeBuilder};

use std::collections::BTreeMap;

/// Worker → per weak model → chosen split indices the worker must evaluate.
pub type ActiveWorkerMap = BTreeMap<usize, Vec<Vec<usize>>>;

/// RNG of one iteration, a pure function of the run seed and the iteration
/// index (splitmix-style mixing).
pub(crate) fn iteration_rng(seed: u64, iter_idx: u32) -> Xoshiro256PlusPlus {
    let mixed = seed
        .wrapping_add((iter_idx as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Xoshiro256PlusPlus::seed_from_u64(mixed)
}

/// Run boosting iteration `iter_idx` and append its trees to `model`.
///
/// A data-loss error aborts the iteration with the model untouched; any
/// other error is fatal for the run.
#[allow(clippy::too_many_arguments)]
pub fn run_iteration(
    iter_idx: u32,
    config: &TrainingConfig,
    loss: &Loss,
    features: &[usize],
    ownership: &FeatureOwnership,
    model: &mut GradientBoostedModel,
    evaluation: &mut TrainingEvaluation,
    manager: &mut dyn AbstractManager,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.new_iter();
    let mut rng = iteration_rng(config.seed, iter_idx);
    let iter_uid: u64 = rng.gen();
    let worker_seed: u64 = rng.gen();

    let root_stats =
        emit_start_new_iter(manager, monitoring, iter_idx, iter_uid, worker_seed)?;
    if root_stats.len() != model.num_trees_per_iter {
        return Err(TrainError::transport(format!(
            "got root statistics for {} weak models, expected {}",
            root_stats.len(),
            model.num_trees_per_iter
        )));
    }

    let leaf_setter = loss.leaf_setter(config.shrinkage);
    let mut builders: Vec<TreeBuilder> = root_stats
        .iter()
        .map(|stats| {
            let mut builder = TreeBuilder::new(leaf_setter);
            builder.set_root_stats(stats);
            builder
        })
        .collect();

    for _layer in 0..config.max_depth.saturating_sub(1) {
        let open_counts: Vec<usize> =
            builders.iter().map(TreeBuilder::num_open_nodes).collect();
        let sampled = sample_input_features(
            config,
            manager.num_workers(),
            features,
            ownership,
            &open_counts,
            &mut rng,
        )?;

        let merged = emit_find_splits(manager, monitoring, &sampled, &open_counts)?;

        // Stop growing when no weak model has a valid split left.
        let has_valid_split = merged
            .iter()
            .any(|splits| num_valid_splits(splits, config.min_split_gain) > 0);
        if !has_valid_split {
            break;
        }

        for (builder, splits) in builders.iter_mut().zip(&merged) {
            builder.apply_splits(splits, config.min_split_gain)?;
        }

        let active_workers =
            build_active_workers(&merged, ownership, config.min_split_gain, &mut rng)?;
        let active_worker_idxs =
            emit_evaluate_splits(manager, monitoring, &merged, &active_workers)?;
        emit_share_splits(manager, monitoring, &merged, &active_worker_idxs)?;
    }

    *evaluation = emit_end_iter(manager, monitoring, iter_idx)?;

    for builder in builders {
        model.trees.push(builder.finish());
    }
    model.training_logs.push(TrainingLogEntry {
        num_iters: iter_idx + 1,
        training_loss: evaluation.loss,
        training_secondary_metrics: evaluation.metrics.clone(),
        validation_secondary_metrics: vec![0.0; model.secondary_metric_names.len()],
    });

    if monitoring.should_display_logs() {
        info!(
            "{}",
            training_log(model, evaluation, config, monitoring)
        );
    }
    Ok(())
}

/// The formatted per-iteration training line.
pub(crate) fn training_log(
    model: &GradientBoostedModel,
    evaluation: &TrainingEvaluation,
    config: &TrainingConfig,
    monitoring: &Monitoring,
) -> String {
    let mut log = format!(
        "num-trees:{}/{} train-loss:{:.6}",
        model.num_iters(),
        config.num_trees,
        evaluation.loss
    );
    for (name, value) in model
        .secondary_metric_names
        .iter()
        .zip(&evaluation.metrics)
    {
        log.push_str(&format!(" train-{name}:{value:.6}"));
    }
    log.push(' ');
    log.push_str(&monitoring.inline_logs());
    log
}

/// How many candidate features each (weak model, open node) examines.
fn num_sampled_features(config: &TrainingConfig, num_features: usize) -> usize {
    match config.candidate_features {
        CandidateFeatures::All => num_features,
        CandidateFeatures::Count(count) => count.min(num_features),
        CandidateFeatures::Ratio(ratio) => {
            ((ratio * num_features as f64).ceil() as usize).clamp(1, num_features)
        }
    }
}

/// Sample `count` features without replacement, shuffle-and-truncate.
fn sample_features<R: Rng>(features: &[usize], count: usize, rng: &mut R) -> Vec<usize> {
    if count >= features.len() {
        return features.to_vec();
    }
    let mut sampled = features.to_vec();
    sampled.shuffle(rng);
    sampled.truncate(count);
    sampled
}

/// Sample candidate features per (weak model, open node) and group them by
/// owning worker. Every worker gets an entry for every weak model and node,
/// possibly empty.
fn sample_input_features<R: Rng>(
    config: &TrainingConfig,
    num_workers: usize,
    features: &[usize],
    ownership: &FeatureOwnership,
    open_counts: &[usize],
    rng: &mut R,
) -> Result<Vec<FeaturesPerWeakModel>> {
    let count = num_sampled_features(config, features.len());

    let mut per_worker: Vec<FeaturesPerWeakModel> = (0..num_workers)
        .map(|_| {
            open_counts
                .iter()
                .map(|&num_open| vec![Vec::new(); num_open])
                .collect()
        })
        .collect();

    for (weak_idx, &num_open) in open_counts.iter().enumerate() {
        for node_idx in 0..num_open {
            for feature in sample_features(features, count, rng) {
                if config.replicate_features_to_all_workers {
                    for worker in per_worker.iter_mut() {
                        worker[weak_idx][node_idx].push(feature);
                    }
                } else {
                    let worker = ownership.select_owner(feature, rng)?;
                    per_worker[worker][weak_idx][node_idx].push(feature);
                }
            }
        }
    }
    Ok(per_worker)
}

/// Map each valid chosen split to one owning worker: the active worker set
/// of the layer.
fn build_active_workers<R: Rng>(
    splits_per_weak_model: &[Vec<Split>],
    ownership: &FeatureOwnership,
    min_gain: f64,
    rng: &mut R,
) -> Result<ActiveWorkerMap> {
    let num_weak_models = splits_per_weak_model.len();
    let mut active_workers = ActiveWorkerMap::new();
    for (weak_idx, splits) in splits_per_weak_model.iter().enumerate() {
        for (split_idx, split) in splits.iter().enumerate() {
            if !split.is_valid(min_gain) {
                continue;
            }
            let feature = split.feature.unwrap_or_default();
            let worker = ownership.select_owner(feature, rng)?;
            active_workers
                .entry(worker)
                .or_insert_with(|| vec![Vec::new(); num_weak_models])[weak_idx]
                .push(split_idx);
        }
    }
    Ok(active_workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::GradStats;
    use crate::tree::SplitCondition;

    fn two_worker_ownership() -> FeatureOwnership {
        FeatureOwnership {
            worker_to_features: vec![vec![0, 2], vec![1, 3]],
            feature_to_workers: vec![vec![0], vec![1], vec![0], vec![1]],
        }
    }

    #[test]
    fn iteration_rng_is_reproducible_per_iteration() {
        let mut a = iteration_rng(42, 7);
        let mut b = iteration_rng(42, 7);
        assert_eq!(a.gen::<u64>(), b.gen::<u64>());

        let mut c = iteration_rng(42, 8);
        let mut a2 = iteration_rng(42, 7);
        assert_ne!(a2.gen::<u64>(), c.gen::<u64>());
    }

    #[test]
    fn sampled_feature_counts() {
        let config = TrainingConfig {
            candidate_features: CandidateFeatures::All,
            ..Default::default()
        };
        assert_eq!(num_sampled_features(&config, 10), 10);

        let config = TrainingConfig {
            candidate_features: CandidateFeatures::Count(3),
            ..Default::default()
        };
        assert_eq!(num_sampled_features(&config, 10), 3);

        let config = TrainingConfig {
            candidate_features: CandidateFeatures::Ratio(0.25),
            ..Default::default()
        };
        assert_eq!(num_sampled_features(&config, 10), 3);
    }

    #[test]
    fn sampling_without_replacement() {
        let mut rng = iteration_rng(1, 0);
        let features = vec![0, 1, 2, 3, 4, 5];
        let sampled = sample_features(&features, 3, &mut rng);
        assert_eq!(sampled.len(), 3);
        let mut unique = sampled.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn sampled_features_go_to_their_owner() {
        let config = TrainingConfig {
            features: vec![0, 1, 2, 3],
            label: 4,
            ..Default::default()
        };
        let ownership = two_worker_ownership();
        let mut rng = iteration_rng(3, 0);
        let per_worker = sample_input_features(
            &config,
            2,
            &[0, 1, 2, 3],
            &ownership,
            &[1],
            &mut rng,
        )
        .unwrap();

        assert_eq!(per_worker.len(), 2);
        for &feature in &per_worker[0][0][0] {
            assert!(feature == 0 || feature == 2);
        }
        for &feature in &per_worker[1][0][0] {
            assert!(feature == 1 || feature == 3);
        }
        let total: usize = per_worker.iter().map(|w| w[0][0].len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn active_workers_cover_exactly_the_valid_splits() {
        let ownership = two_worker_ownership();
        let valid = Split {
            feature: Some(1),
            condition: SplitCondition::HigherThan { threshold: 0.0 },
            gain: 1.0,
            worker: 0,
            negative: GradStats::default(),
            positive: GradStats::default(),
        };
        let splits = vec![vec![valid, Split::none()]];
        let mut rng = iteration_rng(5, 0);
        let active = build_active_workers(&splits, &ownership, 0.0, &mut rng).unwrap();

        assert_eq!(active.len(), 1);
        let (worker, split_idxs) = active.iter().next().unwrap();
        assert_eq!(*worker, 1, "feature 1 is owned by worker 1");
        assert_eq!(split_idxs[0], vec![0]);
    }
}
