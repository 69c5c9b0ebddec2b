//! Checkpoint store: iteration-indexed snapshots of the training run.
//!
//! Layout under the work directory:
//!
//! ```text
//! <wd>/checkpoint/<i>/model                     serialized model
//! <wd>/checkpoint/<i>/checkpoint                binary metadata
//! <wd>/checkpoint/<i>/predictions-<s>-of-<S>    prediction shards
//! <wd>/checkpoint/snapshot                      monotonically increasing index list
//! ```
//!
//! Prediction shards are written by workers to temp paths and renamed into
//! place by the manager; the rename is the per-shard commit point and the
//! snapshot append is the commit point of the checkpoint as a whole. A
//! snapshot index is only selectable for restore when its directory holds the
//! model, the metadata, and all `S` shards.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};
use crate::model::GradientBoostedModel;
use crate::stats::LabelStatistics;

const CHECKPOINT_DIR: &str = "checkpoint";
const SNAPSHOT_FILE: &str = "snapshot";
const MODEL_FILE: &str = "model";
const META_FILE: &str = "checkpoint";
pub const TMP_DIR: &str = "tmp";

/// Per-checkpoint metadata, stored next to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub label_statistics: LabelStatistics,
    /// Number of prediction shards of this checkpoint.
    pub num_shards: u32,
}

impl CheckpointMeta {
    pub fn save(&self, checkpoint_dir: &Path) -> Result<()> {
        let path = checkpoint_dir.join(META_FILE);
        let raw = postcard::to_allocvec(self)?;
        fs::write(&path, raw).map_err(|e| TrainError::io(&path, e))
    }

    pub fn load(checkpoint_dir: &Path) -> Result<Self> {
        let path = checkpoint_dir.join(META_FILE);
        let raw = fs::read(&path).map_err(|e| TrainError::io(&path, e))?;
        Ok(postcard::from_bytes(&raw)?)
    }
}

/// One prediction shard: the prediction matrix columns of a contiguous
/// example range, output-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionShard {
    pub begin_example: u64,
    pub end_example: u64,
    pub num_outputs: u32,
    /// `num_outputs * (end_example - begin_example)` values, one output row
    /// after another.
    pub values: Vec<f32>,
}

impl PredictionShard {
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = postcard::to_allocvec(self)?;
        fs::write(path, raw).map_err(|e| TrainError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| TrainError::io(path, e))?;
        Ok(postcard::from_bytes(&raw)?)
    }
}

pub fn checkpoint_root(work_directory: &Path) -> PathBuf {
    work_directory.join(CHECKPOINT_DIR)
}

pub fn checkpoint_dir(work_directory: &Path, iter_idx: u32) -> PathBuf {
    work_directory.join(CHECKPOINT_DIR).join(iter_idx.to_string())
}

pub fn snapshot_file(work_directory: &Path) -> PathBuf {
    work_directory.join(CHECKPOINT_DIR).join(SNAPSHOT_FILE)
}

pub fn model_file(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join(MODEL_FILE)
}

/// File name of one prediction shard.
pub fn prediction_shard_name(shard: u32, num_shards: u32) -> String {
    format!("predictions-{shard:05}-of-{num_shards:05}")
}

/// Example range `[begin, end)` of one shard, `ceil(num_examples / S)` wide.
pub fn shard_example_range(shard: u32, num_shards: u32, num_examples: u64) -> (u64, u64) {
    let per_shard = num_examples.div_ceil(num_shards as u64);
    let begin = shard as u64 * per_shard;
    let end = num_examples.min((shard as u64 + 1) * per_shard);
    (begin, end)
}

/// Append `iter_idx` to the snapshot index. This commits the checkpoint.
pub fn add_snapshot(work_directory: &Path, iter_idx: u32) -> Result<()> {
    let path = snapshot_file(work_directory);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| TrainError::io(&path, e))?;
    writeln!(file, "{iter_idx}").map_err(|e| TrainError::io(&path, e))
}

/// All recorded snapshot indices, oldest first. Missing file means none.
pub fn read_snapshots(work_directory: &Path) -> Result<Vec<u32>> {
    let path = snapshot_file(work_directory);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TrainError::io(&path, e)),
    };
    let mut snapshots = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let idx = line.parse::<u32>().map_err(|e| {
            TrainError::serialization(format!("corrupt snapshot index entry '{line}': {e}"))
        })?;
        snapshots.push(idx);
    }
    Ok(snapshots)
}

/// Whether the checkpoint of `iter_idx` is complete: model, metadata, and all
/// of its prediction shards are present.
pub fn is_checkpoint_complete(work_directory: &Path, iter_idx: u32) -> bool {
    let dir = checkpoint_dir(work_directory, iter_idx);
    if !model_file(&dir).is_file() {
        return false;
    }
    let Ok(meta) = CheckpointMeta::load(&dir) else {
        return false;
    };
    (0..meta.num_shards)
        .all(|shard| dir.join(prediction_shard_name(shard, meta.num_shards)).is_file())
}

/// Greatest complete snapshot index, optionally capped at `at_most`.
/// Partial checkpoints are skipped, never selected.
pub fn greatest_complete_snapshot(
    work_directory: &Path,
    at_most: Option<u32>,
) -> Result<Option<u32>> {
    let mut snapshots = read_snapshots(work_directory)?;
    snapshots.sort_unstable();
    Ok(snapshots
        .into_iter()
        .rev()
        .filter(|&idx| at_most.map_or(true, |cap| idx <= cap))
        .find(|&idx| is_checkpoint_complete(work_directory, idx)))
}

/// Load the model and metadata of the checkpoint at `iter_idx`.
pub fn restore_manager_checkpoint(
    work_directory: &Path,
    iter_idx: u32,
) -> Result<(GradientBoostedModel, CheckpointMeta)> {
    let dir = checkpoint_dir(work_directory, iter_idx);
    let meta = CheckpointMeta::load(&dir)?;
    let model = GradientBoostedModel::load(&model_file(&dir))?;
    Ok((model, meta))
}

/// Checkpoint trigger: every `checkpoint_interval_trees` iterations, or when
/// `checkpoint_interval_seconds` of wall clock elapsed since the last one.
/// Nothing is checkpointed before the first iteration completed.
pub fn should_create_checkpoint(
    iter_idx: u32,
    time_last_checkpoint: Instant,
    config: &TrainingConfig,
) -> bool {
    if iter_idx == 0 {
        return false;
    }
    if config.checkpoint_interval_trees >= 0 {
        let interval = config.checkpoint_interval_trees.max(1) as u32;
        if iter_idx % interval == 0 {
            return true;
        }
    }
    if config.checkpoint_interval_seconds >= 0
        && time_last_checkpoint.elapsed().as_secs() >= config.checkpoint_interval_seconds as u64
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(num_shards: u32) -> CheckpointMeta {
        CheckpointMeta {
            label_statistics: LabelStatistics::Regression {
                count: 8,
                sum: 4.0,
                sum_squares: 3.0,
            },
            num_shards,
        }
    }

    fn write_complete_checkpoint(work_dir: &Path, iter_idx: u32, num_shards: u32) {
        let dir = checkpoint_dir(work_dir, iter_idx);
        fs::create_dir_all(&dir).unwrap();
        GradientBoostedModel::default().save(&model_file(&dir)).unwrap();
        meta(num_shards).save(&dir).unwrap();
        for shard in 0..num_shards {
            let shard_file = dir.join(prediction_shard_name(shard, num_shards));
            PredictionShard {
                begin_example: 0,
                end_example: 1,
                num_outputs: 1,
                values: vec![0.0],
            }
            .save(&shard_file)
            .unwrap();
        }
        add_snapshot(work_dir, iter_idx).unwrap();
    }

    #[test]
    fn snapshot_append_and_read() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(CHECKPOINT_DIR)).unwrap();
        assert!(read_snapshots(dir.path()).unwrap().is_empty());

        add_snapshot(dir.path(), 5).unwrap();
        add_snapshot(dir.path(), 10).unwrap();
        assert_eq!(read_snapshots(dir.path()).unwrap(), vec![5, 10]);
    }

    #[test]
    fn shard_ranges_cover_all_examples() {
        let mut covered = 0;
        for shard in 0..3 {
            let (begin, end) = shard_example_range(shard, 3, 10);
            assert_eq!(begin, covered);
            covered = end;
        }
        assert_eq!(covered, 10);

        // One shard takes everything.
        assert_eq!(shard_example_range(0, 1, 7), (0, 7));
    }

    #[test]
    fn partial_checkpoint_is_never_selected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(CHECKPOINT_DIR)).unwrap();

        write_complete_checkpoint(dir.path(), 5, 2);

        // Iteration 10: committed to the index but missing one shard.
        let broken = checkpoint_dir(dir.path(), 10);
        fs::create_dir_all(&broken).unwrap();
        GradientBoostedModel::default().save(&model_file(&broken)).unwrap();
        meta(2).save(&broken).unwrap();
        PredictionShard {
            begin_example: 0,
            end_example: 1,
            num_outputs: 1,
            values: vec![0.0],
        }
        .save(&broken.join(prediction_shard_name(0, 2)))
        .unwrap();
        add_snapshot(dir.path(), 10).unwrap();

        assert!(!is_checkpoint_complete(dir.path(), 10));
        assert_eq!(
            greatest_complete_snapshot(dir.path(), None).unwrap(),
            Some(5)
        );
        assert_eq!(
            greatest_complete_snapshot(dir.path(), Some(4)).unwrap(),
            None
        );
    }

    #[test]
    fn restore_round_trip() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(CHECKPOINT_DIR)).unwrap();
        write_complete_checkpoint(dir.path(), 3, 1);

        let (model, restored_meta) = restore_manager_checkpoint(dir.path(), 3).unwrap();
        assert_eq!(model, GradientBoostedModel::default());
        assert_eq!(restored_meta, meta(1));
    }

    #[test]
    fn checkpoint_trigger_by_tree_count() {
        let config = TrainingConfig {
            checkpoint_interval_trees: 10,
            checkpoint_interval_seconds: -1,
            ..Default::default()
        };
        let now = Instant::now();
        assert!(!should_create_checkpoint(0, now, &config));
        assert!(!should_create_checkpoint(5, now, &config));
        assert!(should_create_checkpoint(10, now, &config));
        assert!(should_create_checkpoint(40, now, &config));
    }

    #[test]
    fn checkpoint_trigger_disabled() {
        let config = TrainingConfig {
            checkpoint_interval_trees: -1,
            checkpoint_interval_seconds: -1,
            ..Default::default()
        };
        assert!(!should_create_checkpoint(10, Instant::now(), &config));
    }
}
