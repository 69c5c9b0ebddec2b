//! Worker-side request handler.
//!
//! A [`TrainingWorker`] owns the cache shards of its assigned features plus
//! the label column, keeps the full prediction matrix, and holds the
//! per-iteration volatile state: weak-learner targets, one tree replica per
//! weak model, and the example→node map of each replica. Replicas are grown
//! with the exact same [`TreeBuilder`] the manager uses, fed with the same
//! shared splits, so node ids agree across the pool without shipping tree
//! structure.
//!
//! Split evaluations are exchanged through the shared work directory: the
//! owning worker writes one bitmap per chosen split under
//! `<wd>/tmp/evals-<iter_uid>/layer-<n>/`, and every worker consumes those
//! bitmaps during `ShareSplits` to advance its example→node maps.
//!
//! All worker state except the cache files is volatile. A freshly restarted
//! worker answers any iteration-scoped request with `request_restart_iter`
//! and is brought back by the driver through `RestoreCheckpoint`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::cache::{CacheMetadata, ColumnData, ColumnMeta};
use crate::checkpoint::{
    checkpoint_dir, prediction_shard_name, PredictionShard, TMP_DIR,
};
use crate::config::Task;
use crate::distribute::WorkerHandler;
use crate::error::{Result, TrainError};
use crate::loss::Loss;
use crate::protocol::{
    RequestEnvelope, WorkerReply, WorkerReplyBody, WorkerRequest, WorkerWelcome,
};
use crate::stats::{GradStats, LabelStatistics};
use crate::tree::{Split, SplitCondition, TreeBuilder};

/// Bitmap over the examples of one open node, in ascending example order.
/// Bit set means the example satisfies the split condition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct EvalBitmap {
    bits: Vec<u8>,
}

impl EvalBitmap {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
        }
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    fn get(&self, idx: usize) -> bool {
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }
}

/// Cache shards loaded by this worker.
struct WorkerDataset {
    metadata: CacheMetadata,
    /// Owned feature columns, by column index.
    columns: HashMap<usize, ColumnData>,
    labels: Vec<f32>,
}

/// One weak-model replica mirroring the manager's tree builder.
struct WeakReplica {
    builder: TreeBuilder,
    example_to_node: Vec<u32>,
}

/// Volatile per-iteration state.
struct IterationState {
    iter_idx: u32,
    iter_uid: u64,
    /// Depth layers applied so far; names the evaluation subdirectory.
    layer: u32,
    gradients: Array2<f32>,
    hessians: Array2<f32>,
    weak_models: Vec<WeakReplica>,
}

/// Worker-side implementation of the training protocol.
pub struct TrainingWorker {
    welcome: WorkerWelcome,
    worker_idx: usize,
    dataset: Option<WorkerDataset>,
    predictions: Option<Array2<f32>>,
    iteration: Option<IterationState>,
    temp_counter: u64,
}

impl TrainingWorker {
    pub fn new(welcome: WorkerWelcome, worker_idx: usize) -> Self {
        Self {
            welcome,
            worker_idx,
            dataset: None,
            predictions: None,
            iteration: None,
            temp_counter: 0,
        }
    }

    fn loss(&self) -> Result<Loss> {
        Loss::new(self.welcome.loss, self.welcome.config.task)
    }

    /// Load the owned cache shards on first use. Cache files survive worker
    /// restarts, so this is the only state a fresh worker can rebuild alone.
    fn ensure_dataset(&mut self) -> Result<&WorkerDataset> {
        if self.dataset.is_none() {
            let cache = &self.welcome.cache_path;
            let metadata = CacheMetadata::load(cache)?;
            let mut columns = HashMap::new();
            for &feature in &self.welcome.owned_features[self.worker_idx] {
                columns.insert(feature, ColumnData::load(cache, feature)?);
            }
            let labels = ColumnData::load(cache, self.welcome.config.label)?.label_values()?;
            self.dataset = Some(WorkerDataset {
                metadata,
                columns,
                labels,
            });
        }
        Ok(self.dataset.as_ref().unwrap())
    }

    fn num_examples(&self) -> usize {
        self.dataset
            .as_ref()
            .map_or(0, |d| d.metadata.num_examples as usize)
    }

    fn label_statistics(&mut self) -> Result<LabelStatistics> {
        self.ensure_dataset()?;
        let dataset = self.dataset.as_ref().unwrap();
        match self.welcome.config.task {
            Task::Classification { num_classes } => {
                let mut class_counts = vec![0u64; num_classes as usize];
                for &label in &dataset.labels {
                    let class = label as usize;
                    if class >= class_counts.len() {
                        return Err(TrainError::config(format!(
                            "label value {label} exceeds the configured {num_classes} classes"
                        )));
                    }
                    class_counts[class] += 1;
                }
                Ok(LabelStatistics::Classification {
                    count: dataset.labels.len() as u64,
                    class_counts,
                })
            }
            _ => {
                let sum: f64 = dataset.labels.iter().map(|&y| y as f64).sum();
                let sum_squares: f64 = dataset.labels.iter().map(|&y| (y as f64).powi(2)).sum();
                Ok(LabelStatistics::Regression {
                    count: dataset.labels.len() as u64,
                    sum,
                    sum_squares,
                })
            }
        }
    }

    fn start_new_iter(&mut self, iter_idx: u32, iter_uid: u64) -> Result<Vec<GradStats>> {
        self.ensure_dataset()?;
        let loss = self.loss()?;
        let predictions = self.predictions.as_ref().ok_or_else(|| {
            TrainError::transport("StartNewIter before SetInitialPredictions")
        })?;
        let num_outputs = predictions.nrows();
        let num_examples = predictions.ncols();
        let dataset = self.dataset.as_ref().unwrap();

        let mut gradients = Array2::zeros((num_outputs, num_examples));
        let mut hessians = Array2::zeros((num_outputs, num_examples));
        loss.gradients_into(&dataset.labels, predictions, &mut gradients, &mut hessians);

        let leaf_setter = loss.leaf_setter(self.welcome.config.shrinkage);
        let mut weak_models = Vec::with_capacity(num_outputs);
        let mut root_stats = Vec::with_capacity(num_outputs);
        for output in 0..num_outputs {
            let mut stats = GradStats::default();
            for i in 0..num_examples {
                stats.add(gradients[[output, i]] as f64, hessians[[output, i]] as f64);
            }
            let mut builder = TreeBuilder::new(leaf_setter);
            builder.set_root_stats(&stats);
            weak_models.push(WeakReplica {
                builder,
                example_to_node: vec![0; num_examples],
            });
            root_stats.push(stats);
        }

        self.iteration = Some(IterationState {
            iter_idx,
            iter_uid,
            layer: 0,
            gradients,
            hessians,
            weak_models,
        });
        Ok(root_stats)
    }

    /// Examples currently sitting in each open node of one weak model, in
    /// ascending example order, indexed by open-node position.
    fn examples_per_open_node(replica: &WeakReplica) -> Vec<Vec<u32>> {
        let open = replica.builder.open_nodes();
        let position: HashMap<u32, usize> = open
            .iter()
            .enumerate()
            .map(|(pos, &node)| (node, pos))
            .collect();
        let mut examples = vec![Vec::new(); open.len()];
        for (example, &node) in replica.example_to_node.iter().enumerate() {
            if let Some(&pos) = position.get(&node) {
                examples[pos].push(example as u32);
            }
        }
        examples
    }

    fn find_splits(
        &self,
        features_per_weak_model: &[Vec<Vec<usize>>],
    ) -> Result<Vec<Vec<Split>>> {
        let state = self.iteration.as_ref().ok_or_else(|| {
            TrainError::transport("FindSplits outside an iteration")
        })?;
        let dataset = self.dataset.as_ref().ok_or_else(|| {
            TrainError::transport("FindSplits before the dataset cache was loaded")
        })?;

        let mut splits_per_weak_model = Vec::with_capacity(state.weak_models.len());
        for (weak_idx, replica) in state.weak_models.iter().enumerate() {
            let node_examples = Self::examples_per_open_node(replica);
            let features_per_node = features_per_weak_model.get(weak_idx).ok_or_else(|| {
                TrainError::transport("FindSplits misses a weak model entry")
            })?;
            let mut splits = Vec::with_capacity(node_examples.len());
            for (pos, examples) in node_examples.iter().enumerate() {
                let features = features_per_node.get(pos).map_or(&[][..], Vec::as_slice);
                let mut best = Split::none();
                for &feature in features {
                    if let Some(candidate) = self.best_split_for_feature(
                        dataset, state, weak_idx, feature, examples,
                    )? {
                        // Candidates always carry a feature and a positive
                        // gain; ties go to the lower feature index.
                        let replace = match best.feature {
                            None => true,
                            Some(_) => {
                                candidate.gain > best.gain
                                    || (candidate.gain == best.gain
                                        && candidate.feature < best.feature)
                            }
                        };
                        if replace {
                            best = candidate;
                        }
                    }
                }
                splits.push(best);
            }
            splits_per_weak_model.push(splits);
        }
        Ok(splits_per_weak_model)
    }

    /// Best split of `feature` over `examples`, or `None` when no candidate
    /// satisfies the minimum example count with a positive gain.
    fn best_split_for_feature(
        &self,
        dataset: &WorkerDataset,
        state: &IterationState,
        weak_idx: usize,
        feature: usize,
        examples: &[u32],
    ) -> Result<Option<Split>> {
        let column = dataset.columns.get(&feature).ok_or_else(|| {
            TrainError::transport(format!(
                "worker {} received feature {feature} it does not own",
                self.worker_idx
            ))
        })?;
        let min_examples = self.welcome.config.min_examples;

        let mut parent = GradStats::default();
        for &example in examples {
            parent.add(
                state.gradients[[weak_idx, example as usize]] as f64,
                state.hessians[[weak_idx, example as usize]] as f64,
            );
        }
        if parent.count < 2 * min_examples {
            return Ok(None);
        }

        let grad = |example: u32| state.gradients[[weak_idx, example as usize]] as f64;
        let hess = |example: u32| state.hessians[[weak_idx, example as usize]] as f64;

        let best = match column {
            ColumnData::Numerical(values) => {
                let mut ordered: Vec<(f32, u32)> = examples
                    .iter()
                    .map(|&example| (values[example as usize], example))
                    .collect();
                ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

                let mut negative = GradStats::default();
                let mut best: Option<(f64, f32, GradStats)> = None;
                for window in ordered.windows(2) {
                    let (value, example) = window[0];
                    let (next_value, _) = window[1];
                    negative.add(grad(example), hess(example));
                    if value == next_value {
                        continue;
                    }
                    if let Some(gain) = split_gain(&parent, &negative, min_examples) {
                        let threshold = (value + next_value) / 2.0;
                        if best.as_ref().map_or(true, |(g, _, _)| gain > *g) {
                            best = Some((gain, threshold, negative));
                        }
                    }
                }
                best.map(|(gain, threshold, negative)| {
                    self.make_split(
                        feature,
                        SplitCondition::HigherThan { threshold },
                        gain,
                        &parent,
                        negative,
                    )
                })
            }
            ColumnData::Discretized(buckets) => {
                let ColumnMeta::DiscretizedNumerical { boundaries } =
                    dataset.metadata.column(feature)?
                else {
                    return Err(TrainError::config(format!(
                        "column {feature} payload does not match its metadata"
                    )));
                };
                let num_buckets = boundaries.len() + 1;
                let mut per_bucket = vec![GradStats::default(); num_buckets];
                for &example in examples {
                    per_bucket[buckets[example as usize] as usize]
                        .add(grad(example), hess(example));
                }
                let mut negative = GradStats::default();
                let mut best: Option<(f64, f32, GradStats)> = None;
                for bucket in 1..num_buckets {
                    negative.merge(&per_bucket[bucket - 1]);
                    if let Some(gain) = split_gain(&parent, &negative, min_examples) {
                        if best.as_ref().map_or(true, |(g, _, _)| gain > *g) {
                            best = Some((gain, boundaries[bucket - 1], negative));
                        }
                    }
                }
                best.map(|(gain, threshold, negative)| {
                    self.make_split(
                        feature,
                        SplitCondition::HigherThan { threshold },
                        gain,
                        &parent,
                        negative,
                    )
                })
            }
            ColumnData::Boolean(values) => {
                let mut negative = GradStats::default();
                for &example in examples {
                    if values[example as usize] == 0 {
                        negative.add(grad(example), hess(example));
                    }
                }
                split_gain(&parent, &negative, min_examples).map(|gain| {
                    self.make_split(feature, SplitCondition::IsTrue, gain, &parent, negative)
                })
            }
            ColumnData::Categorical(values) => {
                let ColumnMeta::Categorical { num_values } = dataset.metadata.column(feature)?
                else {
                    return Err(TrainError::config(format!(
                        "column {feature} payload does not match its metadata"
                    )));
                };
                let mut per_category = vec![GradStats::default(); *num_values as usize];
                for &example in examples {
                    per_category[values[example as usize] as usize]
                        .add(grad(example), hess(example));
                }
                // Order categories by their Newton step and scan prefixes,
                // the classic optimal ordering for one-dimensional targets.
                let mut order: Vec<u16> = (0..*num_values as u16).collect();
                order.sort_by(|&a, &b| {
                    let ratio = |s: &GradStats| {
                        if s.sum_hessian > 0.0 {
                            s.sum_gradient / s.sum_hessian
                        } else {
                            0.0
                        }
                    };
                    ratio(&per_category[a as usize])
                        .total_cmp(&ratio(&per_category[b as usize]))
                        .then(a.cmp(&b))
                });

                let mut positive = GradStats::default();
                let mut best: Option<(f64, usize, GradStats)> = None;
                for (prefix_len, &category) in order.iter().enumerate() {
                    positive.merge(&per_category[category as usize]);
                    let mut negative = parent;
                    negative.count -= positive.count;
                    negative.sum_gradient -= positive.sum_gradient;
                    negative.sum_hessian -= positive.sum_hessian;
                    if positive.count < min_examples || negative.count < min_examples {
                        continue;
                    }
                    let gain = negative.score() + positive.score() - parent.score();
                    if gain > 0.0 && best.as_ref().map_or(true, |(g, _, _)| gain > *g) {
                        best = Some((gain, prefix_len + 1, negative));
                    }
                }
                best.map(|(gain, prefix_len, negative)| {
                    let mut categories: Vec<u16> = order[..prefix_len].to_vec();
                    categories.sort_unstable();
                    self.make_split(
                        feature,
                        SplitCondition::ContainsCategories { categories },
                        gain,
                        &parent,
                        negative,
                    )
                })
            }
        };
        Ok(best)
    }

    fn make_split(
        &self,
        feature: usize,
        condition: SplitCondition,
        gain: f64,
        parent: &GradStats,
        negative: GradStats,
    ) -> Split {
        let mut positive = *parent;
        positive.count -= negative.count;
        positive.sum_gradient -= negative.sum_gradient;
        positive.sum_hessian -= negative.sum_hessian;
        Split {
            feature: Some(feature),
            condition,
            gain,
            worker: self.worker_idx,
            negative,
            positive,
        }
    }

    /// Whether `example` satisfies `condition` on an owned column.
    fn condition_holds(
        &self,
        dataset: &WorkerDataset,
        feature: usize,
        example: u32,
        condition: &SplitCondition,
    ) -> Result<bool> {
        let column = dataset.columns.get(&feature).ok_or_else(|| {
            TrainError::transport(format!(
                "worker {} asked to evaluate feature {feature} it does not own",
                self.worker_idx
            ))
        })?;
        Ok(match (column, condition) {
            (ColumnData::Numerical(values), condition) => {
                condition.evaluate_numerical(values[example as usize])
            }
            (ColumnData::Discretized(buckets), SplitCondition::HigherThan { threshold }) => {
                let ColumnMeta::DiscretizedNumerical { boundaries } =
                    dataset.metadata.column(feature)?
                else {
                    return Err(TrainError::config(format!(
                        "column {feature} payload does not match its metadata"
                    )));
                };
                // The threshold is a boundary value; examples at or above it
                // are exactly the buckets past it.
                let split_bucket = boundaries.partition_point(|b| *b < *threshold) as u16 + 1;
                buckets[example as usize] >= split_bucket
            }
            (ColumnData::Boolean(values), SplitCondition::IsTrue) => values[example as usize] != 0,
            (ColumnData::Categorical(values), condition) => {
                condition.evaluate_categorical(values[example as usize])
            }
            _ => {
                return Err(TrainError::transport(format!(
                    "split condition does not match the type of feature {feature}"
                )))
            }
        })
    }

    fn eval_dir(&self, iter_uid: u64, layer: u32) -> PathBuf {
        self.welcome
            .work_directory
            .join(TMP_DIR)
            .join(format!("evals-{iter_uid:016x}"))
            .join(format!("layer-{layer}"))
    }

    fn eval_file(dir: &Path, weak_idx: usize, pos: usize) -> PathBuf {
        dir.join(format!("eval-{weak_idx}-{pos}"))
    }

    fn evaluate_splits(
        &self,
        splits_per_weak_model: &[Vec<(usize, Split)>],
    ) -> Result<()> {
        let state = self.iteration.as_ref().ok_or_else(|| {
            TrainError::transport("EvaluateSplits outside an iteration")
        })?;
        let dataset = self.dataset.as_ref().ok_or_else(|| {
            TrainError::transport("EvaluateSplits before the dataset cache was loaded")
        })?;

        let dir = self.eval_dir(state.iter_uid, state.layer);
        fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;

        for (weak_idx, splits) in splits_per_weak_model.iter().enumerate() {
            let replica = state.weak_models.get(weak_idx).ok_or_else(|| {
                TrainError::transport("EvaluateSplits names an unknown weak model")
            })?;
            let node_examples = Self::examples_per_open_node(replica);
            for (pos, split) in splits {
                let examples = node_examples.get(*pos).ok_or_else(|| {
                    TrainError::transport("EvaluateSplits names an unknown open node")
                })?;
                let feature = split.feature.ok_or_else(|| {
                    TrainError::transport("EvaluateSplits carries an empty split")
                })?;
                let mut bitmap = EvalBitmap::new(examples.len());
                for (bit, &example) in examples.iter().enumerate() {
                    if self.condition_holds(dataset, feature, example, &split.condition)? {
                        bitmap.set(bit);
                    }
                }
                let path = Self::eval_file(&dir, weak_idx, *pos);
                let raw = postcard::to_allocvec(&bitmap)?;
                fs::write(&path, raw).map_err(|e| TrainError::io(&path, e))?;
            }
        }
        Ok(())
    }

    fn share_splits(&mut self, splits_per_weak_model: &[Vec<Split>]) -> Result<()> {
        let state = self.iteration.as_mut().ok_or_else(|| {
            TrainError::transport("ShareSplits outside an iteration")
        })?;
        let min_gain = self.welcome.config.min_split_gain;
        let dir = self
            .welcome
            .work_directory
            .join(TMP_DIR)
            .join(format!("evals-{:016x}", state.iter_uid))
            .join(format!("layer-{}", state.layer));

        for (weak_idx, splits) in splits_per_weak_model.iter().enumerate() {
            let replica = state.weak_models.get_mut(weak_idx).ok_or_else(|| {
                TrainError::transport("ShareSplits names an unknown weak model")
            })?;
            let node_examples = Self::examples_per_open_node(replica);
            let children = replica.builder.apply_splits(splits, min_gain)?;
            for (pos, child) in children.iter().enumerate() {
                let Some((negative, positive)) = child else {
                    continue;
                };
                let path = Self::eval_file(&dir, weak_idx, pos);
                let raw = fs::read(&path).map_err(|e| TrainError::io(&path, e))?;
                let bitmap: EvalBitmap = postcard::from_bytes(&raw)?;
                for (bit, &example) in node_examples[pos].iter().enumerate() {
                    replica.example_to_node[example as usize] = if bitmap.get(bit) {
                        *positive
                    } else {
                        *negative
                    };
                }
            }
        }
        state.layer += 1;
        Ok(())
    }

    fn end_iter(&mut self, compute_training_loss: bool) -> Result<Option<(f64, Vec<f64>)>> {
        let state = self.iteration.take().ok_or_else(|| {
            TrainError::transport("EndIter outside an iteration")
        })?;
        let predictions = self.predictions.as_mut().ok_or_else(|| {
            TrainError::transport("EndIter without predictions")
        })?;

        for (weak_idx, replica) in state.weak_models.iter().enumerate() {
            let tree = replica.builder.tree();
            for (example, &node) in replica.example_to_node.iter().enumerate() {
                let value = tree.leaf_value(node).ok_or_else(|| {
                    TrainError::transport("an example is mapped to a non-leaf node")
                })?;
                predictions[[weak_idx, example]] += value;
            }
        }

        // The evaluation scratch space of this iteration is dead; worker
        // zero reclaims it once the fan-in guarantees nobody reads it.
        if self.worker_idx == 0 {
            let scratch = self
                .welcome
                .work_directory
                .join(TMP_DIR)
                .join(format!("evals-{:016x}", state.iter_uid));
            let _ = fs::remove_dir_all(scratch);
        }

        if compute_training_loss {
            let dataset = self.dataset.as_ref().ok_or_else(|| {
                TrainError::transport("EndIter before the dataset cache was loaded")
            })?;
            let loss = self.loss()?;
            let (value, metrics) = loss.evaluate(&dataset.labels, self.predictions.as_ref().unwrap());
            Ok(Some((value, metrics)))
        } else {
            Ok(None)
        }
    }

    fn create_checkpoint_shard(
        &mut self,
        shard: u32,
        begin_example: u64,
        end_example: u64,
    ) -> Result<PathBuf> {
        let predictions = self.predictions.as_ref().ok_or_else(|| {
            TrainError::transport("CreateCheckpoint without predictions")
        })?;
        let num_outputs = predictions.nrows();
        let mut values =
            Vec::with_capacity(num_outputs * (end_example - begin_example) as usize);
        for output in 0..num_outputs {
            for example in begin_example..end_example {
                values.push(predictions[[output, example as usize]]);
            }
        }
        let payload = PredictionShard {
            begin_example,
            end_example,
            num_outputs: num_outputs as u32,
            values,
        };

        self.temp_counter += 1;
        let path = self.welcome.work_directory.join(TMP_DIR).join(format!(
            "predictions-shard-{shard}-worker-{}-{}",
            self.worker_idx, self.temp_counter
        ));
        payload.save(&path)?;
        Ok(path)
    }

    fn restore_checkpoint(
        &mut self,
        iter_idx: u32,
        num_shards: u32,
        num_weak_models: u32,
    ) -> Result<()> {
        self.ensure_dataset()?;
        let num_examples = self.num_examples();
        let dir = checkpoint_dir(&self.welcome.work_directory, iter_idx);

        let mut predictions = Array2::zeros((num_weak_models as usize, num_examples));
        for shard in 0..num_shards {
            let path = dir.join(prediction_shard_name(shard, num_shards));
            let payload = PredictionShard::load(&path)?;
            let width = (payload.end_example - payload.begin_example) as usize;
            for output in 0..payload.num_outputs as usize {
                for offset in 0..width {
                    predictions[[output, payload.begin_example as usize + offset]] =
                        payload.values[output * width + offset];
                }
            }
        }
        self.predictions = Some(predictions);
        self.iteration = None;
        Ok(())
    }

    /// Whether a request needs per-iteration state a fresh worker lacks.
    fn has_iteration(&self, iter_idx: Option<u32>) -> bool {
        match (&self.iteration, iter_idx) {
            (Some(state), Some(iter_idx)) => state.iter_idx == iter_idx,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

fn split_gain(parent: &GradStats, negative: &GradStats, min_examples: u64) -> Option<f64> {
    let positive_count = parent.count - negative.count;
    if negative.count < min_examples || positive_count < min_examples {
        return None;
    }
    let mut positive = *parent;
    positive.count -= negative.count;
    positive.sum_gradient -= negative.sum_gradient;
    positive.sum_hessian -= negative.sum_hessian;
    let gain = negative.score() + positive.score() - parent.score();
    (gain > 0.0).then_some(gain)
}

impl WorkerHandler for TrainingWorker {
    fn handle(&mut self, envelope: &RequestEnvelope) -> Result<WorkerReply> {
        let worker = self.worker_idx;
        let request_id = envelope.request_id;
        let reply = match &envelope.request {
            WorkerRequest::StartTraining => {
                self.ensure_dataset()?;
                WorkerReply::ack(worker, request_id, WorkerReplyBody::StartTraining)
            }
            WorkerRequest::GetLabelStatistics => {
                let statistics = self.label_statistics()?;
                WorkerReply::ack(
                    worker,
                    request_id,
                    WorkerReplyBody::GetLabelStatistics { statistics },
                )
            }
            WorkerRequest::SetInitialPredictions {
                initial_predictions,
            } => {
                self.ensure_dataset()?;
                let num_examples = self.num_examples();
                let mut predictions =
                    Array2::zeros((initial_predictions.len(), num_examples));
                for (output, &value) in initial_predictions.iter().enumerate() {
                    for example in 0..num_examples {
                        predictions[[output, example]] = value;
                    }
                }
                self.predictions = Some(predictions);
                self.iteration = None;
                WorkerReply::ack(worker, request_id, WorkerReplyBody::SetInitialPredictions)
            }
            WorkerRequest::StartNewIter {
                iter_idx,
                iter_uid,
                seed: _,
            } => {
                if self.predictions.is_none() {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                let root_stats = self.start_new_iter(*iter_idx, *iter_uid)?;
                WorkerReply::ack(
                    worker,
                    request_id,
                    WorkerReplyBody::StartNewIter { root_stats },
                )
            }
            WorkerRequest::FindSplits {
                features_per_weak_model,
            } => {
                if !self.has_iteration(None) {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                let splits_per_weak_model = self.find_splits(features_per_weak_model)?;
                WorkerReply::ack(
                    worker,
                    request_id,
                    WorkerReplyBody::FindSplits {
                        splits_per_weak_model,
                    },
                )
            }
            WorkerRequest::EvaluateSplits {
                splits_per_weak_model,
            } => {
                if !self.has_iteration(None) {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                self.evaluate_splits(splits_per_weak_model)?;
                WorkerReply::ack(worker, request_id, WorkerReplyBody::EvaluateSplits)
            }
            WorkerRequest::ShareSplits {
                splits_per_weak_model,
                active_workers: _,
            } => {
                if !self.has_iteration(None) {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                self.share_splits(splits_per_weak_model)?;
                WorkerReply::ack(worker, request_id, WorkerReplyBody::ShareSplits)
            }
            WorkerRequest::EndIter {
                iter_idx,
                compute_training_loss,
            } => {
                if !self.has_iteration(Some(*iter_idx)) {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                let evaluation = self
                    .end_iter(*compute_training_loss)?
                    .map(|(loss, metrics)| crate::protocol::TrainingEvaluation {
                        loss,
                        metrics,
                    });
                WorkerReply::ack(worker, request_id, WorkerReplyBody::EndIter { evaluation })
            }
            WorkerRequest::CreateCheckpoint {
                shard,
                num_shards: _,
                begin_example,
                end_example,
            } => {
                if self.predictions.is_none() {
                    return Ok(WorkerReply::restart_iter(worker, request_id));
                }
                let temp_path =
                    self.create_checkpoint_shard(*shard, *begin_example, *end_example)?;
                WorkerReply::ack(
                    worker,
                    request_id,
                    WorkerReplyBody::CreateCheckpoint {
                        shard: *shard,
                        temp_path,
                    },
                )
            }
            WorkerRequest::RestoreCheckpoint {
                iter_idx,
                num_shards,
                num_weak_models,
            } => {
                self.restore_checkpoint(*iter_idx, *num_shards, *num_weak_models)?;
                WorkerReply::ack(worker, request_id, WorkerReplyBody::RestoreCheckpoint)
            }
        };
        Ok(reply)
    }
}
