//! Loss functions of the distributed learner.
//!
//! The training driver only needs a small surface: initial predictions from
//! the label statistics, the number of trees grown per iteration, the
//! secondary metric names, and the leaf-setter factory. Workers additionally
//! use the gradient/hessian computation and the training-loss evaluation.
//!
//! Predictions, gradients, and hessians are stored output-major:
//! `[num_outputs, num_examples]`, one row per weak model.

use ndarray::Array2;
use rayon::prelude::*;

use crate::config::{LossKind, Task};
use crate::error::{Result, TrainError};
use crate::stats::LabelStatistics;
use crate::tree::LeafSetter;

const MIN_LOG_ARG: f64 = 1e-12;
const MIN_HESSIAN: f64 = 1e-16;

/// A concrete loss, dispatched by [`LossKind`].
#[derive(Debug, Clone)]
pub enum Loss {
    Squared,
    BinaryLogLoss,
    MultinomialLogLoss { num_classes: usize },
}

impl Loss {
    /// Instantiate a loss and check it against the task.
    pub fn new(kind: LossKind, task: Task) -> Result<Self> {
        match (kind, task) {
            (LossKind::Squared, Task::Regression) => Ok(Self::Squared),
            (LossKind::BinaryLogLoss, Task::Classification { num_classes: 2 }) => {
                Ok(Self::BinaryLogLoss)
            }
            (LossKind::MultinomialLogLoss, Task::Classification { num_classes })
                if num_classes >= 2 =>
            {
                Ok(Self::MultinomialLogLoss {
                    num_classes: num_classes as usize,
                })
            }
            (_, Task::Ranking) => Err(TrainError::config(
                "ranking losses are not implemented by the distributed learner",
            )),
            (kind, task) => Err(TrainError::config(format!(
                "loss {kind:?} is incompatible with task {task:?}"
            ))),
        }
    }

    /// Number of weak models grown per boosting iteration; also the length
    /// of the initial prediction vector.
    pub fn num_trees_per_iter(&self) -> usize {
        match self {
            Self::Squared | Self::BinaryLogLoss => 1,
            Self::MultinomialLogLoss { num_classes } => *num_classes,
        }
    }

    /// The optimal constant predictions before any tree is grown.
    pub fn initial_predictions(&self, statistics: &LabelStatistics) -> Result<Vec<f32>> {
        match (self, statistics) {
            (
                Self::Squared,
                LabelStatistics::Regression { count, sum, .. },
            ) => {
                let mean = if *count > 0 {
                    sum / *count as f64
                } else {
                    0.0
                };
                Ok(vec![mean as f32])
            }
            (
                Self::BinaryLogLoss,
                LabelStatistics::Classification {
                    count,
                    class_counts,
                },
            ) => {
                if class_counts.len() != 2 {
                    return Err(TrainError::config(format!(
                        "binary log-loss expects 2 classes, got {}",
                        class_counts.len()
                    )));
                }
                let p = (class_counts[1] as f64 / (*count).max(1) as f64)
                    .clamp(MIN_LOG_ARG, 1.0 - MIN_LOG_ARG);
                Ok(vec![(p / (1.0 - p)).ln() as f32])
            }
            (Self::MultinomialLogLoss { num_classes }, LabelStatistics::Classification { .. }) => {
                // Multinomial models start from zero margins.
                Ok(vec![0.0; *num_classes])
            }
            (_, statistics) => Err(TrainError::protocol(
                "label statistics matching the loss",
                match statistics {
                    LabelStatistics::Regression { .. } => "Regression",
                    LabelStatistics::Classification { .. } => "Classification",
                },
            )),
        }
    }

    /// Names of the secondary metrics reported next to the training loss.
    pub fn secondary_metric_names(&self) -> Vec<String> {
        match self {
            Self::Squared => vec!["rmse".to_string()],
            Self::BinaryLogLoss | Self::MultinomialLogLoss { .. } => {
                vec!["accuracy".to_string()]
            }
        }
    }

    /// Factory for the leaf setter used by every tree builder of the run.
    pub fn leaf_setter(&self, shrinkage: f32) -> LeafSetter {
        LeafSetter::new(shrinkage)
    }

    /// Compute the weak-learner targets from the current predictions.
    pub fn gradients_into(
        &self,
        labels: &[f32],
        predictions: &Array2<f32>,
        gradients: &mut Array2<f32>,
        hessians: &mut Array2<f32>,
    ) {
        let num_examples = labels.len();
        match self {
            Self::Squared => {
                for i in 0..num_examples {
                    gradients[[0, i]] = predictions[[0, i]] - labels[i];
                    hessians[[0, i]] = 1.0;
                }
            }
            Self::BinaryLogLoss => {
                for i in 0..num_examples {
                    let p = sigmoid(predictions[[0, i]] as f64);
                    gradients[[0, i]] = (p - labels[i] as f64) as f32;
                    hessians[[0, i]] = (p * (1.0 - p)).max(MIN_HESSIAN) as f32;
                }
            }
            Self::MultinomialLogLoss { num_classes } => {
                let mut probs = vec![0.0f64; *num_classes];
                for i in 0..num_examples {
                    softmax_into(predictions, i, &mut probs);
                    let label = labels[i] as usize;
                    for (class, &p) in probs.iter().enumerate() {
                        let y = if class == label { 1.0 } else { 0.0 };
                        gradients[[class, i]] = (p - y) as f32;
                        hessians[[class, i]] = (p * (1.0 - p)).max(MIN_HESSIAN) as f32;
                    }
                }
            }
        }
    }

    /// Training loss and secondary metrics over the full dataset.
    ///
    /// The parallel accumulation uses fixed chunk boundaries combined in
    /// chunk order, so the result is bit-identical across runs regardless of
    /// thread scheduling. Replayed iterations after a checkpoint restore rely
    /// on this.
    pub fn evaluate(&self, labels: &[f32], predictions: &Array2<f32>) -> (f64, Vec<f64>) {
        let num_examples = labels.len();
        if num_examples == 0 {
            return (0.0, vec![0.0; self.secondary_metric_names().len()]);
        }
        let (sum_loss, sum_metric) = match self {
            Self::Squared => chunked_accumulate(num_examples, |i| {
                let err = (predictions[[0, i]] - labels[i]) as f64;
                (err * err, 0)
            }),
            Self::BinaryLogLoss => chunked_accumulate(num_examples, |i| {
                let p = sigmoid(predictions[[0, i]] as f64).clamp(MIN_LOG_ARG, 1.0 - MIN_LOG_ARG);
                let y = labels[i] as f64;
                let loss = -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
                let correct = ((p >= 0.5) as i32 as f64 == y) as u64;
                (loss, correct)
            }),
            Self::MultinomialLogLoss { num_classes } => {
                chunked_accumulate(num_examples, |i| {
                    let mut probs = vec![0.0f64; *num_classes];
                    softmax_into(predictions, i, &mut probs);
                    let label = labels[i] as usize;
                    let loss = -probs[label].max(MIN_LOG_ARG).ln();
                    let predicted = probs
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(class, _)| class)
                        .unwrap_or(0);
                    (loss, (predicted == label) as u64)
                })
            }
        };
        match self {
            Self::Squared => {
                let mse = sum_loss / num_examples as f64;
                (mse, vec![mse.sqrt()])
            }
            _ => (
                sum_loss / num_examples as f64,
                vec![sum_metric as f64 / num_examples as f64],
            ),
        }
    }
}

/// Chunk size of the deterministic parallel accumulation.
const EVAL_CHUNK: usize = 4096;

/// Accumulate `(loss, count)` contributions in parallel over fixed chunks,
/// combining the per-chunk partials in chunk order.
fn chunked_accumulate(
    num_examples: usize,
    per_example: impl Fn(usize) -> (f64, u64) + Sync,
) -> (f64, u64) {
    let num_chunks = num_examples.div_ceil(EVAL_CHUNK);
    let partials: Vec<(f64, u64)> = (0..num_chunks)
        .into_par_iter()
        .map(|chunk| {
            let begin = chunk * EVAL_CHUNK;
            let end = num_examples.min(begin + EVAL_CHUNK);
            let mut sum = 0.0;
            let mut count = 0;
            for i in begin..end {
                let (loss, correct) = per_example(i);
                sum += loss;
                count += correct;
            }
            (sum, count)
        })
        .collect();
    partials
        .into_iter()
        .fold((0.0, 0), |acc, part| (acc.0 + part.0, acc.1 + part.1))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax_into(predictions: &Array2<f32>, example: usize, out: &mut [f64]) {
    let mut max = f64::NEG_INFINITY;
    for (class, slot) in out.iter_mut().enumerate() {
        *slot = predictions[[class, example]] as f64;
        max = max.max(*slot);
    }
    let mut sum = 0.0;
    for slot in out.iter_mut() {
        *slot = (*slot - max).exp();
        sum += *slot;
    }
    for slot in out.iter_mut() {
        *slot /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn squared_loss_initial_predictions_are_the_mean() {
        let loss = Loss::new(LossKind::Squared, Task::Regression).unwrap();
        let stats = LabelStatistics::Regression {
            count: 4,
            sum: 10.0,
            sum_squares: 30.0,
        };
        assert_eq!(loss.initial_predictions(&stats).unwrap(), vec![2.5]);
        assert_eq!(loss.num_trees_per_iter(), 1);
    }

    #[test]
    fn binary_initial_predictions_are_log_odds() {
        let loss = Loss::new(
            LossKind::BinaryLogLoss,
            Task::Classification { num_classes: 2 },
        )
        .unwrap();
        let stats = LabelStatistics::Classification {
            count: 4,
            class_counts: vec![1, 3],
        };
        let preds = loss.initial_predictions(&stats).unwrap();
        assert_relative_eq!(preds[0], (0.75f32 / 0.25).ln(), epsilon = 1e-5);
    }

    #[test]
    fn multinomial_spans_one_tree_per_class() {
        let loss = Loss::new(
            LossKind::MultinomialLogLoss,
            Task::Classification { num_classes: 3 },
        )
        .unwrap();
        assert_eq!(loss.num_trees_per_iter(), 3);
        let stats = LabelStatistics::Classification {
            count: 9,
            class_counts: vec![3, 3, 3],
        };
        assert_eq!(loss.initial_predictions(&stats).unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn loss_task_mismatch_is_rejected() {
        assert!(Loss::new(LossKind::Squared, Task::Classification { num_classes: 2 }).is_err());
        assert!(Loss::new(LossKind::BinaryLogLoss, Task::Regression).is_err());
        assert!(Loss::new(LossKind::Squared, Task::Ranking).is_err());
    }

    #[test]
    fn squared_gradients() {
        let loss = Loss::Squared;
        let labels = vec![1.0, 2.0];
        let predictions = Array2::from_shape_vec((1, 2), vec![1.5, 1.5]).unwrap();
        let mut gradients = Array2::zeros((1, 2));
        let mut hessians = Array2::zeros((1, 2));
        loss.gradients_into(&labels, &predictions, &mut gradients, &mut hessians);

        assert_relative_eq!(gradients[[0, 0]], 0.5);
        assert_relative_eq!(gradients[[0, 1]], -0.5);
        assert_relative_eq!(hessians[[0, 0]], 1.0);
    }

    #[test]
    fn binary_gradients_match_sigmoid() {
        let loss = Loss::BinaryLogLoss;
        let labels = vec![1.0];
        let predictions = Array2::from_shape_vec((1, 1), vec![0.0]).unwrap();
        let mut gradients = Array2::zeros((1, 1));
        let mut hessians = Array2::zeros((1, 1));
        loss.gradients_into(&labels, &predictions, &mut gradients, &mut hessians);

        assert_relative_eq!(gradients[[0, 0]], -0.5);
        assert_relative_eq!(hessians[[0, 0]], 0.25);
    }

    #[test]
    fn evaluation_reports_loss_and_metrics() {
        let loss = Loss::Squared;
        let labels = vec![1.0, 3.0];
        let predictions = Array2::from_shape_vec((1, 2), vec![1.0, 1.0]).unwrap();
        let (value, metrics) = loss.evaluate(&labels, &predictions);
        assert_relative_eq!(value, 2.0);
        assert_relative_eq!(metrics[0], 2.0f64.sqrt());
    }

    #[test]
    fn multinomial_evaluation_accuracy() {
        let loss = Loss::MultinomialLogLoss { num_classes: 3 };
        let labels = vec![0.0, 2.0];
        // Example 0 favors class 0, example 1 favors class 1 (wrong).
        let predictions =
            Array2::from_shape_vec((3, 2), vec![2.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        let (_, metrics) = loss.evaluate(&labels, &predictions);
        assert_relative_eq!(metrics[0], 0.5);
    }
}
