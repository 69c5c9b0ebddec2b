//! Decision tree representation, split descriptors, and the tree builder.
//!
//! Trees are stored as a flat node vector with the root at index 0, built
//! layer by layer by [`TreeBuilder`]. During an iteration the builder tracks
//! the *open nodes*: leaves still eligible for splitting at the current
//! depth. Applying a layer of splits turns open leaves into split nodes and
//! opens their children.
//!
//! Conditions route an example to the *positive* child when they hold and to
//! the *negative* child otherwise.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::stats::GradStats;

/// Routing condition of a split node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitCondition {
    /// Numerical: positive when `value >= threshold`.
    HigherThan { threshold: f32 },
    /// Categorical: positive when the category is in the (sorted) set.
    ContainsCategories { categories: Vec<u16> },
    /// Boolean: positive when the value is true.
    IsTrue,
}

impl SplitCondition {
    /// Whether a raw column value satisfies the condition.
    pub fn evaluate_numerical(&self, value: f32) -> bool {
        match self {
            Self::HigherThan { threshold } => value >= *threshold,
            _ => false,
        }
    }

    pub fn evaluate_categorical(&self, category: u16) -> bool {
        match self {
            Self::ContainsCategories { categories } => categories.binary_search(&category).is_ok(),
            _ => false,
        }
    }
}

/// Best split proposal for one open node of one weak model.
///
/// `feature == None` marks the absence of a proposal. `worker` records the
/// proposing worker for deterministic tie-breaking when merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub feature: Option<usize>,
    pub condition: SplitCondition,
    pub gain: f64,
    pub worker: usize,
    /// Statistics of the examples routed to the negative child.
    pub negative: GradStats,
    /// Statistics of the examples routed to the positive child.
    pub positive: GradStats,
}

impl Split {
    /// The empty proposal.
    pub fn none() -> Self {
        Self {
            feature: None,
            condition: SplitCondition::IsTrue,
            gain: 0.0,
            worker: 0,
            negative: GradStats::default(),
            positive: GradStats::default(),
        }
    }

    /// A split is applied only when it proposes a feature and its gain
    /// exceeds the configured floor.
    pub fn is_valid(&self, min_gain: f64) -> bool {
        self.feature.is_some() && self.gain > min_gain
    }

    /// Ordering used when merging proposals: higher gain wins; ties go to the
    /// lower feature index, then the lower worker index.
    fn beats(&self, other: &Split) -> bool {
        if self.feature.is_none() {
            return false;
        }
        if other.feature.is_none() {
            return true;
        }
        if self.gain != other.gain {
            return self.gain > other.gain;
        }
        if self.feature != other.feature {
            return self.feature < other.feature;
        }
        self.worker < other.worker
    }
}

/// Merge one worker's proposals into the per-node best splits.
pub fn merge_best_splits(incoming: &[Split], merged: &mut [Split]) -> Result<()> {
    if incoming.len() != merged.len() {
        return Err(TrainError::transport(format!(
            "split merge length mismatch: got {} proposals for {} open nodes",
            incoming.len(),
            merged.len()
        )));
    }
    for (candidate, best) in incoming.iter().zip(merged.iter_mut()) {
        if candidate.beats(best) {
            *best = candidate.clone();
        }
    }
    Ok(())
}

/// Number of splits that would actually be applied.
pub fn num_valid_splits(splits: &[Split], min_gain: f64) -> usize {
    splits.iter().filter(|s| s.is_valid(min_gain)).count()
}

// =============================================================================
// Tree
// =============================================================================

/// One node of a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        condition: SplitCondition,
        negative: u32,
        positive: u32,
    },
}

/// A regression tree. Root at node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    fn new_root() -> Self {
        Self {
            nodes: vec![Node::Leaf { value: 0.0 }],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    /// Leaf value at `node`, or `None` if the node is a split.
    pub fn leaf_value(&self, node: u32) -> Option<f32> {
        match self.nodes.get(node as usize) {
            Some(Node::Leaf { value }) => Some(*value),
            _ => None,
        }
    }
}

// =============================================================================
// Leaf setter
// =============================================================================

/// Turns node statistics into a leaf value: the shrunk Newton step
/// `-shrinkage * sum_g / sum_h`. Produced by the loss; see
/// [`crate::loss::Loss::leaf_setter`].
#[derive(Debug, Clone, Copy)]
pub struct LeafSetter {
    shrinkage: f32,
}

impl LeafSetter {
    pub fn new(shrinkage: f32) -> Self {
        Self { shrinkage }
    }

    pub fn value(&self, stats: &GradStats) -> f32 {
        if stats.sum_hessian > 0.0 {
            -self.shrinkage * (stats.sum_gradient / stats.sum_hessian) as f32
        } else {
            0.0
        }
    }
}

// =============================================================================
// TreeBuilder
// =============================================================================

/// Builds one weak model layer by layer.
///
/// The manager and the workers run identical builders fed with the same
/// merged splits, so node ids stay consistent across the pool without ever
/// shipping tree structure over the wire.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    tree: Tree,
    open_nodes: Vec<u32>,
    leaf_setter: LeafSetter,
}

impl TreeBuilder {
    pub fn new(leaf_setter: LeafSetter) -> Self {
        Self {
            tree: Tree::new_root(),
            open_nodes: vec![0],
            leaf_setter,
        }
    }

    /// Seed the root with the iteration's root statistics.
    pub fn set_root_stats(&mut self, stats: &GradStats) {
        self.tree.nodes[0] = Node::Leaf {
            value: self.leaf_setter.value(stats),
        };
    }

    pub fn open_nodes(&self) -> &[u32] {
        &self.open_nodes
    }

    pub fn num_open_nodes(&self) -> usize {
        self.open_nodes.len()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Apply one layer of merged splits, one entry per open node (in open
    /// node order). Valid splits turn their leaf into a split node and open
    /// two children; nodes without a valid split become final leaves.
    ///
    /// Returns, per former open node, the `(negative, positive)` child ids of
    /// the applied split, or `None` when the node was closed.
    pub fn apply_splits(
        &mut self,
        splits: &[Split],
        min_gain: f64,
    ) -> Result<Vec<Option<(u32, u32)>>> {
        if splits.len() != self.open_nodes.len() {
            return Err(TrainError::transport(format!(
                "got {} splits for {} open nodes",
                splits.len(),
                self.open_nodes.len()
            )));
        }

        let mut children = Vec::with_capacity(splits.len());
        let mut next_open = Vec::with_capacity(splits.len() * 2);
        for (&node, split) in self.open_nodes.iter().zip(splits) {
            if !split.is_valid(min_gain) {
                children.push(None);
                continue;
            }
            let feature = split.feature.unwrap_or_default();

            let negative = self.tree.nodes.len() as u32;
            let positive = negative + 1;
            self.tree.nodes.push(Node::Leaf {
                value: self.leaf_setter.value(&split.negative),
            });
            self.tree.nodes.push(Node::Leaf {
                value: self.leaf_setter.value(&split.positive),
            });
            self.tree.nodes[node as usize] = Node::Split {
                feature,
                condition: split.condition.clone(),
                negative,
                positive,
            };

            next_open.push(negative);
            next_open.push(positive);
            children.push(Some((negative, positive)));
        }
        self.open_nodes = next_open;
        Ok(children)
    }

    /// Finalize the tree and hand it over.
    pub fn finish(self) -> Tree {
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats(count: u64, sum_gradient: f64, sum_hessian: f64) -> GradStats {
        GradStats {
            count,
            sum_gradient,
            sum_hessian,
        }
    }

    fn split_on(feature: usize, gain: f64, worker: usize) -> Split {
        Split {
            feature: Some(feature),
            condition: SplitCondition::HigherThan { threshold: 0.5 },
            gain,
            worker,
            negative: stats(4, 2.0, 4.0),
            positive: stats(6, -3.0, 6.0),
        }
    }

    #[test]
    fn empty_split_is_invalid() {
        assert!(!Split::none().is_valid(0.0));
        assert!(split_on(0, 1.0, 0).is_valid(0.0));
        assert!(!split_on(0, 1.0, 0).is_valid(2.0));
    }

    #[test]
    fn merge_takes_best_gain() {
        let mut merged = vec![Split::none(), split_on(3, 1.0, 1)];
        let incoming = vec![split_on(0, 0.5, 2), split_on(1, 2.0, 2)];
        merge_best_splits(&incoming, &mut merged).unwrap();

        assert_eq!(merged[0].feature, Some(0));
        assert_eq!(merged[1].feature, Some(1));
        assert_relative_eq!(merged[1].gain, 2.0);
    }

    #[test]
    fn merge_breaks_ties_by_feature_then_worker() {
        let mut merged = vec![split_on(5, 1.0, 0)];
        merge_best_splits(&[split_on(2, 1.0, 3)], &mut merged).unwrap();
        assert_eq!(merged[0].feature, Some(2));

        // Same feature and gain: the earlier worker wins.
        merge_best_splits(&[split_on(2, 1.0, 1)], &mut merged).unwrap();
        assert_eq!(merged[0].worker, 1);
        merge_best_splits(&[split_on(2, 1.0, 2)], &mut merged).unwrap();
        assert_eq!(merged[0].worker, 1);
    }

    #[test]
    fn merge_length_mismatch_is_an_error() {
        let mut merged = vec![Split::none()];
        assert!(merge_best_splits(&[], &mut merged).is_err());
    }

    #[test]
    fn builder_grows_one_layer() {
        let mut builder = TreeBuilder::new(LeafSetter::new(0.1));
        builder.set_root_stats(&stats(10, -1.0, 10.0));
        assert_eq!(builder.open_nodes(), &[0]);
        assert_relative_eq!(builder.tree().leaf_value(0).unwrap(), 0.01);

        let children = builder.apply_splits(&[split_on(0, 1.0, 0)], 0.0).unwrap();
        assert_eq!(children, vec![Some((1, 2))]);
        assert_eq!(builder.open_nodes(), &[1, 2]);
        assert_eq!(builder.tree().num_nodes(), 3);

        // Children carry leaf values derived from the per-child statistics.
        assert_relative_eq!(builder.tree().leaf_value(1).unwrap(), -0.05);
        assert_relative_eq!(builder.tree().leaf_value(2).unwrap(), 0.05);
    }

    #[test]
    fn invalid_split_closes_the_node() {
        let mut builder = TreeBuilder::new(LeafSetter::new(0.1));
        builder.set_root_stats(&stats(10, 0.0, 10.0));

        let children = builder.apply_splits(&[Split::none()], 0.0).unwrap();
        assert_eq!(children, vec![None]);
        assert_eq!(builder.num_open_nodes(), 0);

        let tree = builder.finish();
        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.num_leaves(), 1);
    }

    #[test]
    fn condition_evaluation() {
        let higher = SplitCondition::HigherThan { threshold: 2.0 };
        assert!(higher.evaluate_numerical(2.0));
        assert!(!higher.evaluate_numerical(1.9));

        let cats = SplitCondition::ContainsCategories {
            categories: vec![1, 4, 7],
        };
        assert!(cats.evaluate_categorical(4));
        assert!(!cats.evaluate_categorical(2));
    }
}
