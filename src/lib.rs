//! treeline: distributed gradient boosted trees for Rust.
//!
//! This crate is the manager-side coordinator of a distributed GBT learner:
//! it drives the training of an ensemble of shallow regression trees across a
//! pool of feature-sharded workers, and survives worker restarts through
//! iteration-indexed checkpoints.
//!
//! # Key Types
//!
//! - [`train`] - Drive one training run end to end
//! - [`TrainingConfig`] / [`Deployment`] - Run configuration
//! - [`GradientBoostedModel`] - The growing ensemble
//! - [`AbstractManager`] / [`ManagerFactory`] - Transport abstraction
//! - [`TrainingWorker`] - Worker-side protocol handler
//! - [`build_cache`] - Vertically partition a dataset into worker shards
//!
//! # Architecture
//!
//! The driver is a single cooperative thread speaking an asynchronous
//! request/reply protocol to the workers ([`protocol`]). Each boosting
//! iteration runs a strictly sequenced pipeline (`StartNewIter` →
//! `FindSplits` → `EvaluateSplits` → `ShareSplits` → `EndIter`) per depth
//! layer ([`iteration`]); checkpoints are written between iterations
//! ([`checkpoint`]) and a worker that lost its state is recovered by
//! restoring the latest one ([`train`]).

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod distribute;
pub mod emitters;
pub mod error;
pub mod iteration;
pub mod loss;
pub mod model;
pub mod monitoring;
pub mod ownership;
pub mod protocol;
pub mod stats;
pub mod testing;
pub mod train;
pub mod tree;
pub mod worker;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use cache::{build_cache, CacheMetadata, ColumnMeta, DatasetSource, RawColumn, RawDataset};
pub use config::{CandidateFeatures, Deployment, LossKind, Task, TrainingConfig};
pub use distribute::{
    AbstractManager, ManagerFactory, MultiThreadFactory, MultiThreadManager, WorkerHandler,
};
pub use error::{Result, TrainError};
pub use model::{GradientBoostedModel, TrainingLogEntry};
pub use ownership::{assign_features_to_workers, FeatureOwnership};
pub use train::train;
pub use worker::TrainingWorker;
