//! Memory-based (k-NN) classification engine.
//!
//! This crate is the pure, I/O-free engine: feature/target modeling,
//! distance metrics, statistics, the instance-base trie, search, and
//! distance-weighted voting. It takes pre-tokenized feature vectors in
//! and hands back a classification plus (optionally) the neighbour set
//! that produced it; reading files, parsing command-line options, and
//! tokenizing raw input lines are the CLI crate's job.
//!
//! Start at [`experiment::Experiment`]: build it with
//! [`config::EngineOptions`], feed it training rows with
//! [`experiment::Experiment::add_training_instance`], call
//! [`experiment::Experiment::train`], then classify.

pub mod bestk;
pub mod config;
pub mod error;
pub mod experiment;
pub mod metric;
pub mod model;
pub mod pool;
pub mod serial;
pub mod stats;
pub mod tester;
pub mod trie;
pub mod vote;

pub use config::{EngineOptions, EngineOptionsBuilder};
pub use error::{EngineError, Result};
pub use experiment::{ClassificationResult, DataWarning, Experiment, Phase};
pub use model::{ClassDistribution, Feature, Instance, MetricKind, Targets};
pub use pool::{FeatureValueId, TargetValueId};
