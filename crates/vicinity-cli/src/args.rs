//! Command-line surface (§6 options, exposed as flags/env-backed clap
//! args). Parsing itself lives entirely in this crate — `vicinity-core`
//! never sees a `clap::Parser`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Memory-based (k-NN) classifier: train on labeled examples, classify
/// unlabeled ones.
#[derive(Debug, Parser)]
#[command(name = "vicinity", version, about)]
pub struct Cli {
    /// Training data file.
    #[arg(short = 't', long = "train", value_name = "FILE")]
    pub train_file: PathBuf,

    /// Test data file to classify against the trained instance base.
    #[arg(short = 'T', long = "test", value_name = "FILE")]
    pub test_file: Option<PathBuf>,

    /// Where to write one prediction line per test row (defaults to stdout).
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// INPUTFORMAT; auto-detected from the training file when omitted.
    #[arg(long = "format", value_enum)]
    pub format: Option<InputFormatArg>,

    /// FLENGTH, required for --format compact.
    #[arg(long = "flength", default_value_t = 0)]
    pub flength: usize,

    /// TARGET_POS, 0-based column of the class label (default: last column).
    #[arg(long = "target-pos")]
    pub target_pos: Option<usize>,

    /// Number of features per instance; required for sparse formats,
    /// inferred from the training file's header row otherwise.
    #[arg(long = "num-features")]
    pub num_features: Option<usize>,

    /// GLOBAL_METRIC applied to every feature unless overridden.
    #[arg(long = "metric", value_enum, default_value_t = MetricArg::Overlap)]
    pub metric: MetricArg,

    /// WEIGHTING scheme for per-feature distance scaling.
    #[arg(long = "weighting", value_enum, default_value_t = WeightingArg::GainRatio)]
    pub weighting: WeightingArg,

    /// Search algorithm: ib1 (full k-NN), igtree, tribl:<offset>, tribl2.
    #[arg(long = "algorithm", default_value = "ib1")]
    pub algorithm: String,

    /// NEIGHBORS, number of distance bins to keep.
    #[arg(short = 'k', long = "neighbors", default_value_t = 1)]
    pub neighbors: usize,

    /// DECAY weighting of neighbours by distance.
    #[arg(long = "decay", value_enum, default_value_t = DecayArg::Zero)]
    pub decay: DecayArg,

    /// NORMALISATION of the final vote.
    #[arg(long = "normalisation", value_enum, default_value_t = NormalisationArg::None)]
    pub normalisation: NormalisationArg,

    /// BIN_SIZE, number of equal-population bins per numeric feature.
    #[arg(long = "bin-size", default_value_t = 20)]
    pub bin_size: usize,

    /// MVD_LIMIT, minimum value frequency to trust its probability vector.
    #[arg(long = "mvd-limit", default_value_t = 1)]
    pub mvd_limit: u64,

    /// SEED for tie-break and ExpDecay randomness; omit for nondeterministic.
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// EXACT_MATCH: try an exact trie lookup before falling back to search.
    #[arg(long = "exact-match", default_value_t = false)]
    pub exact_match: bool,

    /// HASHED_TREE: build a hash index alongside each node's sorted children.
    #[arg(long = "hashed-tree", default_value_t = false)]
    pub hashed_tree: bool,

    /// Print the neighbour set alongside every prediction.
    #[arg(long = "neighbors-verbose", default_value_t = false)]
    pub verbose_neighbors: bool,

    /// Leave-one-out evaluate the training set instead of (or in addition
    /// to) classifying --test.
    #[arg(long = "loo", default_value_t = false)]
    pub leave_one_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputFormatArg {
    C45,
    Columns,
    Tabbed,
    Arff,
    Compact,
    Sparse,
    SparseBin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricArg {
    Overlap,
    Numeric,
    Euclidean,
    ValueDiff,
    Jeffrey,
    Jsdiv,
    Levenshtein,
    Dice,
    Cosine,
    DotProduct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WeightingArg {
    None,
    GainRatio,
    InfoGain,
    ChiSquare,
    SharedVariance,
    StandardDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecayArg {
    Zero,
    InvDist,
    InvLinear,
    ExpDecay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NormalisationArg {
    None,
    Probability,
    AddFactor,
    LogProbability,
}
