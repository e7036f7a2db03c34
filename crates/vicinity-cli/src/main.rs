//! `vicinity`: command-line front end for the memory-based classifier
//! engine in `vicinity-core`. Owns everything the core crate deliberately
//! excludes: argument parsing, file I/O, input tokenization, and the
//! batch-classify driver with its correct/skipped/total summary.

mod args;
mod input;

use std::fs;
use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vicinity_core::config::EngineOptions;
use vicinity_core::experiment::Experiment;
use vicinity_core::model::MetricKind;
use vicinity_core::stats::{TreeOrder, Weighting};
use vicinity_core::trie::Algorithm;
use vicinity_core::vote::{Decay, Normalisation};

use args::{Cli, DecayArg, MetricArg, NormalisationArg, WeightingArg};
use input::{detect_format, tokenize_line, InputFormat, TokenizedRow};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn metric_from_arg(arg: MetricArg) -> MetricKind {
    match arg {
        MetricArg::Overlap => MetricKind::Overlap,
        MetricArg::Numeric => MetricKind::Numeric,
        MetricArg::Euclidean => MetricKind::Euclidean,
        MetricArg::ValueDiff => MetricKind::ValueDiff,
        MetricArg::Jeffrey => MetricKind::Jeffrey,
        MetricArg::Jsdiv => MetricKind::JensenShannon,
        MetricArg::Levenshtein => MetricKind::Levenshtein,
        MetricArg::Dice => MetricKind::Dice,
        MetricArg::Cosine => MetricKind::Cosine,
        MetricArg::DotProduct => MetricKind::DotProduct,
    }
}

fn weighting_from_arg(arg: WeightingArg) -> Weighting {
    match arg {
        WeightingArg::None => Weighting::None,
        WeightingArg::GainRatio => Weighting::GainRatio,
        WeightingArg::InfoGain => Weighting::InfoGain,
        WeightingArg::ChiSquare => Weighting::ChiSquare,
        WeightingArg::SharedVariance => Weighting::SharedVariance,
        WeightingArg::StandardDeviation => Weighting::StandardDeviation,
    }
}

fn decay_from_arg(arg: DecayArg) -> Decay {
    match arg {
        DecayArg::Zero => Decay::Zero,
        DecayArg::InvDist => Decay::InvDist,
        DecayArg::InvLinear => Decay::InvLinear,
        DecayArg::ExpDecay => Decay::ExpDecay { alpha: 1.0, beta: 1.0 },
    }
}

fn normalisation_from_arg(arg: NormalisationArg) -> Normalisation {
    match arg {
        NormalisationArg::None => Normalisation::None,
        NormalisationArg::Probability => Normalisation::Probability,
        NormalisationArg::AddFactor => Normalisation::AddFactor(1.0),
        NormalisationArg::LogProbability => Normalisation::LogProbability,
    }
}

fn algorithm_from_str(s: &str) -> Result<Algorithm> {
    if let Some(offset) = s.strip_prefix("tribl:") {
        let offset: usize = offset.parse().context("malformed tribl:<offset>")?;
        return Ok(Algorithm::Tribl(offset));
    }
    match s {
        "ib1" => Ok(Algorithm::Ib1),
        "igtree" => Ok(Algorithm::IgTree),
        "tribl2" => Ok(Algorithm::Tribl2),
        other => bail!("unknown --algorithm {other:?} (expected ib1, igtree, tribl:<n>, tribl2)"),
    }
}

fn tokenize_file(
    path: &std::path::Path,
    format: InputFormat,
    flength: usize,
    target_pos: Option<usize>,
) -> Result<Vec<TokenizedRow>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.trim_start().starts_with('%') {
            continue;
        }
        match tokenize_line(line, format, flength, target_pos) {
            Ok(row) => rows.push(row),
            Err(err) => {
                tracing::warn!(line = lineno + 1, %err, "skipping malformed line");
            }
        }
    }
    Ok(rows)
}

struct RunSummary {
    correct: u64,
    skipped: u64,
    total: u64,
}

impl RunSummary {
    fn accuracy(&self) -> f64 {
        let scored = self.total - self.skipped;
        if scored == 0 {
            0.0
        } else {
            self.correct as f64 / scored as f64
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let train_text =
        fs::read_to_string(&cli.train_file).with_context(|| format!("reading {}", cli.train_file.display()))?;
    let sample_line = train_text
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();
    let format = match cli.format {
        Some(f) => input_format_from_arg(f),
        None => detect_format(sample_line),
    };

    let train_rows = tokenize_file(&cli.train_file, format, cli.flength, cli.target_pos)?;
    if train_rows.is_empty() {
        bail!("no usable training rows in {}", cli.train_file.display());
    }
    let n_features = cli.num_features.unwrap_or(train_rows[0].values.len());

    let algorithm = algorithm_from_str(&cli.algorithm)?;
    let options = EngineOptions::builder()
        .algorithm(algorithm)
        .weighting(weighting_from_arg(cli.weighting))
        .tree_order(TreeOrder::GainRatio)
        .neighbors(cli.neighbors)
        .decay(decay_from_arg(cli.decay))
        .normalisation(normalisation_from_arg(cli.normalisation))
        .bin_size(cli.bin_size)
        .mvd_limit(cli.mvd_limit)
        .seed(cli.seed)
        .exact_match(cli.exact_match)
        .hashed_tree(cli.hashed_tree)
        .verbose_neighbors(cli.verbose_neighbors)
        .build()?;

    let metrics = vec![metric_from_arg(cli.metric); n_features];
    let mut experiment = Experiment::new(metrics, options);

    let mut skipped_training = 0u64;
    for row in &train_rows {
        if row.values.len() != n_features {
            skipped_training += 1;
            continue;
        }
        let Some(target) = &row.target else {
            skipped_training += 1;
            continue;
        };
        let refs: Vec<&str> = row.values.iter().map(String::as_str).collect();
        if let Err(err) = experiment.add_training_instance(&refs, target, 1.0) {
            tracing::warn!(%err, "skipping training row");
            skipped_training += 1;
        }
    }
    experiment.train()?;
    tracing::info!(
        rows = train_rows.len() - skipped_training as usize,
        skipped = skipped_training,
        "trained instance base"
    );

    let mut out: Box<dyn Write> = match &cli.output_file {
        Some(path) => Box::new(fs::File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(std::io::stdout()),
    };

    if cli.leave_one_out {
        let n_instances = experiment.instance_count();
        let summary = run_loo(&mut experiment, n_instances)?;
        tracing::info!(
            accuracy = summary.accuracy(),
            correct = summary.correct,
            skipped = summary.skipped,
            total = summary.total,
            "leave-one-out evaluation complete"
        );
    }

    if let Some(test_file) = &cli.test_file {
        let test_rows = tokenize_file(test_file, format, cli.flength, cli.target_pos)?;
        let summary = run_test(&experiment, &test_rows, n_features, &mut out)?;
        tracing::info!(
            accuracy = summary.accuracy(),
            correct = summary.correct,
            skipped = summary.skipped,
            total = summary.total,
            "classification complete"
        );
    }

    Ok(())
}

fn run_loo(experiment: &mut Experiment, n_instances: usize) -> Result<RunSummary> {
    let mut summary = RunSummary {
        correct: 0,
        skipped: 0,
        total: n_instances as u64,
    };
    for index in 0..n_instances {
        let expected = experiment.instance_target(index);
        match experiment.classify_loo(index) {
            Ok(result) => {
                if expected == Some(result.target) {
                    summary.correct += 1;
                }
            }
            Err(err) => {
                tracing::warn!(%err, index, "skipping loo instance");
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}

fn run_test(
    experiment: &Experiment,
    rows: &[TokenizedRow],
    n_features: usize,
    out: &mut Box<dyn Write>,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        correct: 0,
        skipped: 0,
        total: rows.len() as u64,
    };
    let mut queries = Vec::with_capacity(rows.len());
    for row in rows {
        if row.values.len() != n_features {
            summary.skipped += 1;
            queries.push(None);
            continue;
        }
        queries.push(Some(row.values.clone()));
    }
    let to_classify: Vec<Vec<String>> = queries.iter().flatten().cloned().collect();
    let results = experiment.classify_batch(&to_classify)?;

    let mut result_iter = results.into_iter();
    for (row, query) in rows.iter().zip(&queries) {
        let Some(_) = query else {
            writeln!(out, "?")?;
            continue;
        };
        let result = result_iter.next().expect("one result per submitted query");
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(%err, "skipping query");
                summary.skipped += 1;
                writeln!(out, "?")?;
                continue;
            }
        };
        let predicted = experiment.targets().name(result.target);
        writeln!(out, "{predicted}\t{:.4}", result.confidence)?;
        if let Some(expected) = &row.target {
            if expected == predicted {
                summary.correct += 1;
            }
        }
    }
    Ok(summary)
}

fn input_format_from_arg(arg: args::InputFormatArg) -> InputFormat {
    match arg {
        args::InputFormatArg::C45 => InputFormat::C45,
        args::InputFormatArg::Columns => InputFormat::Columns,
        args::InputFormatArg::Tabbed => InputFormat::Tabbed,
        args::InputFormatArg::Arff => InputFormat::Arff,
        args::InputFormatArg::Compact => InputFormat::Compact,
        args::InputFormatArg::Sparse => InputFormat::Sparse,
        args::InputFormatArg::SparseBin => InputFormat::SparseBin,
    }
}
