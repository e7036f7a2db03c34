//! Statistics computation (C4).
//!
//! Entropy, information gain, gain ratio, chi-square, shared variance and
//! standard deviation, plus the equal-population numeric binning that feeds
//! the symbolic formulas for numeric features. Also computes the feature
//! permutation (§4.1) that the trie (C5) is built in.

use std::cmp::Ordering;

use crate::model::{ClassDistribution, Feature, FeatureWeights, Targets};

const EPSILON: f64 = 1e-6;

/// A bin produced by [`numeric_bins`]: a pseudo-value standing in for a
/// contiguous range of numeric values with approximately equal population.
#[derive(Debug, Clone)]
pub struct Bin {
    pub freq: u64,
    pub distribution: ClassDistribution,
    pub min: f64,
    pub max: f64,
}

/// Splits a numeric feature's observed values into at most `bin_count`
/// equal-population bins (by training-instance count, not distinct-value
/// count), sorted ascending by value. Feature values with zero frequency
/// (hidden) are excluded.
pub fn numeric_bins(feature: &Feature, bin_count: usize) -> Vec<Bin> {
    let bin_count = bin_count.max(1);
    let mut entries: Vec<(f64, u64, &ClassDistribution)> = feature
        .values
        .iter()
        .filter(|v| v.freq > 0)
        .map(|v| (feature.numeric_value(v.id), v.freq, &v.distribution))
        .collect();
    entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let total: u64 = entries.iter().map(|(_, f, _)| f).sum();
    if total == 0 {
        return Vec::new();
    }
    let target_per_bin = total as f64 / bin_count as f64;

    let mut bins = Vec::new();
    let mut current = Bin {
        freq: 0,
        distribution: ClassDistribution::new(),
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };
    let mut accumulated = 0u64;
    for (val, freq, dist) in entries {
        current.distribution.merge(dist);
        current.freq += freq;
        current.min = current.min.min(val);
        current.max = current.max.max(val);
        accumulated += freq;
        let filled_threshold = target_per_bin * (bins.len() + 1) as f64;
        if accumulated as f64 >= filled_threshold && bins.len() + 1 < bin_count {
            bins.push(current);
            current = Bin {
                freq: 0,
                distribution: ClassDistribution::new(),
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            };
        }
    }
    if current.freq > 0 {
        bins.push(current);
    }
    bins
}

fn entropy_of_distribution(dist: &ClassDistribution) -> f64 {
    let n = dist.total_freq() as f64;
    if n == 0.0 {
        return 0.0;
    }
    -dist
        .iter()
        .map(|(_, e)| {
            if e.freq == 0 {
                0.0
            } else {
                let p = e.freq as f64 / n;
                p * p.log2()
            }
        })
        .sum::<f64>()
}

/// Database entropy `H(T) = -sum_c p(c) log2 p(c)` over the target
/// distribution.
pub fn database_entropy(targets: &Targets) -> f64 {
    let n = targets.total() as f64;
    if n == 0.0 {
        return 0.0;
    }
    -targets
        .iter()
        .map(|t| {
            if t.freq == 0 {
                0.0
            } else {
                let p = t.freq as f64 / n;
                p * p.log2()
            }
        })
        .sum::<f64>()
}

fn feature_conditional_entropy<'a>(
    values: impl Iterator<Item = (u64, &'a ClassDistribution)>,
    n: f64,
) -> f64 {
    values
        .map(|(freq, dist)| {
            if freq == 0 {
                0.0
            } else {
                (freq as f64 / n) * entropy_of_distribution(dist)
            }
        })
        .sum()
}

fn split_info_over(freqs: impl Iterator<Item = u64>, n: f64) -> f64 {
    -freqs
        .filter(|&f| f > 0)
        .map(|f| {
            let p = f as f64 / n;
            p * p.log2()
        })
        .sum::<f64>()
}

fn chi_square_over<'a>(
    values: impl Iterator<Item = (u64, &'a ClassDistribution)>,
    targets: &Targets,
    n: f64,
) -> f64 {
    let mut chi = 0.0;
    for (freq, dist) in values {
        if freq == 0 {
            continue;
        }
        let n_i = freq as f64;
        for t in targets.iter() {
            let n_j = t.freq as f64;
            if n_j == 0.0 {
                continue;
            }
            let expected = n_i * n_j / n;
            if expected <= 0.0 {
                // Zero-expected cells are skipped, not contributed.
                continue;
            }
            let observed = dist.get(t.id).map(|e| e.freq as f64).unwrap_or(0.0);
            let diff = observed - expected;
            chi += diff * diff / expected;
        }
    }
    chi
}

/// Population-style standard deviation of a numeric feature's distinct
/// values, computed per the reference implementation's (non-textbook)
/// formula: for each distinct value `v_i`, `diff_i = sum_of_all_values -
/// v_i`; `SD = sqrt(mean(diff_i^2))`. See SPEC_FULL.md §4.1 for why this is
/// pinned rather than "corrected" to use the mean.
pub fn standard_deviation(feature: &Feature) -> f64 {
    let values: Vec<f64> = feature
        .values
        .iter()
        .map(|v| feature.numeric_value(v.id))
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().sum();
    let total: f64 = values
        .iter()
        .map(|v| {
            let diff = sum - v;
            diff * diff
        })
        .sum();
    (total / values.len() as f64).sqrt()
}

/// Recomputes every statistic for one feature given the current target
/// registry and numeric bin size. Ignored features get all-zero weights.
pub fn compute_feature_weights(feature: &Feature, targets: &Targets, bin_size: usize) -> FeatureWeights {
    let n = targets.total() as f64;
    if n == 0.0 || feature.ignored {
        return FeatureWeights::default();
    }

    let h_t = database_entropy(targets);

    let bins;
    let (h_tf, split, chi2, eff_vals) = if feature.is_numeric() {
        bins = numeric_bins(feature, bin_size);
        let h_tf = feature_conditional_entropy(bins.iter().map(|b| (b.freq, &b.distribution)), n);
        let split = split_info_over(bins.iter().map(|b| b.freq), n);
        let chi2 = chi_square_over(bins.iter().map(|b| (b.freq, &b.distribution)), targets, n);
        (h_tf, split, chi2, bins.len())
    } else {
        let h_tf = feature_conditional_entropy(
            feature.values.iter().map(|v| (v.freq, &v.distribution)),
            n,
        );
        let split = split_info_over(feature.values.iter().map(|v| v.freq), n);
        let chi2 = chi_square_over(
            feature.values.iter().map(|v| (v.freq, &v.distribution)),
            targets,
            n,
        );
        (h_tf, split, chi2, feature.effective_value_count())
    };

    let mut ig = (h_t - h_tf).max(0.0);
    let gr = if split < EPSILON {
        ig = 0.0;
        0.0
    } else {
        ig / split
    };

    let num_cats = targets.effective_values();
    let k = num_cats.min(eff_vals).saturating_sub(1);
    let sv = if k == 0 { 0.0 } else { chi2 / (n * k as f64) };

    let sd = if feature.is_numeric() {
        standard_deviation(feature)
    } else {
        0.0
    };

    FeatureWeights {
        info_gain: ig,
        gain_ratio: gr,
        chi_square: chi2,
        shared_variance: sv,
        standard_deviation: sd,
        split_info: split,
    }
}

/// Weighting scheme selecting which [`FeatureWeights`] field (if any) is
/// used as the per-feature distance multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    None,
    GainRatio,
    InfoGain,
    ChiSquare,
    SharedVariance,
    StandardDeviation,
    UserDefined,
}

/// Returns the per-feature multiplier used by the tester (C6) under `w`.
/// `user_weight` is consulted only for `Weighting::UserDefined`.
pub fn feature_weight(weights: &FeatureWeights, w: Weighting, user_weight: Option<f64>) -> f64 {
    match w {
        Weighting::None => 1.0,
        Weighting::GainRatio => weights.gain_ratio,
        Weighting::InfoGain => weights.info_gain,
        Weighting::ChiSquare => weights.chi_square,
        Weighting::SharedVariance => weights.shared_variance,
        Weighting::StandardDeviation => weights.standard_deviation,
        Weighting::UserDefined => user_weight.unwrap_or(1.0),
    }
}

/// TREE_ORDER tags (§4.1, §6). `DataFile`/`NoOrder` preserve original
/// feature order (handled by the tie-break in [`compute_permutation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOrder {
    DataFile,
    NoOrder,
    GainRatio,
    InfoGain,
    GainRatioTimesSplit,
    InfoGainTimesSplit,
    ChiSquare,
    SharedVariance,
    StandardDeviation,
    InverseValueCount,
}

fn order_key(feature: &Feature, order: TreeOrder) -> f64 {
    let w = &feature.weights;
    match order {
        TreeOrder::DataFile | TreeOrder::NoOrder => 0.0,
        TreeOrder::GainRatio => w.gain_ratio,
        TreeOrder::InfoGain => w.info_gain,
        TreeOrder::GainRatioTimesSplit => w.gain_ratio * w.split_info,
        TreeOrder::InfoGainTimesSplit => w.info_gain * w.split_info,
        TreeOrder::ChiSquare => w.chi_square,
        TreeOrder::SharedVariance => w.shared_variance,
        TreeOrder::StandardDeviation => w.standard_deviation,
        TreeOrder::InverseValueCount => {
            let count = feature.effective_value_count().max(1);
            1.0 / count as f64
        }
    }
}

/// Computes the trie descent permutation (§3, §4.1): effective features
/// first, most-discriminative first under `order`, ties broken by original
/// index; ignored features appended at the tail in original-index order.
pub fn compute_permutation(features: &[Feature], order: TreeOrder) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..features.len()).collect();
    idx.sort_by(|&a, &b| {
        let fa = &features[a];
        let fb = &features[b];
        match fa.ignored.cmp(&fb.ignored) {
            Ordering::Equal => {}
            other => return other,
        }
        if fa.ignored {
            return a.cmp(&b);
        }
        let ka = order_key(fa, order);
        let kb = order_key(fb, order);
        kb.partial_cmp(&ka).unwrap_or(Ordering::Equal).then(a.cmp(&b))
    });
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Feature, MetricKind, Targets};
    use crate::pool::TargetValueId;

    fn xor_targets() -> Targets {
        let mut t = Targets::new();
        let a = t.intern("A");
        let b = t.intern("B");
        t.observe(a, 2);
        t.observe(b, 2);
        t
    }

    #[test]
    fn entropy_of_balanced_binary_is_one() {
        let targets = xor_targets();
        assert!((database_entropy(&targets) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn perfectly_discriminating_feature_has_max_info_gain() {
        let targets = xor_targets();
        let mut f = Feature::new(0, MetricKind::Overlap);
        let v0 = f.intern("0");
        let v1 = f.intern("1");
        f.observe(v0, TargetValueId(0), 2);
        f.observe(v1, TargetValueId(1), 2);
        let w = compute_feature_weights(&f, &targets, 20);
        assert!((w.info_gain - 1.0).abs() < 1e-9);
        assert!(w.gain_ratio > 0.0);
    }

    #[test]
    fn uninformative_feature_has_zero_info_gain() {
        let targets = xor_targets();
        let mut f = Feature::new(0, MetricKind::Overlap);
        let v0 = f.intern("same");
        f.observe(v0, TargetValueId(0), 2);
        f.observe(v0, TargetValueId(1), 2);
        let w = compute_feature_weights(&f, &targets, 20);
        assert!(w.info_gain.abs() < 1e-9);
        assert_eq!(w.gain_ratio, 0.0);
    }

    #[test]
    fn numeric_bins_respect_equal_population() {
        let mut f = Feature::new(0, MetricKind::Numeric);
        for i in 0..10 {
            let v = f.intern(&i.to_string());
            f.observe(v, TargetValueId(0), 1);
        }
        let bins = numeric_bins(&f, 5);
        assert_eq!(bins.len(), 5);
        for b in &bins {
            assert_eq!(b.freq, 2);
        }
    }

    #[test]
    fn permutation_puts_ignored_features_last() {
        let targets = xor_targets();
        let mut f0 = Feature::new(0, MetricKind::Overlap);
        let v0 = f0.intern("0");
        let v1 = f0.intern("1");
        f0.observe(v0, TargetValueId(0), 2);
        f0.observe(v1, TargetValueId(1), 2);
        f0.weights = compute_feature_weights(&f0, &targets, 20);

        let mut f1 = Feature::new(1, MetricKind::Overlap);
        f1.ignored = true;

        let perm = compute_permutation(&[f0, f1], TreeOrder::GainRatio);
        assert_eq!(perm, vec![0, 1]);
    }
}
