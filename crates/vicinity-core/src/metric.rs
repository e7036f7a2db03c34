//! Metric functions (C3).
//!
//! Every symbolic/numeric metric exports a pairwise
//! `distance(fv_a, fv_b, threshold) -> f64` through [`Feature::pairwise_distance`].
//! Similarity metrics (Cosine, DotProduct) are not additive across features;
//! they are computed once per instance over the full numeric sub-vector by
//! [`cosine_distance`]/[`dot_product_distance`].
//!
//! Storable metrics (ValueDiff, Jeffrey, JensenShannon, Levenshtein, Dice)
//! cache their pairwise results in the feature's [`Matrix`](crate::model::Matrix)
//! the first time they are needed; [`Feature::ensure_matrix`] (re)builds that
//! cache and is idempotent once the feature is no longer stale.

use crate::model::{ClassDistribution, Feature, Matrix, MetricKind};
use crate::pool::FeatureValueId;

/// Distance returned for an operand whose class-distribution probabilities
/// cannot be trusted (below `MVD_LIMIT`) or involving the unknown sentinel.
pub const MAX_DISTANCE: f64 = 1.0;

/// Upper bound subtracted from a raw dot product to turn it into a distance
/// (§4.4). Chosen far above any dot product this engine expects under
/// reasonably scaled numeric features; a result that stops being finite
/// after subtracting from it is the "numeric similarity guard" overflow
/// condition callers should surface to the user.
pub const DOT_PRODUCT_SENTINEL: f64 = 1.0e12;

impl Feature {
    /// Pairwise distance between two feature values under this feature's
    /// configured metric. `threshold` is `MVD_LIMIT` (§6): for storable
    /// metrics, an operand with frequency below it makes the distance
    /// default to [`MAX_DISTANCE`] rather than consulting a noisy
    /// probability vector.
    ///
    /// Must not be called for [`MetricKind::Cosine`] or
    /// [`MetricKind::DotProduct`] — those are similarity metrics computed
    /// at the instance level by [`cosine_distance`]/[`dot_product_distance`].
    pub fn pairwise_distance(&self, a: FeatureValueId, b: FeatureValueId, threshold: u64) -> f64 {
        if a == b {
            return 0.0;
        }
        if a.is_unknown() || b.is_unknown() {
            return MAX_DISTANCE;
        }
        match self.metric {
            MetricKind::Overlap => overlap_distance(a, b),
            MetricKind::Numeric => {
                let (min, max) = self.numeric_range.unwrap_or((0.0, 0.0));
                numeric_distance(self.numeric_value(a), self.numeric_value(b), min, max)
            }
            MetricKind::Euclidean => {
                let (min, max) = self.numeric_range.unwrap_or((0.0, 0.0));
                euclidean_distance(self.numeric_value(a), self.numeric_value(b), min, max)
            }
            MetricKind::ValueDiff
            | MetricKind::Jeffrey
            | MetricKind::JensenShannon
            | MetricKind::Levenshtein
            | MetricKind::Dice => self.storable_distance(a, b, threshold),
            MetricKind::Cosine | MetricKind::DotProduct => {
                unreachable!("similarity metrics are computed at the instance level")
            }
        }
    }

    fn storable_distance(&self, a: FeatureValueId, b: FeatureValueId, threshold: u64) -> f64 {
        if let Some(matrix) = &self.matrix {
            if let Some(d) = matrix.get(a, b) {
                return d;
            }
        }
        self.compute_storable(a, b, threshold)
    }

    fn compute_storable(&self, a: FeatureValueId, b: FeatureValueId, threshold: u64) -> f64 {
        let va = self.value(a);
        let vb = self.value(b);
        if va.freq < threshold || vb.freq < threshold {
            return MAX_DISTANCE;
        }
        match self.metric {
            MetricKind::ValueDiff => {
                value_diff_distance(&va.distribution, &vb.distribution, self.clip_factor)
            }
            MetricKind::Jeffrey => {
                jeffrey_distance(&va.distribution, &vb.distribution, self.clip_factor)
            }
            MetricKind::JensenShannon => {
                jensen_shannon_distance(&va.distribution, &vb.distribution, self.clip_factor)
            }
            MetricKind::Levenshtein => {
                let sa = self.value_name(a);
                let sb = self.value_name(b);
                levenshtein_distance(sa, sb) as f64
            }
            MetricKind::Dice => dice_distance(self.value_name(a), self.value_name(b)),
            _ => unreachable!("not a storable metric"),
        }
    }

    /// Parses this feature value's interned name as `f64`. Only meaningful
    /// for numeric features; returns `0.0` for anything that fails to parse
    /// (callers are expected to have validated numeric features at intern
    /// time, per §7 SchemaError).
    pub fn numeric_value(&self, id: FeatureValueId) -> f64 {
        self.value_name(id).parse::<f64>().unwrap_or(0.0)
    }

    /// (Re)builds the pre-stored matrix for a storable metric over every
    /// pair of values that both meet `threshold`. A no-op if the feature's
    /// matrix was loaded from disk (`matrix_locked`) — those are read-only
    /// and never recomputed. Clears and rebuilds fully otherwise; callers
    /// should only invoke this once per (feature, metric) pair, right
    /// after statistics are refreshed, per §4.2.
    pub fn ensure_matrix(&mut self, threshold: u64) {
        if self.matrix_locked || !self.metric.is_storable() {
            return;
        }
        let eligible: Vec<FeatureValueId> = self
            .values
            .iter()
            .filter(|v| v.freq >= threshold)
            .map(|v| v.id)
            .collect();
        let mut matrix = Matrix::default();
        for (i, &a) in eligible.iter().enumerate() {
            for &b in &eligible[i + 1..] {
                let d = self.compute_storable(a, b, threshold);
                matrix.set(a, b, d);
            }
        }
        self.matrix = Some(matrix);
    }
}

/// Overlap: 0 if identical, 1 otherwise. Caller already handles `a == b`;
/// this exists for symmetry/testing and is always invoked with `a != b`.
pub fn overlap_distance(a: FeatureValueId, b: FeatureValueId) -> f64 {
    if a == b { 0.0 } else { 1.0 }
}

/// `|a - b| / (max - min)`. Returns 0 when the range is degenerate
/// (singleton numeric feature).
pub fn numeric_distance(a: f64, b: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if range.abs() < f64::EPSILON {
        0.0
    } else {
        (a - b).abs() / range
    }
}

/// `sqrt(|a^2 - b^2|) / (max - min)`, as specified.
pub fn euclidean_distance(a: f64, b: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if range.abs() < f64::EPSILON {
        0.0
    } else {
        (a * a - b * b).abs().sqrt() / range
    }
}

/// Union of target ids present in either distribution, used by every
/// probability-vector-based storable metric below.
fn target_union(
    a: &ClassDistribution,
    b: &ClassDistribution,
) -> Vec<crate::pool::TargetValueId> {
    let mut ids: Vec<_> = a.iter().map(|(t, _)| t).collect();
    for (t, _) in b.iter() {
        if !ids.contains(&t) {
            ids.push(t);
        }
    }
    ids
}

/// MVDM: half the L1 distance between the two per-value class-probability
/// vectors. `clip_factor` caps each class's frequency (§6 `CLIP_FACTOR`)
/// before it is normalised into a probability, so one class's raw volume
/// cannot swamp the rest of the vector.
pub fn value_diff_distance(a: &ClassDistribution, b: &ClassDistribution, clip_factor: f64) -> f64 {
    let targets = target_union(a, b);
    let sum: f64 = targets
        .iter()
        .map(|&t| (a.clipped_probability(t, clip_factor) - b.clipped_probability(t, clip_factor)).abs())
        .sum();
    sum / 2.0
}

/// Jeffrey divergence: `sum_i p_i * ln(p_i / m_i)` summed symmetrically over
/// both distributions with `m_i = (p_i + q_i) / 2`, halved. Components with
/// `p_i == 0` contribute 0 (the limit of `x ln x` as `x -> 0`). `clip_factor`
/// caps each class's frequency (§6 `CLIP_FACTOR`) the same way as
/// [`value_diff_distance`].
pub fn jeffrey_distance(a: &ClassDistribution, b: &ClassDistribution, clip_factor: f64) -> f64 {
    let targets = target_union(a, b);
    let mut total = 0.0;
    for t in targets {
        let p = a.clipped_probability(t, clip_factor);
        let q = b.clipped_probability(t, clip_factor);
        let m = (p + q) / 2.0;
        if m <= 0.0 {
            continue;
        }
        if p > 0.0 {
            total += p * (p / m).ln();
        }
        if q > 0.0 {
            total += q * (q / m).ln();
        }
    }
    (total / 2.0).max(0.0)
}

/// Jensen-Shannon divergence between the two class-probability vectors,
/// halved. `clip_factor` caps each class's frequency (§6 `CLIP_FACTOR`) the
/// same way as [`value_diff_distance`].
pub fn jensen_shannon_distance(a: &ClassDistribution, b: &ClassDistribution, clip_factor: f64) -> f64 {
    let targets = target_union(a, b);
    let mut total = 0.0;
    for t in targets {
        let p = a.clipped_probability(t, clip_factor);
        let q = b.clipped_probability(t, clip_factor);
        let m = (p + q) / 2.0;
        if m <= 0.0 {
            continue;
        }
        if p > 0.0 {
            total += 0.5 * p * (p / m).ln();
        }
        if q > 0.0 {
            total += 0.5 * q * (q / m).ln();
        }
    }
    (total / 2.0).max(0.0)
}

/// Damerau-Levenshtein edit distance (insert/delete/substitute/transpose,
/// unit costs) over the two strings' characters.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }
    let mut d = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in d.iter_mut().enumerate().take(n + 1) {
        row[0] = i;
    }
    for j in 0..=m {
        d[0][j] = j;
    }
    for i in 1..=n {
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            let mut best = (d[i - 1][j] + 1).min(d[i][j - 1] + 1).min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(d[i - 2][j - 2] + 1);
            }
            d[i][j] = best;
        }
    }
    d[n][m]
}

/// Character bigram sets (unigrams if either string has length <= 1).
fn grams(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 1 {
        return chars.iter().map(|c| c.to_string()).collect();
    }
    chars
        .windows(2)
        .map(|w| w.iter().collect::<String>())
        .collect()
}

/// Dice distance: `1 - 2|B(a) ∩ B(b)| / (|B(a)| + |B(b)|)`.
pub fn dice_distance(a: &str, b: &str) -> f64 {
    let ga = grams(a);
    let gb = grams(b);
    if ga.is_empty() && gb.is_empty() {
        return 0.0;
    }
    let mut intersection = 0usize;
    let mut remaining = gb.clone();
    for g in &ga {
        if let Some(pos) = remaining.iter().position(|x| x == g) {
            remaining.remove(pos);
            intersection += 1;
        }
    }
    let denom = (ga.len() + gb.len()) as f64;
    if denom == 0.0 {
        0.0
    } else {
        1.0 - (2.0 * intersection as f64) / denom
    }
}

/// Cosine distance over a full numeric instance: `1 - cos(theta)` under
/// per-feature weights. `a`/`b` are the numeric values of the instance's
/// numeric features in permutation order; `weights` are the corresponding
/// feature weights.
pub fn cosine_distance(weights: &[f64], a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b)
        .zip(weights)
        .map(|((x, y), w)| w * x * y)
        .sum();
    let norm_a: f64 = a.iter().zip(weights).map(|(x, w)| w * x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().zip(weights).map(|(x, w)| w * x * x).sum::<f64>().sqrt();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

/// DotProduct "distance": `large_sentinel - sum(w_i * a_i * b_i)`, monotone
/// decreasing in similarity so that smaller is still "closer". Callers
/// should treat a saturated (non-finite) result as the §4.4 "numeric
/// similarity guard" condition and recommend switching to Cosine.
pub fn dot_product_distance(weights: &[f64], a: &[f64], b: &[f64], large_sentinel: f64) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b)
        .zip(weights)
        .map(|((x, y), w)| w * x * y)
        .sum();
    large_sentinel - dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TargetValueId;

    #[test]
    fn overlap_is_symmetric_and_zero_on_self() {
        let a = FeatureValueId(1);
        let b = FeatureValueId(2);
        assert_eq!(overlap_distance(a, b), overlap_distance(b, a));
        assert_eq!(overlap_distance(a, a), 0.0);
    }

    #[test]
    fn numeric_distance_handles_degenerate_range() {
        assert_eq!(numeric_distance(1.0, 2.0, 5.0, 5.0), 0.0);
        assert_eq!(numeric_distance(1.0, 10.0, 0.0, 9.0), 1.0);
    }

    #[test]
    fn value_diff_is_symmetric() {
        let mut a = ClassDistribution::new();
        a.add(TargetValueId(0), 3);
        a.add(TargetValueId(1), 1);
        let mut b = ClassDistribution::new();
        b.add(TargetValueId(0), 1);
        b.add(TargetValueId(1), 3);
        let d1 = value_diff_distance(&a, &b, 10.0);
        let d2 = value_diff_distance(&b, &a, 10.0);
        assert!((d1 - d2).abs() < 1e-12);
        assert!(d1 > 0.0);
    }

    #[test]
    fn clip_factor_caps_a_dominating_class_before_normalising() {
        let mut a = ClassDistribution::new();
        a.add(TargetValueId(0), 1000);
        a.add(TargetValueId(1), 1);
        let mut b = ClassDistribution::new();
        b.add(TargetValueId(0), 1);
        b.add(TargetValueId(1), 1000);
        let clipped = value_diff_distance(&a, &b, 10.0);
        let unclipped = value_diff_distance(&a, &b, 0.0);
        // Without clipping the 1000-vs-1 skew saturates the distance near
        // its L1 maximum; clipping both classes to the same cap pulls the
        // two vectors much closer together.
        assert!(clipped < unclipped);
    }

    #[test]
    fn levenshtein_basic_cases() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("ab", "ba"), 1); // transposition
    }

    #[test]
    fn dice_unigram_fallback_for_short_strings() {
        // single-character strings fall back to unigrams
        assert_eq!(dice_distance("a", "a"), 0.0);
        assert_eq!(dice_distance("a", "b"), 1.0);
    }

    #[test]
    fn dice_bigram_overlap() {
        let d = dice_distance("night", "nacht");
        assert!(d > 0.0 && d < 1.0);
    }

    #[test]
    fn cosine_identical_vectors_is_zero_distance() {
        let w = [1.0, 1.0];
        let v = [1.0, 2.0];
        let d = cosine_distance(&w, &v, &v);
        assert!(d.abs() < 1e-9);
    }
}
