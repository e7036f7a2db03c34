//! Feature & target model (C2).
//!
//! Holds the per-feature value tables, per-value aggregated class
//! distributions, per-feature numeric ranges and weights, and the target
//! (class label) registry.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::pool::{FeatureValueId, StringPool, TargetValueId, UNKNOWN_FEATURE_VALUE};

/// One (frequency, weight) entry inside a [`ClassDistribution`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistEntry {
    pub freq: u64,
    pub weight: f64,
}

/// A multiset over target classes, keyed by [`TargetValueId`].
///
/// `weighted` distributions carry an independent `weight` per entry used
/// during decay-weighted voting (C8); `unweighted` distributions keep
/// `weight == freq as f64` at all times and are what training-time
/// aggregation (C2, C5) produces. The running `total`/`weight_total` are
/// kept in sync with every mutation rather than recomputed, matching the
/// "stored total equals the sum of frequencies" invariant (§8, invariant 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassDistribution {
    entries: BTreeMap<TargetValueId, DistEntry>,
    total_freq: u64,
    total_weight: f64,
    weighted: bool,
}

impl ClassDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    /// Adds `count` occurrences of `target` with unit weight each (learn-time
    /// aggregation path). Promotes an unweighted distribution's weight field
    /// in lockstep so the `weight == freq` invariant holds until a weighted
    /// merge is performed.
    pub fn add(&mut self, target: TargetValueId, count: u64) {
        let entry = self.entries.entry(target).or_insert(DistEntry {
            freq: 0,
            weight: 0.0,
        });
        entry.freq += count;
        entry.weight += count as f64;
        self.total_freq += count;
        self.total_weight += count as f64;
    }

    /// Adds `count` occurrences of `target` at training time (§4.3), scaled
    /// by `exemplar_weight` (the instance's own weight, default 1.0). `freq`
    /// tracks the raw occurrence count regardless of weight; `weight`
    /// accumulates `count * exemplar_weight`, so a heavier exemplar
    /// contributes more to the node's vote mass than a lighter one at the
    /// same frequency.
    pub fn add_weighted(&mut self, target: TargetValueId, count: u64, exemplar_weight: f64) {
        let entry = self.entries.entry(target).or_insert(DistEntry {
            freq: 0,
            weight: 0.0,
        });
        let weighted = count as f64 * exemplar_weight;
        entry.freq += count;
        entry.weight += weighted;
        self.total_freq += count;
        self.total_weight += weighted;
    }

    /// Removes `count` occurrences of `target` (hide). Never drives a
    /// frequency negative; a count larger than what is on record saturates
    /// at zero, which would indicate a caller bug (hide of an instance not
    /// actually present).
    pub fn remove(&mut self, target: TargetValueId, count: u64) {
        if let Some(entry) = self.entries.get_mut(&target) {
            let removed = count.min(entry.freq);
            entry.freq -= removed;
            entry.weight = (entry.weight - removed as f64).max(0.0);
            self.total_freq -= removed;
            self.total_weight = (self.total_weight - removed as f64).max(0.0);
        }
    }

    /// Merges `other` into `self` with unit scale (trie aggregate union-sum).
    pub fn merge(&mut self, other: &ClassDistribution) {
        for (&target, entry) in &other.entries {
            let e = self.entries.entry(target).or_insert(DistEntry {
                freq: 0,
                weight: 0.0,
            });
            e.freq += entry.freq;
            e.weight += entry.weight;
        }
        self.total_freq += other.total_freq;
        self.total_weight += other.total_weight;
    }

    /// Merges `other` into `self` scaled by `scale`, marking the result
    /// weighted. Used by C8 to fold a decay-weighted neighbour into the
    /// running vote total; `freq` is left untouched (votes only ever read
    /// weight) while `weight` accumulates `scale * entry.weight`.
    pub fn merge_weighted(&mut self, other: &ClassDistribution, scale: f64) {
        self.weighted = true;
        for (&target, entry) in &other.entries {
            let e = self.entries.entry(target).or_insert(DistEntry {
                freq: 0,
                weight: 0.0,
            });
            e.freq += entry.freq;
            let delta = scale * entry.weight;
            e.weight += delta;
            self.total_weight += delta;
        }
        self.total_freq += other.total_freq;
    }

    /// Scales every entry's weight (not frequency) by `factor`, used by
    /// `Normalisation::Probability`/`AddFactor` (C8).
    pub fn scale_weights(&mut self, factor: f64) {
        for entry in self.entries.values_mut() {
            entry.weight *= factor;
        }
        self.total_weight *= factor;
        self.weighted = true;
    }

    /// Replaces every entry's weight with `f(weight)`, used by
    /// `Normalisation::LogProbability` (C8). Recomputes `total_weight` from
    /// the mapped entries since `f` need not be linear.
    pub fn map_weights(&mut self, f: impl Fn(f64) -> f64) {
        let mut total = 0.0;
        for entry in self.entries.values_mut() {
            entry.weight = f(entry.weight);
            total += entry.weight;
        }
        self.total_weight = total;
        self.weighted = true;
    }

    /// Adds `factor` to `target`'s weight without touching `freq`, creating
    /// the entry at weight 0 first if `target` was not yet present. Used by
    /// `Normalisation::AddFactor` (C8) to give every known target, seen or
    /// not among these neighbours, a floor weight before normalising.
    pub fn add_factor(&mut self, target: TargetValueId, factor: f64) {
        let entry = self.entries.entry(target).or_insert(DistEntry {
            freq: 0,
            weight: 0.0,
        });
        entry.weight += factor;
        self.total_weight += factor;
        self.weighted = true;
    }

    /// Keeps only the `beam` entries with the highest weight, dropping the
    /// rest (§6 `BEAM_SIZE`). Ties at the cut are broken by `TargetValueId`
    /// so the result is deterministic.
    pub fn beam_truncate(&mut self, beam: usize) {
        if self.entries.len() <= beam {
            return;
        }
        let mut ranked: Vec<(TargetValueId, DistEntry)> =
            self.entries.iter().map(|(&t, &e)| (t, e)).collect();
        ranked.sort_by(|a, b| {
            b.1.weight
                .partial_cmp(&a.1.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(beam);
        self.entries = ranked.into_iter().collect();
        self.total_freq = self.entries.values().map(|e| e.freq).sum();
        self.total_weight = self.entries.values().map(|e| e.weight).sum();
    }

    pub fn total_freq(&self) -> u64 {
        self.total_freq
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, target: TargetValueId) -> Option<DistEntry> {
        self.entries.get(&target).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetValueId, DistEntry)> + '_ {
        self.entries.iter().map(|(&t, &e)| (t, e))
    }

    /// Class-conditional probability `p(target | this distribution)` by
    /// frequency (used by MVDM/Jeffrey/JS metrics, not by voting).
    pub fn probability(&self, target: TargetValueId) -> f64 {
        if self.total_freq == 0 {
            return 0.0;
        }
        self.entries
            .get(&target)
            .map(|e| e.freq as f64 / self.total_freq as f64)
            .unwrap_or(0.0)
    }

    /// `probability(target)`, but with every entry's frequency capped at
    /// `clip_factor` (§6 `CLIP_FACTOR`) before normalising, so a class that
    /// overwhelmingly dominates one feature value does not drown out the
    /// others when building a storable-metric probability vector. A
    /// non-positive `clip_factor` disables clipping.
    pub fn clipped_probability(&self, target: TargetValueId, clip_factor: f64) -> f64 {
        if clip_factor <= 0.0 {
            return self.probability(target);
        }
        let mut total = 0.0;
        let mut target_freq = 0.0;
        for (t, entry) in &self.entries {
            let capped = (entry.freq as f64).min(clip_factor);
            total += capped;
            if *t == target {
                target_freq = capped;
            }
        }
        if total <= 0.0 {
            0.0
        } else {
            target_freq / total
        }
    }

    /// Argmax target by weight. Ties broken first by higher global target
    /// frequency (via `targets`), then uniformly at random if `rng` is
    /// `Some`, else deterministically by the lowest [`TargetValueId`].
    pub fn argmax(
        &self,
        targets: &Targets,
        rng: Option<&mut impl Rng>,
    ) -> Option<TargetValueId> {
        if self.entries.is_empty() {
            return None;
        }
        let best_weight = self
            .entries
            .values()
            .map(|e| e.weight)
            .fold(f64::NEG_INFINITY, f64::max);
        let epsilon = 1e-10;
        let mut candidates: Vec<TargetValueId> = self
            .entries
            .iter()
            .filter(|(_, e)| (e.weight - best_weight).abs() < epsilon)
            .map(|(&t, _)| t)
            .collect();
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }
        let best_freq = candidates
            .iter()
            .map(|&t| targets.frequency(t))
            .max()
            .unwrap_or(0);
        candidates.retain(|&t| targets.frequency(t) == best_freq);
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }
        match rng {
            Some(rng) => {
                let idx = rng.gen_range(0..candidates.len());
                Some(candidates[idx])
            }
            None => candidates.into_iter().min(),
        }
    }
}

/// One interned feature value: its id, training frequency, and the
/// aggregated class distribution of instances holding it.
#[derive(Debug, Clone)]
pub struct FeatureValueData {
    pub id: FeatureValueId,
    pub freq: u64,
    pub distribution: ClassDistribution,
}

/// The metric a feature is evaluated under. Determines whether the feature
/// is treated as numeric (`Numeric`, `Euclidean`) or symbolic (everything
/// else), and whether a value-difference matrix can be pre-stored for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    Overlap,
    Numeric,
    Euclidean,
    ValueDiff,
    Jeffrey,
    JensenShannon,
    Levenshtein,
    Dice,
    Cosine,
    DotProduct,
}

impl MetricKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, MetricKind::Numeric | MetricKind::Euclidean)
    }

    pub fn is_storable(self) -> bool {
        matches!(
            self,
            MetricKind::ValueDiff
                | MetricKind::Jeffrey
                | MetricKind::JensenShannon
                | MetricKind::Levenshtein
                | MetricKind::Dice
        )
    }

    pub fn is_similarity(self) -> bool {
        matches!(self, MetricKind::Cosine | MetricKind::DotProduct)
    }
}

/// Per-feature statistical weights, recomputed as a unit whenever training
/// data or the feature's metric changes (see [`crate::stats`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureWeights {
    pub info_gain: f64,
    pub gain_ratio: f64,
    pub chi_square: f64,
    pub shared_variance: f64,
    pub standard_deviation: f64,
    /// Split info (§4.1), kept alongside the weights it derives GR from so
    /// TREE_ORDER's `IG·split`/`GR·split` combination tags can reuse it
    /// without recomputing.
    pub split_info: f64,
}

/// A symmetric sparse pre-stored distance matrix over `(FeatureValueId,
/// FeatureValueId)` pairs, keyed by the unordered pair with the smaller id
/// first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Matrix {
    entries: BTreeMap<(u32, u32), f64>,
}

impl Matrix {
    fn key(a: FeatureValueId, b: FeatureValueId) -> (u32, u32) {
        if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) }
    }

    pub fn get(&self, a: FeatureValueId, b: FeatureValueId) -> Option<f64> {
        self.entries.get(&Self::key(a, b)).copied()
    }

    pub fn set(&mut self, a: FeatureValueId, b: FeatureValueId, value: f64) {
        self.entries.insert(Self::key(a, b), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One feature's full model: its value table, metric, weights, numeric
/// range, and optional pre-stored matrix.
#[derive(Debug, Clone)]
pub struct Feature {
    pub index: usize,
    pub name: Option<String>,
    pool: StringPool,
    pub values: Vec<FeatureValueData>,
    pub metric: MetricKind,
    pub ignored: bool,
    pub weights: FeatureWeights,
    pub numeric_range: Option<(f64, f64)>,
    pub matrix: Option<Matrix>,
    pub matrix_locked: bool,
    pub stale: bool,
    pub clip_factor: f64,
}

impl Feature {
    pub fn new(index: usize, metric: MetricKind) -> Self {
        Feature {
            index,
            name: None,
            pool: StringPool::new(),
            values: Vec::new(),
            metric,
            ignored: false,
            weights: FeatureWeights::default(),
            numeric_range: None,
            matrix: None,
            matrix_locked: false,
            stale: true,
            clip_factor: 10.0,
        }
    }

    /// Sets the per-value frequency cap (§6 `CLIP_FACTOR`) used when
    /// building storable-metric probability vectors.
    pub fn with_clip_factor(mut self, clip_factor: f64) -> Self {
        self.clip_factor = clip_factor;
        self
    }

    /// Interns `value`, creating a fresh [`FeatureValueData`] if new, and
    /// returns its id. Marks statistics stale.
    pub fn intern(&mut self, value: &str) -> FeatureValueId {
        let raw = self.pool.intern(value);
        let id = FeatureValueId(raw);
        if id.0 as usize == self.values.len() {
            self.values.push(FeatureValueData {
                id,
                freq: 0,
                distribution: ClassDistribution::new(),
            });
        }
        self.stale = true;
        id
    }

    pub fn lookup(&self, value: &str) -> Option<FeatureValueId> {
        self.pool.lookup(value).map(FeatureValueId)
    }

    pub fn value_name(&self, id: FeatureValueId) -> &str {
        self.pool.name(id.0)
    }

    pub fn value(&self, id: FeatureValueId) -> &FeatureValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: FeatureValueId) -> &mut FeatureValueData {
        &mut self.values[id.0 as usize]
    }

    /// Records one training occurrence of `value` co-occurring with
    /// `target`.
    pub fn observe(&mut self, value: FeatureValueId, target: TargetValueId, count: u64) {
        let entry = self.value_mut(value);
        entry.freq += count;
        entry.distribution.add(target, count);
        self.stale = true;
    }

    /// Reverses [`Feature::observe`] (hide). Frequency is not allowed to go
    /// negative (§3 invariant); the value stays interned with frequency 0.
    pub fn hide(&mut self, value: FeatureValueId, target: TargetValueId, count: u64) {
        let entry = self.value_mut(value);
        entry.freq = entry.freq.saturating_sub(count);
        entry.distribution.remove(target, count);
        self.stale = true;
    }

    /// `true` if this feature is numeric (its metric is `Numeric` or
    /// `Euclidean`).
    pub fn is_numeric(&self) -> bool {
        self.metric.is_numeric()
    }

    /// Sets the metric, failing if the feature's matrix was loaded from
    /// disk and is therefore locked (§4.2, "MetricLocked").
    pub fn set_metric(&mut self, metric: MetricKind) -> crate::error::Result<()> {
        if self.matrix_locked && metric != self.metric {
            return Err(crate::error::EngineError::MetricLocked {
                feature_index: self.index,
            });
        }
        if metric != self.metric {
            self.metric = metric;
            self.matrix = None;
            self.stale = true;
        }
        Ok(())
    }

    pub fn effective_value_count(&self) -> usize {
        self.values.iter().filter(|v| v.freq > 0).count()
    }
}

/// One interned target (class) value: its id and training frequency.
#[derive(Debug, Clone, Copy)]
pub struct TargetValueData {
    pub id: TargetValueId,
    pub freq: u64,
}

/// Registry of target values plus the majority-class pointer.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pool: StringPool,
    values: Vec<TargetValueData>,
    majority: Option<TargetValueId>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, label: &str) -> TargetValueId {
        let raw = self.pool.intern(label);
        let id = TargetValueId(raw);
        if id.0 as usize == self.values.len() {
            self.values.push(TargetValueData { id, freq: 0 });
        }
        id
    }

    pub fn lookup(&self, label: &str) -> Option<TargetValueId> {
        self.pool.lookup(label).map(TargetValueId)
    }

    pub fn name(&self, id: TargetValueId) -> &str {
        self.pool.name(id.0)
    }

    pub fn frequency(&self, id: TargetValueId) -> u64 {
        self.values[id.0 as usize].freq
    }

    pub fn observe(&mut self, id: TargetValueId, count: u64) {
        self.values[id.0 as usize].freq += count;
        self.recompute_majority();
    }

    pub fn hide(&mut self, id: TargetValueId, count: u64) {
        let v = &mut self.values[id.0 as usize];
        v.freq = v.freq.saturating_sub(count);
        self.recompute_majority();
    }

    fn recompute_majority(&mut self) {
        self.majority = self
            .values
            .iter()
            .max_by_key(|v| v.freq)
            .filter(|v| v.freq > 0)
            .map(|v| v.id);
    }

    pub fn majority(&self) -> Option<TargetValueId> {
        self.majority
    }

    pub fn total(&self) -> u64 {
        self.values.iter().map(|v| v.freq).sum()
    }

    /// Number of distinct target values with non-zero frequency.
    pub fn effective_values(&self) -> usize {
        self.values.iter().filter(|v| v.freq > 0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetValueData> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A fixed-length feature vector plus its label, used both for training
/// instances and test queries. `target` is `None` for unlabeled test
/// queries. `weight` is the exemplar weight (default 1.0); `occurrences`
/// counts repeated identical training rows collapsed into one instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub values: Vec<FeatureValueId>,
    pub target: Option<TargetValueId>,
    pub weight: f64,
    pub occurrences: u32,
}

impl Instance {
    pub fn new(values: Vec<FeatureValueId>, target: Option<TargetValueId>) -> Self {
        Instance {
            values,
            target,
            weight: 1.0,
            occurrences: 1,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn value_at(&self, index: usize) -> FeatureValueId {
        self.values.get(index).copied().unwrap_or(UNKNOWN_FEATURE_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_sum_invariant() {
        let mut d = ClassDistribution::new();
        d.add(TargetValueId(0), 3);
        d.add(TargetValueId(1), 2);
        assert_eq!(d.total_freq(), 5);
        d.remove(TargetValueId(0), 1);
        assert_eq!(d.total_freq(), 4);
        assert_eq!(d.get(TargetValueId(0)).unwrap().freq, 2);
    }

    #[test]
    fn hide_never_goes_negative() {
        let mut d = ClassDistribution::new();
        d.add(TargetValueId(0), 1);
        d.remove(TargetValueId(0), 5);
        assert_eq!(d.get(TargetValueId(0)).unwrap().freq, 0);
        assert_eq!(d.total_freq(), 0);
    }

    #[test]
    fn argmax_breaks_ties_by_global_frequency() {
        let mut targets = Targets::new();
        let a = targets.intern("A");
        let b = targets.intern("B");
        targets.observe(a, 10);
        targets.observe(b, 3);

        let mut d = ClassDistribution::new();
        d.add(a, 1);
        d.add(b, 1);
        assert_eq!(d.argmax(&targets, None::<&mut rand::rngs::StdRng>), Some(a));
    }

    #[test]
    fn feature_hide_unhide_round_trip() {
        let mut f = Feature::new(0, MetricKind::Overlap);
        let v = f.intern("x");
        let t = TargetValueId(0);
        f.observe(v, t, 1);
        assert_eq!(f.value(v).freq, 1);
        f.hide(v, t, 1);
        assert_eq!(f.value(v).freq, 0);
        f.observe(v, t, 1);
        assert_eq!(f.value(v).freq, 1);
    }

    #[test]
    fn matrix_lookup_is_symmetric() {
        let mut m = Matrix::default();
        let a = FeatureValueId(0);
        let b = FeatureValueId(1);
        m.set(a, b, 0.5);
        assert_eq!(m.get(a, b), Some(0.5));
        assert_eq!(m.get(b, a), Some(0.5));
    }

    #[test]
    fn add_weighted_scales_weight_but_not_frequency() {
        let mut d = ClassDistribution::new();
        d.add_weighted(TargetValueId(0), 2, 0.5);
        let entry = d.get(TargetValueId(0)).unwrap();
        assert_eq!(entry.freq, 2);
        assert_eq!(entry.weight, 1.0);
        assert_eq!(d.total_weight(), 1.0);
    }

    #[test]
    fn add_factor_creates_a_missing_entry_at_zero_frequency() {
        let mut d = ClassDistribution::new();
        d.add(TargetValueId(0), 1);
        d.add_factor(TargetValueId(1), 2.0);
        let entry = d.get(TargetValueId(1)).unwrap();
        assert_eq!(entry.freq, 0);
        assert_eq!(entry.weight, 2.0);
    }

    #[test]
    fn beam_truncate_keeps_the_heaviest_entries() {
        let mut d = ClassDistribution::new();
        d.add(TargetValueId(0), 1);
        d.add(TargetValueId(1), 1);
        d.merge_weighted(&{
            let mut e = ClassDistribution::new();
            e.add(TargetValueId(1), 1);
            e
        }, 5.0);
        d.beam_truncate(1);
        assert_eq!(d.get(TargetValueId(0)), None);
        assert!(d.get(TargetValueId(1)).is_some());
    }

    #[test]
    fn clipped_probability_matches_plain_probability_below_the_cap() {
        let mut d = ClassDistribution::new();
        d.add(TargetValueId(0), 1);
        d.add(TargetValueId(1), 1);
        assert_eq!(d.clipped_probability(TargetValueId(0), 10.0), d.probability(TargetValueId(0)));
    }
}
