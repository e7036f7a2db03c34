//! Experiment lifecycle & top-level classify API (C9).
//!
//! [`Experiment`] owns every other component (C1–C8) and enforces the
//! state machine a caller must follow: train while `Learning`, classify
//! only once `Ready`. Classification itself takes `&self` — every field
//! touched during a search is either immutable after training or, for the
//! trie's lazily hashed children, internally synchronized — so
//! [`Experiment::classify_batch`] can fan work out across threads with no
//! cloning of the instance base.

use std::sync::{Arc, Mutex};
use std::thread;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::model::{ClassDistribution, Feature, Instance, MetricKind, Targets};
use crate::pool::{FeatureValueId, TargetValueId};
use crate::stats;
use crate::tester;
use crate::trie::{Algorithm, InstanceBase};
use crate::vote;

/// Where an [`Experiment`] is in its lifecycle. Mirrors the reference
/// implementation's Learning -> (Ready|Testing) state machine (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting `add_training_instance` calls; statistics are stale.
    Learning,
    /// Trained; `classify`/`classify_batch` are available.
    Ready,
    /// A batch classification run is in flight. Distinguished from
    /// `Ready` only so a concurrent mutation attempt gets a clearer error
    /// message.
    Testing,
}

/// A non-fatal condition encountered while loading training or test data,
/// counted and surfaced to the caller rather than propagated as an
/// [`EngineError`] (§7).
#[derive(Debug, Clone, PartialEq)]
pub enum DataWarning {
    /// A line was skipped outright (wrong field count, unparsable numeric
    /// feature).
    SkippedLine { line: usize, reason: String },
    /// An exemplar weight in the input deviated from 1.0 without
    /// `EXEMPLAR_WEIGHTS` having been requested.
    DeviatingWeight { line: usize, weight: f64 },
    /// A feature value was observed exactly once across the whole
    /// training set, which makes MVDM-family metrics unreliable for it.
    SingletonValue { feature_index: usize, value: String },
}

/// One classification outcome: the winning target, the full voted
/// distribution (for confidence/2nd-best reporting), and, when
/// `verbose_neighbors` was requested, the neighbour set that produced it.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub target: TargetValueId,
    pub distribution: ClassDistribution,
    pub confidence: f64,
    pub neighbors: Option<crate::bestk::NeighborSet>,
}

/// Owns the full engine state: feature/target model (C2), trie (C5), and
/// configuration, and drives them through C3–C8 to answer `classify`.
pub struct Experiment {
    features: Vec<Feature>,
    targets: Targets,
    trie: Option<InstanceBase>,
    options: EngineOptions,
    phase: Phase,
    instances: Vec<Instance>,
    instance_targets: Vec<TargetValueId>,
    feature_weights: Vec<f64>,
    warnings: Vec<DataWarning>,
    /// Seeded tie-break source (§4.6): `None` unless `options.seed` was
    /// set, so an unseeded experiment keeps the deterministic
    /// lowest-id fallback rather than silently turning ties random.
    /// Mutex'd rather than a bare `SmallRng` because [`Experiment::classify_batch`]
    /// shares `&self` across worker threads.
    rng: Option<Mutex<SmallRng>>,
}

impl Experiment {
    /// Creates a fresh experiment with one [`Feature`] per entry in
    /// `metrics`, in `Phase::Learning`.
    pub fn new(metrics: Vec<MetricKind>, options: EngineOptions) -> Self {
        let features = metrics
            .into_iter()
            .enumerate()
            .map(|(i, metric)| Feature::new(i, metric).with_clip_factor(options.clip_factor))
            .collect();
        let rng = options.seed.map(|seed| Mutex::new(SmallRng::seed_from_u64(seed)));
        Experiment {
            features,
            targets: Targets::new(),
            trie: None,
            options,
            phase: Phase::Learning,
            instances: Vec::new(),
            instance_targets: Vec::new(),
            feature_weights: Vec::new(),
            warnings: Vec::new(),
            rng,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Locks the shared tie-break RNG (if a seed was configured) and hands
    /// it to `f`, which is always one `argmax` call. `None` propagates
    /// through untouched when no seed is set.
    fn with_rng<R>(&self, f: impl FnOnce(Option<&mut SmallRng>) -> R) -> R {
        match &self.rng {
            Some(mutex) => {
                let mut guard = mutex.lock().unwrap();
                f(Some(&mut guard))
            }
            None => f(None),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn warnings(&self) -> &[DataWarning] {
        &self.warnings
    }

    /// The true target of training instance `index`, for callers scoring
    /// [`Experiment::classify_loo`] results against ground truth.
    pub fn instance_target(&self, index: usize) -> Option<TargetValueId> {
        self.instance_targets.get(index).copied()
    }

    /// Number of training instances staged so far.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn require_phase(&self, expected: Phase, operation: &str) -> Result<()> {
        if self.phase != expected {
            return Err(EngineError::State {
                state: self.phase,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Interns and aggregates one training row. `values.len()` must equal
    /// the number of features this experiment was built with, else a
    /// [`crate::error::EngineError::Schema`] is returned.
    pub fn add_training_instance(&mut self, values: &[&str], target: &str, weight: f64) -> Result<()> {
        self.require_phase(Phase::Learning, "add_training_instance")?;
        if values.len() != self.features.len() {
            return Err(EngineError::Schema(format!(
                "expected {} feature values, got {}",
                self.features.len(),
                values.len()
            )));
        }
        let target_id = self.targets.intern(target);
        self.targets.observe(target_id, 1);

        let mut ids = Vec::with_capacity(values.len());
        for (feature, raw) in self.features.iter_mut().zip(values) {
            if feature.is_numeric() && raw.parse::<f64>().is_err() {
                return Err(EngineError::Schema(format!(
                    "feature {} is numeric but value {:?} does not parse",
                    feature.index, raw
                )));
            }
            let id = feature.intern(raw);
            feature.observe(id, target_id, 1);
            ids.push(id);
        }

        if (weight - 1.0).abs() > f64::EPSILON && !self.options.exemplar_weighting {
            self.warnings.push(DataWarning::DeviatingWeight {
                line: self.instances.len() + 1,
                weight,
            });
        }

        let instance = Instance::new(ids, Some(target_id)).with_weight(weight);
        self.instances.push(instance);
        self.instance_targets.push(target_id);
        Ok(())
    }

    /// Finalizes statistics, builds the trie, and transitions to
    /// `Phase::Ready`. Must be called exactly once before any `classify*`
    /// call.
    pub fn train(&mut self) -> Result<()> {
        self.require_phase(Phase::Learning, "train")?;

        for feature in &mut self.features {
            if feature.is_numeric() {
                let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
                for v in &feature.values {
                    if v.freq == 0 {
                        continue;
                    }
                    let val = feature.numeric_value(v.id);
                    lo = lo.min(val);
                    hi = hi.max(val);
                }
                if lo.is_finite() && hi.is_finite() {
                    feature.numeric_range = Some((lo, hi));
                }
            }
        }

        for feature in &mut self.features {
            feature.weights = stats::compute_feature_weights(feature, &self.targets, self.options.bin_size);
            feature.stale = false;
        }
        for feature in &mut self.features {
            feature.ensure_matrix(self.options.mvd_limit);
        }

        self.feature_weights = self
            .features
            .iter()
            .map(|f| stats::feature_weight(&f.weights, self.options.weighting, None))
            .collect();

        let permutation = stats::compute_permutation(&self.features, self.options.tree_order);
        let mut trie = InstanceBase::new(permutation, self.options.algorithm, self.options.hashed_tree);
        for (instance, &target) in self.instances.iter().zip(&self.instance_targets) {
            trie.add(instance, target);
        }
        // compress() prunes children whose default target already agrees
        // with their parent's, so defaults must exist on every node first.
        self.with_rng(|rng| trie.assign_defaults(&self.targets, rng));
        if matches!(self.options.algorithm, Algorithm::IgTree) {
            trie.compress();
        }
        self.trie = Some(trie);

        self.phase = Phase::Ready;
        Ok(())
    }

    fn resolve_query(&self, values: &[&str]) -> Instance {
        let ids: Vec<FeatureValueId> = self
            .features
            .iter()
            .zip(values)
            .map(|(feature, raw)| feature.lookup(raw).unwrap_or(crate::pool::UNKNOWN_FEATURE_VALUE))
            .collect();
        Instance::new(ids, None)
    }

    fn classify_instance(&self, query: &Instance) -> Result<ClassificationResult> {
        let trie = self
            .trie
            .as_ref()
            .ok_or_else(|| EngineError::State {
                state: self.phase,
                operation: "classify".to_string(),
            })?;

        let neighbors = match tester::exact_match(query, trie) {
            Some(ns) if self.options.exact_match => ns,
            _ => tester::search(
                query,
                &self.features,
                trie,
                &self.feature_weights,
                self.options.mvd_limit,
                self.options.neighbors.min(self.options.max_bests),
                self.options.ig_threshold,
                self.options.exemplar_weighting,
            )?,
        };

        let voted = vote::vote(
            &neighbors,
            self.options.decay,
            self.options.normalisation,
            &self.targets,
            self.options.beam_size,
        );
        let winner = self
            .with_rng(|rng| voted.argmax(&self.targets, rng))
            .or_else(|| self.targets.majority())
            .ok_or_else(|| EngineError::Schema("no training data to classify against".into()))?;
        let confidence = vote::confidence(&voted, winner);

        Ok(ClassificationResult {
            target: winner,
            distribution: voted,
            confidence,
            neighbors: if self.options.verbose_neighbors {
                Some(neighbors)
            } else {
                None
            },
        })
    }

    /// Classifies one query vector. Requires `Phase::Ready`.
    pub fn classify(&self, values: &[&str]) -> Result<ClassificationResult> {
        self.require_phase(Phase::Ready, "classify")?;
        if values.len() != self.features.len() {
            return Err(EngineError::Schema(format!(
                "expected {} feature values, got {}",
                self.features.len(),
                values.len()
            )));
        }
        let query = self.resolve_query(values);
        self.classify_instance(&query)
    }

    /// Classifies many query vectors, splitting the work across
    /// `std::thread::available_parallelism` worker threads. Each worker
    /// borrows `self` directly — no per-worker clone of the trie/feature
    /// tables is needed since classification never mutates them.
    ///
    /// The outer `Result` only ever reports batch-level failures (wrong
    /// phase, a worker thread panicking); a schema error on one query
    /// (wrong feature count) does not abort the rest of the batch — it
    /// surfaces as an `Err` in that query's own slot, matching §5's
    /// per-line failure isolation ("a malformed test line produces a
    /// per-line warning... classification continues").
    pub fn classify_batch(&self, queries: &[Vec<String>]) -> Result<Vec<Result<ClassificationResult>>> {
        self.require_phase(Phase::Ready, "classify_batch")?;
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let chunk_size = (queries.len() / workers).max(1);
        let results: Arc<std::sync::Mutex<Vec<(usize, Result<ClassificationResult>)>>> =
            Arc::new(std::sync::Mutex::new(Vec::with_capacity(queries.len())));

        thread::scope(|scope| {
            for (chunk_index, chunk) in queries.chunks(chunk_size).enumerate() {
                let results = Arc::clone(&results);
                let base_index = chunk_index * chunk_size;
                scope.spawn(move || {
                    let mut local = Vec::with_capacity(chunk.len());
                    for (offset, row) in chunk.iter().enumerate() {
                        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
                        local.push((base_index + offset, self.classify(&refs)));
                    }
                    results.lock().unwrap().extend(local);
                });
            }
        });

        let mut results = Arc::try_unwrap(results)
            .map_err(|_| EngineError::Resource("worker threads did not join cleanly".into()))?
            .into_inner()
            .map_err(|_| EngineError::Resource("a worker thread panicked".into()))?;
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    /// Leave-one-out classification (§ADD): temporarily hides training
    /// instance `index` from every statistic and the trie, classifies it
    /// against the rest of the instance base, then restores it. Used by
    /// cross-validation style evaluation without a second training pass.
    pub fn classify_loo(&mut self, index: usize) -> Result<ClassificationResult> {
        self.require_phase(Phase::Ready, "classify_loo")?;
        if index >= self.instances.len() {
            return Err(EngineError::Schema(format!("instance index {index} out of range")));
        }
        let instance = self.instances[index].clone();
        let target = self.instance_targets[index];

        self.hide_instance(&instance, target);
        let result = self.classify_instance(&instance);
        self.unhide_instance(&instance, target);

        result
    }

    fn hide_instance(&mut self, instance: &Instance, target: TargetValueId) {
        for (feature, &value) in self.features.iter_mut().zip(&instance.values) {
            feature.hide(value, target, instance.occurrences as u64);
        }
        self.targets.hide(target, instance.occurrences as u64);
        if let Some(trie) = &mut self.trie {
            trie.hide(instance, target);
        }
    }

    fn unhide_instance(&mut self, instance: &Instance, target: TargetValueId) {
        for (feature, &value) in self.features.iter_mut().zip(&instance.values) {
            feature.observe(value, target, instance.occurrences as u64);
        }
        self.targets.observe(target, instance.occurrences as u64);
        if let Some(trie) = &mut self.trie {
            trie.add(instance, target);
        }
    }

    /// Records a non-fatal [`DataWarning`] seen while loading data.
    pub fn record_warning(&mut self, warning: DataWarning) {
        self.warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::model::MetricKind;

    fn trained_xor() -> Experiment {
        let options = EngineOptions::builder().neighbors(1).build().unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap, MetricKind::Overlap], options);
        exp.add_training_instance(&["0", "0"], "A", 1.0).unwrap();
        exp.add_training_instance(&["1", "1"], "A", 1.0).unwrap();
        exp.add_training_instance(&["0", "1"], "B", 1.0).unwrap();
        exp.add_training_instance(&["1", "0"], "B", 1.0).unwrap();
        exp.train().unwrap();
        exp
    }

    #[test]
    fn classify_before_train_is_rejected() {
        let options = EngineOptions::builder().build().unwrap();
        let exp = Experiment::new(vec![MetricKind::Overlap], options);
        let err = exp.classify(&["0"]).unwrap_err();
        assert!(matches!(err, EngineError::State { .. }));
    }

    #[test]
    fn xor_exact_matches_classify_correctly() {
        let exp = trained_xor();
        let result = exp.classify(&["0", "0"]).unwrap();
        assert_eq!(exp.targets().name(result.target), "A");
    }

    #[test]
    fn classify_batch_matches_sequential_classify() {
        let exp = trained_xor();
        let queries = vec![
            vec!["0".to_string(), "0".to_string()],
            vec!["1".to_string(), "0".to_string()],
        ];
        let batch = exp.classify_batch(&queries).unwrap();
        let seq0 = exp.classify(&["0", "0"]).unwrap();
        let seq1 = exp.classify(&["1", "0"]).unwrap();
        assert_eq!(batch[0].as_ref().unwrap().target, seq0.target);
        assert_eq!(batch[1].as_ref().unwrap().target, seq1.target);
    }

    #[test]
    fn classify_batch_isolates_a_malformed_query_from_the_rest() {
        let exp = trained_xor();
        let queries = vec![
            vec!["0".to_string(), "0".to_string()],
            vec!["only-one-value".to_string()],
            vec!["1".to_string(), "0".to_string()],
        ];
        let batch = exp.classify_batch(&queries).unwrap();
        assert!(batch[0].is_ok());
        assert!(matches!(batch[1], Err(EngineError::Schema(_))));
        assert!(batch[2].is_ok());
    }

    #[test]
    fn classify_loo_restores_state_afterward() {
        let mut exp = trained_xor();
        let before = exp.targets().frequency(exp.classify(&["0", "0"]).unwrap().target);
        let _ = exp.classify_loo(0).unwrap();
        let after_target = exp.classify(&["0", "0"]).unwrap().target;
        let after = exp.targets().frequency(after_target);
        assert_eq!(before, after);
    }

    #[test]
    fn wrong_arity_is_a_schema_error() {
        let exp = trained_xor();
        let err = exp.classify(&["0"]).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    fn tied_vote_experiment(seed: Option<u64>) -> Experiment {
        let options = EngineOptions::builder()
            .neighbors(2)
            .decay(crate::vote::Decay::Zero)
            .seed(seed)
            .build()
            .unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap], options);
        // Both targets are seen exactly once, so weight and global
        // frequency tie on an unseen query equidistant from both.
        exp.add_training_instance(&["x"], "A", 1.0).unwrap();
        exp.add_training_instance(&["y"], "B", 1.0).unwrap();
        exp.train().unwrap();
        exp
    }

    #[test]
    fn unseeded_tie_break_is_the_deterministic_lowest_id() {
        let exp = tied_vote_experiment(None);
        let result = exp.classify(&["z"]).unwrap();
        assert_eq!(exp.targets().name(result.target), "A");
    }

    #[test]
    fn seeded_tie_break_is_reproducible_across_identically_seeded_experiments() {
        let first = tied_vote_experiment(Some(7));
        let second = tied_vote_experiment(Some(7));
        let winner_first = first.classify(&["z"]).unwrap().target;
        let winner_second = second.classify(&["z"]).unwrap().target;
        assert_eq!(winner_first, winner_second);
    }

    #[test]
    fn deviating_weight_warns_unless_exemplar_weighting_is_requested() {
        let options = EngineOptions::builder().build().unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap], options);
        exp.add_training_instance(&["x"], "A", 1.0).unwrap();
        exp.add_training_instance(&["y"], "B", 2.5).unwrap();
        assert!(matches!(
            exp.warnings()[0],
            DataWarning::DeviatingWeight { weight, .. } if (weight - 2.5).abs() < 1e-9
        ));

        let options = EngineOptions::builder().exemplar_weighting(true).build().unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap], options);
        exp.add_training_instance(&["x"], "A", 1.0).unwrap();
        exp.add_training_instance(&["y"], "B", 2.5).unwrap();
        assert!(exp.warnings().is_empty());
    }

    #[test]
    fn exemplar_weight_shifts_classification_toward_the_heavier_neighbour() {
        let options = EngineOptions::builder()
            .neighbors(2)
            .decay(crate::vote::Decay::Zero)
            .build()
            .unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap], options);
        // Both classes are one overlap-distance step from the query and
        // tie in the same distance bin; "B" carries far more exemplar
        // weight (merged into its trie leaf at training time, §4.3) and
        // should win the vote despite tying on raw neighbour count.
        exp.add_training_instance(&["a"], "A", 1.0).unwrap();
        exp.add_training_instance(&["b"], "B", 50.0).unwrap();
        exp.train().unwrap();
        let result = exp.classify(&["z"]).unwrap();
        assert_eq!(exp.targets().name(result.target), "B");
    }

    #[test]
    fn exemplar_weighting_search_variant_does_not_panic_and_still_classifies() {
        // With NEIGHBORS=1 the nearest bin wins outright, so this is a
        // smoke test for the running_d/(freq+eps) leaf-scoring path
        // itself rather than a test of the trie-level exemplar weight.
        let options = EngineOptions::builder()
            .neighbors(1)
            .exemplar_weighting(true)
            .build()
            .unwrap();
        let mut exp = Experiment::new(vec![MetricKind::Overlap], options);
        exp.add_training_instance(&["a"], "A", 1.0).unwrap();
        exp.add_training_instance(&["b"], "B", 50.0).unwrap();
        exp.train().unwrap();
        let result = exp.classify(&["a"]).unwrap();
        assert_eq!(exp.targets().name(result.target), "A");
    }
}
