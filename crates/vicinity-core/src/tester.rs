//! Search over the instance-base trie (C6).
//!
//! Every search strategy (§4.3, §4.5) returns a [`NeighborSet`] (or, for
//! IGTree's single-path descent, a degenerate one-bin set) via an explicit
//! `Vec<LevelFrame>` stack rather than recursion, so arbitrarily deep
//! feature vectors never risk a native stack overflow and a caller can
//! inspect in-flight search state (useful for `+neighbors` reporting).

use crate::bestk::BestArray;
use crate::bestk::NeighborSet;
use crate::error::{EngineError, Result};
use crate::metric::{self, DOT_PRODUCT_SENTINEL};
use crate::model::{ClassDistribution, Feature, Instance, MetricKind};
use crate::pool::TargetValueId;
use crate::trie::{Algorithm, InstanceBase, NodeId};

/// One pending subtree in the explicit-stack walk: the node to expand and
/// the distance already accumulated on the path down to it.
#[derive(Debug, Clone, Copy)]
pub struct LevelFrame {
    pub node: NodeId,
    pub running_distance: f64,
}

/// Distance floor (§4.4 exemplar-weight variant) added to a target's
/// frequency before dividing, so a class seen exactly once at a leaf still
/// yields a finite weighted distance.
const EXEMPLAR_WEIGHT_EPSILON: f64 = 1e-6;

/// Full best-k search (IB1, §4.3) of the subtree rooted at `start`,
/// branch-and-bound pruned against the current k-th best distance.
/// `feature_weights[i]` scales feature `i`'s pairwise distance before it is
/// added to the running sum (§4.4's combination of metric and weighting).
///
/// `exemplar_weighting` switches the leaf-reached step to §4.4's
/// exemplar-weight variant: instead of submitting the leaf's whole
/// distribution at the running distance, every target present at the leaf
/// is submitted as its own singleton distribution at
/// `running_distance / (target_frequency + ε)`, so rarer classes at that
/// leaf contribute a proportionally larger (more cautious) distance.
#[allow(clippy::too_many_arguments)]
pub fn search_full(
    query: &Instance,
    features: &[Feature],
    trie: &InstanceBase,
    feature_weights: &[f64],
    mvdm_threshold: u64,
    start: NodeId,
    start_distance: f64,
    k: usize,
    exemplar_weighting: bool,
) -> NeighborSet {
    let mut best = BestArray::new(k);
    let mut stack = vec![LevelFrame {
        node: start,
        running_distance: start_distance,
    }];
    while let Some(frame) = stack.pop() {
        let node = trie.node(frame.node);
        // No in-tree pruning in exemplar-weight mode (§4.4): the bin
        // distances are no longer the running additive distance, so they
        // cannot bound it.
        if !exemplar_weighting && frame.running_distance > best.threshold() + 1e-8 {
            continue;
        }
        if node.depth() >= trie.permutation().len() || node.is_leaf() {
            if exemplar_weighting {
                for (target, entry) in node.distribution().iter() {
                    let mut singleton = ClassDistribution::new();
                    singleton.add(target, entry.freq);
                    let d = frame.running_distance / (entry.freq as f64 + EXEMPLAR_WEIGHT_EPSILON);
                    best.add_result(d, &singleton, &[]);
                }
            } else {
                best.add_result(frame.running_distance, node.distribution(), &[]);
            }
            continue;
        }
        let feature_index = trie.permutation()[node.depth()];
        let feature = &features[feature_index];
        let query_value = query.value_at(feature_index);
        let weight = feature_weights.get(feature_index).copied().unwrap_or(1.0);
        for (value, child) in node.children_iter() {
            let d = feature.pairwise_distance(query_value, value, mvdm_threshold);
            let new_distance = frame.running_distance + weight * d;
            if exemplar_weighting || new_distance <= best.threshold() + 1e-8 {
                stack.push(LevelFrame {
                    node: child,
                    running_distance: new_distance,
                });
            }
        }
    }
    best.into_neighbor_set()
}

/// IGTree-style greedy single-path descent (§4.3): follows the child that
/// matches the query value at each level; on the first mismatch or
/// unknown value, returns the last matched node's `default_target`
/// distribution rather than continuing to search. Distance is always 0 or
/// 1 along the matched prefix (overlap-equivalent), which is why IGTree
/// bases are normally built over Overlap/Numeric features only.
pub fn search_greedy(query: &Instance, trie: &InstanceBase) -> ClassDistribution {
    let mut current = trie.root();
    loop {
        let node = trie.node(current);
        if node.is_leaf() {
            return node.distribution().clone();
        }
        let feature_index = node.depth();
        let actual_index = trie.permutation().get(feature_index).copied();
        let Some(actual_index) = actual_index else {
            return node.distribution().clone();
        };
        let value = query.value_at(actual_index);
        match node.child(value) {
            Some(next) => current = next,
            None => return node.distribution().clone(),
        }
    }
}

/// Descends greedily (as in [`search_greedy`]) for `offset` levels, then
/// switches to a full best-k search over the remaining subtree (§4.5
/// TRIBL). If the greedy descent runs off the tree before `offset` levels
/// are reached, the node it stopped at is used as the full-search root —
/// there is nothing more specific to descend into.
#[allow(clippy::too_many_arguments)]
pub fn search_tribl(
    query: &Instance,
    features: &[Feature],
    trie: &InstanceBase,
    feature_weights: &[f64],
    mvdm_threshold: u64,
    offset: usize,
    k: usize,
    exemplar_weighting: bool,
) -> NeighborSet {
    let mut current = trie.root();
    let mut distance = 0.0;
    for level in 0..offset {
        let node = trie.node(current);
        if node.is_leaf() {
            break;
        }
        let feature_index = match trie.permutation().get(level) {
            Some(&i) => i,
            None => break,
        };
        let feature = &features[feature_index];
        let query_value = query.value_at(feature_index);
        let weight = feature_weights.get(feature_index).copied().unwrap_or(1.0);
        let matched = node.child(query_value);
        match matched {
            Some(next) => {
                current = next;
            }
            None => {
                // fall back to the closest available child so search_full
                // still has a meaningful (non-empty) subtree to explore.
                if let Some((value, next)) = node.children_iter().next() {
                    distance += weight * feature.pairwise_distance(query_value, value, mvdm_threshold);
                    current = next;
                } else {
                    break;
                }
            }
        }
    }
    search_full(
        query,
        features,
        trie,
        feature_weights,
        mvdm_threshold,
        current,
        distance,
        k,
        exemplar_weighting,
    )
}

/// TRIBL2 (§4.5): like [`search_tribl`], but the greedy/full switch point
/// is where the feature about to be descended falls below
/// `weight_threshold` (an information-gain-style cutoff) rather than a
/// fixed depth, so it adapts to each feature's actual discriminative
/// power instead of a hand-picked offset.
#[allow(clippy::too_many_arguments)]
pub fn search_tribl2(
    query: &Instance,
    features: &[Feature],
    trie: &InstanceBase,
    feature_weights: &[f64],
    mvdm_threshold: u64,
    weight_threshold: f64,
    k: usize,
    exemplar_weighting: bool,
) -> NeighborSet {
    let mut current = trie.root();
    let mut distance = 0.0;
    loop {
        let node = trie.node(current);
        if node.is_leaf() {
            break;
        }
        let depth = node.depth();
        let feature_index = match trie.permutation().get(depth) {
            Some(&i) => i,
            None => break,
        };
        let weight = feature_weights.get(feature_index).copied().unwrap_or(1.0);
        if weight < weight_threshold {
            break;
        }
        let feature = &features[feature_index];
        let query_value = query.value_at(feature_index);
        match node.child(query_value) {
            Some(next) => current = next,
            None => {
                if let Some((value, next)) = node.children_iter().next() {
                    distance += weight * feature.pairwise_distance(query_value, value, mvdm_threshold);
                    current = next;
                } else {
                    break;
                }
            }
        }
    }
    search_full(
        query,
        features,
        trie,
        feature_weights,
        mvdm_threshold,
        current,
        distance,
        k,
        exemplar_weighting,
    )
}

/// Full-vector similarity search (§4.4): Cosine and DotProduct are not
/// additive across features, so no incremental branch-and-bound pruning is
/// possible the way [`search_full`] prunes by running distance. Every leaf
/// of the whole trie is enumerated and scored once, by reconstructing the
/// query's and that leaf's full numeric vector along the permutation order.
pub fn search_similarity(
    query: &Instance,
    features: &[Feature],
    trie: &InstanceBase,
    feature_weights: &[f64],
    metric: MetricKind,
    k: usize,
) -> Result<NeighborSet> {
    let permutation = trie.permutation();
    let query_vector: Vec<f64> = permutation
        .iter()
        .map(|&fi| features[fi].numeric_value(query.value_at(fi)))
        .collect();
    let weights: Vec<f64> = permutation
        .iter()
        .map(|&fi| feature_weights.get(fi).copied().unwrap_or(1.0))
        .collect();

    let mut best = BestArray::new(k);
    let mut stack = vec![(trie.root(), Vec::<f64>::new())];
    while let Some((node_id, values)) = stack.pop() {
        let node = trie.node(node_id);
        if node.is_leaf() || node.depth() >= permutation.len() {
            let distance = match metric {
                MetricKind::Cosine => metric::cosine_distance(&weights, &query_vector, &values),
                MetricKind::DotProduct => {
                    let d = metric::dot_product_distance(
                        &weights,
                        &query_vector,
                        &values,
                        DOT_PRODUCT_SENTINEL,
                    );
                    if !d.is_finite() {
                        return Err(EngineError::Numeric(
                            "DotProduct metric overflowed; switch to Cosine".into(),
                        ));
                    }
                    d
                }
                other => unreachable!("{other:?} is not a similarity metric"),
            };
            best.add_result(distance, node.distribution(), &[]);
            continue;
        }
        let feature_index = permutation[node.depth()];
        let feature = &features[feature_index];
        for (value, child) in node.children_iter() {
            let mut next_values = values.clone();
            next_values.push(feature.numeric_value(value));
            stack.push((child, next_values));
        }
    }
    Ok(best.into_neighbor_set())
}

/// Dispatches to the right strategy per the instance base's configured
/// [`Algorithm`] — or, when any feature uses a similarity metric, to
/// [`search_similarity`] regardless of `Algorithm`, since incremental
/// IGTree/TRIBL descent does not apply to a non-additive metric.
#[allow(clippy::too_many_arguments)]
pub fn search(
    query: &Instance,
    features: &[Feature],
    trie: &InstanceBase,
    feature_weights: &[f64],
    mvdm_threshold: u64,
    k: usize,
    ig_threshold: f64,
    exemplar_weighting: bool,
) -> Result<NeighborSet> {
    if let Some(metric) = features.iter().map(|f| f.metric).find(|m| m.is_similarity()) {
        return search_similarity(query, features, trie, feature_weights, metric, k);
    }
    Ok(match trie.algorithm() {
        Algorithm::Ib1 => search_full(
            query,
            features,
            trie,
            feature_weights,
            mvdm_threshold,
            trie.root(),
            0.0,
            k,
            exemplar_weighting,
        ),
        Algorithm::IgTree => {
            let mut best = BestArray::new(1);
            best.add_result(0.0, &search_greedy(query, trie), &[]);
            best.into_neighbor_set()
        }
        Algorithm::Tribl(offset) => search_tribl(
            query,
            features,
            trie,
            feature_weights,
            mvdm_threshold,
            offset,
            k,
            exemplar_weighting,
        ),
        Algorithm::Tribl2 => search_tribl2(
            query,
            features,
            trie,
            feature_weights,
            mvdm_threshold,
            ig_threshold,
            k,
            exemplar_weighting,
        ),
    })
}

/// Direct exact-match lookup (§4.5 EXACT_MATCH), bypassing best-k search
/// entirely. Returns `None` if any feature value along the path was never
/// seen at training time.
pub fn exact_match(query: &Instance, trie: &InstanceBase) -> Option<NeighborSet> {
    let dist = trie.exact_match(query)?;
    let mut best = BestArray::new(1);
    best.add_result(0.0, dist, &[]);
    Some(best.into_neighbor_set())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricKind;
    use crate::pool::FeatureValueId;

    fn build_ib1(a0: FeatureValueId, a1: FeatureValueId) -> (Vec<Feature>, InstanceBase) {
        let mut f0 = Feature::new(0, MetricKind::Overlap);
        f0.intern("x");
        f0.intern("y");
        let features = vec![f0];
        let mut trie = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let i1 = Instance::new(vec![a0], Some(TargetValueId(0)));
        let i2 = Instance::new(vec![a1], Some(TargetValueId(1)));
        trie.add(&i1, TargetValueId(0));
        trie.add(&i2, TargetValueId(1));
        (features, trie)
    }

    #[test]
    fn full_search_finds_exact_value_at_zero_distance() {
        let (features, trie) = build_ib1(FeatureValueId(0), FeatureValueId(1));
        let query = Instance::new(vec![FeatureValueId(0)], None);
        let ns = search_full(&query, &features, &trie, &[1.0], 0, trie.root(), 0.0, 2, false);
        assert_eq!(ns.bins()[0].distance, 0.0);
        assert_eq!(
            ns.bins()[0].distribution.get(TargetValueId(0)).unwrap().freq,
            1
        );
    }

    #[test]
    fn greedy_search_falls_back_to_default_on_unknown_value() {
        let (_features, mut trie) = build_ib1(FeatureValueId(0), FeatureValueId(1));
        let targets = {
            let mut t = crate::model::Targets::new();
            t.intern("A");
            t.intern("B");
            t.observe(TargetValueId(0), 1);
            t.observe(TargetValueId(1), 1);
            t
        };
        trie.assign_defaults(&targets, None);
        let query = Instance::new(vec![FeatureValueId(99)], None);
        let dist = search_greedy(&query, &trie);
        assert_eq!(dist.total_freq(), 2);
    }

    #[test]
    fn exact_match_returns_none_for_unseen_value() {
        let (_features, trie) = build_ib1(FeatureValueId(0), FeatureValueId(1));
        let query = Instance::new(vec![FeatureValueId(99)], None);
        assert!(exact_match(&query, &trie).is_none());
    }

    fn build_numeric(metric: MetricKind) -> (Vec<Feature>, InstanceBase) {
        let mut f0 = Feature::new(0, metric);
        f0.intern("1.0"); // FeatureValueId(0)
        f0.intern("2.0"); // FeatureValueId(1)
        f0.intern("-1.0"); // FeatureValueId(2)
        let features = vec![f0];
        let mut trie = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let aligned = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0)));
        let opposite = Instance::new(vec![FeatureValueId(2)], Some(TargetValueId(1)));
        trie.add(&aligned, TargetValueId(0));
        trie.add(&opposite, TargetValueId(1));
        (features, trie)
    }

    /// Regression test for a CLI invocation with `--metric cosine`: the
    /// additive walker used to reach `Feature::pairwise_distance`'s
    /// `unreachable!()` for similarity metrics and panic on valid input.
    #[test]
    fn cosine_search_does_not_panic_and_favors_the_aligned_vector() {
        let (features, trie) = build_numeric(MetricKind::Cosine);
        let query = Instance::new(vec![FeatureValueId(1)], None); // "2.0"
        let ns = search(&query, &features, &trie, &[1.0], 0, 2, 0.0, false).unwrap();
        assert_eq!(
            ns.bins()[0].distribution.get(TargetValueId(0)).map(|e| e.freq),
            Some(1)
        );
        assert!(ns.bins()[0].distance < ns.bins()[1].distance);
    }

    /// §4.4 exemplar-weight search variant: a target seen more often at a
    /// leaf (higher `entry.freq`) is divided by a larger denominator, so it
    /// ends up in a nearer (more confident) bin than an equally-distant
    /// target seen only once, even though both leaves sit at the same
    /// running distance from the query.
    #[test]
    fn exemplar_weighting_rewards_the_more_frequent_target_at_equal_running_distance() {
        let mut f0 = Feature::new(0, MetricKind::Overlap);
        f0.intern("x");
        f0.intern("rare");
        f0.intern("common");
        let features = vec![f0];
        let mut trie = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let rare = Instance::new(vec![FeatureValueId(1)], Some(TargetValueId(0)));
        trie.add(&rare, TargetValueId(0));
        let common = Instance::new(vec![FeatureValueId(2)], Some(TargetValueId(1)));
        for _ in 0..10 {
            trie.add(&common, TargetValueId(1));
        }

        let query = Instance::new(vec![FeatureValueId(0)], None);
        let ns = search_full(&query, &features, &trie, &[1.0], 0, trie.root(), 0.0, 2, true);
        assert_eq!(ns.bins().len(), 2);
        let rare_bin = ns
            .bins()
            .iter()
            .find(|b| b.distribution.get(TargetValueId(0)).is_some())
            .unwrap();
        let common_bin = ns
            .bins()
            .iter()
            .find(|b| b.distribution.get(TargetValueId(1)).is_some())
            .unwrap();
        assert!(common_bin.distance < rare_bin.distance);
    }

    #[test]
    fn dot_product_overflow_reports_a_numeric_error_instead_of_panicking() {
        let mut f0 = Feature::new(0, MetricKind::DotProduct);
        f0.intern(&f64::MAX.to_string());
        let features = vec![f0];
        let mut trie = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let inst = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0)));
        trie.add(&inst, TargetValueId(0));
        let query = Instance::new(vec![FeatureValueId(0)], None);
        let err = search(&query, &features, &trie, &[1.0], 0, 1, 0.0, false).unwrap_err();
        assert!(matches!(err, EngineError::Numeric(_)));
    }
}
