//! Instance-base trie (C5).
//!
//! Training instances are indexed in a feature-value trie, descended in the
//! permutation order computed by [`crate::stats::compute_permutation`].
//! Every node carries the aggregated class distribution of the subtree
//! below it, so a search that runs out of tree (an unknown value, or an
//! IGTree-compressed branch) can still back off to a majority-class
//! default rather than failing.
//!
//! The trie is arena-allocated (`Vec<TrieNode>` addressed by [`NodeId`])
//! rather than built from owned/parent pointers, matching this crate's
//! general replacement of shared-pointer graphs with index-addressed
//! arenas (see SPEC_FULL.md §9).

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::OnceCell;
use rand::rngs::SmallRng;

use crate::model::{ClassDistribution, Instance, Targets};
use crate::pool::{FeatureValueId, TargetValueId};

/// Arena index of a [`TrieNode`]. The root is always `NodeId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Which search strategy the instance base was built for (§4.3, §4.5).
/// `IGTree` compresses the tree at build time; `Tribl`/`Tribl2` keep the
/// full tree but the tester switches between IGTree-style and full
/// k-NN search at the configured offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Ib1,
    IgTree,
    Tribl(usize),
    Tribl2,
}

#[derive(Debug)]
pub struct TrieNode {
    children: BTreeMap<FeatureValueId, NodeId>,
    hashed_children: OnceCell<HashMap<FeatureValueId, NodeId>>,
    distribution: ClassDistribution,
    default_target: Option<TargetValueId>,
    depth: usize,
}

impl TrieNode {
    fn new(depth: usize) -> Self {
        TrieNode {
            children: BTreeMap::new(),
            hashed_children: OnceCell::new(),
            distribution: ClassDistribution::new(),
            default_target: None,
            depth,
        }
    }

    pub fn distribution(&self) -> &ClassDistribution {
        &self.distribution
    }

    pub fn default_target(&self) -> Option<TargetValueId> {
        self.default_target
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// A node with no children, either because its feature path is
    /// exhausted or (IGTree) its children were all pruned by
    /// [`InstanceBase::compress`] into agreeing with this node's default.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, value: FeatureValueId) -> Option<NodeId> {
        if let Some(map) = self.hashed_children.get() {
            return map.get(&value).copied();
        }
        self.children.get(&value).copied()
    }

    /// Builds (once) a hash-indexed copy of `children` for HASHED_TREE
    /// lookups (§6). A no-op on repeat calls.
    fn ensure_hashed(&self) {
        self.hashed_children.get_or_init(|| {
            self.children
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect::<HashMap<_, _>>()
        });
    }

    pub fn children_iter(&self) -> impl Iterator<Item = (FeatureValueId, NodeId)> + '_ {
        self.children.iter().map(|(&k, &v)| (k, v))
    }
}

/// The arena-backed trie plus the permutation and algorithm it was built
/// under.
#[derive(Debug)]
pub struct InstanceBase {
    arena: Vec<TrieNode>,
    permutation: Vec<usize>,
    algorithm: Algorithm,
    hashed: bool,
    compressed: bool,
}

impl InstanceBase {
    pub fn new(permutation: Vec<usize>, algorithm: Algorithm, hashed: bool) -> Self {
        InstanceBase {
            arena: vec![TrieNode::new(0)],
            permutation,
            algorithm,
            hashed,
            compressed: false,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &TrieNode {
        &self.arena[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TrieNode {
        &mut self.arena[id.0 as usize]
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1 && self.arena[0].distribution.is_empty()
    }

    /// Inserts one training instance along the full permuted path, adding
    /// `weight_count` (the instance's occurrence count) scaled by the
    /// instance's exemplar weight (§4.3, default 1.0) to the class
    /// distribution of every node on the path, creating nodes as needed.
    /// IGTree compression happens later via [`InstanceBase::compress`], not
    /// at insert time, so the full path is always stored until then.
    pub fn add(&mut self, instance: &Instance, target: TargetValueId) {
        let count = instance.occurrences as u64;
        let weight = instance.weight;
        let mut current = self.root();
        self.node_mut(current)
            .distribution
            .add_weighted(target, count, weight);
        for &feature_index in &self.permutation.clone() {
            let value = instance.value_at(feature_index);
            let depth = self.node(current).depth + 1;
            let next = match self.node(current).child(value) {
                Some(existing) => existing,
                None => {
                    let id = NodeId(self.arena.len() as u32);
                    self.arena.push(TrieNode::new(depth));
                    self.node_mut(current).children.insert(value, id);
                    self.node_mut(current).hashed_children = OnceCell::new();
                    id
                }
            };
            self.node_mut(next)
                .distribution
                .add_weighted(target, count, weight);
            current = next;
        }
    }

    /// Reverses [`InstanceBase::add`] along the same path (hide, §3).
    /// Missing nodes along the path are a caller bug (hiding an instance
    /// never added) and are silently skipped rather than panicking.
    pub fn hide(&mut self, instance: &Instance, target: TargetValueId) {
        let count = instance.occurrences as u64;
        let mut current = self.root();
        self.node_mut(current).distribution.remove(target, count);
        for &feature_index in &self.permutation.clone() {
            let value = instance.value_at(feature_index);
            let Some(next) = self.node(current).child(value) else {
                return;
            };
            self.node_mut(next).distribution.remove(target, count);
            current = next;
        }
    }

    /// Walks the full permuted path for `instance`, returning the leaf
    /// distribution only if every feature value along the way was seen at
    /// training time (§4.5 exact match).
    pub fn exact_match(&self, instance: &Instance) -> Option<&ClassDistribution> {
        let mut current = self.root();
        for &feature_index in &self.permutation {
            let value = instance.value_at(feature_index);
            current = self.node(current).child(value)?;
        }
        Some(self.node(current).distribution())
    }

    /// Computes `default_target` for every node (majority class of the
    /// subtree rooted there), used as the IGTree/TRIBL back-off prediction
    /// when search runs off the known tree. Must be called after all
    /// training instances are added and before [`InstanceBase::compress`],
    /// which prunes children by comparing their default to their parent's.
    ///
    /// `rng` is the seeded tie-break source (§4.6): `Some` only when the
    /// caller configured a random seed, in which case a default that is
    /// still tied after weight and global-frequency comparison is chosen
    /// uniformly at random rather than by lowest id.
    pub fn assign_defaults(&mut self, targets: &Targets, mut rng: Option<&mut SmallRng>) {
        for i in 0..self.arena.len() {
            let majority = self.arena[i].distribution.argmax(targets, rng.as_deref_mut());
            self.arena[i].default_target = majority;
        }
        if self.hashed {
            for node in &mut self.arena {
                node.ensure_hashed();
            }
        }
    }

    /// IGTree compression (§3, §4.3): bottom-up, removes any child whose
    /// `default_target` already agrees with its parent's — once the whole
    /// tree has been compressed this way, a child only survives if
    /// descending into it changes the predicted class, which is exactly
    /// what IGTree's greedy search relies on to back off to an ancestor's
    /// default. Requires [`InstanceBase::assign_defaults`] to have run
    /// first. A node left with no children is a leaf regardless of depth
    /// ([`TrieNode::is_leaf`] already treats empty `children` as leaf, so
    /// no separate flag bookkeeping is needed here); its own distribution
    /// and default are untouched by removing its children.
    pub fn compress(&mut self) {
        if self.compressed {
            return;
        }
        self.compressed = true;

        // Post-order (children before parents) so a node's children are
        // already resolved by the time we decide whether the node itself
        // collapses into its parent.
        let mut stack = vec![(self.root(), None::<NodeId>)];
        let mut post_order: Vec<(NodeId, Option<NodeId>)> = Vec::new();
        while let Some((id, parent)) = stack.pop() {
            let children: Vec<NodeId> = self.node(id).children_iter().map(|(_, c)| c).collect();
            post_order.push((id, parent));
            for child in children {
                stack.push((child, Some(id)));
            }
        }

        for &(id, parent) in post_order.iter().rev() {
            let Some(parent) = parent else {
                continue; // root has no parent to collapse into
            };
            if !self.node(id).children.is_empty() {
                continue; // still branches below, nothing to collapse
            }
            if self.node(id).default_target == self.node(parent).default_target {
                let value = self
                    .node(parent)
                    .children_iter()
                    .find(|&(_, c)| c == id)
                    .map(|(v, _)| v);
                if let Some(value) = value {
                    self.node_mut(parent).children.remove(&value);
                    self.node_mut(parent).hashed_children = OnceCell::new();
                    if self.hashed {
                        self.node(parent).ensure_hashed();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;
    use crate::pool::FeatureValueId;

    fn targets_ab() -> Targets {
        let mut t = Targets::new();
        t.intern("A");
        t.intern("B");
        t
    }

    #[test]
    fn add_then_exact_match_round_trip() {
        let mut ib = InstanceBase::new(vec![0, 1], Algorithm::Ib1, false);
        let inst = Instance::new(vec![FeatureValueId(0), FeatureValueId(1)], Some(TargetValueId(0)));
        ib.add(&inst, TargetValueId(0));
        let dist = ib.exact_match(&inst).expect("path must exist");
        assert_eq!(dist.total_freq(), 1);
        assert_eq!(dist.get(TargetValueId(0)).unwrap().freq, 1);
    }

    #[test]
    fn unknown_path_has_no_exact_match() {
        let mut ib = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let inst = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0)));
        ib.add(&inst, TargetValueId(0));
        let other = Instance::new(vec![FeatureValueId(99)], None);
        assert!(ib.exact_match(&other).is_none());
    }

    #[test]
    fn hide_reverses_add() {
        let mut ib = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let inst = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0)));
        ib.add(&inst, TargetValueId(0));
        ib.hide(&inst, TargetValueId(0));
        let dist = ib.exact_match(&inst).unwrap();
        assert_eq!(dist.total_freq(), 0);
    }

    #[test]
    fn compress_collapses_a_branch_whose_whole_subtree_is_one_class() {
        let mut ib = InstanceBase::new(vec![0, 1], Algorithm::IgTree, false);
        // Feature 0 alone already determines the class; feature 1 varies
        // but adds no further class information once feature 0 is fixed.
        let i1 = Instance::new(vec![FeatureValueId(0), FeatureValueId(0)], Some(TargetValueId(0)));
        let i2 = Instance::new(vec![FeatureValueId(0), FeatureValueId(1)], Some(TargetValueId(0)));
        ib.add(&i1, TargetValueId(0));
        ib.add(&i2, TargetValueId(0));
        let targets = targets_ab();
        ib.assign_defaults(&targets, None);
        ib.compress();
        let root_child = ib.node(ib.root()).child(FeatureValueId(0)).unwrap();
        assert!(ib.node(root_child).is_leaf());
    }

    #[test]
    fn compress_keeps_a_branch_that_changes_the_prediction() {
        // Feature 0 = 0 -> always A (both feature-1 values agree, so that
        // sub-branch collapses into the feature-0=0 node); feature 0 = 1 ->
        // always B, which disagrees with the root's own default (a tie
        // between A and B, broken towards the lower target id, A) and so
        // must survive compression or the B prediction would be lost.
        let mut ib = InstanceBase::new(vec![0, 1], Algorithm::IgTree, false);
        let rows = [
            (FeatureValueId(0), FeatureValueId(0), TargetValueId(0)),
            (FeatureValueId(0), FeatureValueId(1), TargetValueId(0)),
            (FeatureValueId(1), FeatureValueId(0), TargetValueId(1)),
            (FeatureValueId(1), FeatureValueId(1), TargetValueId(1)),
        ];
        for (f0, f1, target) in rows {
            let inst = Instance::new(vec![f0, f1], Some(target));
            ib.add(&inst, target);
        }
        let targets = targets_ab();
        ib.assign_defaults(&targets, None);
        assert_eq!(ib.node(ib.root()).default_target(), Some(TargetValueId(0)));
        ib.compress();

        // The feature-0=0 branch agrees with the root's own default (A) at
        // every depth, so it collapses away entirely.
        assert!(ib.node(ib.root()).child(FeatureValueId(0)).is_none());

        // The feature-0=1 branch predicts B, which disagrees with the
        // root's A default, so it must survive as a (now childless) leaf.
        let b_branch = ib
            .node(ib.root())
            .child(FeatureValueId(1))
            .expect("the B-predicting branch must not be pruned away");
        assert!(ib.node(b_branch).is_leaf());
        assert_eq!(ib.node(b_branch).default_target(), Some(TargetValueId(1)));
    }

    #[test]
    fn exemplar_weight_scales_distribution_weight_but_not_frequency() {
        let mut ib = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let heavy = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0))).with_weight(3.0);
        ib.add(&heavy, TargetValueId(0));
        let dist = ib.exact_match(&heavy).unwrap();
        let entry = dist.get(TargetValueId(0)).unwrap();
        assert_eq!(entry.freq, 1);
        assert_eq!(entry.weight, 3.0);
    }

    #[test]
    fn assign_defaults_sets_majority_at_root() {
        let mut ib = InstanceBase::new(vec![0], Algorithm::Ib1, false);
        let i1 = Instance::new(vec![FeatureValueId(0)], Some(TargetValueId(0)));
        let i2 = Instance::new(vec![FeatureValueId(1)], Some(TargetValueId(0)));
        ib.add(&i1, TargetValueId(0));
        ib.add(&i2, TargetValueId(0));
        let targets = targets_ab();
        ib.assign_defaults(&targets, None);
        assert_eq!(ib.node(ib.root()).default_target(), Some(TargetValueId(0)));
    }
}
