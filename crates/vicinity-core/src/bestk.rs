//! Best-k neighbour tracking (C7).
//!
//! A [`BestArray`] holds the `k` best distance *bins* seen during a search:
//! every instance at the same distance as an already-admitted bin joins
//! that bin rather than competing for a slot, so "k neighbours" means k
//! distinct distances, potentially many more instances. [`NeighborSet`] is
//! the materialized result handed to the voter (C8): one aggregated
//! [`ClassDistribution`] and exemplar list per bin, nearest first.

use crate::model::{ClassDistribution, Instance};
use crate::pool::TargetValueId;

#[derive(Debug, Clone)]
struct Bin {
    distance: f64,
    distribution: ClassDistribution,
    exemplars: Vec<ExemplarRef>,
}

/// A reference to one training instance admitted into a bin, kept for
/// exemplar-weighted voting and `+neighbors` reporting.
#[derive(Debug, Clone, Copy)]
pub struct ExemplarRef {
    pub target: TargetValueId,
    pub weight: f64,
}

/// Bounded collection of the `k` smallest distances encountered, each
/// holding every instance tied at that distance. Distances are compared
/// with a small epsilon so floating point noise does not fragment a tied
/// bin into two (§4.6).
#[derive(Debug, Clone)]
pub struct BestArray {
    capacity: usize,
    bins: Vec<Bin>,
    epsilon: f64,
    considered: u64,
}

impl BestArray {
    pub fn new(capacity: usize) -> Self {
        BestArray {
            capacity: capacity.max(1),
            bins: Vec::new(),
            epsilon: 1e-8,
            considered: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn considered(&self) -> u64 {
        self.considered
    }

    /// The worst (largest) admitted distance, or `f64::INFINITY` if the
    /// array has not yet filled to capacity — i.e. the current pruning
    /// threshold a tester can use to skip subtrees whose minimum possible
    /// distance already exceeds it.
    pub fn threshold(&self) -> f64 {
        if self.bins.len() < self.capacity {
            f64::INFINITY
        } else {
            self.bins.last().map(|b| b.distance).unwrap_or(f64::INFINITY)
        }
    }

    pub fn is_full(&self) -> bool {
        self.bins.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Offers one candidate at `distance`, whose aggregated class
    /// distribution is `dist` and whose individual exemplars (for
    /// exemplar-weighted voting) are `exemplars`. Joins an existing bin
    /// within epsilon of `distance`; otherwise inserts a new bin in sorted
    /// order and evicts the worst bin if over capacity.
    pub fn add_result(&mut self, distance: f64, dist: &ClassDistribution, exemplars: &[ExemplarRef]) {
        self.considered += 1;
        if distance > self.threshold() + self.epsilon {
            return;
        }
        if let Some(bin) = self
            .bins
            .iter_mut()
            .find(|b| (b.distance - distance).abs() <= self.epsilon)
        {
            bin.distribution.merge(dist);
            bin.exemplars.extend_from_slice(exemplars);
            return;
        }
        let pos = self
            .bins
            .iter()
            .position(|b| b.distance > distance)
            .unwrap_or(self.bins.len());
        self.bins.insert(
            pos,
            Bin {
                distance,
                distribution: dist.clone(),
                exemplars: exemplars.to_vec(),
            },
        );
        if self.bins.len() > self.capacity {
            self.bins.pop();
        }
    }

    /// Offers one instance directly (tester convenience over
    /// [`BestArray::add_result`]).
    pub fn add_instance(&mut self, distance: f64, instance: &Instance, target: TargetValueId) {
        let mut dist = ClassDistribution::new();
        dist.add(target, instance.occurrences as u64);
        let exemplar = ExemplarRef {
            target,
            weight: instance.weight,
        };
        self.add_result(distance, &dist, &[exemplar]);
    }

    /// Materializes the accumulated bins into a [`NeighborSet`], nearest
    /// distance first.
    pub fn into_neighbor_set(self) -> NeighborSet {
        NeighborSet {
            bins: self
                .bins
                .into_iter()
                .map(|b| NeighborBin {
                    distance: b.distance,
                    distribution: b.distribution,
                    exemplars: b.exemplars,
                })
                .collect(),
        }
    }
}

/// One distance bin in a finalized [`NeighborSet`].
#[derive(Debug, Clone)]
pub struct NeighborBin {
    pub distance: f64,
    pub distribution: ClassDistribution,
    pub exemplars: Vec<ExemplarRef>,
}

/// The finalized best-k result handed to the voter (C8), ordered nearest
/// bin first.
#[derive(Debug, Clone, Default)]
pub struct NeighborSet {
    bins: Vec<NeighborBin>,
}

impl NeighborSet {
    pub fn bins(&self) -> &[NeighborBin] {
        &self.bins
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Total number of instances aggregated across every bin.
    pub fn total_instances(&self) -> u64 {
        self.bins.iter().map(|b| b.distribution.total_freq()).sum()
    }
}
