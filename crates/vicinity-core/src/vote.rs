//! Distance-weighted voting (C8).
//!
//! Converts a [`NeighborSet`] into a final [`ClassDistribution`] of
//! weighted votes: every bin's distance is mapped to a scalar weight by
//! [`Decay`], folded into the running distribution, and the whole thing is
//! optionally renormalized by [`Normalisation`] before the caller takes its
//! argmax.

use rand::Rng;

use crate::bestk::NeighborSet;
use crate::model::{ClassDistribution, Targets};
use crate::pool::TargetValueId;

/// Maps a neighbour's distance (and its 0-indexed rank `k` among the
/// admitted bins) to a vote weight (§4.6). `Zero` is plain majority vote
/// among the k nearest (every neighbour counts 1); the rest favor closer
/// neighbours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decay {
    Zero,
    InvDist,
    InvLinear,
    ExpDecay { alpha: f64, beta: f64 },
}

const EXP_DECAY_FLOOR: f64 = 1e-6;

impl Decay {
    /// `distance` is the bin's distance; `k` is its 0-indexed rank among
    /// admitted bins; `d_min`/`d_max` are the nearest/farthest admitted
    /// bin's distance (used by `InvLinear`).
    fn weight(self, distance: f64, k: usize, d_min: f64, d_max: f64) -> f64 {
        match self {
            Decay::Zero => 1.0,
            Decay::InvDist => 1.0 / (distance + 1e-6),
            Decay::InvLinear => {
                if k == 0 || (d_max - d_min).abs() < 1e-12 {
                    1.0
                } else {
                    ((d_max - distance) / (d_max - d_min)).max(EXP_DECAY_FLOOR)
                }
            }
            Decay::ExpDecay { alpha, beta } => {
                // The reference implementation floors every neighbour's
                // weight at EXP_DECAY_FLOOR, not just the first (bug 89
                // in the original tracker).
                (-alpha * distance.powf(beta)).exp().max(EXP_DECAY_FLOOR)
            }
        }
    }
}

/// Post-vote renormalization of the accumulated weights (§4.6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalisation {
    None,
    Probability,
    AddFactor(f64),
    LogProbability,
}

impl Normalisation {
    /// `targets` is the full target registry, consulted by `AddFactor` so
    /// targets unseen among these neighbours still receive the floor
    /// weight, and every Probability-style pass normalises over the whole
    /// class set rather than just the classes present in `dist`.
    fn apply(self, dist: &mut ClassDistribution, targets: &Targets) {
        match self {
            Normalisation::None => {}
            Normalisation::Probability => probability_normalise(dist),
            Normalisation::AddFactor(factor) => {
                for target in targets.iter() {
                    dist.add_factor(target.id, factor);
                }
                probability_normalise(dist);
            }
            Normalisation::LogProbability => {
                dist.map_weights(|w| (1.0 + w).ln());
                probability_normalise(dist);
            }
        }
    }
}

/// Rescales every weight so the distribution sums to 1 (a no-op if the
/// total is already non-positive).
fn probability_normalise(dist: &mut ClassDistribution) {
    let total = dist.total_weight();
    if total > 0.0 {
        dist.scale_weights(1.0 / total);
    }
}

/// Folds every bin of `neighbors` into a single weighted [`ClassDistribution`]
/// under `decay`, then applies `normalisation` and, if `beam` is set, keeps
/// only its top entries by weight (§6 `BEAM_SIZE`). The returned
/// distribution's weights (not frequencies) are what a caller should rank
/// with [`ClassDistribution::argmax`].
pub fn vote(
    neighbors: &NeighborSet,
    decay: Decay,
    normalisation: Normalisation,
    targets: &Targets,
    beam: Option<usize>,
) -> ClassDistribution {
    let mut result = ClassDistribution::new();
    let d_min = neighbors.bins().first().map(|b| b.distance).unwrap_or(0.0);
    let d_max = neighbors.bins().last().map(|b| b.distance).unwrap_or(0.0);
    for (k, bin) in neighbors.bins().iter().enumerate() {
        let scale = decay.weight(bin.distance, k, d_min, d_max);
        result.merge_weighted(&bin.distribution, scale);
    }
    normalisation.apply(&mut result, targets);
    if let Some(beam) = beam {
        result.beam_truncate(beam);
    }
    result
}

/// Confidence score (§4.6) for a classification: the winning target's
/// share of total vote weight, or 0.0 if nothing was voted.
pub fn confidence(voted: &ClassDistribution, winner: TargetValueId) -> f64 {
    let total = voted.total_weight();
    if total <= 0.0 {
        return 0.0;
    }
    voted.get(winner).map(|e| e.weight / total).unwrap_or(0.0)
}

/// Convenience wrapper: votes and immediately takes the argmax, the
/// classifier's common path. `rng` is the seeded tie-break source (§4.6);
/// pass `None` for the deterministic lowest-id fallback.
pub fn classify_distribution(
    neighbors: &NeighborSet,
    decay: Decay,
    normalisation: Normalisation,
    targets: &Targets,
    beam: Option<usize>,
    rng: Option<&mut impl Rng>,
) -> Option<(TargetValueId, ClassDistribution)> {
    let voted = vote(neighbors, decay, normalisation, targets, beam);
    let winner = voted.argmax(targets, rng)?;
    Some((winner, voted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bestk::{BestArray, ExemplarRef};

    fn neighbors_two_bins() -> NeighborSet {
        let mut best = BestArray::new(2);
        let mut near = ClassDistribution::new();
        near.add(TargetValueId(0), 1);
        best.add_result(0.1, &near, &[ExemplarRef { target: TargetValueId(0), weight: 1.0 }]);
        let mut far = ClassDistribution::new();
        far.add(TargetValueId(1), 1);
        best.add_result(0.5, &far, &[ExemplarRef { target: TargetValueId(1), weight: 1.0 }]);
        best.into_neighbor_set()
    }

    fn two_targets() -> Targets {
        let mut t = Targets::new();
        t.intern("A");
        t.intern("B");
        t
    }

    #[test]
    fn zero_decay_is_unweighted_majority() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(&ns, Decay::Zero, Normalisation::None, &targets, None);
        assert_eq!(voted.get(TargetValueId(0)).unwrap().weight, 1.0);
        assert_eq!(voted.get(TargetValueId(1)).unwrap().weight, 1.0);
    }

    #[test]
    fn inv_dist_favors_the_closer_bin() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(&ns, Decay::InvDist, Normalisation::None, &targets, None);
        let near = voted.get(TargetValueId(0)).unwrap().weight;
        let far = voted.get(TargetValueId(1)).unwrap().weight;
        assert!(near > far);
    }

    #[test]
    fn probability_normalisation_sums_to_one() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(&ns, Decay::InvDist, Normalisation::Probability, &targets, None);
        let total: f64 = voted.iter().map(|(_, e)| e.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn exp_decay_never_drops_below_floor() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(
            &ns,
            Decay::ExpDecay { alpha: 50.0, beta: 1.0 },
            Normalisation::None,
            &targets,
            None,
        );
        for (_, e) in voted.iter() {
            assert!(e.weight >= EXP_DECAY_FLOOR);
        }
    }

    #[test]
    fn confidence_reflects_vote_share() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(&ns, Decay::Zero, Normalisation::None, &targets, None);
        let c = confidence(&voted, TargetValueId(0));
        assert!((c - 0.5).abs() < 1e-9);
    }

    /// §4.6: LogProbability replaces each weight by `ln(1+w)` and then
    /// Probability-normalises, rather than taking a bare `ln(w)` (which is
    /// negative for `w<1` and undefined at `w=0`).
    #[test]
    fn log_probability_uses_ln_one_plus_w_and_sums_to_one() {
        let ns = neighbors_two_bins();
        let targets = two_targets();
        let voted = vote(&ns, Decay::Zero, Normalisation::LogProbability, &targets, None);
        let total: f64 = voted.iter().map(|(_, e)| e.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        // Equal raw weights (1.0 each under Decay::Zero) stay equal after
        // ln(1+w) and normalisation.
        let a = voted.get(TargetValueId(0)).unwrap().weight;
        let b = voted.get(TargetValueId(1)).unwrap().weight;
        assert!((a - b).abs() < 1e-9);
    }

    /// §4.6: AddFactor adds `f` to every known target's weight, including
    /// targets absent from the neighbour set, before Probability-normalising
    /// — distinct from plain Probability normalisation of the same bins.
    #[test]
    fn add_factor_gives_every_known_target_a_floor_weight() {
        let ns = neighbors_two_bins();
        let mut targets = two_targets();
        targets.intern("C"); // never appears among these neighbours
        let unseen = targets.lookup("C").unwrap();

        let voted = vote(&ns, Decay::Zero, Normalisation::AddFactor(1.0), &targets, None);
        assert!(voted.get(unseen).is_some());
        let total: f64 = voted.iter().map(|(_, e)| e.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);

        let plain = vote(&ns, Decay::Zero, Normalisation::Probability, &targets, None);
        let add_factor_a = voted.get(TargetValueId(0)).unwrap().weight;
        let plain_a = plain.get(TargetValueId(0)).unwrap().weight;
        assert!((add_factor_a - plain_a).abs() > 1e-9);
    }

    #[test]
    fn beam_keeps_only_the_top_entries_by_weight() {
        let mut best = BestArray::new(3);
        let mut a = ClassDistribution::new();
        a.add(TargetValueId(0), 1);
        best.add_result(0.0, &a, &[]);
        let mut b = ClassDistribution::new();
        b.add(TargetValueId(1), 1);
        best.add_result(1.0, &b, &[]);
        let mut c = ClassDistribution::new();
        c.add(TargetValueId(2), 1);
        best.add_result(2.0, &c, &[]);
        let ns = best.into_neighbor_set();
        let mut targets = two_targets();
        targets.intern("C");

        let voted = vote(&ns, Decay::InvLinear, Normalisation::None, &targets, Some(1));
        assert_eq!(voted.iter().count(), 1);
        assert!(voted.get(TargetValueId(0)).is_some());
    }

    /// §8 scenario E6: three neighbours at distances {0, 1, 2}, one class
    /// each, ExpDecay(alpha=1, beta=1). Weights should be exp(0)=1,
    /// exp(-1), exp(-2); argmax the distance-0 class; confidence
    /// 1/(1+e^-1+e^-2).
    #[test]
    fn exp_decay_e6_scenario() {
        let mut best = BestArray::new(3);
        let mut a = ClassDistribution::new();
        a.add(TargetValueId(0), 1);
        best.add_result(0.0, &a, &[ExemplarRef { target: TargetValueId(0), weight: 1.0 }]);
        let mut b = ClassDistribution::new();
        b.add(TargetValueId(1), 1);
        best.add_result(1.0, &b, &[ExemplarRef { target: TargetValueId(1), weight: 1.0 }]);
        let mut c = ClassDistribution::new();
        c.add(TargetValueId(2), 1);
        best.add_result(2.0, &c, &[ExemplarRef { target: TargetValueId(2), weight: 1.0 }]);
        let ns = best.into_neighbor_set();

        let mut targets = Targets::new();
        targets.intern("A");
        targets.intern("B");
        targets.intern("C");

        let voted = vote(
            &ns,
            Decay::ExpDecay { alpha: 1.0, beta: 1.0 },
            Normalisation::None,
            &targets,
            None,
        );
        let wa = voted.get(TargetValueId(0)).unwrap().weight;
        let wb = voted.get(TargetValueId(1)).unwrap().weight;
        let wc = voted.get(TargetValueId(2)).unwrap().weight;
        assert!((wa - 1.0).abs() < 1e-9);
        assert!((wb - (-1.0f64).exp()).abs() < 1e-9);
        assert!((wc - (-2.0f64).exp()).abs() < 1e-9);

        let winner = voted.argmax(&targets, None::<&mut rand::rngs::StdRng>).unwrap();
        assert_eq!(winner, TargetValueId(0));
        let expected_confidence = 1.0 / (1.0 + (-1.0f64).exp() + (-2.0f64).exp());
        assert!((confidence(&voted, winner) - expected_confidence).abs() < 1e-9);
    }

    /// §4.6: InvLinear weight 1 for the nearest neighbour, scaling linearly
    /// down to the floor at the farthest.
    #[test]
    fn inv_linear_scales_between_nearest_and_farthest() {
        let mut best = BestArray::new(3);
        let mut a = ClassDistribution::new();
        a.add(TargetValueId(0), 1);
        best.add_result(0.0, &a, &[]);
        let mut b = ClassDistribution::new();
        b.add(TargetValueId(1), 1);
        best.add_result(1.0, &b, &[]);
        let mut c = ClassDistribution::new();
        c.add(TargetValueId(2), 1);
        best.add_result(4.0, &c, &[]);
        let ns = best.into_neighbor_set();
        let targets = two_targets();

        let voted = vote(&ns, Decay::InvLinear, Normalisation::None, &targets, None);
        assert!((voted.get(TargetValueId(0)).unwrap().weight - 1.0).abs() < 1e-9);
        // (d_max - d_k) / (d_max - d_min) = (4 - 1) / (4 - 0) = 0.75
        assert!((voted.get(TargetValueId(1)).unwrap().weight - 0.75).abs() < 1e-9);
        // the farthest neighbour's weight is 0, floored to EXP_DECAY_FLOOR
        assert!(voted.get(TargetValueId(2)).unwrap().weight <= EXP_DECAY_FLOOR);
    }
}
