//! Engine configuration (§6).
//!
//! [`EngineOptions`] is built through [`EngineOptionsBuilder`], mirroring
//! this crate's general builder-then-validate configuration style: every
//! setter takes and returns `Self`, and `build()` is the single point
//! where cross-option consistency is checked, returning
//! [`crate::error::EngineError::Config`] on the first violation found.

use crate::error::{EngineError, Result};
use crate::stats::{TreeOrder, Weighting};
use crate::trie::Algorithm;
use crate::vote::{Decay, Normalisation};

/// Reserved but unimplemented in this crate: IB2's incremental-subset
/// training mode is out of scope (see SPEC_FULL.md Non-goals). The option
/// is still accepted and validated so existing option files round-trip,
/// but [`EngineOptionsBuilder::build`] rejects a nonzero value rather than
/// silently ignoring it.
pub const IB2_OFFSET_UNIMPLEMENTED: &str =
    "IB2_OFFSET is reserved but not implemented by this engine; leave it at 0";

/// Fully validated, immutable engine configuration. Construct via
/// [`EngineOptionsBuilder`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub algorithm: Algorithm,
    pub weighting: Weighting,
    pub tree_order: TreeOrder,
    pub neighbors: usize,
    pub decay: Decay,
    pub normalisation: Normalisation,
    pub beam_size: Option<usize>,
    pub max_bests: usize,
    pub bin_size: usize,
    pub mvd_limit: u64,
    pub ig_threshold: f64,
    pub seed: Option<u64>,
    pub keep_distributions: bool,
    pub exact_match: bool,
    pub hashed_tree: bool,
    pub progress: bool,
    pub clip_factor: f64,
    pub verbose_neighbors: bool,
    pub exemplar_weighting: bool,
}

impl EngineOptions {
    pub fn builder() -> EngineOptionsBuilder {
        EngineOptionsBuilder::default()
    }
}

/// Builder for [`EngineOptions`]; every field defaults to the reference
/// implementation's documented default (§6).
#[derive(Debug, Clone)]
pub struct EngineOptionsBuilder {
    algorithm: Algorithm,
    weighting: Weighting,
    tree_order: TreeOrder,
    neighbors: usize,
    decay: Decay,
    normalisation: Normalisation,
    beam_size: Option<usize>,
    max_bests: usize,
    bin_size: usize,
    mvd_limit: u64,
    tribl_offset: usize,
    ig_threshold: f64,
    ib2_offset: usize,
    seed: Option<u64>,
    keep_distributions: bool,
    exact_match: bool,
    hashed_tree: bool,
    progress: bool,
    clip_factor: f64,
    verbose_neighbors: bool,
    exemplar_weighting: bool,
}

impl Default for EngineOptionsBuilder {
    fn default() -> Self {
        EngineOptionsBuilder {
            algorithm: Algorithm::Ib1,
            weighting: Weighting::GainRatio,
            tree_order: TreeOrder::GainRatio,
            neighbors: 1,
            decay: Decay::Zero,
            normalisation: Normalisation::None,
            beam_size: None,
            max_bests: 500,
            bin_size: 20,
            mvd_limit: 1,
            tribl_offset: 0,
            ig_threshold: 0.0,
            ib2_offset: 0,
            seed: None,
            keep_distributions: false,
            exact_match: false,
            hashed_tree: false,
            progress: false,
            clip_factor: 10.0,
            verbose_neighbors: false,
            exemplar_weighting: false,
        }
    }
}

impl EngineOptionsBuilder {
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn tree_order(mut self, order: TreeOrder) -> Self {
        self.tree_order = order;
        self
    }

    pub fn neighbors(mut self, k: usize) -> Self {
        self.neighbors = k;
        self
    }

    pub fn decay(mut self, decay: Decay) -> Self {
        self.decay = decay;
        self
    }

    pub fn normalisation(mut self, normalisation: Normalisation) -> Self {
        self.normalisation = normalisation;
        self
    }

    pub fn beam_size(mut self, beam: Option<usize>) -> Self {
        self.beam_size = beam;
        self
    }

    pub fn max_bests(mut self, max_bests: usize) -> Self {
        self.max_bests = max_bests;
        self
    }

    pub fn bin_size(mut self, bin_size: usize) -> Self {
        self.bin_size = bin_size;
        self
    }

    pub fn mvd_limit(mut self, limit: u64) -> Self {
        self.mvd_limit = limit;
        self
    }

    /// Sets TRIBL_OFFSET and, if `algorithm` is currently `Tribl(_)`,
    /// updates it in lockstep so the two never drift apart.
    pub fn tribl_offset(mut self, offset: usize) -> Self {
        self.tribl_offset = offset;
        if matches!(self.algorithm, Algorithm::Tribl(_)) {
            self.algorithm = Algorithm::Tribl(offset);
        }
        self
    }

    pub fn ig_threshold(mut self, threshold: f64) -> Self {
        self.ig_threshold = threshold;
        self
    }

    pub fn ib2_offset(mut self, offset: usize) -> Self {
        self.ib2_offset = offset;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn keep_distributions(mut self, keep: bool) -> Self {
        self.keep_distributions = keep;
        self
    }

    pub fn exact_match(mut self, exact: bool) -> Self {
        self.exact_match = exact;
        self
    }

    pub fn hashed_tree(mut self, hashed: bool) -> Self {
        self.hashed_tree = hashed;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn clip_factor(mut self, factor: f64) -> Self {
        self.clip_factor = factor;
        self
    }

    pub fn verbose_neighbors(mut self, verbose: bool) -> Self {
        self.verbose_neighbors = verbose;
        self
    }

    /// Switches search to the §4.4 exemplar-weight variant: leaves are
    /// scored by `running_distance / (freq + ε)` per target instead of the
    /// plain additive running distance, and no in-tree pruning is possible.
    pub fn exemplar_weighting(mut self, enabled: bool) -> Self {
        self.exemplar_weighting = enabled;
        self
    }

    /// Validates cross-option consistency and produces an immutable
    /// [`EngineOptions`]. Non-fatal conflicts (EXACT_MATCH with
    /// `verbose_neighbors`) are resolved here with a `tracing::warn!`
    /// rather than rejected.
    pub fn build(mut self) -> Result<EngineOptions> {
        if self.neighbors == 0 {
            return Err(EngineError::Config("NEIGHBORS must be at least 1".into()));
        }
        if self.bin_size == 0 {
            return Err(EngineError::Config("BIN_SIZE must be at least 1".into()));
        }
        if self.ib2_offset != 0 {
            return Err(EngineError::Config(IB2_OFFSET_UNIMPLEMENTED.into()));
        }
        if let Some(beam) = self.beam_size {
            if beam == 0 {
                return Err(EngineError::Config("BEAM_SIZE must be at least 1".into()));
            }
            if self.normalisation != Normalisation::None {
                tracing::warn!(
                    "BEAM_SIZE cannot be combined with a NORMALISATION other than None; forcing NORMALISATION=None"
                );
                self.normalisation = Normalisation::None;
            }
        }
        if matches!(self.algorithm, Algorithm::Tribl(_)) {
            self.algorithm = Algorithm::Tribl(self.tribl_offset);
        }
        if self.exact_match && self.verbose_neighbors {
            tracing::warn!(
                "EXACT_MATCH is incompatible with +neighbors reporting; disabling EXACT_MATCH"
            );
            self.exact_match = false;
        }

        Ok(EngineOptions {
            algorithm: self.algorithm,
            weighting: self.weighting,
            tree_order: self.tree_order,
            neighbors: self.neighbors,
            decay: self.decay,
            normalisation: self.normalisation,
            beam_size: self.beam_size,
            max_bests: self.max_bests,
            bin_size: self.bin_size,
            mvd_limit: self.mvd_limit,
            ig_threshold: self.ig_threshold,
            seed: self.seed,
            keep_distributions: self.keep_distributions,
            exact_match: self.exact_match,
            hashed_tree: self.hashed_tree,
            progress: self.progress,
            clip_factor: self.clip_factor,
            verbose_neighbors: self.verbose_neighbors,
            exemplar_weighting: self.exemplar_weighting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_cleanly() {
        let opts = EngineOptions::builder().build().unwrap();
        assert_eq!(opts.neighbors, 1);
        assert_eq!(opts.algorithm, Algorithm::Ib1);
    }

    #[test]
    fn beam_with_normalisation_is_forced_to_none() {
        let opts = EngineOptions::builder()
            .beam_size(Some(5))
            .normalisation(Normalisation::Probability)
            .build()
            .unwrap();
        assert_eq!(opts.normalisation, Normalisation::None);
        assert_eq!(opts.beam_size, Some(5));
    }

    #[test]
    fn zero_beam_size_is_rejected() {
        let result = EngineOptions::builder().beam_size(Some(0)).build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn ib2_offset_is_rejected() {
        let result = EngineOptions::builder().ib2_offset(3).build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn exact_match_with_verbose_neighbors_is_auto_disabled() {
        let opts = EngineOptions::builder()
            .exact_match(true)
            .verbose_neighbors(true)
            .build()
            .unwrap();
        assert!(!opts.exact_match);
    }

    #[test]
    fn tribl_offset_updates_algorithm_in_lockstep() {
        let opts = EngineOptions::builder()
            .algorithm(Algorithm::Tribl(0))
            .tribl_offset(3)
            .build()
            .unwrap();
        assert_eq!(opts.algorithm, Algorithm::Tribl(3));
    }
}
