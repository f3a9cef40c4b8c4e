use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use super::beam::Beam;
use super::config::TranslatorConfig;

/// Coverage carried alongside a beam step: accumulated attention per slot.
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    coverage: Option<Array2<f32>>,
}

impl GlobalState {
    pub fn with_coverage(coverage: Array2<f32>) -> Self {
        Self {
            coverage: Some(coverage),
        }
    }

    pub fn coverage(&self, slot: usize) -> Option<ArrayView1<'_, f32>> {
        self.coverage
            .as_ref()
            .filter(|c| slot < c.nrows())
            .map(|c| c.row(slot))
    }
}

/// Rescores hypotheses beyond their raw log-probability.
pub trait GlobalScorer: Send + Sync {
    /// Ranking score for `slot` at the beam's current depth.
    fn score(&self, beam: &Beam, slot: usize, log_prob: f32) -> f32;

    /// Highest score any continuation of `slot` could still reach; used by
    /// the early-stop check.
    fn best_attainable(&self, beam: &Beam, slot: usize, log_prob: f32) -> f32 {
        self.score(beam, slot, log_prob)
    }

    /// Whether `step_penalty` is applied to candidates before selection.
    fn stepwise_penalty(&self) -> bool {
        false
    }

    /// Adjustment added to every continuation of `slot` when it attends with
    /// `attention` in the step being scored.
    fn step_penalty(&self, _beam: &Beam, _slot: usize, _attention: ArrayView1<f32>) -> f32 {
        0.0
    }

    /// State for the step about to be appended: slot `i` descends from
    /// `backpointers[i]`, which attended with `attention[backpointers[i]]`.
    fn update_global_state(
        &self,
        beam: &Beam,
        backpointers: &[usize],
        attention: ArrayView2<f32>,
    ) -> GlobalState {
        let width = attention.ncols();
        let mut coverage = Array2::zeros((backpointers.len(), width));
        for (mut row, &parent) in coverage.axis_iter_mut(Axis(0)).zip(backpointers) {
            row.assign(&attention.row(parent));
            if let Some(prev) = beam.coverage(parent).filter(|p| p.len() == width) {
                row += &prev;
            }
        }
        GlobalState::with_coverage(coverage)
    }
}

/// Length normalisation and coverage penalty from Wu et al. (2016).
#[derive(Debug, Clone, PartialEq)]
pub struct GnmtGlobalScorer {
    pub alpha: f32,
    pub beta: f32,
    pub stepwise: bool,
}

const MIN_COVERAGE: f32 = 1e-20;

impl GnmtGlobalScorer {
    pub fn new(alpha: f32, beta: f32) -> Self {
        Self {
            alpha,
            beta,
            stepwise: false,
        }
    }

    pub fn from_config(config: &TranslatorConfig) -> Self {
        Self {
            alpha: config.alpha,
            beta: config.beta,
            stepwise: config.stepwise_penalty,
        }
    }

    pub fn length_penalty(&self, length: usize) -> f32 {
        if self.alpha == 0.0 {
            return 1.0;
        }
        ((5.0 + length as f32).powf(self.alpha)) / 6f32.powf(self.alpha)
    }

    /// `beta * sum(ln(min(coverage, 1)))`; zero for full coverage, negative
    /// for source positions that were under-attended.
    pub fn coverage_penalty(&self, coverage: ArrayView1<f32>) -> f32 {
        if self.beta == 0.0 {
            return 0.0;
        }
        self.beta
            * coverage
                .iter()
                .map(|&c| c.min(1.0).max(MIN_COVERAGE).ln())
                .sum::<f32>()
    }
}

impl GlobalScorer for GnmtGlobalScorer {
    fn score(&self, beam: &Beam, slot: usize, log_prob: f32) -> f32 {
        let penalty = beam
            .coverage(slot)
            .map(|c| self.coverage_penalty(c))
            .unwrap_or(0.0);
        log_prob / self.length_penalty(beam.depth()) + penalty
    }

    fn best_attainable(&self, beam: &Beam, _slot: usize, log_prob: f32) -> f32 {
        let length = if log_prob < 0.0 {
            beam.max_length()
        } else {
            beam.depth()
        };
        log_prob / self.length_penalty(length)
    }

    fn stepwise_penalty(&self) -> bool {
        self.stepwise
    }

    fn step_penalty(&self, beam: &Beam, slot: usize, attention: ArrayView1<f32>) -> f32 {
        let mut coverage = attention.to_owned();
        let width = coverage.len();
        if let Some(prev) = beam.coverage(slot).filter(|p| p.len() == width) {
            coverage += &prev;
        }
        self.coverage_penalty(coverage.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn length_penalty_is_one_without_alpha() {
        let scorer = GnmtGlobalScorer::new(0.0, 0.0);
        assert_eq!(scorer.length_penalty(17), 1.0);
    }

    #[test]
    fn length_penalty_matches_gnmt_formula() {
        let scorer = GnmtGlobalScorer::new(1.0, 0.0);
        assert!((scorer.length_penalty(1) - 1.0).abs() < 1e-6);
        assert!((scorer.length_penalty(7) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn full_coverage_has_no_penalty() {
        let scorer = GnmtGlobalScorer::new(0.0, 0.5);
        assert_eq!(scorer.coverage_penalty(arr1(&[1.0, 2.5, 1.0]).view()), 0.0);
    }

    #[test]
    fn partial_coverage_is_penalised() {
        let scorer = GnmtGlobalScorer::new(0.0, 1.0);
        let penalty = scorer.coverage_penalty(arr1(&[1.0, 0.5]).view());
        assert!((penalty - 0.5f32.ln()).abs() < 1e-6);
    }
}
