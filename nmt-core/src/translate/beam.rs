//! Per-sentence beam search state.
//!
//! A [`Beam`] is a stack of immutable [`BeamStep`] snapshots, one per search
//! depth. Depth 0 holds the bos token in every slot with only slot 0 live, so
//! the first expansion starts from a single real hypothesis.

use std::cmp::Ordering;
use std::sync::Arc;

use ndarray::{stack, Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;

use super::config::TranslatorConfig;
use super::scorer::{GlobalScorer, GlobalState};
use crate::error::TranslateError;
use crate::model::ModelError;

/// One generation of hypothesis slots.
#[derive(Debug, Clone)]
pub struct BeamStep {
    tokens: Vec<u32>,
    backpointers: Vec<usize>,
    scores: Vec<f32>,
    attention: Option<Array2<f32>>,
    global: GlobalState,
}

impl BeamStep {
    /// Token each slot ended with at this depth.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Slot at the previous depth each slot was expanded from; empty at depth 0.
    pub fn backpointers(&self) -> &[usize] {
        &self.backpointers
    }

    /// Cumulative log-probability per slot.
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// `(width, src_len)` attention inherited by every slot; `None` at depth 0.
    pub fn attention(&self) -> Option<&Array2<f32>> {
        self.attention.as_ref()
    }
}

/// A hypothesis that emitted eos, or an unfinished one used as a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FinishedHypothesis {
    /// Ranking score (rescored when a global scorer is set).
    pub score: f32,
    /// Raw cumulative log-probability.
    pub log_prob: f32,
    pub depth: usize,
    pub slot: usize,
    /// `false` for active slots returned because too few finished.
    pub complete: bool,
}

/// Tokens and attention of one reconstructed hypothesis, bos excluded.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    /// `(tokens.len(), src_len)`.
    pub attention: Array2<f32>,
}

pub struct Beam {
    width: usize,
    n_best: usize,
    min_length: usize,
    max_length: usize,
    eos: u32,
    steps: Vec<BeamStep>,
    finished: Vec<FinishedHypothesis>,
    scorer: Option<Arc<dyn GlobalScorer>>,
}

impl Beam {
    /// Fails with [`TranslateError::Config`] when `config` does not validate.
    pub fn new(
        config: &TranslatorConfig,
        scorer: Option<Arc<dyn GlobalScorer>>,
    ) -> Result<Self, TranslateError> {
        config.validate()?;
        let width = config.beam_width;
        let mut scores = vec![f32::NEG_INFINITY; width];
        scores[0] = 0.0;
        Ok(Self {
            width,
            n_best: config.n_best,
            min_length: config.min_length,
            max_length: config.max_length,
            eos: config.eos_token_id,
            steps: vec![BeamStep {
                tokens: vec![config.bos_token_id; width],
                backpointers: Vec::new(),
                scores,
                attention: None,
                global: GlobalState::default(),
            }],
            finished: Vec::new(),
            scorer,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of tokens generated so far.
    pub fn depth(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn step(&self, depth: usize) -> Option<&BeamStep> {
        self.steps.get(depth)
    }

    pub fn last_step(&self) -> &BeamStep {
        &self.steps[self.steps.len() - 1]
    }

    /// Next decoder input for every slot.
    pub fn current_tokens(&self) -> &[u32] {
        &self.last_step().tokens
    }

    pub fn current_scores(&self) -> &[f32] {
        &self.last_step().scores
    }

    /// Parent slot of every current slot; identity before the first advance.
    pub fn current_origin(&self) -> Vec<usize> {
        if self.depth() == 0 {
            (0..self.width).collect()
        } else {
            self.last_step().backpointers.clone()
        }
    }

    /// Accumulated attention of `slot` at the current depth, when tracked.
    pub fn coverage(&self, slot: usize) -> Option<ArrayView1<'_, f32>> {
        self.last_step().global.coverage(slot)
    }

    pub fn finished(&self) -> &[FinishedHypothesis] {
        &self.finished
    }

    /// Expands every live slot with every token and keeps the `width` best.
    ///
    /// `log_probs` is `(width, vocab)` and `attention` is `(width, src_len)`,
    /// both indexed by current slot. Exact score ties go to the lower
    /// `slot * vocab + token` index.
    pub fn advance(
        &mut self,
        log_probs: ArrayView2<f32>,
        attention: ArrayView2<f32>,
    ) -> Result<(), TranslateError> {
        let (rows, vocab) = log_probs.dim();
        if rows != self.width {
            return Err(TranslateError::shape("beam scores", self.width, rows));
        }
        if attention.nrows() != self.width {
            return Err(TranslateError::shape(
                "beam attention",
                self.width,
                attention.nrows(),
            ));
        }
        if (self.eos as usize) >= vocab {
            return Err(TranslateError::shape(
                "beam vocabulary",
                format!("more than {} entries", self.eos),
                vocab,
            ));
        }

        let depth = self.depth();
        let mask_eos = depth + 1 < self.min_length;
        let current = self.last_step();
        let stepwise = self.scorer.as_ref().filter(|s| s.stepwise_penalty());

        let mut bases = Vec::with_capacity(self.width);
        let mut ranks = Vec::with_capacity(self.width * vocab);
        for (slot, row) in log_probs.outer_iter().enumerate() {
            let base = if depth > 0 && current.tokens[slot] == self.eos {
                f32::NEG_INFINITY
            } else {
                current.scores[slot]
            };
            let penalty = match stepwise {
                Some(scorer) if base.is_finite() => {
                    scorer.step_penalty(self, slot, attention.row(slot))
                }
                _ => 0.0,
            };
            bases.push(base);
            for (token, &lp) in row.iter().enumerate() {
                let lp = if mask_eos && token == self.eos as usize {
                    f32::NEG_INFINITY
                } else {
                    lp
                };
                let rank = base + lp + penalty;
                ranks.push(if rank.is_nan() { f32::NEG_INFINITY } else { rank });
            }
        }

        let by_rank = |a: &usize, b: &usize| -> Ordering {
            ranks[*b].total_cmp(&ranks[*a]).then_with(|| a.cmp(b))
        };
        let mut order: Vec<usize> = (0..ranks.len()).collect();
        if order.len() > self.width {
            order.select_nth_unstable_by(self.width - 1, by_rank);
            order.truncate(self.width);
        }
        order.sort_unstable_by(by_rank);

        let mut tokens = Vec::with_capacity(self.width);
        let mut backpointers = Vec::with_capacity(self.width);
        let mut scores = Vec::with_capacity(self.width);
        for &flat in &order {
            let (slot, token) = (flat / vocab, flat % vocab);
            let lp = if mask_eos && token == self.eos as usize {
                f32::NEG_INFINITY
            } else {
                log_probs[[slot, token]]
            };
            tokens.push(token as u32);
            backpointers.push(slot);
            scores.push(bases[slot] + lp);
        }

        let global = match &self.scorer {
            Some(scorer) => scorer.update_global_state(self, &backpointers, attention),
            None => GlobalState::default(),
        };
        let inherited = attention.select(Axis(0), &backpointers);

        self.steps.push(BeamStep {
            tokens,
            backpointers,
            scores,
            attention: Some(inherited),
            global,
        });

        let depth = self.depth();
        let step = self.last_step();
        let newly_finished: Vec<FinishedHypothesis> = (0..self.width)
            .filter(|&slot| step.tokens[slot] == self.eos && step.scores[slot].is_finite())
            .map(|slot| FinishedHypothesis {
                score: self.rank_score(slot, step.scores[slot]),
                log_prob: step.scores[slot],
                depth,
                slot,
                complete: true,
            })
            .collect();
        self.finished.extend(newly_finished);
        Ok(())
    }

    /// Ranking score of `slot` at the current depth.
    fn rank_score(&self, slot: usize, log_prob: f32) -> f32 {
        match &self.scorer {
            Some(scorer) => scorer.score(self, slot, log_prob),
            None => log_prob,
        }
    }

    fn is_live(&self, slot: usize) -> bool {
        let step = self.last_step();
        step.scores[slot].is_finite() && (self.depth() == 0 || step.tokens[slot] != self.eos)
    }

    /// Whether the search for this sentence should stop.
    ///
    /// Stops at the length limit, when no slot can be expanded past
    /// `min_length`, or once `n_best` hypotheses finished and no live slot can
    /// still outrank the worst of them. Below `min_length` the search keeps
    /// going even when every slot is `-inf`, so fallback hypotheses are never
    /// shorter than `min_length`.
    pub fn is_done(&self) -> bool {
        if self.depth() >= self.max_length {
            return true;
        }
        if self.depth() < self.min_length {
            return false;
        }
        let best_live = (0..self.width)
            .filter(|&slot| self.is_live(slot))
            .map(|slot| {
                let lp = self.current_scores()[slot];
                match &self.scorer {
                    Some(scorer) => scorer.best_attainable(self, slot, lp),
                    None => lp,
                }
            })
            .fold(f32::NEG_INFINITY, f32::max);
        if best_live == f32::NEG_INFINITY {
            return true;
        }
        if self.finished.len() < self.n_best {
            return false;
        }
        let mut kept: Vec<f32> = self.finished.iter().map(|f| f.score).collect();
        kept.sort_unstable_by(|a, b| b.total_cmp(a));
        kept[self.n_best - 1] >= best_live
    }

    /// Finished hypotheses, best first. When fewer than `minimum` finished,
    /// the current slots not already recorded are appended best first.
    pub fn sort_finished(&self, minimum: usize) -> Vec<FinishedHypothesis> {
        let mut ranked = self.finished.clone();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        if ranked.len() >= minimum {
            return ranked;
        }

        let depth = self.depth();
        let scores = self.current_scores();
        let mut pending: Vec<FinishedHypothesis> = (0..self.width)
            .filter(|&slot| {
                !self
                    .finished
                    .iter()
                    .any(|f| f.depth == depth && f.slot == slot)
            })
            .map(|slot| FinishedHypothesis {
                score: self.rank_score(slot, scores[slot]),
                log_prob: scores[slot],
                depth,
                slot,
                complete: false,
            })
            .collect();
        pending.sort_by(|a, b| b.score.total_cmp(&a.score));
        let missing = minimum - ranked.len();
        ranked.extend(pending.into_iter().take(missing));
        ranked
    }

    /// Walks backpointers from `(depth, slot)` to the root.
    pub fn hypothesis(&self, depth: usize, slot: usize) -> Result<Hypothesis, TranslateError> {
        if depth > self.depth() || slot >= self.width {
            return Err(TranslateError::Input(format!(
                "no hypothesis at depth {depth}, slot {slot} (depth {}, width {})",
                self.depth(),
                self.width
            )));
        }

        let mut tokens = Vec::with_capacity(depth);
        let mut rows = Vec::with_capacity(depth);
        let mut k = slot;
        for step in self.steps[1..=depth].iter().rev() {
            tokens.push(step.tokens[k]);
            if let Some(attention) = &step.attention {
                rows.push(attention.row(k));
            }
            k = step.backpointers[k];
        }
        tokens.reverse();
        rows.reverse();

        let attention = if rows.is_empty() {
            Array2::zeros((0, 0))
        } else {
            stack(Axis(0), &rows).map_err(ModelError::from)?
        };
        Ok(Hypothesis { tokens, attention })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};

    const EOS: u32 = 3;

    fn config(width: usize, n_best: usize, max_length: usize, min_length: usize) -> TranslatorConfig {
        TranslatorConfig {
            beam_width: width,
            n_best,
            max_length,
            min_length,
            ..Default::default()
        }
    }

    fn log(rows: &[&[f32]]) -> Array2<f32> {
        let cols = rows[0].len();
        let flat: Vec<f32> = rows
            .iter()
            .flat_map(|r| r.iter().map(|p| p.ln()))
            .collect();
        Array2::from_shape_vec((rows.len(), cols), flat).unwrap()
    }

    fn repeated(row: &[f32], n: usize) -> Array2<f32> {
        let rows: Vec<&[f32]> = vec![row; n];
        log(&rows)
    }

    fn attention(width: usize) -> Array2<f32> {
        Array2::from_elem((width, 2), 0.5)
    }

    #[test]
    fn starts_with_single_live_slot() {
        let beam = Beam::new(&config(3, 1, 5, 0), None).unwrap();
        assert_eq!(beam.current_tokens(), &[2, 2, 2]);
        assert_eq!(beam.current_scores()[0], 0.0);
        assert!(beam.current_scores()[1..].iter().all(|s| *s == f32::NEG_INFINITY));
        assert_eq!(beam.current_origin(), vec![0, 1, 2]);
        assert!(!beam.is_done());
    }

    #[test]
    fn first_advance_expands_only_slot_zero() {
        let mut beam = Beam::new(&config(2, 1, 5, 0), None).unwrap();
        let probs = log(&[
            &[0.0, 0.0, 0.0, 0.1, 0.6, 0.3],
            &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        ]);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert_eq!(beam.current_tokens(), &[4, 5]);
        assert_eq!(beam.current_origin(), vec![0, 0]);
        assert!((beam.current_scores()[0] - 0.6f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn ties_prefer_lower_flat_index() {
        let mut beam = Beam::new(&config(2, 1, 5, 0), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.0, 0.5, 0.5], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert_eq!(beam.current_tokens(), &[4, 5]);

        let probs = repeated(&[0.0, 0.0, 0.0, 0.0, 0.5, 0.5], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert_eq!(beam.current_tokens(), &[4, 5]);
        assert_eq!(beam.current_origin(), vec![0, 0]);
    }

    #[test]
    fn eos_is_recorded_and_not_expanded_again() {
        let mut beam = Beam::new(&config(2, 2, 5, 0), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.7, 0.3, 0.0], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert_eq!(beam.current_tokens(), &[EOS, 4]);
        assert_eq!(beam.finished().len(), 1);
        assert_eq!(beam.finished()[0].depth, 1);

        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert!(beam.current_origin().iter().all(|&k| k == 1));
        assert_eq!(beam.finished().len(), 2);
    }

    #[test]
    fn min_length_masks_eos() {
        let mut beam = Beam::new(&config(2, 1, 6, 3), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.9, 0.1, 0.0], 2);
        for _ in 0..2 {
            beam.advance(probs.view(), attention(2).view()).unwrap();
            assert_eq!(beam.current_tokens()[0], 4);
            assert!(beam.finished().is_empty());
        }
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert_eq!(beam.finished()[0].depth, 3);
    }

    #[test]
    fn all_masked_slots_keep_going_until_min_length() {
        let mut beam = Beam::new(&config(2, 1, 6, 3), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0], 2);
        for depth in 1..3 {
            beam.advance(probs.view(), attention(2).view()).unwrap();
            assert!(beam.current_scores().iter().all(|s| *s == f32::NEG_INFINITY));
            assert!(!beam.is_done(), "stopped at depth {depth}");
        }
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert!(beam.is_done());
        assert!(beam.finished().is_empty());

        let fallback = beam.sort_finished(1);
        let hyp = beam.hypothesis(fallback[0].depth, fallback[0].slot).unwrap();
        assert_eq!(hyp.tokens.len(), 3);
        assert!(!fallback[0].complete);
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            Beam::new(&config(0, 1, 5, 0), None),
            Err(TranslateError::Config(_))
        ));
        assert!(Beam::new(&config(2, 3, 5, 0), None).is_err());
        assert!(Beam::new(&config(2, 1, 4, 4), None).is_err());
    }

    #[test]
    fn steps_keep_every_generation() {
        let mut beam = Beam::new(&config(2, 1, 5, 0), None).unwrap();
        assert_eq!(beam.width(), 2);
        let probs = repeated(&[0.0, 0.0, 0.0, 0.0, 0.6, 0.4], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        beam.advance(probs.view(), attention(2).view()).unwrap();

        let root = beam.step(0).unwrap();
        assert_eq!(root.tokens(), &[2, 2]);
        assert!(root.backpointers().is_empty() && root.attention().is_none());
        let first = beam.step(1).unwrap();
        assert_eq!(first.tokens(), &[4, 5]);
        assert_eq!(first.attention().map(|a| a.dim()), Some((2, 2)));
        assert_eq!(beam.step(2).unwrap().backpointers(), &[0, 0]);
        assert!(beam.step(3).is_none());
    }

    #[test]
    fn wrong_row_count_is_rejected() {
        let mut beam = Beam::new(&config(3, 1, 5, 0), None).unwrap();
        let probs = repeated(&[0.25, 0.25, 0.25, 0.25], 2);
        let err = beam.advance(probs.view(), attention(2).view()).unwrap_err();
        assert!(matches!(err, TranslateError::Shape { .. }));
        assert_eq!(beam.depth(), 0);
    }

    #[test]
    fn done_once_best_finished_beats_live_slots() {
        let mut beam = Beam::new(&config(2, 1, 10, 0), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.8, 0.2, 0.0], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert!(beam.is_done());
    }

    #[test]
    fn done_at_max_length() {
        let mut beam = Beam::new(&config(2, 1, 2, 0), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.0, 0.5, 0.5], 2);
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert!(!beam.is_done());
        beam.advance(probs.view(), attention(2).view()).unwrap();
        assert!(beam.is_done());
    }

    #[test]
    fn sort_finished_pads_with_live_slots() {
        let mut beam = Beam::new(&config(3, 3, 2, 0), None).unwrap();
        let probs = repeated(&[0.0, 0.0, 0.0, 0.5, 0.3, 0.2], 3);
        beam.advance(probs.view(), attention(3).view()).unwrap();
        let ranked = beam.sort_finished(3);
        assert_eq!(ranked.len(), 3);
        assert!(ranked[0].complete);
        assert!(!ranked[1].complete && !ranked[2].complete);
        assert!(ranked[1].score >= ranked[2].score);
        assert_eq!(beam.current_tokens()[ranked[1].slot], 4);
    }

    #[test]
    fn hypothesis_follows_backpointers() {
        let mut beam = Beam::new(&config(2, 1, 5, 0), None).unwrap();
        let first = repeated(&[0.0, 0.0, 0.0, 0.0, 0.6, 0.4], 2);
        beam.advance(first.view(), arr2(&[[1.0, 0.0], [0.0, 1.0]]).view()).unwrap();
        // slot 0 moves on to token 0, slot 1 emits eos
        let second = log(&[&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0], &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]]);
        beam.advance(second.view(), arr2(&[[0.2, 0.8], [0.7, 0.3]]).view()).unwrap();

        let eos_slot = beam.current_tokens().iter().position(|&t| t == EOS).unwrap();
        let hyp = beam.hypothesis(2, eos_slot).unwrap();
        assert_eq!(hyp.tokens, vec![5, EOS]);
        assert_eq!(hyp.attention, arr2(&[[1.0, 0.0], [0.7, 0.3]]));
        assert!(beam.hypothesis(3, 0).is_err());
    }
}
