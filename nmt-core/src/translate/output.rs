use ndarray::Array2;

use crate::error::TranslateError;
use crate::model::SourceBatch;

/// Turns raw step-model scores into the log-probabilities a beam consumes.
///
/// Row `r` of the scores belongs to sentence `r / rows_per_sentence`.
pub trait OutputAdapter: Send + Sync {
    /// Rewrites decoder inputs before they reach the model.
    fn prepare_input(&self, _input: &mut [u32]) {}

    fn log_probs(
        &self,
        scores: Array2<f32>,
        batch: &SourceBatch,
        rows_per_sentence: usize,
    ) -> Result<Array2<f32>, TranslateError>;
}

/// Scores already are log-probabilities over the target vocabulary.
#[derive(Debug, Clone)]
pub struct PlainOutput {
    vocab: usize,
}

impl PlainOutput {
    pub fn new(vocab: usize) -> Self {
        Self { vocab }
    }
}

impl OutputAdapter for PlainOutput {
    fn log_probs(
        &self,
        scores: Array2<f32>,
        _batch: &SourceBatch,
        _rows_per_sentence: usize,
    ) -> Result<Array2<f32>, TranslateError> {
        if scores.ncols() != self.vocab {
            return Err(TranslateError::shape(
                "step scores",
                self.vocab,
                scores.ncols(),
            ));
        }
        Ok(scores)
    }
}

/// Probabilities over the target vocabulary followed by one entry per source
/// position. Mass of source positions whose word exists in the target
/// vocabulary is folded into that target id.
#[derive(Debug, Clone)]
pub struct CopyOutput {
    vocab: usize,
    unk: u32,
}

/// Left in a folded extended slot so it is never preferred over its target.
const FOLDED_MASS: f32 = 1e-10;

impl CopyOutput {
    pub fn new(vocab: usize, unk: u32) -> Self {
        Self { vocab, unk }
    }
}

impl OutputAdapter for CopyOutput {
    fn prepare_input(&self, input: &mut [u32]) {
        for token in input.iter_mut() {
            if *token as usize >= self.vocab {
                *token = self.unk;
            }
        }
    }

    fn log_probs(
        &self,
        mut scores: Array2<f32>,
        batch: &SourceBatch,
        rows_per_sentence: usize,
    ) -> Result<Array2<f32>, TranslateError> {
        let cols = scores.ncols();
        if cols < self.vocab {
            return Err(TranslateError::shape(
                "copy scores",
                format!("at least {}", self.vocab),
                cols,
            ));
        }
        let copy_maps = batch
            .copy_maps
            .as_ref()
            .ok_or_else(|| TranslateError::Input("copy attention needs copy maps".into()))?;
        let rows_per_sentence = rows_per_sentence.max(1);

        for (r, mut row) in scores.outer_iter_mut().enumerate() {
            let sentence = r / rows_per_sentence;
            let map = copy_maps.get(sentence).ok_or_else(|| {
                TranslateError::Input(format!("missing copy map for sentence {sentence}"))
            })?;
            if self.vocab + map.len() > cols {
                return Err(TranslateError::shape(
                    "copy map",
                    format!("at most {} entries", cols - self.vocab),
                    map.len(),
                ));
            }
            for (offset, &target) in map.iter().enumerate() {
                let Some(target) = target.filter(|&t| (t as usize) < self.vocab) else {
                    continue;
                };
                let extended = self.vocab + offset;
                let copied = row[extended];
                row[target as usize] += copied;
                row[extended] = FOLDED_MASS;
            }
        }
        Ok(scores.mapv(f32::ln))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn plain_output_checks_vocab() {
        let out = PlainOutput::new(3);
        let batch = SourceBatch::new(vec![vec![1]]);
        assert!(out.log_probs(Array2::zeros((1, 4)), &batch, 1).is_err());
        assert!(out.log_probs(Array2::zeros((1, 3)), &batch, 1).is_ok());
    }

    #[test]
    fn copy_output_folds_known_source_words() {
        let out = CopyOutput::new(3, 1);
        let batch = SourceBatch::new(vec![vec![7, 8]]).with_copy_maps(vec![vec![Some(2), None]]);
        let scores = arr2(&[[0.1, 0.2, 0.3, 0.25, 0.15]]);
        let lp = out.log_probs(scores, &batch, 1).unwrap();
        assert!((lp[[0, 2]] - 0.55f32.ln()).abs() < 1e-6);
        assert!((lp[[0, 3]] - FOLDED_MASS.ln()).abs() < 1e-3);
        assert!((lp[[0, 4]] - 0.15f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn copy_output_maps_extended_inputs_to_unk() {
        let out = CopyOutput::new(5, 1);
        let mut input = [2, 4, 5, 9];
        out.prepare_input(&mut input);
        assert_eq!(input, [2, 4, 1, 1]);
    }

    #[test]
    fn copy_output_requires_maps() {
        let out = CopyOutput::new(2, 1);
        let batch = SourceBatch::new(vec![vec![1]]);
        assert!(matches!(
            out.log_probs(Array2::ones((1, 3)), &batch, 1),
            Err(TranslateError::Input(_))
        ));
    }
}
