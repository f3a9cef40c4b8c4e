use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array2};

use super::beam::Beam;
use super::config::TranslatorConfig;
use super::output::{CopyOutput, OutputAdapter, PlainOutput};
use super::scorer::{GlobalScorer, GnmtGlobalScorer};
use super::trace::{BeamObserver, BeamTrace, SearchPosition};
use crate::error::TranslateError;
use crate::model::{DecoderState, ModelError, SourceBatch, StepModel};

/// Search result for one source sentence; hypotheses are best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    /// Generated ids, bos excluded.
    pub predictions: Vec<Vec<u32>>,
    /// Ranking score of each prediction.
    pub scores: Vec<f32>,
    /// `(prediction.len(), src_len)` attention of each prediction.
    pub attention: Vec<Array2<f32>>,
    /// `false` for hypotheses that never emitted eos.
    pub complete: Vec<bool>,
    /// Teacher-forced log-likelihood of the reference; 0 without one.
    pub gold_score: f32,
}

impl Translation {
    pub fn best(&self) -> Option<&[u32]> {
        self.predictions.first().map(Vec::as_slice)
    }
}

/// Batched beam search over a [`StepModel`].
///
/// Every sentence gets its own [`Beam`]; the model is stepped once per round
/// for all `sentences * beam_width` slots, laid out sentence-major
/// (row `j * width + k` is slot `k` of sentence `j`).
pub struct BeamSearchSession<M: StepModel> {
    model: M,
    config: TranslatorConfig,
    scorer: Option<Arc<dyn GlobalScorer>>,
    output: Box<dyn OutputAdapter>,
    trace: Option<BeamTrace>,
    observers: Vec<Box<dyn BeamObserver>>,
    batches: usize,
    sentences: usize,
}

impl<M: StepModel> BeamSearchSession<M> {
    pub fn new(model: M, config: TranslatorConfig) -> Result<Self, TranslateError> {
        config.validate()?;
        let vocab = model.target_vocab_size();
        for (name, id) in [
            ("pad", config.pad_token_id),
            ("unk", config.unk_token_id),
            ("bos", config.bos_token_id),
            ("eos", config.eos_token_id),
        ] {
            if id as usize >= vocab {
                return Err(TranslateError::Config(format!(
                    "{name} token id {id} is outside the target vocabulary of size {vocab}"
                )));
            }
        }

        let output: Box<dyn OutputAdapter> = if config.copy_attn {
            Box::new(CopyOutput::new(vocab, config.unk_token_id))
        } else {
            Box::new(PlainOutput::new(vocab))
        };
        let scorer: Option<Arc<dyn GlobalScorer>> = if config.wants_global_scorer() {
            Some(Arc::new(GnmtGlobalScorer::from_config(&config)))
        } else {
            None
        };
        let trace = config.beam_trace.then(BeamTrace::new);

        log::info!(
            "Beam search session: width={}, n_best={}, max_length={}, min_length={}, copy_attn={}, global_scorer={}",
            config.beam_width,
            config.n_best,
            config.max_length,
            config.min_length,
            config.copy_attn,
            scorer.is_some()
        );

        Ok(Self {
            model,
            config,
            scorer,
            output,
            trace,
            observers: Vec::new(),
            batches: 0,
            sentences: 0,
        })
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn GlobalScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn without_scorer(mut self) -> Self {
        self.scorer = None;
        self
    }

    pub fn with_observer(mut self, observer: impl BeamObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn trace(&self) -> Option<&BeamTrace> {
        self.trace.as_ref()
    }

    /// Hands out the recorded trace and starts a fresh one.
    pub fn take_trace(&mut self) -> Option<BeamTrace> {
        self.trace.as_mut().map(std::mem::take)
    }

    /// Runs the search for every sentence of `batch`.
    ///
    /// Any model or shape failure aborts the whole batch; no partial result
    /// is returned and the session-wide batch and sentence counters stay
    /// where they were.
    pub fn translate_batch(
        &mut self,
        batch: &SourceBatch,
    ) -> Result<Vec<Translation>, TranslateError> {
        let started = Instant::now();
        self.check_batch(batch)?;

        let n = batch.len();
        let width = self.config.beam_width;
        let rows = n * width;
        let lengths = batch.lengths();
        let max_src_len = batch.max_len();

        let mut beams = (0..n)
            .map(|_| Beam::new(&self.config, self.scorer.clone()))
            .collect::<Result<Vec<Beam>, _>>()?;

        let encoded = self.model.init_state(batch)?;
        if encoded.rows() != n {
            return Err(TranslateError::shape("initial state rows", n, encoded.rows()));
        }
        let mut state = encoded.repeat_interleave(width)?;

        let mut rounds = 0;
        for round in 0..self.config.max_length {
            if beams.iter().all(Beam::is_done) {
                break;
            }

            let mut input: Vec<u32> = beams
                .iter()
                .flat_map(|b| b.current_tokens().iter().copied())
                .collect();
            self.output.prepare_input(&mut input);

            let out = self.model.step(&input, &state)?;
            if out.scores.nrows() != rows {
                return Err(TranslateError::shape("step scores rows", rows, out.scores.nrows()));
            }
            if out.attention.nrows() != rows || out.attention.ncols() < max_src_len {
                return Err(TranslateError::shape(
                    "step attention",
                    format!("({rows}, >= {max_src_len})"),
                    format!("{:?}", out.attention.dim()),
                ));
            }
            if out.state.rows() != rows {
                return Err(TranslateError::shape("step state rows", rows, out.state.rows()));
            }
            let log_probs = self.output.log_probs(out.scores, batch, width)?;

            let mut origin = Vec::with_capacity(rows);
            let mut advanced = 0;
            for (j, beam) in beams.iter_mut().enumerate() {
                let base = j * width;
                if beam.is_done() {
                    origin.extend(base..base + width);
                    continue;
                }
                beam.advance(
                    log_probs.slice(s![base..base + width, ..]),
                    out.attention.slice(s![base..base + width, ..lengths[j]]),
                )?;
                origin.extend(beam.current_origin().into_iter().map(|k| base + k));
                advanced += 1;

                let at = SearchPosition {
                    batch: self.batches,
                    round,
                    sentence: self.sentences + j,
                };
                if let Some(trace) = self.trace.as_mut() {
                    trace.on_advance(at, beam);
                }
                for observer in self.observers.iter_mut() {
                    observer.on_advance(at, beam);
                }
            }

            state = out.state.select_rows(&origin)?;
            rounds = round + 1;
            log::debug!("Round {round}: advanced {advanced}/{n} beams");
        }

        let gold = self.gold_scores(batch)?;
        let n_best = self.config.n_best;
        let mut translations = Vec::with_capacity(n);
        for (j, beam) in beams.iter().enumerate() {
            let mut translation = Translation {
                gold_score: gold[j],
                ..Default::default()
            };
            for ranked in beam.sort_finished(n_best).into_iter().take(n_best) {
                let hypothesis = beam.hypothesis(ranked.depth, ranked.slot)?;
                translation.predictions.push(hypothesis.tokens);
                translation.attention.push(hypothesis.attention);
                translation.scores.push(ranked.score);
                translation.complete.push(ranked.complete);
            }
            if translation.complete.iter().any(|c| !c) {
                log::warn!(
                    "Sentence {}: only {} of {n_best} hypotheses finished; using unfinished ones",
                    self.sentences + j,
                    translation.complete.iter().filter(|c| **c).count()
                );
            }
            translations.push(translation);
        }

        log::info!(
            "Batch {}: translated {n} sentences in {rounds} rounds ({:.2?})",
            self.batches,
            started.elapsed()
        );
        self.batches += 1;
        self.sentences += n;
        Ok(translations)
    }

    fn check_batch(&self, batch: &SourceBatch) -> Result<(), TranslateError> {
        if batch.is_empty() {
            return Err(ModelError::EmptyBatch.into());
        }
        if let Some(targets) = &batch.targets {
            if targets.len() != batch.len() {
                return Err(TranslateError::Input(format!(
                    "{} targets for {} sources",
                    targets.len(),
                    batch.len()
                )));
            }
        }
        if self.config.copy_attn {
            match &batch.copy_maps {
                Some(maps) if maps.len() == batch.len() => {}
                Some(maps) => {
                    return Err(TranslateError::Input(format!(
                        "{} copy maps for {} sources",
                        maps.len(),
                        batch.len()
                    )))
                }
                None => {
                    return Err(TranslateError::Input(
                        "copy attention needs a copy map per sentence".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Teacher-forced log-likelihood of each reference target.
    ///
    /// Position `t` feeds `target[t]` and scores `target[t + 1]`; pad targets
    /// contribute nothing.
    fn gold_scores(&self, batch: &SourceBatch) -> Result<Vec<f32>, TranslateError> {
        let n = batch.len();
        let Some(targets) = &batch.targets else {
            return Ok(vec![0.0; n]);
        };
        let pad = self.config.pad_token_id;
        let steps = targets.iter().map(Vec::len).max().unwrap_or(0);

        let mut state = self.model.init_state(batch)?;
        let mut gold = vec![0.0; n];
        for t in 0..steps.saturating_sub(1) {
            let mut input: Vec<u32> = targets
                .iter()
                .map(|target| target.get(t).copied().unwrap_or(pad))
                .collect();
            self.output.prepare_input(&mut input);

            let out = self.model.step(&input, &state)?;
            if out.scores.nrows() != n {
                return Err(TranslateError::shape("gold scores rows", n, out.scores.nrows()));
            }
            let log_probs = self.output.log_probs(out.scores, batch, 1)?;
            for (j, target) in targets.iter().enumerate() {
                let next = target.get(t + 1).copied().unwrap_or(pad);
                if next == pad {
                    continue;
                }
                gold[j] += log_probs.get((j, next as usize)).copied().ok_or_else(|| {
                    TranslateError::Input(format!(
                        "gold token {next} of sentence {j} is outside the output vocabulary"
                    ))
                })?;
            }
            state = out.state;
        }
        Ok(gold)
    }
}
