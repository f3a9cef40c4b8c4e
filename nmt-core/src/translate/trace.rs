use std::fs;
use std::path::Path;

use serde::Serialize;

use super::beam::Beam;
use crate::error::TranslateError;

/// Where an advance happened within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchPosition {
    /// Number of `translate_batch` calls before this one.
    pub batch: usize,
    /// Round within the batch, restarting at 0 for every batch.
    pub round: usize,
    /// Session-wide sentence index: sentences of earlier batches come first.
    pub sentence: usize,
}

/// Notified after every successful beam advance.
pub trait BeamObserver {
    fn on_advance(&mut self, at: SearchPosition, beam: &Beam);
}

/// Raw predicted ids, parent slots and cumulative scores of every round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BeamTrace {
    pub rounds: Vec<TraceRound>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRound {
    pub batch: usize,
    pub round: usize,
    pub sentence: usize,
    pub predicted_ids: Vec<u32>,
    pub beam_parent_ids: Vec<usize>,
    /// Pruned slots carry `-inf`, written as `null` in JSON.
    pub scores: Vec<f32>,
}

impl BeamTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Rounds recorded for one sentence, in order.
    pub fn for_sentence(&self, sentence: usize) -> impl Iterator<Item = &TraceRound> {
        self.rounds.iter().filter(move |r| r.sentence == sentence)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TranslateError> {
        fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        log::info!(
            "Wrote beam trace ({} rounds) to {}",
            self.rounds.len(),
            path.as_ref().display()
        );
        Ok(())
    }
}

impl BeamObserver for BeamTrace {
    fn on_advance(&mut self, at: SearchPosition, beam: &Beam) {
        let step = beam.last_step();
        self.rounds.push(TraceRound {
            batch: at.batch,
            round: at.round,
            sentence: at.sentence,
            predicted_ids: step.tokens().to_vec(),
            beam_parent_ids: step.backpointers().to_vec(),
            scores: step.scores().to_vec(),
        });
    }
}
