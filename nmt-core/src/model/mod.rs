//! The step-model contract consumed by the search, plus reference recurrent
//! encoder/decoder layers that implement it.

pub mod generator;
pub mod layers;
pub mod rnn;
pub mod weights;

use ndarray::{Array2, ShapeError};

pub use generator::{CopyGenerator, Generator, PlainGenerator};
pub use rnn::{AttnDecoderRnn, Decoder, DecoderRnn, EncoderRnn, RnnState, Seq2Seq};
pub use weights::Seq2SeqWeights;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ndarray shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("Token id {token} is outside the vocabulary of size {vocab}")]
    InvalidToken { token: u32, vocab: usize },
    #[error("Source sentence of length {len} exceeds the model maximum of {max}")]
    SourceTooLong { len: usize, max: usize },
    #[error("Empty batch")]
    EmptyBatch,
    #[error("Row index {index} out of range for state with {rows} rows")]
    RowOutOfRange { index: usize, rows: usize },
    #[error("Expected {expected} input tokens, got {actual}")]
    InputLength { expected: usize, actual: usize },
    #[error("Invalid weights: {0}")]
    Weights(String),
}

/// A batch of source sentences, optionally with gold targets and the
/// per-sentence copy mapping used by copy-attention generators.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub sources: Vec<Vec<u32>>,
    /// Reference translations, each starting with the bos token.
    pub targets: Option<Vec<Vec<u32>>>,
    /// For every sentence, extended-vocabulary slot `i` maps to the target id
    /// of source position `i`, when that word exists in the target vocabulary.
    pub copy_maps: Option<Vec<Vec<Option<u32>>>>,
}

impl SourceBatch {
    pub fn new(sources: Vec<Vec<u32>>) -> Self {
        Self {
            sources,
            ..Default::default()
        }
    }

    pub fn with_targets(mut self, targets: Vec<Vec<u32>>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_copy_maps(mut self, copy_maps: Vec<Vec<Option<u32>>>) -> Self {
        self.copy_maps = Some(copy_maps);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.sources.iter().map(Vec::len).collect()
    }

    pub fn max_len(&self) -> usize {
        self.sources.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Recurrent decoder state with one row per hypothesis slot.
///
/// Reordering produces a new state; the previous one is left untouched so a
/// failed round never leaves a half-reordered state behind.
pub trait DecoderState: Sized {
    fn rows(&self) -> usize;

    /// Row `r` becomes rows `r * times .. (r + 1) * times`.
    fn repeat_interleave(&self, times: usize) -> Result<Self, ModelError>;

    /// New state whose row `i` is a copy of row `indices[i]`.
    fn select_rows(&self, indices: &[usize]) -> Result<Self, ModelError>;
}

/// Output of one decoding step for every row of the batch.
#[derive(Debug, Clone)]
pub struct StepOutput<S> {
    /// `(rows, vocab)` scores: log-probabilities for plain generators,
    /// probabilities over the extended vocabulary for copy generators.
    pub scores: Array2<f32>,
    pub state: S,
    /// `(rows, max_src_len)` attention weights over the source.
    pub attention: Array2<f32>,
}

/// Autoregressive decoder driven one token at a time.
///
/// Implementations must be deterministic: identical inputs and state give
/// identical outputs.
pub trait StepModel {
    type State: DecoderState;

    fn target_vocab_size(&self) -> usize;

    /// Encodes the batch and returns the initial decoder state, one row per
    /// sentence.
    fn init_state(&self, batch: &SourceBatch) -> Result<Self::State, ModelError>;

    fn step(
        &self,
        input: &[u32],
        state: &Self::State,
    ) -> Result<StepOutput<Self::State>, ModelError>;
}
