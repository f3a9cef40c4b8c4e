use std::sync::Arc;

use ndarray::{concatenate, s, Array2, Array3, Axis};

use super::generator::Generator;
use super::layers::{relu, softmax, Embedding, GruCell, Linear};
use super::{DecoderState, ModelError, SourceBatch, StepModel, StepOutput};

/// Decoder state for the recurrent models: hidden vector per row plus the
/// encoder outputs the row attends over.
#[derive(Debug, Clone)]
pub struct RnnState {
    pub hidden: Array2<f32>,
    /// `(rows, max_src_len, hidden)`, zero past each row's source length.
    pub memory: Arc<Array3<f32>>,
    pub lengths: Vec<usize>,
}

impl DecoderState for RnnState {
    fn rows(&self) -> usize {
        self.hidden.nrows()
    }

    fn repeat_interleave(&self, times: usize) -> Result<Self, ModelError> {
        let indices: Vec<usize> = (0..self.rows())
            .flat_map(|r| std::iter::repeat(r).take(times))
            .collect();
        self.select_rows(&indices)
    }

    fn select_rows(&self, indices: &[usize]) -> Result<Self, ModelError> {
        let rows = self.rows();
        if let Some(&index) = indices.iter().find(|&&i| i >= rows) {
            return Err(ModelError::RowOutOfRange { index, rows });
        }
        Ok(Self {
            hidden: self.hidden.select(Axis(0), indices),
            memory: Arc::new(self.memory.select(Axis(0), indices)),
            lengths: indices.iter().map(|&i| self.lengths[i]).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncoderRnn {
    pub(crate) embedding: Embedding,
    pub(crate) gru: GruCell,
}

impl EncoderRnn {
    pub fn new(embedding: Embedding, gru: GruCell) -> Result<Self, ModelError> {
        if embedding.dim() != gru.input_size() {
            return Err(ModelError::Weights(format!(
                "encoder embedding dim {} does not match GRU input {}",
                embedding.dim(),
                gru.input_size()
            )));
        }
        Ok(Self { embedding, gru })
    }

    pub fn hidden_size(&self) -> usize {
        self.gru.hidden_size()
    }

    /// Runs the GRU over every sentence; rows stop updating past their length.
    pub fn encode(
        &self,
        sources: &[Vec<u32>],
        max_src_len: usize,
    ) -> Result<(Array3<f32>, Array2<f32>), ModelError> {
        let n = sources.len();
        let hs = self.hidden_size();
        let steps = sources.iter().map(Vec::len).max().unwrap_or(0);
        let mut memory = Array3::zeros((n, max_src_len, hs));
        let mut hidden = Array2::zeros((n, hs));

        for t in 0..steps {
            let ids: Vec<u32> = sources.iter().map(|s| s.get(t).copied().unwrap_or(0)).collect();
            let x = self.embedding.forward(&ids)?;
            let next = self.gru.forward(&x.view(), &hidden.view());
            for (row, src) in sources.iter().enumerate() {
                if t < src.len() {
                    hidden.row_mut(row).assign(&next.row(row));
                    memory.slice_mut(s![row, t, ..]).assign(&next.row(row));
                }
            }
        }
        Ok((memory, hidden))
    }
}

/// Decoder without attention: embedding, relu, GRU.
#[derive(Debug, Clone)]
pub struct DecoderRnn {
    pub(crate) embedding: Embedding,
    pub(crate) gru: GruCell,
}

impl DecoderRnn {
    pub fn new(embedding: Embedding, gru: GruCell) -> Result<Self, ModelError> {
        if embedding.dim() != gru.input_size() {
            return Err(ModelError::Weights(format!(
                "decoder embedding dim {} does not match GRU input {}",
                embedding.dim(),
                gru.input_size()
            )));
        }
        Ok(Self { embedding, gru })
    }

    fn step(&self, input: &[u32], state: &RnnState) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        let x = self.embedding.forward(input)?.mapv(relu);
        let hidden = self.gru.forward(&x.view(), &state.hidden.view());
        let attention = Array2::zeros((state.rows(), state.memory.dim().1));
        Ok((hidden, attention))
    }
}

/// Decoder with feed-forward attention over a fixed number of source slots.
#[derive(Debug, Clone)]
pub struct AttnDecoderRnn {
    pub(crate) embedding: Embedding,
    pub(crate) attn: Linear,
    pub(crate) combine: Linear,
    pub(crate) gru: GruCell,
}

impl AttnDecoderRnn {
    pub fn new(
        embedding: Embedding,
        attn: Linear,
        combine: Linear,
        gru: GruCell,
    ) -> Result<Self, ModelError> {
        let e = embedding.dim();
        let h = gru.hidden_size();
        if attn.in_dim() != e + h || combine.in_dim() != e + h || combine.out_dim() != gru.input_size() {
            return Err(ModelError::Weights(format!(
                "attention decoder projections do not fit embedding {e} / hidden {h}"
            )));
        }
        Ok(Self {
            embedding,
            attn,
            combine,
            gru,
        })
    }

    pub fn max_src_len(&self) -> usize {
        self.attn.out_dim()
    }

    fn step(&self, input: &[u32], state: &RnnState) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        let embedded = self.embedding.forward(input)?;
        let query = concatenate(Axis(1), &[embedded.view(), state.hidden.view()])?;
        let mut logits = self.attn.forward(&query.view());
        for (mut row, &len) in logits.outer_iter_mut().zip(&state.lengths) {
            row.slice_mut(s![len..]).fill(f32::NEG_INFINITY);
        }
        let weights = softmax(&logits);

        let mut context = Array2::zeros(state.hidden.raw_dim());
        for (row, mut ctx) in context.outer_iter_mut().enumerate() {
            ctx.assign(&weights.row(row).dot(&state.memory.index_axis(Axis(0), row)));
        }

        let combined = concatenate(Axis(1), &[embedded.view(), context.view()])?;
        let x = self.combine.forward(&combined.view()).mapv(relu);
        let hidden = self.gru.forward(&x.view(), &state.hidden.view());
        Ok((hidden, weights))
    }
}

#[derive(Debug, Clone)]
pub enum Decoder {
    Plain(DecoderRnn),
    Attention(AttnDecoderRnn),
}

impl Decoder {
    fn hidden_size(&self) -> usize {
        match self {
            Self::Plain(d) => d.gru.hidden_size(),
            Self::Attention(d) => d.gru.hidden_size(),
        }
    }

    fn step(&self, input: &[u32], state: &RnnState) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        match self {
            Self::Plain(d) => d.step(input, state),
            Self::Attention(d) => d.step(input, state),
        }
    }
}

/// Recurrent encoder-decoder exposing a batched [`StepModel`].
pub struct Seq2Seq {
    encoder: EncoderRnn,
    decoder: Decoder,
    generator: Box<dyn Generator>,
    max_src_len: usize,
}

impl Seq2Seq {
    pub fn new(
        encoder: EncoderRnn,
        decoder: Decoder,
        generator: Box<dyn Generator>,
        max_src_len: usize,
    ) -> Result<Self, ModelError> {
        if encoder.hidden_size() != decoder.hidden_size() {
            return Err(ModelError::Weights(format!(
                "encoder hidden {} does not match decoder hidden {}",
                encoder.hidden_size(),
                decoder.hidden_size()
            )));
        }
        if let Decoder::Attention(d) = &decoder {
            if d.max_src_len() != max_src_len {
                return Err(ModelError::Weights(format!(
                    "attention covers {} positions, model declares {max_src_len}",
                    d.max_src_len()
                )));
            }
        }
        Ok(Self {
            encoder,
            decoder,
            generator,
            max_src_len,
        })
    }

    pub fn max_src_len(&self) -> usize {
        self.max_src_len
    }

    pub fn copies(&self) -> bool {
        self.generator.copies()
    }
}

impl StepModel for Seq2Seq {
    type State = RnnState;

    fn target_vocab_size(&self) -> usize {
        self.generator.vocab_size()
    }

    fn init_state(&self, batch: &SourceBatch) -> Result<RnnState, ModelError> {
        if batch.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        if batch.max_len() > self.max_src_len {
            return Err(ModelError::SourceTooLong {
                len: batch.max_len(),
                max: self.max_src_len,
            });
        }
        let (memory, hidden) = self.encoder.encode(&batch.sources, self.max_src_len)?;
        Ok(RnnState {
            hidden,
            memory: Arc::new(memory),
            lengths: batch.lengths(),
        })
    }

    fn step(&self, input: &[u32], state: &RnnState) -> Result<StepOutput<RnnState>, ModelError> {
        if input.len() != state.rows() {
            return Err(ModelError::InputLength {
                expected: state.rows(),
                actual: input.len(),
            });
        }
        let (hidden, attention) = self.decoder.step(input, state)?;
        let scores = self.generator.forward(&hidden.view(), &attention.view())?;
        Ok(StepOutput {
            scores,
            state: RnnState {
                hidden,
                memory: Arc::clone(&state.memory),
                lengths: state.lengths.clone(),
            },
            attention,
        })
    }
}
