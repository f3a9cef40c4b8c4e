use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::generator::{CopyGenerator, Generator, PlainGenerator};
use super::layers::{Embedding, GruCell, Linear};
use super::rnn::{AttnDecoderRnn, Decoder, DecoderRnn, EncoderRnn, Seq2Seq};
use super::ModelError;
use crate::error::TranslateError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearWeights {
    /// `(out, in)` row-major.
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GruWeights {
    pub input: LinearWeights,
    pub hidden: LinearWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderWeights {
    pub embedding: Vec<Vec<f32>>,
    pub gru: GruWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderWeights {
    Plain {
        embedding: Vec<Vec<f32>>,
        gru: GruWeights,
    },
    Attention {
        embedding: Vec<Vec<f32>>,
        attn: LinearWeights,
        combine: LinearWeights,
        gru: GruWeights,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorWeights {
    Plain { out: LinearWeights },
    Copy { out: LinearWeights, gate: LinearWeights },
}

/// On-disk (JSON) form of a [`Seq2Seq`] model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seq2SeqWeights {
    pub max_src_len: usize,
    pub encoder: EncoderWeights,
    pub decoder: DecoderWeights,
    pub generator: GeneratorWeights,
}

/// Sizes for [`Seq2SeqWeights::patterned`].
#[derive(Debug, Clone, Copy)]
pub struct ModelDims {
    pub src_vocab: usize,
    pub tgt_vocab: usize,
    pub hidden: usize,
    pub max_src_len: usize,
    pub attention: bool,
    pub copy: bool,
}

impl Seq2SeqWeights {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TranslateError> {
        let content = fs::read_to_string(path.as_ref())?;
        let weights = serde_json::from_str(&content)?;
        log::info!("Loaded model weights from {}", path.as_ref().display());
        Ok(weights)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TranslateError> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn build(&self) -> Result<Seq2Seq, ModelError> {
        let encoder = EncoderRnn::new(
            Embedding::new(matrix(&self.encoder.embedding)?),
            gru(&self.encoder.gru)?,
        )?;
        let decoder = match &self.decoder {
            DecoderWeights::Plain { embedding, gru: g } => {
                Decoder::Plain(DecoderRnn::new(Embedding::new(matrix(embedding)?), gru(g)?)?)
            }
            DecoderWeights::Attention {
                embedding,
                attn,
                combine,
                gru: g,
            } => Decoder::Attention(AttnDecoderRnn::new(
                Embedding::new(matrix(embedding)?),
                linear(attn)?,
                linear(combine)?,
                gru(g)?,
            )?),
        };
        let generator: Box<dyn Generator> = match &self.generator {
            GeneratorWeights::Plain { out } => Box::new(PlainGenerator::new(linear(out)?)),
            GeneratorWeights::Copy { out, gate } => {
                Box::new(CopyGenerator::new(linear(out)?, linear(gate)?)?)
            }
        };
        Seq2Seq::new(encoder, decoder, generator, self.max_src_len)
    }

    /// Weights drawn uniformly from `[-0.5, 0.5)` by an RNG seeded with `seed`;
    /// for demos and tests that need a real network without a trained
    /// checkpoint. The same seed always gives the same weights.
    pub fn patterned(dims: ModelDims, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = dims.hidden;
        let gru_weights = |rng: &mut StdRng| GruWeights {
            input: random_linear(rng, 3 * h, h),
            hidden: random_linear(rng, 3 * h, h),
        };

        let encoder = EncoderWeights {
            embedding: random_rows(&mut rng, dims.src_vocab, h),
            gru: gru_weights(&mut rng),
        };
        let decoder = if dims.attention {
            DecoderWeights::Attention {
                embedding: random_rows(&mut rng, dims.tgt_vocab, h),
                attn: random_linear(&mut rng, dims.max_src_len, 2 * h),
                combine: random_linear(&mut rng, h, 2 * h),
                gru: gru_weights(&mut rng),
            }
        } else {
            DecoderWeights::Plain {
                embedding: random_rows(&mut rng, dims.tgt_vocab, h),
                gru: gru_weights(&mut rng),
            }
        };
        let generator = if dims.copy {
            GeneratorWeights::Copy {
                out: random_linear(&mut rng, dims.tgt_vocab, h),
                gate: random_linear(&mut rng, 1, h),
            }
        } else {
            GeneratorWeights::Plain {
                out: random_linear(&mut rng, dims.tgt_vocab, h),
            }
        };

        Self {
            max_src_len: dims.max_src_len,
            encoder,
            decoder,
            generator,
        }
    }
}

fn random_rows(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-0.5..0.5)).collect())
        .collect()
}

fn random_linear(rng: &mut StdRng, out: usize, input: usize) -> LinearWeights {
    LinearWeights {
        weight: random_rows(rng, out, input),
        bias: (0..out).map(|_| rng.gen_range(-0.5..0.5)).collect(),
    }
}

fn matrix(rows: &[Vec<f32>]) -> Result<Array2<f32>, ModelError> {
    let cols = rows.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
        return Err(ModelError::Weights(format!(
            "ragged matrix: row of {} values in a {cols}-column matrix",
            bad.len()
        )));
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Array2::from_shape_vec((rows.len(), cols), flat)?)
}

fn linear(w: &LinearWeights) -> Result<Linear, ModelError> {
    Linear::new(matrix(&w.weight)?, Array1::from_vec(w.bias.clone()))
}

fn gru(w: &GruWeights) -> Result<GruCell, ModelError> {
    GruCell::new(linear(&w.input)?, linear(&w.hidden)?)
}
