use ndarray::{concatenate, Array2, ArrayView2, Axis};

use super::layers::{log_softmax, sigmoid, softmax, Linear};
use super::ModelError;

/// Maps decoder outputs to next-token scores.
pub trait Generator: Send + Sync {
    fn vocab_size(&self) -> usize;

    /// `true` when `forward` emits probabilities over the target vocabulary
    /// extended with one entry per source position.
    fn copies(&self) -> bool;

    fn forward(
        &self,
        hidden: &ArrayView2<f32>,
        attention: &ArrayView2<f32>,
    ) -> Result<Array2<f32>, ModelError>;
}

/// Linear projection followed by log-softmax.
#[derive(Debug, Clone)]
pub struct PlainGenerator {
    out: Linear,
}

impl PlainGenerator {
    pub fn new(out: Linear) -> Self {
        Self { out }
    }
}

impl Generator for PlainGenerator {
    fn vocab_size(&self) -> usize {
        self.out.out_dim()
    }

    fn copies(&self) -> bool {
        false
    }

    fn forward(
        &self,
        hidden: &ArrayView2<f32>,
        _attention: &ArrayView2<f32>,
    ) -> Result<Array2<f32>, ModelError> {
        Ok(log_softmax(&self.out.forward(hidden)))
    }
}

/// Pointer-generator: mixes the vocabulary distribution with the attention
/// distribution over source positions, gated per row.
#[derive(Debug, Clone)]
pub struct CopyGenerator {
    out: Linear,
    gate: Linear,
}

impl CopyGenerator {
    pub fn new(out: Linear, gate: Linear) -> Result<Self, ModelError> {
        if gate.out_dim() != 1 || gate.in_dim() != out.in_dim() {
            return Err(ModelError::Weights(format!(
                "copy gate must map {} inputs to 1 output, got {}x{}",
                out.in_dim(),
                gate.out_dim(),
                gate.in_dim()
            )));
        }
        Ok(Self { out, gate })
    }
}

impl Generator for CopyGenerator {
    fn vocab_size(&self) -> usize {
        self.out.out_dim()
    }

    fn copies(&self) -> bool {
        true
    }

    fn forward(
        &self,
        hidden: &ArrayView2<f32>,
        attention: &ArrayView2<f32>,
    ) -> Result<Array2<f32>, ModelError> {
        let p_gen = self.gate.forward(hidden).mapv(sigmoid);
        let vocab = softmax(&self.out.forward(hidden)) * &p_gen;
        let copy = attention.to_owned() * &p_gen.mapv(|p| 1.0 - p);
        Ok(concatenate(Axis(1), &[vocab.view(), copy.view()])?)
    }
}
