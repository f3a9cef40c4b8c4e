use ndarray::{s, Array1, Array2, ArrayView2, Axis, Zip};

use super::ModelError;

#[derive(Debug, Clone)]
pub struct Embedding {
    pub(crate) table: Array2<f32>,
}

impl Embedding {
    pub fn new(table: Array2<f32>) -> Self {
        Self { table }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn forward(&self, ids: &[u32]) -> Result<Array2<f32>, ModelError> {
        let mut out = Array2::zeros((ids.len(), self.dim()));
        for (mut row, &id) in out.outer_iter_mut().zip(ids) {
            let idx = id as usize;
            if idx >= self.vocab_size() {
                return Err(ModelError::InvalidToken {
                    token: id,
                    vocab: self.vocab_size(),
                });
            }
            row.assign(&self.table.row(idx));
        }
        Ok(out)
    }
}

/// `y = x W^T + b`, weights stored as `(out, in)`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub(crate) weight: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, ModelError> {
        if weight.nrows() != bias.len() {
            return Err(ModelError::Weights(format!(
                "linear bias has {} entries for {} outputs",
                bias.len(),
                weight.nrows()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// Single GRU cell, gates ordered `r, z, n`.
#[derive(Debug, Clone)]
pub struct GruCell {
    pub(crate) input: Linear,
    pub(crate) hidden: Linear,
}

impl GruCell {
    pub fn new(input: Linear, hidden: Linear) -> Result<Self, ModelError> {
        let h = hidden.in_dim();
        if input.out_dim() != 3 * h || hidden.out_dim() != 3 * h {
            return Err(ModelError::Weights(format!(
                "GRU gate projections must have {} outputs, got {} and {}",
                3 * h,
                input.out_dim(),
                hidden.out_dim()
            )));
        }
        Ok(Self { input, hidden })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden.in_dim()
    }

    pub fn input_size(&self) -> usize {
        self.input.in_dim()
    }

    pub fn forward(&self, x: &ArrayView2<f32>, h: &ArrayView2<f32>) -> Array2<f32> {
        let hs = self.hidden_size();
        let gi = self.input.forward(x);
        let gh = self.hidden.forward(h);

        let r = (&gi.slice(s![.., 0..hs]) + &gh.slice(s![.., 0..hs])).mapv(sigmoid);
        let z = (&gi.slice(s![.., hs..2 * hs]) + &gh.slice(s![.., hs..2 * hs])).mapv(sigmoid);
        let n = (&gi.slice(s![.., 2 * hs..]) + &(&r * &gh.slice(s![.., 2 * hs..]))).mapv(f32::tanh);

        let mut out = Array2::zeros(h.raw_dim());
        Zip::from(&mut out)
            .and(&z)
            .and(&n)
            .and(h)
            .for_each(|o, &z, &n, &h| *o = (1.0 - z) * n + z * h);
        out
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Row-wise log-softmax; rows that are entirely `-inf` stay `-inf`.
pub fn log_softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max.is_finite() {
            continue;
        }
        let lse = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - lse);
    }
    out
}

pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    log_softmax(x).mapv(f32::exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn log_softmax_rows_normalize() {
        let x = arr2(&[[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        let p = softmax(&x);
        for row in p.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert!((p[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn log_softmax_ignores_masked_entries() {
        let x = arr2(&[[0.0, f32::NEG_INFINITY]]);
        let lp = log_softmax(&x);
        assert!(lp[[0, 0]].abs() < 1e-6);
        assert_eq!(lp[[0, 1]], f32::NEG_INFINITY);
    }

    #[test]
    fn embedding_rejects_out_of_vocab() {
        let emb = Embedding::new(Array2::zeros((4, 2)));
        assert!(matches!(
            emb.forward(&[1, 4]),
            Err(ModelError::InvalidToken { token: 4, vocab: 4 })
        ));
    }

    #[test]
    fn linear_applies_bias() {
        let lin = Linear::new(arr2(&[[1.0, 0.0], [0.0, 2.0]]), arr1(&[0.5, -1.0])).unwrap();
        let y = lin.forward(&arr2(&[[1.0, 1.0]]).view());
        assert_eq!(y, arr2(&[[1.5, 1.0]]));
    }

    #[test]
    fn gru_with_zero_weights_halves_hidden() {
        // r = z = sigmoid(0) = 0.5, n = tanh(0) = 0
        let cell = GruCell::new(
            Linear::new(Array2::zeros((6, 3)), Array1::zeros(6)).unwrap(),
            Linear::new(Array2::zeros((6, 2)), Array1::zeros(6)).unwrap(),
        )
        .unwrap();
        let h = arr2(&[[1.0, -2.0]]);
        let out = cell.forward(&Array2::zeros((1, 3)).view(), &h.view());
        assert_eq!(out, arr2(&[[0.5, -1.0]]));
    }
}
