// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;
use spiral_config::determinism;

/// Dense lookup table.
///
/// Through the [`Module`] surface the input is a `(rows, 1)` tensor of integer
/// ids stored as floats and the output is `(rows, embed_dim)`. Callers that
/// already hold `usize` indices use [`Embedding::lookup`] and
/// [`Embedding::accumulate_lookup`] directly.
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Parameter,
    vocab_size: usize,
    embed_dim: usize,
}

impl Embedding {
    pub fn new(name: impl Into<String>, vocab_size: usize, embed_dim: usize) -> PureResult<Self> {
        let name = name.into();
        let mut rng = determinism::rng_from_label(&name);
        Self::with_rng(name, vocab_size, embed_dim, &mut rng)
    }

    /// Table initialised from `N(0, 1)`.
    pub fn with_rng<R: Rng + ?Sized>(
        name: impl Into<String>,
        vocab_size: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: vocab_size,
                cols: embed_dim,
            });
        }
        let name = name.into();
        let weight = Tensor::random_normal_with(vocab_size, embed_dim, 0.0, 1.0, rng)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            vocab_size,
            embed_dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    fn guard_index(&self, index: usize) -> PureResult<()> {
        if index >= self.vocab_size {
            return Err(TensorError::IndexOutOfRange {
                label: "embedding",
                index,
                len: self.vocab_size,
            });
        }
        Ok(())
    }

    /// Gathers one row per index.
    pub fn lookup(&self, indices: &[usize]) -> PureResult<Tensor> {
        if indices.is_empty() {
            return Err(TensorError::EmptyInput("embedding lookup"));
        }
        let weights = self.weight.value().data();
        let mut out = Vec::with_capacity(indices.len() * self.embed_dim);
        for &idx in indices {
            self.guard_index(idx)?;
            let start = idx * self.embed_dim;
            out.extend_from_slice(&weights[start..start + self.embed_dim]);
        }
        Tensor::from_vec(indices.len(), self.embed_dim, out)
    }

    /// Scatters `grad_output` rows back onto the looked-up table rows.
    pub fn accumulate_lookup(&mut self, indices: &[usize], grad_output: &Tensor) -> PureResult<()> {
        if grad_output.shape() != (indices.len(), self.embed_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (indices.len(), self.embed_dim),
            });
        }
        let mut grad_weight = vec![0.0f32; self.vocab_size * self.embed_dim];
        for (row, &idx) in indices.iter().enumerate() {
            self.guard_index(idx)?;
            let base = idx * self.embed_dim;
            let grad_row = grad_output.row(row)?;
            for (acc, g) in grad_weight[base..base + self.embed_dim].iter_mut().zip(grad_row) {
                *acc += g;
            }
        }
        let grad = Tensor::from_vec(self.vocab_size, self.embed_dim, grad_weight)?;
        self.weight.accumulate_euclidean(&grad)
    }

    fn ids_from_tensor(&self, input: &Tensor) -> PureResult<Vec<usize>> {
        if input.shape().1 != 1 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, 1),
            });
        }
        input
            .data()
            .iter()
            .map(|value| {
                if !value.is_finite() || *value < 0.0 {
                    return Err(TensorError::NonFiniteValue {
                        label: "embedding_id",
                        value: *value,
                    });
                }
                Ok(value.round() as usize)
            })
            .collect()
    }
}

impl Parameterized for Embedding {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let ids = self.ids_from_tensor(input)?;
        self.lookup(&ids)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let ids = self.ids_from_tensor(input)?;
        self.accumulate_lookup(&ids, grad_output)?;
        Tensor::zeros(input.shape().0, 1)
    }
}
