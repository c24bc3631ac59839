// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::linear::Linear;
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;
use st_tensor::masked_softmax;

/// Boolean allow-mask shaped `[batch, queries, keys]`.
///
/// `true` admits the key for that query. Disallowed entries receive exactly
/// zero attention weight; a query row with no admissible key attends to nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    batch: usize,
    queries: usize,
    keys: usize,
    allow: Vec<bool>,
}

impl AttentionMask {
    pub fn from_fn<F>(batch: usize, queries: usize, keys: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> bool,
    {
        let mut allow = Vec::with_capacity(batch * queries * keys);
        for b in 0..batch {
            for i in 0..queries {
                for j in 0..keys {
                    allow.push(f(b, i, j));
                }
            }
        }
        Self {
            batch,
            queries,
            keys,
            allow,
        }
    }

    /// Every query sees every key.
    pub fn full(batch: usize, queries: usize, keys: usize) -> Self {
        Self {
            batch,
            queries,
            keys,
            allow: vec![true; batch * queries * keys],
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.queries, self.keys)
    }

    pub fn allows(&self, batch: usize, query: usize, key: usize) -> bool {
        self.allow[(batch * self.queries + query) * self.keys + key]
    }

    /// Admissible keys for one query.
    pub fn row(&self, batch: usize, query: usize) -> &[bool] {
        let start = (batch * self.queries + query) * self.keys;
        &self.allow[start..start + self.keys]
    }

    fn combine(&self, other: &AttentionMask, op: impl Fn(bool, bool) -> bool) -> PureResult<Self> {
        if self.dims() != other.dims() {
            return Err(TensorError::ShapeMismatch {
                left: (self.batch * self.queries, self.keys),
                right: (other.batch * other.queries, other.keys),
            });
        }
        let allow = self
            .allow
            .iter()
            .zip(&other.allow)
            .map(|(a, b)| op(*a, *b))
            .collect();
        Ok(Self {
            allow,
            ..self.clone()
        })
    }

    pub fn and(&self, other: &AttentionMask) -> PureResult<Self> {
        self.combine(other, |a, b| a && b)
    }

    pub fn or(&self, other: &AttentionMask) -> PureResult<Self> {
        self.combine(other, |a, b| a || b)
    }
}

/// Multi-head scaled dot-product attention with separate query and context inputs.
///
/// Inputs are flattened token streams: `query` is `(batch * queries, hidden)` and
/// `context` is `(batch * keys, hidden)`. Self-attention passes the same tensor
/// twice and sums the two input gradients returned by [`MultiHeadAttention::backward`].
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    heads: usize,
    head_dim: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
}

struct Projections {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    queries: usize,
    keys: usize,
}

impl MultiHeadAttention {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        hidden: usize,
        heads: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if heads == 0 || hidden % heads != 0 {
            return Err(TensorError::InvalidDimensions {
                rows: hidden,
                cols: heads,
            });
        }
        Ok(Self {
            heads,
            head_dim: hidden / heads,
            query: Linear::with_rng(format!("{name}.query"), hidden, hidden, rng)?,
            key: Linear::with_rng(format!("{name}.key"), hidden, hidden, rng)?,
            value: Linear::with_rng(format!("{name}.value"), hidden, hidden, rng)?,
            output: Linear::with_rng(format!("{name}.output"), hidden, hidden, rng)?,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn hidden(&self) -> usize {
        self.heads * self.head_dim
    }

    fn project(
        &self,
        query: &Tensor,
        context: &Tensor,
        batch: usize,
        mask: &AttentionMask,
    ) -> PureResult<Projections> {
        if batch == 0 || query.rows() % batch != 0 || context.rows() % batch != 0 {
            return Err(TensorError::ShapeMismatch {
                left: query.shape(),
                right: context.shape(),
            });
        }
        let queries = query.rows() / batch;
        let keys = context.rows() / batch;
        if mask.dims() != (batch, queries, keys) {
            return Err(TensorError::ShapeMismatch {
                left: (batch * queries, keys),
                right: (mask.batch * mask.queries, mask.keys),
            });
        }
        Ok(Projections {
            q: self.query.forward(query)?,
            k: self.key.forward(context)?,
            v: self.value.forward(context)?,
            queries,
            keys,
        })
    }

    /// Attention weights for `(batch, head)` as a `queries x keys` row-stochastic block.
    fn head_probabilities(
        &self,
        proj: &Projections,
        mask: &AttentionMask,
        b: usize,
        h: usize,
    ) -> Vec<f32> {
        let hidden = self.hidden();
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let offset = h * self.head_dim;
        let mut probs = Vec::with_capacity(proj.queries * proj.keys);
        let mut scores = vec![0.0f32; proj.keys];
        for i in 0..proj.queries {
            let q_row = (b * proj.queries + i) * hidden + offset;
            let q_slice = &proj.q.data()[q_row..q_row + self.head_dim];
            for (j, score) in scores.iter_mut().enumerate() {
                let k_row = (b * proj.keys + j) * hidden + offset;
                let k_slice = &proj.k.data()[k_row..k_row + self.head_dim];
                *score = q_slice.iter().zip(k_slice).map(|(a, c)| a * c).sum::<f32>() * scale;
            }
            probs.extend(masked_softmax(&scores, Some(mask.row(b, i))));
        }
        probs
    }

    fn mix_values(
        &self,
        proj: &Projections,
        mask: &AttentionMask,
        batch: usize,
    ) -> PureResult<Tensor> {
        let hidden = self.hidden();
        let mut mixed = vec![0.0f32; batch * proj.queries * hidden];
        for b in 0..batch {
            for h in 0..self.heads {
                let offset = h * self.head_dim;
                let probs = self.head_probabilities(proj, mask, b, h);
                for i in 0..proj.queries {
                    let out_row = (b * proj.queries + i) * hidden + offset;
                    for j in 0..proj.keys {
                        let p = probs[i * proj.keys + j];
                        if p == 0.0 {
                            continue;
                        }
                        let v_row = (b * proj.keys + j) * hidden + offset;
                        for d in 0..self.head_dim {
                            mixed[out_row + d] += p * proj.v.data()[v_row + d];
                        }
                    }
                }
            }
        }
        Tensor::from_vec(batch * proj.queries, hidden, mixed)
    }

    pub fn forward(
        &self,
        query: &Tensor,
        context: &Tensor,
        batch: usize,
        mask: &AttentionMask,
    ) -> PureResult<Tensor> {
        let proj = self.project(query, context, batch, mask)?;
        let mixed = self.mix_values(&proj, mask, batch)?;
        self.output.forward(&mixed)
    }

    /// Per `(batch, head)` attention maps, each shaped `(queries, keys)`.
    pub fn attention_probabilities(
        &self,
        query: &Tensor,
        context: &Tensor,
        batch: usize,
        mask: &AttentionMask,
    ) -> PureResult<Vec<Tensor>> {
        let proj = self.project(query, context, batch, mask)?;
        let mut maps = Vec::with_capacity(batch * self.heads);
        for b in 0..batch {
            for h in 0..self.heads {
                let probs = self.head_probabilities(&proj, mask, b, h);
                maps.push(Tensor::from_vec(proj.queries, proj.keys, probs)?);
            }
        }
        Ok(maps)
    }

    /// Returns `(grad_query, grad_context)`.
    pub fn backward(
        &mut self,
        query: &Tensor,
        context: &Tensor,
        batch: usize,
        mask: &AttentionMask,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let proj = self.project(query, context, batch, mask)?;
        let mixed = self.mix_values(&proj, mask, batch)?;
        let grad_mixed = self.output.backward(&mixed, grad_output)?;

        let hidden = self.hidden();
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let mut grad_q = vec![0.0f32; proj.q.len()];
        let mut grad_k = vec![0.0f32; proj.k.len()];
        let mut grad_v = vec![0.0f32; proj.v.len()];
        let mut grad_probs = vec![0.0f32; proj.keys];

        for b in 0..batch {
            for h in 0..self.heads {
                let offset = h * self.head_dim;
                let probs = self.head_probabilities(&proj, mask, b, h);
                for i in 0..proj.queries {
                    let row = (b * proj.queries + i) * hidden + offset;
                    let go = &grad_mixed.data()[row..row + self.head_dim];
                    let p_row = &probs[i * proj.keys..(i + 1) * proj.keys];
                    let mut weighted = 0.0f32;
                    for j in 0..proj.keys {
                        let v_row = (b * proj.keys + j) * hidden + offset;
                        let v = &proj.v.data()[v_row..v_row + self.head_dim];
                        let dp: f32 = go.iter().zip(v).map(|(g, x)| g * x).sum();
                        grad_probs[j] = dp;
                        weighted += p_row[j] * dp;
                        if p_row[j] != 0.0 {
                            for d in 0..self.head_dim {
                                grad_v[v_row + d] += p_row[j] * go[d];
                            }
                        }
                    }
                    for j in 0..proj.keys {
                        let ds = p_row[j] * (grad_probs[j] - weighted) * scale;
                        if ds == 0.0 {
                            continue;
                        }
                        let k_row = (b * proj.keys + j) * hidden + offset;
                        for d in 0..self.head_dim {
                            grad_q[row + d] += ds * proj.k.data()[k_row + d];
                            grad_k[k_row + d] += ds * proj.q.data()[row + d];
                        }
                    }
                }
            }
        }

        let grad_q = Tensor::from_vec(proj.q.rows(), hidden, grad_q)?;
        let grad_k = Tensor::from_vec(proj.k.rows(), hidden, grad_k)?;
        let grad_v = Tensor::from_vec(proj.v.rows(), hidden, grad_v)?;
        let grad_query = self.query.backward(query, &grad_q)?;
        let mut grad_context = self.key.backward(context, &grad_k)?;
        grad_context.add_scaled(&self.value.backward(context, &grad_v)?, 1.0)?;
        Ok((grad_query, grad_context))
    }
}

impl Parameterized for MultiHeadAttention {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.query.visit_parameters(visitor)?;
        self.key.visit_parameters(visitor)?;
        self.value.visit_parameters(visitor)?;
        self.output.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.query.visit_parameters_mut(visitor)?;
        self.key.visit_parameters_mut(visitor)?;
        self.value.visit_parameters_mut(visitor)?;
        self.output.visit_parameters_mut(visitor)
    }
}
