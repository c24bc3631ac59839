// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pre-norm encoder and decoder stacks over flattened `(B * L, H)` sequences.
//!
//! Forward passes return the per-layer inputs they consumed; backward passes
//! take those back and recompute the intermediate activations they need.

use crate::{NeuroResult, Tensor};
use rand::Rng;
use st_nn::layers::{AttentionMask, FeedForward, LayerNorm, MultiHeadAttention};
use st_nn::module::{Module, Parameter, Parameterized};
use st_tensor::PureResult;

/// Shape shared by both stacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackShape {
    pub hidden: usize,
    pub heads: usize,
    pub inner: usize,
    pub layers: usize,
    pub epsilon: f32,
}

/// `x + MHA(LN1 x)` then `h + FF(LN2 h)`.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    norm_attn: LayerNorm,
    attn: MultiHeadAttention,
    norm_ff: LayerNorm,
    ff: FeedForward,
}

impl EncoderLayer {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        shape: StackShape,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(Self {
            norm_attn: LayerNorm::new(format!("{name}.norm_attn"), shape.hidden, shape.epsilon)?,
            attn: MultiHeadAttention::with_rng(
                &format!("{name}.attn"),
                shape.hidden,
                shape.heads,
                rng,
            )?,
            norm_ff: LayerNorm::new(format!("{name}.norm_ff"), shape.hidden, shape.epsilon)?,
            ff: FeedForward::with_rng(&format!("{name}.ff"), shape.hidden, shape.inner, rng)?,
        })
    }

    fn attended(&self, x: &Tensor, batch: usize, mask: &AttentionMask) -> PureResult<Tensor> {
        let normed = self.norm_attn.forward(x)?;
        let mut h = self.attn.forward(&normed, &normed, batch, mask)?;
        h.add_scaled(x, 1.0)?;
        Ok(h)
    }

    pub fn forward(&self, x: &Tensor, batch: usize, mask: &AttentionMask) -> PureResult<Tensor> {
        let h = self.attended(x, batch, mask)?;
        let mut out = self.ff.forward(&self.norm_ff.forward(&h)?)?;
        out.add_scaled(&h, 1.0)?;
        Ok(out)
    }

    pub fn backward(
        &mut self,
        x: &Tensor,
        batch: usize,
        mask: &AttentionMask,
        grad_out: &Tensor,
    ) -> PureResult<Tensor> {
        let h = self.attended(x, batch, mask)?;
        let normed_h = self.norm_ff.forward(&h)?;
        let grad_normed_h = self.ff.backward(&normed_h, grad_out)?;
        let mut grad_h = self.norm_ff.backward(&h, &grad_normed_h)?;
        grad_h.add_scaled(grad_out, 1.0)?;

        let normed_x = self.norm_attn.forward(x)?;
        let (grad_q, grad_kv) = self.attn.backward(&normed_x, &normed_x, batch, mask, &grad_h)?;
        let mut grad_normed_x = grad_q;
        grad_normed_x.add_scaled(&grad_kv, 1.0)?;
        let mut grad_x = self.norm_attn.backward(x, &grad_normed_x)?;
        grad_x.add_scaled(&grad_h, 1.0)?;
        Ok(grad_x)
    }

    pub fn attention_probabilities(
        &self,
        x: &Tensor,
        batch: usize,
        mask: &AttentionMask,
    ) -> PureResult<Vec<Tensor>> {
        let normed = self.norm_attn.forward(x)?;
        self.attn.attention_probabilities(&normed, &normed, batch, mask)
    }
}

impl Parameterized for EncoderLayer {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm_attn.visit_parameters(visitor)?;
        self.attn.visit_parameters(visitor)?;
        self.norm_ff.visit_parameters(visitor)?;
        self.ff.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm_attn.visit_parameters_mut(visitor)?;
        self.attn.visit_parameters_mut(visitor)?;
        self.norm_ff.visit_parameters_mut(visitor)?;
        self.ff.visit_parameters_mut(visitor)
    }
}

/// Activations kept from a stack's forward pass.
#[derive(Debug, Clone)]
pub struct StackTrace {
    /// Input of every layer, then the input of the closing norm.
    pub inputs: Vec<Tensor>,
    pub output: Tensor,
}

#[derive(Debug, Clone)]
pub struct EncoderStack {
    layers: Vec<EncoderLayer>,
    norm: LayerNorm,
}

impl EncoderStack {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        shape: StackShape,
        rng: &mut R,
    ) -> PureResult<Self> {
        let layers = (0..shape.layers)
            .map(|idx| EncoderLayer::with_rng(&format!("{name}.layers.{idx}"), shape, rng))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: LayerNorm::new(format!("{name}.norm"), shape.hidden, shape.epsilon)?,
        })
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn forward(
        &self,
        x: &Tensor,
        batch: usize,
        mask: &AttentionMask,
    ) -> NeuroResult<StackTrace> {
        let mut inputs = Vec::with_capacity(self.layers.len() + 1);
        let mut current = x.clone();
        for layer in &self.layers {
            let next = layer.forward(&current, batch, mask)?;
            inputs.push(current);
            current = next;
        }
        let output = self.norm.forward(&current)?;
        inputs.push(current);
        Ok(StackTrace { inputs, output })
    }

    pub fn backward(
        &mut self,
        trace: &StackTrace,
        batch: usize,
        mask: &AttentionMask,
        grad_out: &Tensor,
    ) -> NeuroResult<Tensor> {
        let last = &trace.inputs[self.layers.len()];
        let mut grad = self.norm.backward(last, grad_out)?;
        for (layer, input) in self.layers.iter_mut().zip(&trace.inputs).rev() {
            grad = layer.backward(input, batch, mask, &grad)?;
        }
        Ok(grad)
    }
}

impl Parameterized for EncoderStack {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        self.norm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        self.norm.visit_parameters_mut(visitor)
    }
}

/// Self-attention, cross-attention against the encoder context, then MLP.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    norm_self: LayerNorm,
    self_attn: MultiHeadAttention,
    norm_query: LayerNorm,
    norm_context: LayerNorm,
    cross_attn: MultiHeadAttention,
    norm_ff: LayerNorm,
    ff: FeedForward,
}

/// Masks and context shared by every decoder layer of one forward call.
pub struct DecoderInputs<'a> {
    pub batch: usize,
    pub self_mask: &'a AttentionMask,
    pub cross_mask: &'a AttentionMask,
    pub context: &'a Tensor,
}

impl DecoderLayer {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        shape: StackShape,
        rng: &mut R,
    ) -> PureResult<Self> {
        let norm = |suffix: &str| {
            LayerNorm::new(format!("{name}.{suffix}"), shape.hidden, shape.epsilon)
        };
        Ok(Self {
            norm_self: norm("norm_self")?,
            self_attn: MultiHeadAttention::with_rng(
                &format!("{name}.self_attn"),
                shape.hidden,
                shape.heads,
                rng,
            )?,
            norm_query: norm("norm_query")?,
            norm_context: norm("norm_context")?,
            cross_attn: MultiHeadAttention::with_rng(
                &format!("{name}.cross_attn"),
                shape.hidden,
                shape.heads,
                rng,
            )?,
            norm_ff: norm("norm_ff")?,
            ff: FeedForward::with_rng(&format!("{name}.ff"), shape.hidden, shape.inner, rng)?,
        })
    }

    fn after_self(&self, y: &Tensor, io: &DecoderInputs<'_>) -> PureResult<Tensor> {
        let normed = self.norm_self.forward(y)?;
        let mut y1 = self.self_attn.forward(&normed, &normed, io.batch, io.self_mask)?;
        y1.add_scaled(y, 1.0)?;
        Ok(y1)
    }

    fn after_cross(&self, y1: &Tensor, io: &DecoderInputs<'_>) -> PureResult<Tensor> {
        let query = self.norm_query.forward(y1)?;
        let context = self.norm_context.forward(io.context)?;
        let mut y2 = self.cross_attn.forward(&query, &context, io.batch, io.cross_mask)?;
        y2.add_scaled(y1, 1.0)?;
        Ok(y2)
    }

    pub fn forward(&self, y: &Tensor, io: &DecoderInputs<'_>) -> PureResult<Tensor> {
        let y2 = self.after_cross(&self.after_self(y, io)?, io)?;
        let mut out = self.ff.forward(&self.norm_ff.forward(&y2)?)?;
        out.add_scaled(&y2, 1.0)?;
        Ok(out)
    }

    /// Returns `(grad_y, grad_context)`.
    pub fn backward(
        &mut self,
        y: &Tensor,
        io: &DecoderInputs<'_>,
        grad_out: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let y1 = self.after_self(y, io)?;
        let y2 = self.after_cross(&y1, io)?;

        let normed_y2 = self.norm_ff.forward(&y2)?;
        let grad_normed_y2 = self.ff.backward(&normed_y2, grad_out)?;
        let mut grad_y2 = self.norm_ff.backward(&y2, &grad_normed_y2)?;
        grad_y2.add_scaled(grad_out, 1.0)?;

        let query = self.norm_query.forward(&y1)?;
        let context = self.norm_context.forward(io.context)?;
        let (grad_query, grad_context_normed) =
            self.cross_attn
                .backward(&query, &context, io.batch, io.cross_mask, &grad_y2)?;
        let mut grad_y1 = self.norm_query.backward(&y1, &grad_query)?;
        grad_y1.add_scaled(&grad_y2, 1.0)?;
        let grad_context = self.norm_context.backward(io.context, &grad_context_normed)?;

        let normed_y = self.norm_self.forward(y)?;
        let (grad_q, grad_kv) =
            self.self_attn
                .backward(&normed_y, &normed_y, io.batch, io.self_mask, &grad_y1)?;
        let mut grad_normed_y = grad_q;
        grad_normed_y.add_scaled(&grad_kv, 1.0)?;
        let mut grad_y = self.norm_self.backward(y, &grad_normed_y)?;
        grad_y.add_scaled(&grad_y1, 1.0)?;
        Ok((grad_y, grad_context))
    }
}

impl Parameterized for DecoderLayer {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm_self.visit_parameters(visitor)?;
        self.self_attn.visit_parameters(visitor)?;
        self.norm_query.visit_parameters(visitor)?;
        self.norm_context.visit_parameters(visitor)?;
        self.cross_attn.visit_parameters(visitor)?;
        self.norm_ff.visit_parameters(visitor)?;
        self.ff.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm_self.visit_parameters_mut(visitor)?;
        self.self_attn.visit_parameters_mut(visitor)?;
        self.norm_query.visit_parameters_mut(visitor)?;
        self.norm_context.visit_parameters_mut(visitor)?;
        self.cross_attn.visit_parameters_mut(visitor)?;
        self.norm_ff.visit_parameters_mut(visitor)?;
        self.ff.visit_parameters_mut(visitor)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderStack {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
}

impl DecoderStack {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        shape: StackShape,
        rng: &mut R,
    ) -> PureResult<Self> {
        let layers = (0..shape.layers)
            .map(|idx| DecoderLayer::with_rng(&format!("{name}.layers.{idx}"), shape, rng))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: LayerNorm::new(format!("{name}.norm"), shape.hidden, shape.epsilon)?,
        })
    }

    pub fn forward(&self, y: &Tensor, io: &DecoderInputs<'_>) -> NeuroResult<StackTrace> {
        let mut inputs = Vec::with_capacity(self.layers.len() + 1);
        let mut current = y.clone();
        for layer in &self.layers {
            let next = layer.forward(&current, io)?;
            inputs.push(current);
            current = next;
        }
        let output = self.norm.forward(&current)?;
        inputs.push(current);
        Ok(StackTrace { inputs, output })
    }

    /// Returns `(grad_y, grad_context)`.
    pub fn backward(
        &mut self,
        trace: &StackTrace,
        io: &DecoderInputs<'_>,
        grad_out: &Tensor,
    ) -> NeuroResult<(Tensor, Tensor)> {
        let last = &trace.inputs[self.layers.len()];
        let mut grad = self.norm.backward(last, grad_out)?;
        let mut grad_context = Tensor::zeros(io.context.rows(), io.context.cols())?;
        for (layer, input) in self.layers.iter_mut().zip(&trace.inputs).rev() {
            let (grad_y, grad_ctx) = layer.backward(input, io, &grad)?;
            grad_context.add_scaled(&grad_ctx, 1.0)?;
            grad = grad_y;
        }
        Ok((grad, grad_context))
    }
}

impl Parameterized for DecoderStack {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        self.norm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        self.norm.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shape(layers: usize) -> StackShape {
        StackShape {
            hidden: 4,
            heads: 2,
            inner: 8,
            layers,
            epsilon: 1e-5,
        }
    }

    fn upstream(rows: usize, cols: usize) -> Tensor {
        Tensor::from_fn(rows, cols, |r, c| (((r * cols + c) % 5) as f32) * 0.2 - 0.4).unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f32 {
        a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn encoder_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut stack = EncoderStack::with_rng("enc", shape(2), &mut rng).unwrap();
        let x = Tensor::random_normal_with(6, 4, 0.0, 1.0, &mut rng).unwrap();
        let mask = AttentionMask::from_fn(2, 3, 3, |_, i, j| j <= i);
        let g = upstream(6, 4);
        let trace = stack.forward(&x, 2, &mask).unwrap();
        let analytic = stack.backward(&trace, 2, &mask, &g).unwrap();
        let eps = 1e-2;
        for idx in [0, 5, 11, 17, 23] {
            let mut plus = x.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = x.clone();
            minus.data_mut()[idx] -= eps;
            let fp = dot(&stack.forward(&plus, 2, &mask).unwrap().output, &g);
            let fm = dot(&stack.forward(&minus, 2, &mask).unwrap().output, &g);
            let numeric = (fp - fm) / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[idx]).abs() < 5e-2 * (1.0 + numeric.abs()),
                "idx {idx}: {numeric} vs {}",
                analytic.data()[idx]
            );
        }
    }

    #[test]
    fn decoder_backward_matches_finite_differences_on_context() {
        let mut rng = StdRng::seed_from_u64(22);
        let mut stack = DecoderStack::with_rng("dec", shape(1), &mut rng).unwrap();
        let y = Tensor::random_normal_with(4, 4, 0.0, 1.0, &mut rng).unwrap();
        let ctx = Tensor::random_normal_with(6, 4, 0.0, 1.0, &mut rng).unwrap();
        let self_mask = AttentionMask::full(2, 2, 2);
        let cross_mask = AttentionMask::from_fn(2, 2, 3, |_, _, j| j != 1);
        let g = upstream(4, 4);
        let io = DecoderInputs {
            batch: 2,
            self_mask: &self_mask,
            cross_mask: &cross_mask,
            context: &ctx,
        };
        let trace = stack.forward(&y, &io).unwrap();
        let (_, grad_ctx) = stack.backward(&trace, &io, &g).unwrap();
        for row in [1, 4] {
            assert!(grad_ctx.row(row).unwrap().iter().all(|v| *v == 0.0));
        }
        let eps = 1e-2;
        for idx in [0, 9, 22] {
            let mut plus = ctx.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = ctx.clone();
            minus.data_mut()[idx] -= eps;
            let eval = |c: &Tensor| {
                let io = DecoderInputs {
                    batch: 2,
                    self_mask: &self_mask,
                    cross_mask: &cross_mask,
                    context: c,
                };
                dot(&stack.forward(&y, &io).unwrap().output, &g)
            };
            let numeric = (eval(&plus) - eval(&minus)) / (2.0 * eps);
            assert!((numeric - grad_ctx.data()[idx]).abs() < 5e-2 * (1.0 + numeric.abs()));
        }
    }
}
