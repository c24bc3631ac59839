// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-session adapters between raw channel widths and the shared hidden width.
//!
//! An [`Adapter`] is either `Stitched` (one unit per registered session, held
//! in an arena indexed by the dense session index) or `Plain` (one unit shared
//! by every session). Stream helpers walk a `(B * T, C)` batch example by
//! example so each example only ever touches its own session's unit and its
//! own `C_s` leading channels.

use crate::{NeuroError, NeuroResult, Tensor};
use rand::Rng;
use st_nn::layers::{Linear, Softsign};
use st_nn::module::{Module, Parameter, Parameterized};
use st_tensor::{PureResult, TensorError};

/// `Linear(C -> 2C) -> scaled softsign -> Linear(2C -> H)` on token streams,
/// or `Linear(1 -> 2T) -> reshape (T, 2) -> scaled softsign -> Linear(2 -> H)`
/// on per-trial labels.
#[derive(Debug, Clone)]
pub struct StitchEncoder {
    expand: Linear,
    act: Softsign,
    project: Linear,
    label_steps: Option<usize>,
}

impl StitchEncoder {
    pub fn tokens<R: Rng + ?Sized>(
        name: &str,
        channels: usize,
        hidden: usize,
        scale: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(Self {
            expand: Linear::with_rng(format!("{name}.expand"), channels, 2 * channels, rng)?,
            act: Softsign::new(scale)?,
            project: Linear::with_rng(format!("{name}.project"), 2 * channels, hidden, rng)?,
            label_steps: None,
        })
    }

    pub fn label<R: Rng + ?Sized>(
        name: &str,
        steps: usize,
        hidden: usize,
        scale: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(Self {
            expand: Linear::with_rng(format!("{name}.expand"), 1, 2 * steps, rng)?,
            act: Softsign::new(scale)?,
            project: Linear::with_rng(format!("{name}.project"), 2, hidden, rng)?,
            label_steps: Some(steps),
        })
    }

    /// Raw input width this unit accepts.
    pub fn channels(&self) -> usize {
        self.expand.input_dim()
    }

    fn expanded(&self, input: &Tensor) -> PureResult<Tensor> {
        let wide = self.expand.forward(input)?;
        match self.label_steps {
            Some(steps) => wide.reshape(steps, 2),
            None => Ok(wide),
        }
    }
}

impl Parameterized for StitchEncoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.expand.visit_parameters(visitor)?;
        self.project.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.expand.visit_parameters_mut(visitor)?;
        self.project.visit_parameters_mut(visitor)
    }
}

impl Module for StitchEncoder {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let expanded = self.expanded(input)?;
        self.project.forward(&self.act.forward(&expanded)?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let expanded = self.expanded(input)?;
        let activated = self.act.forward(&expanded)?;
        let grad_act = self.project.backward(&activated, grad_output)?;
        let mut grad_expanded = self.act.backward(&expanded, &grad_act)?;
        if self.label_steps.is_some() {
            grad_expanded = grad_expanded.reshape(1, self.expand.output_dim())?;
        }
        self.expand.backward(input, &grad_expanded)
    }
}

/// Maps hidden tokens back to a session's raw output.
#[derive(Debug, Clone)]
pub enum StitchDecoder {
    /// `Linear(H -> C_s)` per token.
    Tokens { project: Linear },
    /// Learned temporal pooling followed by `Linear(H -> K)`, one row per trial.
    Label { pool: Parameter, classify: Linear },
}

impl StitchDecoder {
    pub fn tokens<R: Rng + ?Sized>(
        name: &str,
        hidden: usize,
        channels: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(StitchDecoder::Tokens {
            project: Linear::with_rng(format!("{name}.project"), hidden, channels, rng)?,
        })
    }

    pub fn label<R: Rng + ?Sized>(
        name: &str,
        hidden: usize,
        steps: usize,
        classes: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        let pool = Tensor::filled(1, steps, 1.0 / steps as f32)?;
        Ok(StitchDecoder::Label {
            pool: Parameter::new(format!("{name}.pool"), pool),
            classify: Linear::with_rng(format!("{name}.classify"), hidden, classes, rng)?,
        })
    }

    pub fn output_width(&self) -> usize {
        match self {
            StitchDecoder::Tokens { project } => project.output_dim(),
            StitchDecoder::Label { classify, .. } => classify.output_dim(),
        }
    }

    fn pooled(pool: &Parameter, input: &Tensor) -> PureResult<Tensor> {
        let steps = input.rows();
        if steps > pool.value().cols() {
            return Err(TensorError::ShapeMismatch {
                left: pool.value().shape(),
                right: input.shape(),
            });
        }
        let weights = pool.value().slice_cols(0, steps)?;
        weights.matmul(input)
    }
}

impl Parameterized for StitchDecoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            StitchDecoder::Tokens { project } => project.visit_parameters(visitor),
            StitchDecoder::Label { pool, classify } => {
                visitor(pool)?;
                classify.visit_parameters(visitor)
            }
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            StitchDecoder::Tokens { project } => project.visit_parameters_mut(visitor),
            StitchDecoder::Label { pool, classify } => {
                visitor(pool)?;
                classify.visit_parameters_mut(visitor)
            }
        }
    }
}

impl Module for StitchDecoder {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        match self {
            StitchDecoder::Tokens { project } => project.forward(input),
            StitchDecoder::Label { pool, classify } => {
                classify.forward(&Self::pooled(pool, input)?)
            }
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        match self {
            StitchDecoder::Tokens { project } => project.backward(input, grad_output),
            StitchDecoder::Label { pool, classify } => {
                let pooled = Self::pooled(pool, input)?;
                let grad_pooled = classify.backward(&pooled, grad_output)?;
                let steps = input.rows();
                // d pooled / d w_t = h_t ; d pooled / d h_t = w_t
                let grad_weights = input.matmul_transpose(&grad_pooled)?.transpose();
                let mut grad_pool = Tensor::zeros(1, pool.value().cols())?;
                grad_pool.write_block(0, 0, &grad_weights)?;
                pool.accumulate_euclidean(&grad_pool)?;
                let weights = pool.value().slice_cols(0, steps)?;
                weights.transpose().matmul(&grad_pooled)
            }
        }
    }
}

/// Per-session arena or single shared unit.
#[derive(Debug, Clone)]
pub enum Adapter<U> {
    Stitched { units: Vec<Option<U>> },
    Plain { unit: U },
}

impl<U: Module> Adapter<U> {
    pub fn stitched(capacity: usize) -> Self {
        Adapter::Stitched {
            units: Vec::with_capacity(capacity),
        }
    }

    pub fn plain(unit: U) -> Self {
        Adapter::Plain { unit }
    }

    pub fn is_stitched(&self) -> bool {
        matches!(self, Adapter::Stitched { .. })
    }

    /// Stores the unit for a freshly registered session. `None` records a
    /// session that does not carry this modality. Plain adapters ignore it.
    pub fn allocate(&mut self, session: usize, unit: Option<U>) {
        if let Adapter::Stitched { units } = self {
            if units.len() <= session {
                units.resize_with(session + 1, || None);
            }
            units[session] = unit;
        }
    }

    pub fn has_session(&self, session: usize) -> bool {
        match self {
            Adapter::Stitched { units } => units.get(session).map_or(false, Option::is_some),
            Adapter::Plain { .. } => true,
        }
    }

    pub fn unit(&self, session: usize, eid: &str) -> NeuroResult<&U> {
        match self {
            Adapter::Stitched { units } => units
                .get(session)
                .and_then(Option::as_ref)
                .ok_or_else(|| NeuroError::UnknownSession { eid: eid.to_string() }),
            Adapter::Plain { unit } => Ok(unit),
        }
    }

    pub fn unit_mut(&mut self, session: usize, eid: &str) -> NeuroResult<&mut U> {
        match self {
            Adapter::Stitched { units } => units
                .get_mut(session)
                .and_then(Option::as_mut)
                .ok_or_else(|| NeuroError::UnknownSession { eid: eid.to_string() }),
            Adapter::Plain { unit } => Ok(unit),
        }
    }

    /// Visits only the parameters owned by `session`.
    pub fn visit_session_mut(
        &mut self,
        session: usize,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            Adapter::Stitched { units } => match units.get_mut(session).and_then(Option::as_mut) {
                Some(unit) => unit.visit_parameters_mut(visitor),
                None => Ok(()),
            },
            Adapter::Plain { .. } => Ok(()),
        }
    }
}

impl<U: Module> Parameterized for Adapter<U> {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            Adapter::Stitched { units } => {
                for unit in units.iter().flatten() {
                    unit.visit_parameters(visitor)?;
                }
                Ok(())
            }
            Adapter::Plain { unit } => unit.visit_parameters(visitor),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            Adapter::Stitched { units } => {
                for unit in units.iter_mut().flatten() {
                    unit.visit_parameters_mut(visitor)?;
                }
                Ok(())
            }
            Adapter::Plain { unit } => unit.visit_parameters_mut(visitor),
        }
    }
}

/// Which session and how many channels each example of a stream uses.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLayout {
    pub batch: usize,
    pub steps: usize,
    pub sessions: Vec<usize>,
    pub eids: Vec<String>,
    /// Raw width `C_s` of each example's session.
    pub widths: Vec<usize>,
    /// Per-trial labels instead of token streams.
    pub labels: bool,
}

impl StreamLayout {
    fn example_input(&self, input: &Tensor, b: usize) -> PureResult<Tensor> {
        if self.labels {
            input.slice_rows(b, b + 1)
        } else {
            input
                .slice_rows(b * self.steps, (b + 1) * self.steps)?
                .slice_cols(0, self.widths[b])
        }
    }

    fn example_hidden(&self, hidden: &Tensor, b: usize) -> PureResult<Tensor> {
        hidden.slice_rows(b * self.steps, (b + 1) * self.steps)
    }
}

/// `(B * T, C)` or `(B, 1)` raw inputs to `(B * T, H)` tokens.
pub fn encode_stream(
    adapter: &Adapter<StitchEncoder>,
    layout: &StreamLayout,
    input: &Tensor,
    hidden: usize,
) -> NeuroResult<Tensor> {
    let mut out = Tensor::zeros(layout.batch * layout.steps, hidden)?;
    for b in 0..layout.batch {
        let unit = adapter.unit(layout.sessions[b], &layout.eids[b])?;
        let tokens = unit.forward(&layout.example_input(input, b)?)?;
        let tokens = if layout.labels {
            tokens.slice_rows(0, layout.steps)?
        } else {
            tokens
        };
        out.write_block(b * layout.steps, 0, &tokens)?;
    }
    Ok(out)
}

/// Accumulates adapter gradients for `grad_tokens` shaped like [`encode_stream`]'s output.
pub fn encode_stream_backward(
    adapter: &mut Adapter<StitchEncoder>,
    layout: &StreamLayout,
    input: &Tensor,
    grad_tokens: &Tensor,
) -> NeuroResult<()> {
    for b in 0..layout.batch {
        let unit = adapter.unit_mut(layout.sessions[b], &layout.eids[b])?;
        let example = layout.example_input(input, b)?;
        let mut grad = grad_tokens.slice_rows(b * layout.steps, (b + 1) * layout.steps)?;
        if let Some(steps) = unit.label_steps.filter(|s| *s != layout.steps) {
            let mut padded = Tensor::zeros(steps, grad.cols())?;
            padded.write_block(0, 0, &grad)?;
            grad = padded;
        }
        unit.backward(&example, &grad)?;
    }
    Ok(())
}

/// `(B * T, H)` tokens to `(B * T, width)` predictions, or `(B, K)` logits for labels.
/// Columns at and beyond an example's `C_s` stay zero.
pub fn decode_stream(
    adapter: &Adapter<StitchDecoder>,
    layout: &StreamLayout,
    hidden: &Tensor,
    width: usize,
) -> NeuroResult<Tensor> {
    let rows = if layout.labels { layout.batch } else { layout.batch * layout.steps };
    let mut out = Tensor::zeros(rows, width)?;
    for b in 0..layout.batch {
        let unit = adapter.unit(layout.sessions[b], &layout.eids[b])?;
        let pred = unit.forward(&layout.example_hidden(hidden, b)?)?;
        if pred.cols() > width {
            return Err(NeuroError::shape(
                format!("decoded width for session {}", layout.eids[b]),
                (pred.rows(), width),
                pred.shape(),
            ));
        }
        let row = if layout.labels { b } else { b * layout.steps };
        out.write_block(row, 0, &pred)?;
    }
    Ok(out)
}

/// Returns the gradient with respect to the hidden tokens.
pub fn decode_stream_backward(
    adapter: &mut Adapter<StitchDecoder>,
    layout: &StreamLayout,
    hidden: &Tensor,
    grad_preds: &Tensor,
) -> NeuroResult<Tensor> {
    let mut grad_hidden = Tensor::zeros(hidden.rows(), hidden.cols())?;
    for b in 0..layout.batch {
        let unit = adapter.unit_mut(layout.sessions[b], &layout.eids[b])?;
        let width = unit.output_width();
        let grad = if layout.labels {
            grad_preds.slice_rows(b, b + 1)?.slice_cols(0, width)?
        } else {
            grad_preds
                .slice_rows(b * layout.steps, (b + 1) * layout.steps)?
                .slice_cols(0, width)?
        };
        let grad_example = unit.backward(&layout.example_hidden(hidden, b)?, &grad)?;
        grad_hidden.write_block(b * layout.steps, 0, &grad_example)?;
    }
    Ok(grad_hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layout(widths: Vec<usize>, steps: usize, labels: bool) -> StreamLayout {
        StreamLayout {
            batch: widths.len(),
            steps,
            sessions: (0..widths.len()).collect(),
            eids: (0..widths.len()).map(|i| format!("s{i}")).collect(),
            widths,
            labels,
        }
    }

    #[test]
    fn stitched_round_trip_keeps_session_widths() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut enc = Adapter::stitched(2);
        let mut dec = Adapter::stitched(2);
        for (idx, width) in [4usize, 7].into_iter().enumerate() {
            let unit = StitchEncoder::tokens(&format!("e{idx}"), width, 8, 1.0, &mut rng).unwrap();
            enc.allocate(idx, Some(unit));
            let unit = StitchDecoder::tokens(&format!("d{idx}"), 8, width, &mut rng).unwrap();
            dec.allocate(idx, Some(unit));
        }
        let lay = layout(vec![4, 7], 3, false);
        let input = Tensor::from_fn(6, 7, |r, c| ((r + c) % 4) as f32).unwrap();
        let hidden = encode_stream(&enc, &lay, &input, 8).unwrap();
        assert_eq!(hidden.shape(), (6, 8));
        let preds = decode_stream(&dec, &lay, &hidden, 7).unwrap();
        assert_eq!(preds.shape(), (6, 7));
        for r in 0..3 {
            assert!(preds.row(r).unwrap()[4..].iter().all(|v| *v == 0.0));
        }
        assert!(preds.row(3).unwrap()[6] != 0.0);
    }

    #[test]
    fn unregistered_sessions_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut enc = Adapter::stitched(2);
        enc.allocate(0, Some(StitchEncoder::tokens("e0", 2, 4, 1.0, &mut rng).unwrap()));
        let mut lay = layout(vec![2], 2, false);
        lay.sessions = vec![1];
        let err = encode_stream(&enc, &lay, &Tensor::zeros(2, 2).unwrap(), 4).unwrap_err();
        assert!(matches!(err, NeuroError::UnknownSession { .. }));
    }

    #[test]
    fn label_units_broadcast_over_time() {
        let mut rng = StdRng::seed_from_u64(2);
        let enc = Adapter::plain(StitchEncoder::label("choice", 5, 4, 1.0, &mut rng).unwrap());
        let dec = Adapter::plain(StitchDecoder::label("choice", 4, 5, 2, &mut rng).unwrap());
        let lay = layout(vec![1, 1], 3, true);
        let labels = Tensor::from_vec(2, 1, vec![0.0, 1.0]).unwrap();
        let tokens = encode_stream(&enc, &lay, &labels, 4).unwrap();
        assert_eq!(tokens.shape(), (6, 4));
        let logits = decode_stream(&dec, &lay, &tokens, 2).unwrap();
        assert_eq!(logits.shape(), (2, 2));
    }

    #[test]
    fn label_decoder_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut unit = StitchDecoder::label("block", 3, 4, 3, &mut rng).unwrap();
        let hidden = Tensor::random_normal_with(2, 3, 0.0, 1.0, &mut rng).unwrap();
        let upstream = Tensor::from_vec(1, 3, vec![0.3, -0.7, 0.2]).unwrap();
        let grad = unit.backward(&hidden, &upstream).unwrap();
        let objective = |h: &Tensor| -> f32 {
            unit.forward(h).unwrap().data().iter().zip(upstream.data()).map(|(a, b)| a * b).sum()
        };
        let eps = 1e-2;
        for idx in 0..hidden.len() {
            let mut plus = hidden.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = hidden.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
            assert!((numeric - grad.data()[idx]).abs() < 1e-3);
        }
    }

    #[test]
    fn label_encoder_gradient_reaches_expand_weights() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut unit = StitchEncoder::label("choice", 3, 2, 1.0, &mut rng).unwrap();
        let label = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_out = Tensor::filled(3, 2, 0.5).unwrap();
        unit.backward(&label, &grad_out).unwrap();
        let mut touched = 0;
        unit.visit_parameters(&mut |p| {
            if p.gradient().map_or(false, |g| g.squared_l2_norm() > 0.0) {
                touched += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(touched, 4);
    }
}
