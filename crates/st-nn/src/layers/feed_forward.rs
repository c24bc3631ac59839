// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::{gelu::Gelu, linear::Linear};
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor};
use rand::Rng;

/// Position-wise `Linear -> GELU -> Linear` block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    up: Linear,
    act: Gelu,
    down: Linear,
}

impl FeedForward {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        hidden: usize,
        inner: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(Self {
            up: Linear::with_rng(format!("{name}.up"), hidden, inner, rng)?,
            act: Gelu::new(),
            down: Linear::with_rng(format!("{name}.down"), inner, hidden, rng)?,
        })
    }
}

impl Parameterized for FeedForward {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.up.visit_parameters(visitor)?;
        self.down.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.up.visit_parameters_mut(visitor)?;
        self.down.visit_parameters_mut(visitor)
    }
}

impl Module for FeedForward {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let hidden = self.up.forward(input)?;
        let activated = self.act.forward(&hidden)?;
        self.down.forward(&activated)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let hidden = self.up.forward(input)?;
        let activated = self.act.forward(&hidden)?;
        let grad_activated = self.down.backward(&activated, grad_output)?;
        let grad_hidden = self.act.backward(&hidden, &grad_activated)?;
        self.up.backward(input, &grad_hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gradcheck::assert_input_gradient;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn feed_forward_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut block = FeedForward::with_rng("mlp", 3, 6, &mut rng).unwrap();
        let input = Tensor::random_normal_with(2, 3, 0.0, 1.0, &mut rng).unwrap();
        assert_input_gradient(&mut block, &input, 2e-2);
    }
}
