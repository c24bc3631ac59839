// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod attention;
pub mod embedding;
pub mod feed_forward;
pub mod gelu;
pub mod linear;
pub mod normalization;

pub use activation::Softsign;
pub use attention::{AttentionMask, MultiHeadAttention};
pub use embedding::Embedding;
pub use feed_forward::FeedForward;
pub use gelu::Gelu;
pub use linear::Linear;
pub use normalization::LayerNorm;

#[cfg(test)]
pub(crate) mod gradcheck {
    use crate::module::Module;
    use crate::Tensor;

    fn upstream(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i % 7) as f32) * 0.25 - 0.6).collect()
    }

    fn objective(module: &dyn Module, input: &Tensor) -> f32 {
        let out = module.forward(input).unwrap();
        out.data().iter().zip(upstream(out.len())).map(|(a, b)| a * b).sum()
    }

    /// Compares `backward` against central differences of `sum(forward(x) * upstream)`.
    pub(crate) fn assert_input_gradient(module: &mut dyn Module, input: &Tensor, tol: f32) {
        let out = module.forward(input).unwrap();
        let (rows, cols) = out.shape();
        let grad_out = Tensor::from_vec(rows, cols, upstream(rows * cols)).unwrap();
        let analytic = module.backward(input, &grad_out).unwrap();
        assert_eq!(analytic.shape(), input.shape());
        let eps = 1e-2f32;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (objective(module, &plus) - objective(module, &minus)) / (2.0 * eps);
            let got = analytic.data()[idx];
            assert!(
                (numeric - got).abs() <= tol * (1.0 + numeric.abs()),
                "index {idx}: numeric {numeric} analytic {got}"
            );
        }
    }
}
