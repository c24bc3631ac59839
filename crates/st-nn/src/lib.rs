//! High-level neural module API built on top of SpiralTorch primitives.
//!
//! This crate offers a lightweight `nn.Module` style surface: named
//! parameters with gradient accumulators, recompute-style layers, losses that
//! return their own gradients, and optimisers that walk any [`Parameterized`]
//! value by name.

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use io::{load_bincode, load_json, save_bincode, save_json, ModuleSnapshot, StoredTensor};
pub use layers::{
    AttentionMask, Embedding, FeedForward, Gelu, LayerNorm, Linear, MultiHeadAttention, Softsign,
};
pub use loss::{InfoNce, Loss, MeanSquaredError, PoissonNll, SoftmaxCrossEntropy};
pub use module::{Module, Parameter, Parameterized};
pub use optim::{AdamW, AdamWConfig, LrScheduler, OneCycleConfig, OneCycleLr};

pub use st_tensor::{PureResult, Tensor, TensorError};
