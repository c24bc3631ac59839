//! Runtime knobs shared by every crate in the workspace: deterministic seeding
//! and the global tracing subscriber.

pub mod determinism;
pub mod tracing;

pub use self::determinism::{rng_from_label, rng_from_optional, SeedStream};
pub use self::tracing::{init_tracing, init_tracing_with, InitError, TracingOptions};
