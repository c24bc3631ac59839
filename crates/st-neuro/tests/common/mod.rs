#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_neuro::{Batch, Modality, ModalityDict, NeuroConfig, Tensor};
use std::collections::BTreeSet;

/// Spike counts in `0..3`, so the Poisson loss stays non-negative.
pub fn spikes(rows: usize, cols: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::from_fn(rows, cols, |_, _| rng.gen_range(0..3) as f32).unwrap()
}

pub fn traces(rows: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::from_fn(rows, 1, |_, _| rng.gen_range(-1.0..1.0)).unwrap()
}

pub fn small_config(steps: usize) -> NeuroConfig {
    NeuroConfig::default()
        .with_seed(17)
        .with_hidden(16, 2)
        .with_intermediate_size(32)
        .with_layers(1, 1)
        .with_max_time_steps(steps)
        .with_max_sessions(8)
}

pub fn modalities(list: &[Modality]) -> BTreeSet<Modality> {
    list.iter().copied().collect()
}

pub fn spike_dict(
    batch: usize,
    steps: usize,
    neurons: usize,
    eid: &str,
    seed: u64,
) -> ModalityDict {
    Batch::single_session(spikes(batch * steps, neurons, seed), steps, eid)
        .unwrap()
        .into_modality_dict(&modalities(&[Modality::Spike]))
        .unwrap()
}
