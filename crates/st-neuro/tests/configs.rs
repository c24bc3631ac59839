use st_neuro::{FineTunePolicy, MaskingScheme, Modality, ModelMode, NeuroConfig, TrainingMode};
use std::path::PathBuf;

fn shipped(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs").join(name)
}

#[test]
fn pretraining_config_parses() {
    let config = NeuroConfig::from_toml_path(shipped("mm_pretrain.toml")).unwrap();
    assert_eq!(config.model_mode, ModelMode::Mm);
    assert_eq!(
        config.modalities,
        vec![Modality::Spike, Modality::Wheel, Modality::Choice]
    );
    assert!(config.contrastive.enabled && config.contrastive.moco);
    assert_eq!(config.training.schemes.len(), 5);
    assert!(config.training.schemes.contains(&TrainingMode::SelfBehavior));
    assert_eq!(config.optimizer.total_steps, 20_000);
}

#[test]
fn fine_tuning_config_is_encoder_only() {
    let config = NeuroConfig::from_toml_path(shipped("finetune_encoding.toml")).unwrap();
    assert_eq!(config.decoder.layers, 0);
    assert_eq!(config.masker, MaskingScheme::Causal { ratio: 0.2 });
    assert_eq!(config.training.fine_tune, FineTunePolicy::AdaptersOnly);
    // Unlisted sections keep their defaults.
    assert_eq!(config.embedder.max_time_steps, 100);
}

#[test]
fn toml_round_trip_preserves_the_config() {
    let config = NeuroConfig::from_toml_path(shipped("mm_pretrain.toml")).unwrap();
    let text = config.to_toml_string().unwrap();
    assert_eq!(NeuroConfig::from_toml_str(&text).unwrap(), config);
}
