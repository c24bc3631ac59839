mod common;

use common::{modalities, small_config, spikes, traces};
use st_neuro::{
    Batch, ContrastiveConfig, ForwardOptions, MaskingScheme, Modality, ModalityDict, MultiModal,
    NeuroConfig, NeuroError, SessionSpec, TrainingMode,
};
use st_nn::module::Parameterized;

const STEPS: usize = 6;

fn config(moco: bool) -> NeuroConfig {
    small_config(STEPS)
        .with_modalities([Modality::Spike, Modality::Wheel])
        .with_contrastive(ContrastiveConfig {
            enabled: true,
            moco,
            projection_dim: 4,
            queue_size: 8,
            momentum: 0.9,
        })
}

fn model(moco: bool) -> MultiModal {
    let spec = SessionSpec::new("s", 5).with_behaviors([Modality::Wheel]);
    MultiModal::with_sessions(config(moco), [spec]).unwrap()
}

fn dict(steps: usize, seed: u64) -> ModalityDict {
    Batch::single_session(spikes(2 * steps, 5, seed), steps, "s")
        .unwrap()
        .with_wheel(traces(2 * steps, seed + 1))
        .into_modality_dict(&modalities(&[Modality::Spike, Modality::Wheel]))
        .unwrap()
}

#[test]
fn clip_loss_blends_with_the_modal_objective() {
    let mut model = model(false);
    assert!(model.queue().is_none());
    let options =
        ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.5 }, TrainingMode::RandomToken);
    let output = model.forward(&dict(STEPS, 1), &options).unwrap();

    let diagnostics = output.contrastive.expect("contrastive diagnostics");
    assert!(diagnostics.loss > 0.0);
    assert!((0.0..=1.0).contains(&diagnostics.s2b_acc));
    assert!((0.0..=1.0).contains(&diagnostics.b2s_acc));
    let modal: f32 = output.mod_loss.values().sum();
    let expected = 0.5 * modal + 0.5 * diagnostics.loss;
    assert!((output.loss - expected).abs() < 1e-5);

    model.backward(&output).unwrap();
    let mut scale_grad = None;
    model
        .visit_parameters(&mut |p| {
            if p.name() == "contrastive.logit_scale" {
                scale_grad = p.gradient().map(|g| g.data()[0]);
            }
            Ok(())
        })
        .unwrap();
    assert!(scale_grad.map_or(false, f32::is_finite));
}

#[test]
fn moco_forward_advances_the_queue_only_when_asked() {
    let mut model = model(true);
    assert_eq!(model.queue().unwrap().ptr(), 0);
    let options =
        ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.5 }, TrainingMode::RandomToken);

    let output = model.forward(&dict(STEPS, 2), &options).unwrap();
    assert!(output.contrastive.is_some());
    assert_eq!(model.queue().unwrap().ptr(), 2);

    model
        .forward(&dict(STEPS, 3), &ForwardOptions::evaluation(TrainingMode::RandomToken))
        .unwrap();
    assert_eq!(model.queue().unwrap().ptr(), 2);

    for _ in 0..3 {
        model.forward(&dict(STEPS, 4), &options).unwrap();
    }
    // 8 / 2 pushes wrap the pointer.
    assert_eq!(model.queue().unwrap().ptr(), 0);
}

#[test]
fn momentum_snapshot_tracks_the_encoder() {
    let mut model = model(true);
    let live = model.encoder_parameters().unwrap();
    let snapshot = model.momentum().unwrap().values().clone();
    for (name, value) in &live {
        assert_eq!(&snapshot[name], value, "{name}");
    }

    let output = model
        .forward(
            &dict(STEPS, 5),
            &ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.5 }, TrainingMode::RandomToken),
        )
        .unwrap();
    model.backward(&output).unwrap();
    // Forward and backward alone leave both copies where they were.
    assert_eq!(model.encoder_parameters().unwrap(), live);
    model.update_momentum().unwrap();
    let snapshot = model.momentum().unwrap().values();
    for (name, value) in &live {
        for (m, v) in snapshot[name].data().iter().zip(value.data()) {
            assert!((m - v).abs() <= 1e-6 * v.abs().max(1.0), "{name}");
        }
    }
}

#[test]
fn pooling_rejects_short_trials() {
    let mut model = model(false);
    let err = model
        .forward(
            &dict(STEPS - 1, 6),
            &ForwardOptions::new(MaskingScheme::None, TrainingMode::RandomToken),
        )
        .unwrap_err();
    assert!(matches!(err, NeuroError::ShapeMismatch { .. }), "{err}");
}

#[test]
fn contrastive_config_needs_a_behaviour() {
    let err = MultiModal::new(small_config(STEPS).with_contrastive(ContrastiveConfig {
        enabled: true,
        ..ContrastiveConfig::default()
    }))
    .unwrap_err();
    assert!(matches!(err, NeuroError::InvalidConfig(_)));
}
