mod common;

use common::{modalities, small_config, spike_dict, spikes};
use st_neuro::sequence::{ContextWindow, Sequence, StreamTokens};
use st_neuro::transformer::{EncoderLayer, StackShape};
use st_neuro::{
    Batch, ForwardOptions, MaskingScheme, ModalFilter, Modality, ModelMode, MultiModal, NeuroConfig,
    NeuroError, SessionSpec, TrainingMode,
};
use st_nn::module::Parameterized;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn single_session_encoding_run_predicts_every_neuron() {
    let config = NeuroConfig::default()
        .with_seed(1)
        .with_hidden(32, 4)
        .with_intermediate_size(64)
        .with_model_mode(ModelMode::Encoding)
        .with_masker(MaskingScheme::Temporal { ratio: 0.1 });
    let mut model = MultiModal::with_sessions(config, [SessionSpec::new("ses-a", 50)]).unwrap();
    let dict = spike_dict(4, 100, 50, "ses-a", 2);
    let options =
        ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.1 }, TrainingMode::RandomToken);

    let output = model.forward(&dict, &options).unwrap();
    assert!(output.mod_loss[&Modality::Spike] >= 0.0);
    assert_eq!(output.mod_preds[&Modality::Spike].dims(), (4, 100, 50));
    // 10 hidden steps per example, all 50 channels each.
    assert_eq!(output.mod_n_examples[&Modality::Spike], 4 * 10 * 50);
    assert!(output.loss.is_finite());
}

#[test]
fn sessions_of_different_width_keep_their_own_adapters() {
    let config = small_config(12);
    let mut model = MultiModal::with_sessions(
        config,
        [SessionSpec::new("ses-40", 40), SessionSpec::new("ses-70", 70)],
    )
    .unwrap();
    let options =
        ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.5 }, TrainingMode::RandomToken);

    let narrow = model.forward(&spike_dict(2, 12, 40, "ses-40", 3), &options).unwrap();
    assert_eq!(narrow.mod_preds[&Modality::Spike].dims(), (2, 12, 40));
    let wide = model.forward(&spike_dict(2, 12, 70, "ses-70", 4), &options).unwrap();
    assert_eq!(wide.mod_preds[&Modality::Spike].dims(), (2, 12, 70));

    // Gradients from a ses-40 batch never reach ses-70 adapters.
    model.backward(&narrow).unwrap();
    model
        .visit_parameters(&mut |p| {
            let touched = p.gradient().map_or(false, |g| g.squared_l2_norm() > 0.0);
            if p.name().contains(".ses-70.") {
                assert!(!touched, "{} received a gradient", p.name());
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn mixed_session_batch_leaves_padding_channels_empty() {
    let mut model = MultiModal::with_sessions(
        small_config(6),
        [SessionSpec::new("narrow", 3), SessionSpec::new("wide", 5)],
    )
    .unwrap();
    let batch = Batch::new(spikes(2 * 6, 5, 9), 6, vec!["narrow".into(), "wide".into()]).unwrap();
    let dict = batch.into_modality_dict(&modalities(&[Modality::Spike])).unwrap();
    let output = model
        .forward(&dict, &ForwardOptions::new(MaskingScheme::None, TrainingMode::Encoding))
        .unwrap();
    let preds = &output.mod_preds[&Modality::Spike];
    for t in 0..6 {
        assert_eq!(&preds.at(0, t).unwrap()[3..], &[0.0, 0.0]);
    }
    // Encoding hides every spike token: 6 * 3 + 6 * 5 scored entries.
    assert_eq!(output.mod_n_examples[&Modality::Spike], 6 * 3 + 6 * 5);
}

#[test]
fn choice_cross_entropy_and_argmax_agree_with_logits() {
    let steps = 8;
    let config = small_config(steps)
        .with_modalities([Modality::Spike, Modality::Choice])
        .with_model_mode(ModelMode::Decoding);
    let spec = SessionSpec::new("ses-c", 6).with_behaviors([Modality::Choice]);
    let mut model = MultiModal::with_sessions(config, [spec]).unwrap();
    let dict = Batch::single_session(spikes(3 * steps, 6, 5), steps, "ses-c")
        .unwrap()
        .with_choice(vec![0, 0, 0])
        .into_modality_dict(&modalities(&[Modality::Spike, Modality::Choice]))
        .unwrap();

    let output = model
        .forward(&dict, &ForwardOptions::new(MaskingScheme::None, TrainingMode::Decoding))
        .unwrap();
    let logits = &output.mod_preds[&Modality::Choice];
    assert_eq!(logits.dims(), (3, 1, 2));
    let expected: f32 = (0..3)
        .map(|b| {
            let row = logits.values.row(b).unwrap();
            let p0 = row[0].exp() / (row[0].exp() + row[1].exp());
            -p0.ln()
        })
        .sum::<f32>()
        / 3.0;
    assert!((output.mod_loss[&Modality::Choice] - expected).abs() < 1e-5);
    assert_eq!(output.mod_n_examples[&Modality::Choice], 3);
    let argmax = &output.mod_argmax[&Modality::Choice];
    for b in 0..3 {
        let row = logits.values.row(b).unwrap();
        assert_eq!(argmax[b], usize::from(row[1] > row[0]));
    }
}

#[test]
fn causal_scheme_never_attends_to_the_future() {
    let steps = 5;
    let ts: Vec<usize> = (0..2).flat_map(|_| 0..steps).collect();
    let sequence = Sequence::build(
        2,
        &[
            StreamTokens {
                modality: Modality::Spike,
                steps,
                timestamps: &ts,
                keys: vec![true; 2 * steps],
            },
            StreamTokens {
                modality: Modality::Wheel,
                steps,
                timestamps: &ts,
                keys: vec![true; 2 * steps],
            },
        ],
    )
    .unwrap();
    let mask = sequence.encoder_mask(ContextWindow::default().causal());
    let shape = StackShape {
        hidden: 8,
        heads: 2,
        inner: 16,
        layers: 1,
        epsilon: 1e-5,
    };
    let layer = EncoderLayer::with_rng("causal", shape, &mut StdRng::seed_from_u64(4)).unwrap();
    let x = spikes(2 * sequence.len, 8, 6);
    let maps = layer.attention_probabilities(&x, 2, &mask).unwrap();
    assert_eq!(maps.len(), 2 * 2);
    for (idx, map) in maps.iter().enumerate() {
        let b = idx / 2;
        for i in 0..sequence.len {
            for j in 0..sequence.len {
                let (tq, tk) = (
                    sequence.timestamps[b * sequence.len + i],
                    sequence.timestamps[b * sequence.len + j],
                );
                if tk > tq {
                    assert_eq!(map.row(i).unwrap()[j], 0.0, "b{b} q{i} k{j}");
                }
            }
        }
    }
}

#[test]
fn nothing_hidden_gives_exact_zero_loss() {
    let mut model = MultiModal::with_sessions(small_config(6), [SessionSpec::new("s", 4)]).unwrap();
    let output = model
        .forward(
            &spike_dict(2, 6, 4, "s", 1),
            &ForwardOptions::new(MaskingScheme::None, TrainingMode::RandomToken),
        )
        .unwrap();
    assert_eq!(output.mod_loss[&Modality::Spike], 0.0);
    assert_eq!(output.mod_n_examples[&Modality::Spike], 0);
    assert_eq!(output.loss, 0.0);
}

#[test]
fn unregistered_session_is_fatal() {
    let mut model = MultiModal::with_sessions(small_config(6), [SessionSpec::new("s", 4)]).unwrap();
    let err = model
        .forward(
            &spike_dict(1, 6, 4, "ghost", 1),
            &ForwardOptions::new(MaskingScheme::None, TrainingMode::RandomToken),
        )
        .unwrap_err();
    assert_eq!(err, NeuroError::UnknownSession { eid: "ghost".into() });
}

#[test]
fn unconfigured_modality_in_filter_is_rejected() {
    let mut model = MultiModal::with_sessions(small_config(6), [SessionSpec::new("s", 4)]).unwrap();
    let options = ForwardOptions::new(MaskingScheme::None, TrainingMode::RandomToken)
        .with_filter(ModalFilter::new([Modality::Spike], [Modality::Wheel]));
    let err = model.forward(&spike_dict(1, 6, 4, "s", 1), &options).unwrap_err();
    assert_eq!(err, NeuroError::UnsupportedModality("wheel".into()));
}

#[test]
fn withheld_behavior_is_scored_without_encoder_tokens() {
    let steps = 6;
    let config = small_config(steps).with_modalities([Modality::Spike, Modality::Wheel]);
    let spec = SessionSpec::new("s", 4).with_behaviors([Modality::Wheel]);
    let mut model = MultiModal::with_sessions(config, [spec]).unwrap();
    let dict = Batch::single_session(spikes(2 * steps, 4, 3), steps, "s")
        .unwrap()
        .with_wheel(common::traces(2 * steps, 4))
        .into_modality_dict(&modalities(&[Modality::Spike, Modality::Wheel]))
        .unwrap();
    let options = ForwardOptions::new(MaskingScheme::None, TrainingMode::SelfSpike)
        .with_withheld(Modality::Wheel);
    let output = model.forward(&dict, &options).unwrap();
    let wheel_mask = output.tape.mask(Modality::Wheel).unwrap();
    assert_eq!(wheel_mask.hidden_tokens(), 2 * steps);
    assert_eq!(output.mod_n_examples[&Modality::Wheel], 2 * steps);
    assert!(output.mod_loss[&Modality::Wheel] > 0.0);
    model.backward(&output).unwrap();
}

#[test]
fn hidden_tokens_remain_attention_keys() {
    let steps = 6;
    let config = small_config(steps).with_modalities([Modality::Spike, Modality::Wheel]);
    let spec = SessionSpec::new("s", 4).with_behaviors([Modality::Wheel]);
    let mut model = MultiModal::with_sessions(config, [spec]).unwrap();
    let dict = Batch::single_session(spikes(2 * steps, 4, 5), steps, "s")
        .unwrap()
        .with_wheel(common::traces(2 * steps, 6))
        .into_modality_dict(&modalities(&[Modality::Spike, Modality::Wheel]))
        .unwrap();
    let options = ForwardOptions::new(MaskingScheme::None, TrainingMode::SelfSpike)
        .with_withheld(Modality::Wheel);
    let output = model.forward(&dict, &options).unwrap();
    assert_eq!(output.tape.mask(Modality::Wheel).unwrap().hidden_tokens(), 2 * steps);

    let sequence = output.tape.encoder_sequence();
    let spike = sequence.segment(Modality::Spike).unwrap().offset;
    let wheel = sequence.segment(Modality::Wheel).unwrap().offset;
    let mask = output.tape.encoder_mask();
    for b in 0..2 {
        for t in 0..steps {
            assert!(mask.allows(b, spike, wheel + t), "example {b} step {t}");
            assert!(mask.allows(b, wheel + t, spike));
        }
    }
}

#[test]
fn encoder_only_model_scores_heads_off_the_encoder() {
    let config = small_config(6).with_layers(1, 0);
    let mut model = MultiModal::with_sessions(config, [SessionSpec::new("s", 4)]).unwrap();
    let output = model
        .forward(
            &spike_dict(2, 6, 4, "s", 8),
            &ForwardOptions::new(MaskingScheme::Temporal { ratio: 0.5 }, TrainingMode::RandomToken),
        )
        .unwrap();
    assert_eq!(output.mod_n_examples[&Modality::Spike], 2 * 3 * 4);
    model.backward(&output).unwrap();
}
