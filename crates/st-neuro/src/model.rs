// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The session-adaptive multimodal transformer.
//!
//! A forward call masks every modality, stitches session-specific channels
//! into the shared width, runs the encoder over the concatenated input
//! streams, optionally runs the decoder against that context, and scores the
//! per-modality heads. Everything [`MultiModal::backward`] needs is recorded
//! on the returned [`ForwardTape`], so the two calls must see the same
//! parameter values.

use crate::batch::{ModalityDict, ModalityEntry};
use crate::config::{FineTunePolicy, NeuroConfig};
use crate::contrastive::{
    pool_segments, unpool_segments, ContrastiveDiagnostics, ContrastiveHead, ContrastiveOutcome,
    Embeddings, MomentumEncoder, MomentumQueue,
};
use crate::embed::SideEmbedding;
use crate::heads::{modality_loss, LossReduction, Prediction};
use crate::masker::{MaskOutcome, Masker, MaskingScheme};
use crate::modality::Modality;
use crate::mode::{ModalFilter, TrainingMode};
use crate::sequence::{ContextWindow, Sequence, StreamTokens};
use crate::session::{SessionRegistry, SessionSpec};
use crate::stitch::{
    decode_stream, decode_stream_backward, encode_stream, encode_stream_backward, Adapter,
    StitchDecoder, StitchEncoder, StreamLayout,
};
use crate::transformer::{DecoderInputs, DecoderStack, EncoderStack, StackShape, StackTrace};
use crate::{NeuroError, NeuroResult, Tensor};
use rand::Rng;
use spiral_config::SeedStream;
use st_nn::layers::{AttentionMask, Embedding, Linear};
use st_nn::module::{Module, Parameter, Parameterized};
use st_tensor::PureResult;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Per-call selectors threaded explicitly through [`MultiModal::forward`].
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOptions {
    pub scheme: MaskingScheme,
    pub training_mode: TrainingMode,
    /// Input modality hidden from the encoder entirely.
    pub withheld: Option<Modality>,
    /// Overrides the filter implied by the configured model mode.
    pub filter: Option<ModalFilter>,
    /// Advance the momentum queue after scoring.
    pub enqueue: bool,
}

impl ForwardOptions {
    pub fn new(scheme: MaskingScheme, training_mode: TrainingMode) -> Self {
        Self {
            scheme,
            training_mode,
            withheld: None,
            filter: None,
            enqueue: true,
        }
    }

    /// Full-context pass that leaves the queue untouched.
    pub fn evaluation(training_mode: TrainingMode) -> Self {
        Self {
            enqueue: false,
            ..Self::new(MaskingScheme::None, training_mode)
        }
    }

    pub fn with_withheld(mut self, modality: Modality) -> Self {
        self.withheld = Some(modality);
        self
    }

    pub fn with_filter(mut self, filter: ModalFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Result of one forward call.
#[derive(Debug, Clone)]
pub struct MultiModalOutput {
    pub loss: f32,
    /// Normalised loss of every output modality.
    pub mod_loss: BTreeMap<Modality, f32>,
    /// Loss-eligible entries per output modality.
    pub mod_n_examples: BTreeMap<Modality, usize>,
    pub mod_preds: BTreeMap<Modality, Prediction>,
    pub mod_targets: BTreeMap<Modality, Tensor>,
    /// Predicted classes for label modalities.
    pub mod_argmax: BTreeMap<Modality, Vec<usize>>,
    pub contrastive: Option<ContrastiveDiagnostics>,
    pub tape: ForwardTape,
}

#[derive(Debug, Clone)]
struct StreamState {
    layout: StreamLayout,
    outcome: MaskOutcome,
    timestamps: Vec<usize>,
    /// Dense session index of every token.
    sessions: Vec<usize>,
}

#[derive(Debug, Clone)]
struct EncoderPass {
    sequence: Sequence,
    mask: AttentionMask,
    embeddings: Tensor,
    trace: StackTrace,
}

#[derive(Debug, Clone)]
struct DecoderPass {
    sequence: Sequence,
    self_mask: AttentionMask,
    cross_mask: AttentionMask,
    context: Tensor,
    trace: StackTrace,
}

#[derive(Debug, Clone)]
struct HeadState {
    hidden: Tensor,
    /// Gradient of the total loss with respect to the predictions.
    grad: Tensor,
}

#[derive(Debug, Clone)]
struct ContrastiveTape {
    behaviors: Vec<Modality>,
    pooled_spike: Tensor,
    pooled_behavior: Tensor,
    live: Embeddings,
    outcome: ContrastiveOutcome,
    weight: f32,
}

/// Activations and loss gradients recorded by a forward call.
#[derive(Debug, Clone)]
pub struct ForwardTape {
    streams: BTreeMap<Modality, StreamState>,
    inputs: Vec<Modality>,
    outputs: Vec<Modality>,
    encoder: EncoderPass,
    decoder: Option<DecoderPass>,
    heads: BTreeMap<Modality, HeadState>,
    contrastive: Option<ContrastiveTape>,
}

impl ForwardTape {
    /// Hide mask applied to `modality` during the call.
    pub fn mask(&self, modality: Modality) -> Option<&MaskOutcome> {
        self.streams.get(&modality).map(|s| &s.outcome)
    }

    /// Encoder attention mask over the concatenated input sequence.
    pub fn encoder_mask(&self) -> &AttentionMask {
        &self.encoder.mask
    }

    pub fn encoder_sequence(&self) -> &Sequence {
        &self.encoder.sequence
    }
}

fn zero_rows(tensor: &mut Tensor, hide: &[bool]) -> PureResult<()> {
    for (row, hidden) in hide.iter().enumerate() {
        if *hidden {
            tensor.row_mut(row)?.fill(0.0);
        }
    }
    Ok(())
}

fn missing_adapter(modality: Modality) -> NeuroError {
    NeuroError::MissingModality(format!(
        "{modality} has no adapter; register a session carrying it"
    ))
}

/// Stitch encoders, embeddings and the encoder stack. This is the parameter
/// set the momentum snapshot mirrors.
#[derive(Debug, Clone)]
struct EncoderSide {
    stitch: BTreeMap<Modality, Adapter<StitchEncoder>>,
    embed: SideEmbedding,
    /// Shared with the decoder side.
    modality_table: Embedding,
    stack: EncoderStack,
}

impl EncoderSide {
    fn run(
        &self,
        dict: &ModalityDict,
        streams: &BTreeMap<Modality, StreamState>,
        inputs: &[Modality],
        window: ContextWindow,
        hidden: usize,
    ) -> NeuroResult<EncoderPass> {
        let mut tokens = Vec::with_capacity(inputs.len());
        let mut embeddings = Vec::with_capacity(inputs.len());
        let mut metas = Vec::with_capacity(inputs.len());
        for &m in inputs {
            let (entry, state) = (&dict[&m], &streams[&m]);
            let adapter = self.stitch.get(&m).ok_or_else(|| missing_adapter(m))?;
            let mut tok = encode_stream(adapter, &state.layout, &state.outcome.masked, hidden)?;
            zero_rows(&mut tok, &state.outcome.token_hide)?;
            tokens.push(tok);
            embeddings.push(self.embed.embed(
                &self.modality_table,
                m,
                &entry.timestamps,
                &state.sessions,
            )?);
            metas.push(StreamTokens {
                modality: m,
                steps: entry.steps(),
                timestamps: &entry.timestamps,
                keys: entry.attn_mask.clone(),
            });
        }
        let batch = metas.first().map(|_| dict[&inputs[0]].batch()).unwrap_or(0);
        let sequence = Sequence::build(batch, &metas)?;
        let mut x0 = sequence.concat(&tokens.iter().collect::<Vec<_>>())?;
        let embeddings = sequence.concat(&embeddings.iter().collect::<Vec<_>>())?;
        x0.add_scaled(&embeddings, 1.0)?;
        let mask = sequence.encoder_mask(window);
        let trace = self.stack.forward(&x0, batch, &mask)?;
        Ok(EncoderPass {
            sequence,
            mask,
            embeddings,
            trace,
        })
    }
}

impl Parameterized for EncoderSide {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for adapter in self.stitch.values() {
            adapter.visit_parameters(visitor)?;
        }
        self.embed.visit_parameters(visitor)?;
        self.modality_table.visit_parameters(visitor)?;
        self.stack.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for adapter in self.stitch.values_mut() {
            adapter.visit_parameters_mut(visitor)?;
        }
        self.embed.visit_parameters_mut(visitor)?;
        self.modality_table.visit_parameters_mut(visitor)?;
        self.stack.visit_parameters_mut(visitor)
    }
}

#[derive(Debug, Clone)]
struct DecoderSide {
    stitch: BTreeMap<Modality, Adapter<StitchEncoder>>,
    embed: SideEmbedding,
    context: Linear,
    stack: DecoderStack,
}

struct DecoderRequest<'a> {
    dict: &'a ModalityDict,
    streams: &'a BTreeMap<Modality, StreamState>,
    outputs: &'a [Modality],
    encoder: &'a EncoderPass,
    modality_table: &'a Embedding,
    causal: bool,
    separate: bool,
    hidden: usize,
}

impl DecoderSide {
    fn run(&self, req: DecoderRequest<'_>) -> NeuroResult<DecoderPass> {
        let mut queries = Vec::with_capacity(req.outputs.len());
        let mut metas = Vec::with_capacity(req.outputs.len());
        for &m in req.outputs {
            let (entry, state) = (&req.dict[&m], &req.streams[&m]);
            let adapter = self.stitch.get(&m).ok_or_else(|| missing_adapter(m))?;
            let mut query =
                encode_stream(adapter, &state.layout, &state.outcome.masked, req.hidden)?;
            zero_rows(&mut query, &state.outcome.token_hide)?;
            query.add_scaled(
                &self.embed.embed(req.modality_table, m, &entry.timestamps, &state.sessions)?,
                1.0,
            )?;
            queries.push(query);
            metas.push(StreamTokens {
                modality: m,
                steps: entry.steps(),
                timestamps: &entry.timestamps,
                keys: entry.attn_mask.clone(),
            });
        }
        let batch = req.encoder.sequence.batch;
        let sequence = Sequence::build(batch, &metas)?;
        let y0 = sequence.concat(&queries.iter().collect::<Vec<_>>())?;
        let mut context = self.context.forward(&req.encoder.trace.output)?;
        context.add_scaled(&req.encoder.embeddings, 1.0)?;
        let self_mask = sequence.decoder_self_mask(req.causal, req.separate);
        let cross_mask = sequence.cross_mask(&req.encoder.sequence, req.causal);
        let trace = self.stack.forward(
            &y0,
            &DecoderInputs {
                batch,
                self_mask: &self_mask,
                cross_mask: &cross_mask,
                context: &context,
            },
        )?;
        Ok(DecoderPass {
            sequence,
            self_mask,
            cross_mask,
            context,
            trace,
        })
    }
}

impl Parameterized for DecoderSide {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for adapter in self.stitch.values() {
            adapter.visit_parameters(visitor)?;
        }
        self.embed.visit_parameters(visitor)?;
        self.context.visit_parameters(visitor)?;
        self.stack.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for adapter in self.stitch.values_mut() {
            adapter.visit_parameters_mut(visitor)?;
        }
        self.embed.visit_parameters_mut(visitor)?;
        self.context.visit_parameters_mut(visitor)?;
        self.stack.visit_parameters_mut(visitor)
    }
}

/// Adapter units built for one session before it is committed to the arena.
struct SessionUnits {
    encoder: Vec<(Modality, StitchEncoder)>,
    decoder: Vec<(Modality, StitchEncoder)>,
    heads: Vec<(Modality, StitchDecoder)>,
}

fn adapter_name(side: &str, m: Modality, role: &str, eid: Option<&str>) -> String {
    match eid {
        Some(eid) => format!("{side}.{m}.{role}.{eid}"),
        None => format!("{side}.{m}.{role}"),
    }
}

fn install<U: Module>(
    map: &mut BTreeMap<Modality, Adapter<U>>,
    modality: Modality,
    session: usize,
    unit: Option<U>,
) {
    match map.get_mut(&modality) {
        Some(adapter) if adapter.is_stitched() => adapter.allocate(session, unit),
        Some(_) => {}
        None => {
            if let Some(unit) = unit {
                map.insert(modality, Adapter::plain(unit));
            }
        }
    }
}

fn thaw_session<U: Module>(
    map: &mut BTreeMap<Modality, Adapter<U>>,
    session: usize,
) -> PureResult<()> {
    let thaw = &mut |p: &mut Parameter| {
        p.set_frozen(false);
        Ok(())
    };
    for adapter in map.values_mut() {
        if adapter.is_stitched() {
            adapter.visit_session_mut(session, thaw)?;
        } else {
            adapter.visit_parameters_mut(thaw)?;
        }
    }
    Ok(())
}

/// Shared backbone plus per-session adapters.
#[derive(Debug)]
pub struct MultiModal {
    config: NeuroConfig,
    registry: SessionRegistry,
    seeds: SeedStream,
    masker: Masker,
    encoder: EncoderSide,
    decoder: Option<DecoderSide>,
    heads: BTreeMap<Modality, Adapter<StitchDecoder>>,
    contrastive: Option<ContrastiveHead>,
    momentum: Option<MomentumEncoder>,
    queue: Option<MomentumQueue>,
}

impl MultiModal {
    pub fn new(config: NeuroConfig) -> NeuroResult<Self> {
        config.validate()?;
        let seeds = SeedStream::new(config.seed);
        let mut rng = seeds.rng("st-neuro/backbone");
        let enc = config.encoder;
        let emb = config.embedder;
        let hidden = enc.hidden_size;
        let shape = StackShape {
            hidden,
            heads: enc.heads,
            inner: enc.intermediate_size,
            layers: enc.layers,
            epsilon: enc.layer_norm_eps,
        };
        let arena = |stitching: bool| -> BTreeMap<Modality, Adapter<StitchEncoder>> {
            if stitching {
                config
                    .modalities
                    .iter()
                    .map(|&m| (m, Adapter::stitched(emb.max_sessions)))
                    .collect()
            } else {
                BTreeMap::new()
            }
        };

        let encoder = EncoderSide {
            stitch: arena(enc.stitching),
            embed: SideEmbedding::with_rng(
                "encoder.embed",
                emb.max_time_steps,
                emb.max_sessions,
                hidden,
                &mut rng,
            )?,
            modality_table: Embedding::with_rng(
                "embed.modality",
                Modality::ALL.len(),
                hidden,
                &mut rng,
            )?,
            stack: EncoderStack::with_rng("encoder", shape, &mut rng)?,
        };
        let decoder = if config.decoder.layers > 0 {
            Some(DecoderSide {
                stitch: arena(config.decoder.stitching),
                embed: SideEmbedding::with_rng(
                    "decoder.embed",
                    emb.max_time_steps,
                    emb.max_sessions,
                    hidden,
                    &mut rng,
                )?,
                context: Linear::with_rng("decoder.context", hidden, hidden, &mut rng)?,
                stack: DecoderStack::with_rng(
                    "decoder",
                    StackShape {
                        layers: config.decoder.layers,
                        ..shape
                    },
                    &mut rng,
                )?,
            })
        } else {
            None
        };
        let heads = if config.decoder.stitching {
            config
                .modalities
                .iter()
                .map(|&m| (m, Adapter::stitched(emb.max_sessions)))
                .collect()
        } else {
            BTreeMap::new()
        };

        let cfg = config.contrastive;
        let (contrastive, momentum, queue) = if cfg.enabled {
            let behaviors = config.modalities.iter().filter(|m| m.is_behavior()).count();
            let per_stream = emb.max_time_steps * hidden;
            let head = ContrastiveHead::with_rng(
                "contrastive",
                per_stream,
                behaviors * per_stream,
                cfg.projection_dim,
                &mut rng,
            )?;
            if cfg.moco {
                let mut queue_rng = seeds.rng("st-neuro/queue");
                (
                    Some(head),
                    Some(MomentumEncoder::new(&encoder, cfg.momentum)?),
                    Some(MomentumQueue::with_rng(
                        cfg.queue_size,
                        cfg.projection_dim,
                        &mut queue_rng,
                    )?),
                )
            } else {
                (Some(head), None, None)
            }
        } else {
            (None, None, None)
        };

        let masker = Masker::with_rng(seeds.rng("st-neuro/masker"));
        let registry = SessionRegistry::with_capacity(emb.max_sessions);
        info!(
            hidden,
            encoder_layers = enc.layers,
            decoder_layers = config.decoder.layers,
            contrastive = cfg.enabled,
            moco = cfg.enabled && cfg.moco,
            "built multimodal model"
        );
        Ok(Self {
            config,
            registry,
            seeds,
            masker,
            encoder,
            decoder,
            heads,
            contrastive,
            momentum,
            queue,
        })
    }

    /// Builds the model and registers the pretraining sessions, all trainable.
    pub fn with_sessions(
        config: NeuroConfig,
        sessions: impl IntoIterator<Item = SessionSpec>,
    ) -> NeuroResult<Self> {
        let mut model = Self::new(config)?;
        for spec in sessions {
            model.register_session(spec, FineTunePolicy::Full)?;
        }
        Ok(model)
    }

    pub fn config(&self) -> &NeuroConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn momentum(&self) -> Option<&MomentumEncoder> {
        self.momentum.as_ref()
    }

    pub fn momentum_mut(&mut self) -> Option<&mut MomentumEncoder> {
        self.momentum.as_mut()
    }

    pub fn queue(&self) -> Option<&MomentumQueue> {
        self.queue.as_ref()
    }

    pub(crate) fn set_queue(&mut self, queue: MomentumQueue) {
        self.queue = Some(queue);
    }

    /// Replaces the momentum snapshot and seeds entries for parameters it lacks.
    pub(crate) fn restore_momentum(&mut self, values: HashMap<String, Tensor>) -> NeuroResult<()> {
        if let Some(momentum) = &mut self.momentum {
            momentum.restore(values);
            momentum.adopt(&self.encoder)?;
        }
        Ok(())
    }

    /// `exp(logit_scale)` of the contrastive head.
    pub fn temperature(&self) -> Option<f32> {
        self.contrastive.as_ref().map(ContrastiveHead::temperature)
    }

    fn build_units<R: Rng + ?Sized>(
        &self,
        spec: &SessionSpec,
        rng: &mut R,
    ) -> NeuroResult<SessionUnits> {
        let hidden = self.config.encoder.hidden_size;
        let steps = self.config.embedder.max_time_steps;
        let scale = self.config.embedder.activation_scale;
        let mut units = SessionUnits {
            encoder: Vec::new(),
            decoder: Vec::new(),
            heads: Vec::new(),
        };
        let stitch_enc = self.config.encoder.stitching;
        let stitch_dec = self.config.decoder.stitching;
        for &m in &self.config.modalities {
            let Some(width) = spec.width(m) else { continue };
            let encoder_unit = |name: String, rng: &mut R| -> PureResult<StitchEncoder> {
                if m.is_static() {
                    StitchEncoder::label(&name, steps, hidden, scale, rng)
                } else {
                    StitchEncoder::tokens(&name, width, hidden, scale, rng)
                }
            };

            match self.encoder.stitch.get(&m) {
                Some(adapter) if !adapter.is_stitched() => {
                    let shared = adapter.unit(0, &spec.eid)?.channels();
                    if !m.is_static() && shared != width {
                        return Err(NeuroError::InvalidConfig(format!(
                            "shared {m} adapter expects {shared} channels, session {} has {width}",
                            spec.eid
                        )));
                    }
                }
                _ => {
                    let eid = stitch_enc.then_some(spec.eid.as_str());
                    let unit = encoder_unit(adapter_name("encoder", m, "stitch", eid), &mut *rng)?;
                    units.encoder.push((m, unit));
                }
            }

            if let Some(decoder) = &self.decoder {
                match decoder.stitch.get(&m) {
                    Some(adapter) if !adapter.is_stitched() => {
                        let shared = adapter.unit(0, &spec.eid)?.channels();
                        if !m.is_static() && shared != width {
                            return Err(NeuroError::InvalidConfig(format!(
                                "shared {m} decoder adapter expects {shared} channels, \
                                 session {} has {width}",
                                spec.eid
                            )));
                        }
                    }
                    _ => {
                        let eid = stitch_dec.then_some(spec.eid.as_str());
                        let name = adapter_name("decoder", m, "stitch", eid);
                        units.decoder.push((m, encoder_unit(name, &mut *rng)?));
                    }
                }
            }

            match self.heads.get(&m) {
                Some(adapter) if !adapter.is_stitched() => {
                    let shared = adapter.unit(0, &spec.eid)?.output_width();
                    if shared != width {
                        return Err(NeuroError::InvalidConfig(format!(
                            "shared {m} head emits {shared} channels, session {} has {width}",
                            spec.eid
                        )));
                    }
                }
                _ => {
                    let eid = stitch_dec.then_some(spec.eid.as_str());
                    let name = adapter_name("decoder", m, "head", eid);
                    let unit = if m.is_static() {
                        StitchDecoder::label(&name, hidden, steps, width, &mut *rng)?
                    } else {
                        StitchDecoder::tokens(&name, hidden, width, &mut *rng)?
                    };
                    units.heads.push((m, unit));
                }
            }
        }
        Ok(units)
    }

    /// Allocates fresh adapters for `spec` and applies `policy`. Existing
    /// sessions' parameters are never touched.
    pub fn register_session(
        &mut self,
        spec: SessionSpec,
        policy: FineTunePolicy,
    ) -> NeuroResult<usize> {
        spec.validate()?;
        if self.registry.contains(&spec.eid) {
            return Err(NeuroError::DuplicateSession { eid: spec.eid });
        }
        if self.registry.len() >= self.registry.capacity() {
            return Err(NeuroError::SessionCapacityExceeded {
                capacity: self.registry.capacity(),
            });
        }
        let mut rng = self.seeds.rng(&format!("st-neuro/session/{}", spec.eid));
        let units = self.build_units(&spec, &mut rng)?;
        let eid = spec.eid.clone();
        let session = self.registry.register(spec)?;

        let mut encoder_units: BTreeMap<Modality, StitchEncoder> =
            units.encoder.into_iter().collect();
        let mut decoder_units: BTreeMap<Modality, StitchEncoder> =
            units.decoder.into_iter().collect();
        let mut head_units: BTreeMap<Modality, StitchDecoder> = units.heads.into_iter().collect();
        for &m in &self.config.modalities {
            install(&mut self.encoder.stitch, m, session, encoder_units.remove(&m));
            if let Some(decoder) = &mut self.decoder {
                install(&mut decoder.stitch, m, session, decoder_units.remove(&m));
            }
            install(&mut self.heads, m, session, head_units.remove(&m));
        }

        if policy == FineTunePolicy::AdaptersOnly {
            self.visit_parameters_mut(&mut |p| {
                p.set_frozen(true);
                Ok(())
            })?;
            thaw_session(&mut self.encoder.stitch, session)?;
            if let Some(decoder) = &mut self.decoder {
                thaw_session(&mut decoder.stitch, session)?;
            }
            thaw_session(&mut self.heads, session)?;
        }
        if let Some(momentum) = &mut self.momentum {
            momentum.adopt(&self.encoder)?;
        }
        info!(session = %eid, index = session, ?policy, "registered session");
        Ok(session)
    }

    fn layout(&self, entry: &ModalityEntry) -> NeuroResult<StreamLayout> {
        let m = entry.modality();
        let max = self.config.embedder.max_time_steps;
        if entry.steps() > max {
            return Err(NeuroError::TimestampOutOfRange {
                timestamp: entry.steps() - 1,
                max,
            });
        }
        let mut sessions = Vec::with_capacity(entry.batch());
        let mut widths = Vec::with_capacity(entry.batch());
        for eid in &entry.eids {
            let session = self.registry.index_of(eid)?;
            let spec = self.registry.lookup(eid)?;
            let width = spec
                .width(m)
                .ok_or_else(|| NeuroError::MissingModality(format!("{m} for session {eid}")))?;
            if !m.is_static() && width > entry.width() {
                return Err(NeuroError::shape(
                    format!("{m} channels for session {eid}"),
                    (entry.inputs.rows(), width),
                    entry.inputs.shape(),
                ));
            }
            sessions.push(session);
            widths.push(width);
        }
        Ok(StreamLayout {
            batch: entry.batch(),
            steps: entry.steps(),
            sessions,
            eids: entry.eids.clone(),
            widths,
            labels: m.is_static(),
        })
    }

    fn resolve_filter(&self, options: &ForwardOptions) -> NeuroResult<ModalFilter> {
        let filter = match &options.filter {
            Some(filter) => filter.clone(),
            None => self.config.modal_filter()?,
        };
        if filter.inputs.is_empty() || filter.outputs.is_empty() {
            return Err(NeuroError::InvalidConfig("modal filter needs inputs and outputs".into()));
        }
        let unknown = filter
            .modalities()
            .into_iter()
            .find(|m| !self.config.modalities.contains(m));
        if let Some(m) = unknown {
            return Err(NeuroError::UnsupportedModality(m.to_string()));
        }
        if self.decoder.is_none() {
            if let Some(m) = filter.outputs.iter().find(|m| !filter.inputs.contains(m)) {
                return Err(NeuroError::InvalidConfig(format!(
                    "encoder-only model cannot predict {m}: it is not an input"
                )));
            }
        }
        Ok(filter)
    }

    pub fn forward(
        &mut self,
        dict: &ModalityDict,
        options: &ForwardOptions,
    ) -> NeuroResult<MultiModalOutput> {
        options.scheme.validate()?;
        let filter = self.resolve_filter(options)?;
        let inputs: Vec<Modality> = filter.inputs.iter().copied().collect();
        let outputs: Vec<Modality> = filter.outputs.iter().copied().collect();
        let hidden = self.config.encoder.hidden_size;

        let mut reference: Option<(usize, &[String])> = None;
        let mut streams = BTreeMap::new();
        for m in filter.modalities() {
            let entry = dict
                .get(&m)
                .ok_or_else(|| NeuroError::MissingModality(m.to_string()))?;
            match reference {
                Some((batch, eids)) if batch != entry.batch() || eids != entry.eids.as_slice() => {
                    return Err(NeuroError::shape(
                        format!("{m} batch"),
                        (batch, entry.steps()),
                        (entry.batch(), entry.steps()),
                    ));
                }
                Some(_) => {}
                None => reference = Some((entry.batch(), entry.eids.as_slice())),
            }
            let layout = self.layout(entry)?;
            let mut outcome = self
                .masker
                .mask(entry, &options.scheme, options.training_mode.hide_policy(m))?;
            if options.withheld == Some(m) && filter.inputs.contains(&m) {
                outcome.withhold(entry);
            }
            let sessions = layout
                .sessions
                .iter()
                .flat_map(|&s| std::iter::repeat(s).take(entry.steps()))
                .collect();
            streams.insert(
                m,
                StreamState {
                    layout,
                    outcome,
                    timestamps: entry.timestamps.clone(),
                    sessions,
                },
            );
        }

        let causal = options.scheme.is_causal();
        let window = if causal {
            self.config.context.causal()
        } else {
            self.config.context
        };
        let encoder = self.encoder.run(dict, &streams, &inputs, window, hidden)?;
        let decoder = match &self.decoder {
            Some(side) => Some(side.run(DecoderRequest {
                dict,
                streams: &streams,
                outputs: &outputs,
                encoder: &encoder,
                modality_table: &self.encoder.modality_table,
                causal: causal || self.config.decoder.causal,
                separate: self.config.decoder.separate_modalities,
                hidden,
            })?),
            None => None,
        };

        // Heads.
        let mut mod_loss = BTreeMap::new();
        let mut mod_n_examples = BTreeMap::new();
        let mut mod_preds = BTreeMap::new();
        let mut mod_targets = BTreeMap::new();
        let mut mod_argmax = BTreeMap::new();
        let mut scored = Vec::with_capacity(outputs.len());
        for &m in &outputs {
            let (entry, state) = (&dict[&m], &streams[&m]);
            let hidden_m = match &decoder {
                Some(pass) => pass.sequence.extract(&pass.trace.output, m)?,
                None => encoder.sequence.extract(&encoder.trace.output, m)?,
            };
            let width = m.fixed_width().filter(|_| m.is_static()).unwrap_or(entry.width());
            let adapter = self.heads.get(&m).ok_or_else(|| missing_adapter(m))?;
            let preds = decode_stream(adapter, &state.layout, &hidden_m, width)?;
            let head = modality_loss(entry, &state.outcome, &state.layout, &preds)?;
            mod_loss.insert(m, head.mean());
            mod_n_examples.insert(m, head.count);
            if let Some(argmax) = head.argmax.clone() {
                mod_argmax.insert(m, argmax);
            }
            mod_targets.insert(m, entry.targets.clone());
            mod_preds.insert(
                m,
                Prediction {
                    values: preds,
                    batch: entry.batch(),
                    steps: entry.steps(),
                },
            );
            scored.push((m, hidden_m, head));
        }

        let (modal, scales): (f32, Vec<f32>) = match self.config.loss.reduction {
            LossReduction::Sum => (
                scored.iter().map(|(_, _, h)| h.mean()).sum(),
                scored
                    .iter()
                    .map(|(_, _, h)| if h.count == 0 { 0.0 } else { 1.0 / h.count as f32 })
                    .collect(),
            ),
            LossReduction::PooledMean => {
                let count: usize = scored.iter().map(|(_, _, h)| h.count).sum();
                if count == 0 {
                    (0.0, vec![0.0; scored.len()])
                } else {
                    let total: f32 = scored.iter().map(|(_, _, h)| h.total).sum();
                    (total / count as f32, vec![1.0 / count as f32; scored.len()])
                }
            }
        };

        // Contrastive alignment on the encoder output.
        let weight = self.config.loss.contrastive_weight;
        let contrastive = match &self.contrastive {
            Some(head) if filter.inputs.contains(&Modality::Spike) => {
                let behaviors: Vec<Modality> = self
                    .config
                    .modalities
                    .iter()
                    .copied()
                    .filter(|m| m.is_behavior())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                if let Some(m) = behaviors.iter().find(|m| !filter.inputs.contains(m)) {
                    return Err(NeuroError::MissingModality(format!(
                        "{m} is needed as an input for contrastive alignment"
                    )));
                }
                let max = self.config.embedder.max_time_steps;
                if let Some(m) = behaviors
                    .iter()
                    .chain(std::iter::once(&Modality::Spike))
                    .find(|m| dict[*m].steps() != max)
                {
                    return Err(NeuroError::shape(
                        format!("{m} steps for contrastive pooling"),
                        (dict[m].batch() * max, hidden),
                        (dict[m].batch() * dict[m].steps(), hidden),
                    ));
                }
                let pooled_spike =
                    pool_segments(&encoder.sequence, &encoder.trace.output, &[Modality::Spike])?;
                let pooled_behavior =
                    pool_segments(&encoder.sequence, &encoder.trace.output, &behaviors)?;
                let live = head.embed(&pooled_spike, &pooled_behavior)?;
                let outcome = match (&mut self.momentum, &mut self.queue) {
                    (Some(momentum), Some(queue)) => {
                        momentum.swap(&mut self.encoder)?;
                        let pass = self.encoder.run(dict, &streams, &inputs, window, hidden);
                        momentum.swap(&mut self.encoder)?;
                        let pass = pass?;
                        let lagged = head.embed(
                            &pool_segments(&pass.sequence, &pass.trace.output, &[Modality::Spike])?,
                            &pool_segments(&pass.sequence, &pass.trace.output, &behaviors)?,
                        )?;
                        let outcome = head.moco(&live, &lagged, queue)?;
                        if options.enqueue {
                            queue.push(&lagged.spike, &lagged.behavior)?;
                        }
                        outcome
                    }
                    _ => head.clip(&live)?,
                };
                Some(ContrastiveTape {
                    behaviors,
                    pooled_spike,
                    pooled_behavior,
                    live,
                    outcome,
                    weight,
                })
            }
            _ => None,
        };

        let modal_weight = if contrastive.is_some() { 1.0 - weight } else { 1.0 };
        let loss = self
            .config
            .loss
            .combine(modal, contrastive.as_ref().map(|c| c.outcome.diagnostics.loss));
        let mut heads = BTreeMap::new();
        for ((m, hidden_m, head), scale) in scored.into_iter().zip(scales) {
            heads.insert(
                m,
                HeadState {
                    hidden: hidden_m,
                    grad: head.grad.scale(scale * modal_weight)?,
                },
            );
        }
        debug!(loss, ?mod_loss, ?mod_n_examples, "multimodal forward");

        Ok(MultiModalOutput {
            loss,
            mod_loss,
            mod_n_examples,
            mod_preds,
            mod_targets,
            mod_argmax,
            contrastive: contrastive.as_ref().map(|c| c.outcome.diagnostics),
            tape: ForwardTape {
                streams,
                inputs,
                outputs,
                encoder,
                decoder,
                heads,
                contrastive,
            },
        })
    }

    /// Accumulates `d loss / d theta` for the forward call that produced `output`.
    pub fn backward(&mut self, output: &MultiModalOutput) -> NeuroResult<()> {
        let tape = &output.tape;
        let enc = &tape.encoder;
        let mut grad_encoded = Tensor::zeros(enc.trace.output.rows(), enc.trace.output.cols())?;
        let mut grad_context = None;

        match (&mut self.decoder, &tape.decoder) {
            (Some(decoder), Some(pass)) => {
                let mut grad_y = Tensor::zeros(pass.trace.output.rows(), pass.trace.output.cols())?;
                for (m, head) in &tape.heads {
                    let adapter = self.heads.get_mut(m).ok_or_else(|| missing_adapter(*m))?;
                    let layout = &tape.streams[m].layout;
                    let grad = decode_stream_backward(adapter, layout, &head.hidden, &head.grad)?;
                    pass.sequence.scatter_add(&mut grad_y, *m, &grad)?;
                }
                let io = DecoderInputs {
                    batch: pass.sequence.batch,
                    self_mask: &pass.self_mask,
                    cross_mask: &pass.cross_mask,
                    context: &pass.context,
                };
                let (grad_y0, grad_ctx) = decoder.stack.backward(&pass.trace, &io, &grad_y)?;
                for &m in &tape.outputs {
                    let state = &tape.streams[&m];
                    let grad_m = pass.sequence.extract(&grad_y0, m)?;
                    decoder.embed.backward(
                        &mut self.encoder.modality_table,
                        m,
                        &state.timestamps,
                        &state.sessions,
                        &grad_m,
                    )?;
                    let mut grad_tokens = grad_m;
                    zero_rows(&mut grad_tokens, &state.outcome.token_hide)?;
                    let adapter = decoder.stitch.get_mut(&m).ok_or_else(|| missing_adapter(m))?;
                    encode_stream_backward(
                        adapter,
                        &state.layout,
                        &state.outcome.masked,
                        &grad_tokens,
                    )?;
                }
                let grad_from_context = decoder.context.backward(&enc.trace.output, &grad_ctx)?;
                grad_encoded.add_scaled(&grad_from_context, 1.0)?;
                grad_context = Some(grad_ctx);
            }
            (None, None) => {
                for (m, head) in &tape.heads {
                    let adapter = self.heads.get_mut(m).ok_or_else(|| missing_adapter(*m))?;
                    let layout = &tape.streams[m].layout;
                    let grad = decode_stream_backward(adapter, layout, &head.hidden, &head.grad)?;
                    enc.sequence.scatter_add(&mut grad_encoded, *m, &grad)?;
                }
            }
            _ => {
                return Err(NeuroError::InvalidConfig(
                    "forward tape does not match this model's decoder".into(),
                ))
            }
        }

        if let (Some(head), Some(ct)) = (&mut self.contrastive, &tape.contrastive) {
            let (grad_spike, grad_behavior) =
                head.backward(
                    &ct.pooled_spike,
                    &ct.pooled_behavior,
                    &ct.live,
                    &ct.outcome,
                    ct.weight,
                )?;
            unpool_segments(&enc.sequence, &mut grad_encoded, &[Modality::Spike], &grad_spike)?;
            unpool_segments(&enc.sequence, &mut grad_encoded, &ct.behaviors, &grad_behavior)?;
        }

        let grad_x0 = self
            .encoder
            .stack
            .backward(&enc.trace, enc.sequence.batch, &enc.mask, &grad_encoded)?;
        let mut grad_embeddings = grad_x0.clone();
        if let Some(grad_ctx) = &grad_context {
            grad_embeddings.add_scaled(grad_ctx, 1.0)?;
        }
        for &m in &tape.inputs {
            let state = &tape.streams[&m];
            let grad_e = enc.sequence.extract(&grad_embeddings, m)?;
            self.encoder.embed.backward(
                &mut self.encoder.modality_table,
                m,
                &state.timestamps,
                &state.sessions,
                &grad_e,
            )?;
            let mut grad_tokens = enc.sequence.extract(&grad_x0, m)?;
            zero_rows(&mut grad_tokens, &state.outcome.token_hide)?;
            let adapter = self.encoder.stitch.get_mut(&m).ok_or_else(|| missing_adapter(m))?;
            encode_stream_backward(
                adapter,
                &state.layout,
                &state.outcome.masked,
                &grad_tokens,
            )?;
        }
        Ok(())
    }

    /// EMA step of the momentum snapshot. No-op without momentum contrast.
    pub fn update_momentum(&mut self) -> NeuroResult<()> {
        if let Some(momentum) = &mut self.momentum {
            momentum.update(&self.encoder)?;
        }
        Ok(())
    }

    /// Parameters mirrored by the momentum snapshot.
    pub fn encoder_parameters(&self) -> PureResult<HashMap<String, Tensor>> {
        self.encoder.state_dict()
    }
}

impl Parameterized for MultiModal {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters(visitor)?;
        if let Some(decoder) = &self.decoder {
            decoder.visit_parameters(visitor)?;
        }
        for adapter in self.heads.values() {
            adapter.visit_parameters(visitor)?;
        }
        if let Some(head) = &self.contrastive {
            head.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        if let Some(decoder) = &mut self.decoder {
            decoder.visit_parameters_mut(visitor)?;
        }
        for adapter in self.heads.values_mut() {
            adapter.visit_parameters_mut(visitor)?;
        }
        if let Some(head) = &mut self.contrastive {
            head.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}
