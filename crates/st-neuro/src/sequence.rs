// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Concatenation of modality streams along the sequence axis and the
//! attention masks built over the concatenated sequence.

use crate::modality::Modality;
use crate::{NeuroError, NeuroResult, Tensor};
use serde::{Deserialize, Serialize};
use st_nn::layers::AttentionMask;

/// Relative window `[-backward, +forward]` in timestamp units. Negative
/// values leave that side unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub forward: i64,
    pub backward: i64,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            forward: -1,
            backward: -1,
        }
    }
}

impl ContextWindow {
    pub fn causal(self) -> Self {
        Self { forward: 0, ..self }
    }

    pub fn allows(&self, query_time: usize, key_time: usize) -> bool {
        let delta = key_time as i64 - query_time as i64;
        let ahead_ok = self.forward < 0 || delta <= self.forward;
        let behind_ok = self.backward < 0 || -delta <= self.backward;
        ahead_ok && behind_ok
    }
}

/// One modality's block inside the concatenated sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub modality: Modality,
    pub offset: usize,
    pub steps: usize,
}

/// Per-token metadata of a concatenated `(B * L, H)` sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub batch: usize,
    pub len: usize,
    pub segments: Vec<Segment>,
    /// `B * L` entries each.
    pub timestamps: Vec<usize>,
    pub modality_ids: Vec<usize>,
    /// Tokens other tokens may attend to.
    pub keys: Vec<bool>,
}

/// Per-modality token data handed to [`Sequence::build`].
pub struct StreamTokens<'a> {
    pub modality: Modality,
    pub steps: usize,
    pub timestamps: &'a [usize],
    pub keys: Vec<bool>,
}

impl Sequence {
    pub fn build(batch: usize, streams: &[StreamTokens<'_>]) -> NeuroResult<Self> {
        if streams.is_empty() {
            return Err(NeuroError::InvalidConfig("no modality streams to concatenate".into()));
        }
        let mut segments = Vec::with_capacity(streams.len());
        let mut offset = 0;
        for stream in streams {
            segments.push(Segment {
                modality: stream.modality,
                offset,
                steps: stream.steps,
            });
            offset += stream.steps;
        }
        let len = offset;
        let mut timestamps = vec![0; batch * len];
        let mut modality_ids = vec![0; batch * len];
        let mut keys = vec![false; batch * len];
        for (segment, stream) in segments.iter().zip(streams) {
            let tokens = batch * stream.steps;
            if stream.timestamps.len() != tokens || stream.keys.len() != tokens {
                return Err(NeuroError::shape(
                    format!("{} token metadata", stream.modality),
                    (tokens, tokens),
                    (stream.timestamps.len(), stream.keys.len()),
                ));
            }
            for b in 0..batch {
                for t in 0..stream.steps {
                    let src = b * stream.steps + t;
                    let dst = b * len + segment.offset + t;
                    timestamps[dst] = stream.timestamps[src];
                    modality_ids[dst] = stream.modality.index();
                    keys[dst] = stream.keys[src];
                }
            }
        }
        Ok(Self {
            batch,
            len,
            segments,
            timestamps,
            modality_ids,
            keys,
        })
    }

    pub fn segment(&self, modality: Modality) -> NeuroResult<&Segment> {
        self.segments
            .iter()
            .find(|s| s.modality == modality)
            .ok_or_else(|| NeuroError::MissingModality(modality.to_string()))
    }

    /// Stacks per-modality `(B * T_m, H)` tensors into `(B * L, H)`.
    pub fn concat(&self, parts: &[&Tensor]) -> NeuroResult<Tensor> {
        let hidden = parts.first().map(|p| p.cols()).unwrap_or(1);
        let mut out = Tensor::zeros(self.batch * self.len, hidden)?;
        for (segment, part) in self.segments.iter().zip(parts) {
            for b in 0..self.batch {
                let block = part.slice_rows(b * segment.steps, (b + 1) * segment.steps)?;
                out.write_block(b * self.len + segment.offset, 0, &block)?;
            }
        }
        Ok(out)
    }

    /// Inverse of [`Sequence::concat`] for one modality.
    pub fn extract(&self, full: &Tensor, modality: Modality) -> NeuroResult<Tensor> {
        let segment = self.segment(modality)?;
        let mut out = Tensor::zeros(self.batch * segment.steps, full.cols())?;
        for b in 0..self.batch {
            let start = b * self.len + segment.offset;
            out.write_block(b * segment.steps, 0, &full.slice_rows(start, start + segment.steps)?)?;
        }
        Ok(out)
    }

    /// Adds a `(B * T_m, H)` gradient into the matching rows of `full`.
    pub fn scatter_add(
        &self,
        full: &mut Tensor,
        modality: Modality,
        part: &Tensor,
    ) -> NeuroResult<()> {
        let segment = self.segment(modality)?;
        for b in 0..self.batch {
            let block = part.slice_rows(b * segment.steps, (b + 1) * segment.steps)?;
            full.accumulate_block(b * self.len + segment.offset, 0, &block)?;
        }
        Ok(())
    }

    fn token(&self, b: usize, i: usize) -> usize {
        b * self.len + i
    }

    /// `self OR (window AND key)`.
    pub fn encoder_mask(&self, window: ContextWindow) -> AttentionMask {
        AttentionMask::from_fn(self.batch, self.len, self.len, |b, i, j| {
            let (qi, kj) = (self.token(b, i), self.token(b, j));
            i == j || (window.allows(self.timestamps[qi], self.timestamps[kj]) && self.keys[kj])
        })
    }

    /// `self OR (base AND (separate => same modality))`, where `base` is the
    /// lower-triangular time mask when `causal` and key validity otherwise.
    pub fn decoder_self_mask(&self, causal: bool, separate: bool) -> AttentionMask {
        AttentionMask::from_fn(self.batch, self.len, self.len, |b, i, j| {
            let (qi, kj) = (self.token(b, i), self.token(b, j));
            let base = if causal {
                self.timestamps[kj] <= self.timestamps[qi]
            } else {
                self.keys[kj]
            };
            let modality_ok = !separate || self.modality_ids[kj] == self.modality_ids[qi];
            i == j || (base && modality_ok)
        })
    }

    /// Decoder queries (`self`) against encoder keys (`context`).
    pub fn cross_mask(&self, context: &Sequence, causal: bool) -> AttentionMask {
        AttentionMask::from_fn(self.batch, self.len, context.len, |b, i, j| {
            let qi = self.token(b, i);
            let kj = context.token(b, j);
            context.keys[kj] && (!causal || context.timestamps[kj] <= self.timestamps[qi])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_streams() -> Sequence {
        let ts = [0usize, 1, 2, 0, 1, 2];
        Sequence::build(
            2,
            &[
                StreamTokens {
                    modality: Modality::Spike,
                    steps: 3,
                    timestamps: &ts,
                    keys: vec![true, false, true, true, true, true],
                },
                StreamTokens {
                    modality: Modality::Wheel,
                    steps: 3,
                    timestamps: &ts,
                    keys: vec![true; 6],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn concat_and_extract_invert_each_other() {
        let seq = two_streams();
        let spike = Tensor::from_fn(6, 2, |r, c| (r * 2 + c) as f32).unwrap();
        let wheel = Tensor::from_fn(6, 2, |r, c| -((r * 2 + c) as f32)).unwrap();
        let full = seq.concat(&[&spike, &wheel]).unwrap();
        assert_eq!(full.shape(), (12, 2));
        assert_eq!(full.row(6).unwrap(), spike.row(3).unwrap());
        assert_eq!(seq.extract(&full, Modality::Wheel).unwrap(), wheel);
    }

    #[test]
    fn encoder_mask_keeps_identity_for_hidden_tokens() {
        let seq = two_streams();
        let mask = seq.encoder_mask(ContextWindow::default());
        assert!(mask.allows(0, 1, 1));
        assert!(!mask.allows(0, 0, 1));
        assert!(mask.allows(0, 0, 4));
    }

    #[test]
    fn causal_window_blocks_future_keys() {
        let seq = two_streams();
        let mask = seq.encoder_mask(ContextWindow::default().causal());
        assert!(!mask.allows(1, 0, 2));
        assert!(mask.allows(1, 2, 0));
        assert!(!mask.allows(1, 3, 5));
    }

    #[test]
    fn decoder_masks_separate_modalities() {
        let seq = two_streams();
        let sa = seq.decoder_self_mask(false, true);
        assert!(!sa.allows(0, 0, 3));
        assert!(sa.allows(0, 3, 4));
        let padded = seq.decoder_self_mask(false, false);
        assert!(!padded.allows(0, 2, 1));
        let causal = seq.decoder_self_mask(true, false);
        assert!(causal.allows(0, 2, 1));
        assert!(!causal.allows(0, 1, 2));
        let xa = seq.cross_mask(&seq, true);
        assert!(!xa.allows(0, 0, 2));
        assert!(!xa.allows(0, 2, 1));
    }
}
