// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::modality::Modality;
use crate::{NeuroError, NeuroResult, Tensor};
use rand::Rng;
use st_nn::layers::Embedding;
use st_nn::module::{Parameter, Parameterized};
use st_tensor::PureResult;

/// Positional and session tables for one side of the model. The modality
/// table is shared between sides and passed in by the caller.
#[derive(Debug, Clone)]
pub struct SideEmbedding {
    position: Embedding,
    session: Embedding,
}

impl SideEmbedding {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        max_time_steps: usize,
        max_sessions: usize,
        hidden: usize,
        rng: &mut R,
    ) -> NeuroResult<Self> {
        Ok(Self {
            position: Embedding::with_rng(format!("{name}.position"), max_time_steps, hidden, rng)?,
            session: Embedding::with_rng(format!("{name}.session"), max_sessions, hidden, rng)?,
        })
    }

    fn guard(&self, timestamps: &[usize]) -> NeuroResult<()> {
        let max = self.position.vocab_size();
        match timestamps.iter().find(|t| **t >= max) {
            Some(&timestamp) => Err(NeuroError::TimestampOutOfRange { timestamp, max }),
            None => Ok(()),
        }
    }

    /// `modality + position[t] + session[s]` for every token.
    pub fn embed(
        &self,
        modality_table: &Embedding,
        modality: Modality,
        timestamps: &[usize],
        sessions: &[usize],
    ) -> NeuroResult<Tensor> {
        self.guard(timestamps)?;
        let mut out = self.position.lookup(timestamps)?;
        out.add_scaled(&self.session.lookup(sessions)?, 1.0)?;
        let modality_row = modality_table.lookup(&[modality.index()])?;
        out.add_row_inplace(modality_row.data())?;
        Ok(out)
    }

    pub fn backward(
        &mut self,
        modality_table: &mut Embedding,
        modality: Modality,
        timestamps: &[usize],
        sessions: &[usize],
        grad: &Tensor,
    ) -> NeuroResult<()> {
        self.position.accumulate_lookup(timestamps, grad)?;
        self.session.accumulate_lookup(sessions, grad)?;
        let summed = Tensor::from_vec(1, grad.cols(), grad.sum_axis0())?;
        modality_table.accumulate_lookup(&[modality.index()], &summed)?;
        Ok(())
    }
}

impl Parameterized for SideEmbedding {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.position.visit_parameters(visitor)?;
        self.session.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.position.visit_parameters_mut(visitor)?;
        self.session.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn embedding_sums_three_tables_and_guards_time() {
        let mut rng = StdRng::seed_from_u64(11);
        let table = Embedding::with_rng("modality", 6, 4, &mut rng).unwrap();
        let side = SideEmbedding::with_rng("enc", 3, 2, 4, &mut rng).unwrap();
        let out = side.embed(&table, Modality::Wheel, &[0, 2], &[1, 1]).unwrap();
        let pos = side.position.lookup(&[2]).unwrap();
        let sess = side.session.lookup(&[1]).unwrap();
        let modality = table.lookup(&[Modality::Wheel.index()]).unwrap();
        for c in 0..4 {
            let expected = pos.data()[c] + sess.data()[c] + modality.data()[c];
            assert!((out.row(1).unwrap()[c] - expected).abs() < 1e-6);
        }
        let err = side.embed(&table, Modality::Wheel, &[3], &[0]).unwrap_err();
        assert!(matches!(err, NeuroError::TimestampOutOfRange { timestamp: 3, max: 3 }));
    }
}
