// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! JSON and bincode persistence for parameter state dictionaries.

use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Flat, format-stable copy of a tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.rows(),
            cols: tensor.cols(),
            data: tensor.data().to_vec(),
        }
    }

    pub fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// Named parameters ordered by name so serialised files diff cleanly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub parameters: BTreeMap<String, StoredTensor>,
}

impl ModuleSnapshot {
    pub fn from_state(state: &HashMap<String, Tensor>) -> Self {
        let parameters = state
            .iter()
            .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
            .collect();
        Self { parameters }
    }

    pub fn capture<M: Parameterized + ?Sized>(module: &M) -> PureResult<Self> {
        Ok(Self::from_state(&module.state_dict()?))
    }

    pub fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        self.parameters
            .into_iter()
            .map(|(name, stored)| Ok((name, stored.into_tensor()?)))
            .collect()
    }
}

pub(crate) fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

pub(crate) fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes any serde value as pretty JSON.
pub fn write_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value).map_err(serde_error)
}

pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> PureResult<T> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    serde_json::from_reader(BufReader::new(file)).map_err(serde_error)
}

/// Writes any serde value with bincode.
pub fn write_bincode<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    bincode::serialize_into(BufWriter::new(file), value).map_err(serde_error)
}

pub fn read_bincode<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> PureResult<T> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)
}

pub fn save_json<M: Parameterized + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    write_json(&ModuleSnapshot::capture(module)?, path)
}

pub fn load_json<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let snapshot: ModuleSnapshot = read_json(path)?;
    module.load_state_dict(&snapshot.into_state()?)
}

pub fn save_bincode<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &M,
    path: P,
) -> PureResult<()> {
    write_bincode(&ModuleSnapshot::capture(module)?, path)
}

pub fn load_bincode<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let snapshot: ModuleSnapshot = read_bincode(path)?;
    module.load_state_dict(&snapshot.into_state()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.json");
        let mut layer = Linear::new("io", 2, 2).unwrap();
        save_json(&layer, &path).unwrap();
        let before = layer.state_dict().unwrap();
        layer
            .visit_parameters_mut(&mut |p| {
                p.value_mut().data_mut()[0] += 1.0;
                Ok(())
            })
            .unwrap();
        load_json(&mut layer, &path).unwrap();
        assert_eq!(before, layer.state_dict().unwrap());
    }

    #[test]
    fn bincode_load_reports_missing_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.bin");
        let small = Linear::new("io_small", 2, 2).unwrap();
        save_bincode(&small, &path).unwrap();
        let mut other = Linear::new("io_other", 2, 2).unwrap();
        let err = load_bincode(&mut other, &path).unwrap_err();
        assert!(matches!(err, TensorError::MissingParameter { .. }));
    }
}
