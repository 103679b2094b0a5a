// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::srl::SrlStateDict;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const SRL_CHECKPOINT_PREFIX: &str = "srl_checkpoint_ep";
const SRL_CHECKPOINT_SUFFIX: &str = ".json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ParameterSnapshot {
    parameters: HashMap<String, StoredTensor>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SrlSnapshot {
    epoch: Option<usize>,
    state: SrlStateDict,
}

fn snapshot_from_state(state: &HashMap<String, Tensor>) -> ParameterSnapshot {
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    ParameterSnapshot { parameters }
}

fn state_from_snapshot(snapshot: ParameterSnapshot) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::with_capacity(snapshot.parameters.len());
    for (name, tensor) in snapshot.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

fn writer(path: &Path) -> PureResult<BufWriter<File>> {
    File::create(path).map(BufWriter::new).map_err(io_error)
}

fn reader(path: &Path) -> PureResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(io_error)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = snapshot_from_state(state);
    serde_json::to_writer_pretty(writer(path.as_ref())?, &snapshot).map_err(serde_error)
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let snapshot: ParameterSnapshot =
        serde_json::from_reader(reader(path.as_ref())?).map_err(serde_error)?;
    state_from_snapshot(snapshot)
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = snapshot_from_state(state);
    bincode::serialize_into(writer(path.as_ref())?, &snapshot).map_err(serde_error)
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let snapshot: ParameterSnapshot =
        bincode::deserialize_from(reader(path.as_ref())?).map_err(serde_error)?;
    state_from_snapshot(snapshot)
}

/// Writes a rate-controller state, optionally tagged with its epoch.
pub fn save_srl_state_json<P: AsRef<Path>>(
    state: &SrlStateDict,
    epoch: Option<usize>,
    path: P,
) -> PureResult<()> {
    let snapshot = SrlSnapshot {
        epoch,
        state: state.clone(),
    };
    serde_json::to_writer_pretty(writer(path.as_ref())?, &snapshot).map_err(serde_error)
}

pub fn load_srl_state_json<P: AsRef<Path>>(path: P) -> PureResult<SrlStateDict> {
    let snapshot: SrlSnapshot =
        serde_json::from_reader(reader(path.as_ref())?).map_err(serde_error)?;
    Ok(snapshot.state)
}

/// File name of the rate-controller checkpoint for `epoch`.
pub fn srl_checkpoint_name(epoch: usize) -> String {
    format!("{SRL_CHECKPOINT_PREFIX}{epoch}{SRL_CHECKPOINT_SUFFIX}")
}

/// Newest `srl_checkpoint_ep{N}.json` in `dir` by epoch number. `None` when
/// the directory holds none.
pub fn latest_srl_checkpoint<P: AsRef<Path>>(dir: P) -> PureResult<Option<(usize, PathBuf)>> {
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir.as_ref()).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        let name = entry.file_name();
        let Some(epoch) = name
            .to_str()
            .and_then(|name| name.strip_prefix(SRL_CHECKPOINT_PREFIX))
            .and_then(|rest| rest.strip_suffix(SRL_CHECKPOINT_SUFFIX))
            .and_then(|digits| digits.parse::<usize>().ok())
        else {
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
            latest = Some((epoch, entry.path()));
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.json");
        let mut layer = Linear::new("io", 2, 2).unwrap();
        save_json(&layer, &path).unwrap();
        let before = layer.state_dict().unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        layer.backward(&input, &Tensor::full(1, 2, 1.0).unwrap()).unwrap();
        layer.apply_step(0.01).unwrap();
        assert_ne!(layer.state_dict().unwrap(), before);
        load_json(&mut layer, &path).unwrap();
        assert_eq!(layer.state_dict().unwrap(), before);
    }

    #[test]
    fn save_and_load_roundtrip_bincode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.bin");
        let mut layer = Linear::new("io", 2, 2).unwrap();
        save_bincode(&layer, &path).unwrap();
        let before = layer.state_dict().unwrap();
        load_bincode(&mut layer, &path).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);
        assert_eq!(layer.state_dict().unwrap(), before);
    }

    #[test]
    fn srl_state_round_trips_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(srl_checkpoint_name(4));
        let mut state = SrlStateDict::new();
        state.insert("alpha".to_string(), -0.123_456_789_012_345_6);
        state.insert("optim.exp_avg".to_string(), 1e-17);
        save_srl_state_json(&state, Some(4), &path).unwrap();
        assert_eq!(load_srl_state_json(&path).unwrap(), state);
    }

    #[test]
    fn latest_checkpoint_picks_the_highest_epoch() {
        let dir = tempdir().unwrap();
        assert!(latest_srl_checkpoint(dir.path()).unwrap().is_none());
        let state = SrlStateDict::new();
        for epoch in [2, 10, 9] {
            save_srl_state_json(&state, Some(epoch), dir.path().join(srl_checkpoint_name(epoch)))
                .unwrap();
        }
        fs::write(dir.path().join("srl_checkpoint_epx.json"), "{}").unwrap();
        let (epoch, path) = latest_srl_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(epoch, 10);
        assert!(path.ends_with("srl_checkpoint_ep10.json"));
    }
}
