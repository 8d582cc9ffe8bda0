// ============================================================
// Layer 6 — Named-Tensor Files
// ============================================================
// Reads and writes a StateDict as a safetensors file. Every
// tensor is stored as little-endian f32 with its shape; the
// optional metadata map lands in the safetensors header.
//
// Writes go to a sibling ".tmp" file first and are renamed
// into place, so a crash mid-write leaves the previous file.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::domain::params::StateDict;
use crate::error::{Result, TrainError};

fn tensor_bytes(tensor: &ArrayD<f32>) -> Vec<u8> {
    // iter() walks logical (row-major) order regardless of memory layout.
    tensor.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` through a temporary sibling file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn save_state_dict(
    path:     &Path,
    state:    &StateDict,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let encoded: Vec<(&str, Vec<u8>, Vec<usize>)> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor_bytes(tensor), tensor.shape().to_vec()))
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (name, bytes, shape) in &encoded {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes).map_err(|e| {
            TrainError::Checkpoint(format!("cannot encode tensor '{name}': {e}"))
        })?;
        views.push((*name, view));
    }

    let metadata = if metadata.is_empty() { None } else { Some(metadata) };
    let bytes = safetensors::serialize(views, &metadata)
        .map_err(|e| TrainError::Checkpoint(format!("safetensors serialization failed: {e}")))?;

    write_atomic(path, &bytes)?;
    tracing::debug!(path = %path.display(), tensors = state.len(), "wrote state dict");
    Ok(())
}

pub fn load_state_dict(path: &Path) -> Result<StateDict> {
    if !path.is_file() {
        return Err(TrainError::MissingCheckpoint(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| {
        TrainError::Checkpoint(format!("cannot parse '{}': {e}", path.display()))
    })?;

    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(TrainError::Checkpoint(format!(
                "tensor '{name}' has dtype {:?}, only F32 is supported",
                view.dtype()
            )));
        }
        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
            .map_err(|e| TrainError::Shape(format!("tensor '{name}': {e}")))?;
        state.insert(name, tensor);
    }
    Ok(state)
}

/// Entries of `state` whose key starts with `prefix`, with the prefix removed.
pub fn strip_prefix(state: &StateDict, prefix: &str) -> StateDict {
    state
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

/// Entries of `state` whose key does not start with `prefix`.
pub fn without_prefix(state: &StateDict, prefix: &str) -> StateDict {
    state
        .iter()
        .filter(|(k, _)| !k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
