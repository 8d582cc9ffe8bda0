// ============================================================
// Layer 5 — Positional Embedding Interpolation
// ============================================================
// A pretraining checkpoint may carry a positional embedding for
// a different number of expert tokens than the classifier uses.
// The table [src_len, dim] is resampled along the sequence axis
// to [target_len, dim] with linear interpolation and aligned
// corners, so the first and last rows are kept exactly.

use ndarray::{Array2, Ix2};

use crate::domain::params::StateDict;
use crate::error::{Result, TrainError};

pub fn interpolate_pos_embed(embed: &Array2<f32>, target_len: usize) -> Result<Array2<f32>> {
    let (src_len, dim) = embed.dim();
    if src_len == 0 || dim == 0 {
        return Err(TrainError::Shape(format!(
            "cannot interpolate an empty positional embedding of shape [{src_len}, {dim}]"
        )));
    }
    if target_len == 0 {
        return Err(TrainError::Shape(
            "positional embedding target length must be positive".into(),
        ));
    }
    if src_len == target_len {
        return Ok(embed.clone());
    }

    let mut out = Array2::<f32>::zeros((target_len, dim));
    let scale = if target_len > 1 {
        (src_len - 1) as f64 / (target_len - 1) as f64
    } else {
        0.0
    };

    for t in 0..target_len {
        let pos = t as f64 * scale;
        let lo = (pos.floor() as usize).min(src_len - 1);
        let hi = (lo + 1).min(src_len - 1);
        let frac = (pos - lo as f64) as f32;
        for d in 0..dim {
            out[[t, d]] = embed[[lo, d]] * (1.0 - frac) + embed[[hi, d]] * frac;
        }
    }

    Ok(out)
}

/// Resample `state[key]` to `target_len` rows if its length differs.
///
/// Returns `true` when the tensor was replaced.
pub fn adapt_state_embedding(state: &mut StateDict, key: &str, target_len: usize) -> Result<bool> {
    let tensor = state.get(key).ok_or_else(|| {
        TrainError::Shape(format!("checkpoint has no positional embedding '{key}'"))
    })?;
    let embed = tensor
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            TrainError::Shape(format!(
                "positional embedding '{key}' must be 2-D, found shape {:?}",
                tensor.shape()
            ))
        })?;

    let src_len = embed.nrows();
    if src_len == target_len {
        return Ok(false);
    }

    let resized = interpolate_pos_embed(&embed, target_len)?;
    tracing::info!(
        key,
        from = src_len,
        to = target_len,
        "interpolated positional embedding"
    );
    state.insert(key.to_string(), resized.into_dyn());
    Ok(true)
}
