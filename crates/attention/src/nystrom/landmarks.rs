//! Landmark construction by segment averaging.

use candle_core::{Tensor, D};

use crate::core::{AttentionError, Result};

/// Length of each averaged segment for a sequence of `len` frames.
///
/// Always `len / n_landmarks + 1`, so `n_landmarks` segments cover at least
/// `len + 1` positions of the tiled sequence and never need padding.
pub fn segment_len(len: usize, n_landmarks: usize) -> usize {
    len / n_landmarks + 1
}

/// Averages `[batch, head, time, d_k]` into `[batch, head, n_landmarks, d_k]`.
///
/// The sequence is tiled end to end along time, truncated to
/// `n_landmarks * segment_len` positions and cut into contiguous segments.
/// Three copies are enough whenever `n_landmarks <= 2 * time`; shorter
/// sequences are tiled as often as needed.
pub fn segment_means(x: &Tensor, n_landmarks: usize) -> Result<Tensor> {
    let (batch, heads, len, d_k) = x.dims4()?;
    if n_landmarks == 0 {
        return Err(AttentionError::config("n_landmarks must be greater than zero"));
    }
    if len == 0 {
        return Err(AttentionError::shape("landmarks need a non-empty time axis"));
    }

    let seg = segment_len(len, n_landmarks);
    let needed = n_landmarks * seg;
    let copies = needed.div_ceil(len).max(3);
    let tiled = Tensor::cat(&vec![x; copies], 2)?;
    let landmarks = tiled
        .narrow(2, 0, needed)?
        .contiguous()?
        .reshape((batch, heads, n_landmarks, seg, d_k))?
        .mean(D::Minus2)?;
    Ok(landmarks)
}
