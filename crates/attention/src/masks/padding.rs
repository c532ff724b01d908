//! Builders for padding masks over variable-length utterances.

use candle_core::{Device, Tensor};

use super::MASK_DTYPE;
use crate::core::Result;

/// Padding mask from per-utterance valid frame counts.
///
/// Returns `[batch, 1, max_len]` with `1` for frames `< length` and `0` for
/// padding. Lengths beyond `max_len` are clamped.
pub fn non_pad_mask(device: &Device, lengths: &[usize], max_len: usize) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * max_len];
    for (row, &valid) in data.chunks_mut(max_len.max(1)).zip(lengths) {
        for slot in row.iter_mut().take(valid.min(max_len)) {
            *slot = 1;
        }
    }
    let mask = Tensor::from_vec(data, (batch, 1, max_len), device)?;
    debug_assert_eq!(mask.dtype(), MASK_DTYPE);
    Ok(mask)
}
