//! Mask utilities shared by attention implementations.
//!
//! Masks are multiplicative `0/1` tensors: `1` marks a key position that may
//! be attended, `0` one that must receive zero weight. Padding masks are
//! shaped `[batch, 1, k_len]` and broadcast over queries; full masks are
//! `[batch, q_len, k_len]`. Before use a mask is turned into a boolean
//! "masked-out" tensor shaped `[batch, 1, q_len, k_len]` that broadcasts over
//! heads and drives a differentiable `where_cond` select.

pub mod causal;
pub mod padding;

use candle_core::{DType, Tensor};
use layers::dtypes::most_negative;

use crate::core::{AttentionError, Result};

pub use causal::{combine_masks, subsequent_mask};
pub use padding::non_pad_mask;

/// Dtype produced by the mask builders.
pub const MASK_DTYPE: DType = DType::U8;

/// Validates `mask` and returns a `u8` tensor shaped `[batch, 1, q_len, k_len]`
/// holding `1` wherever the position is masked out.
pub fn prepare_mask(mask: &Tensor, batch: usize, q_len: usize, k_len: usize) -> Result<Tensor> {
    let (mb, mq, mk) = mask.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "mask must be [batch, 1|q_len, k_len], got {:?}",
            mask.dims()
        ))
    })?;
    if mb != batch || mk != k_len || (mq != 1 && mq != q_len) {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [{batch}, 1|{q_len}, {k_len}] got [{mb}, {mq}, {mk}]"
        )));
    }
    let masked_out = mask.eq(&mask.zeros_like()?)?;
    Ok(masked_out
        .unsqueeze(1)?
        .broadcast_as((batch, 1, q_len, k_len))?
        .contiguous()?)
}

/// Replaces masked entries of `scores` with the most negative finite value of
/// its dtype. `masked_out` must broadcast to the shape of `scores`.
pub fn fill_masked_scores(scores: &Tensor, masked_out: &Tensor) -> Result<Tensor> {
    let shape = scores.shape();
    let fill = Tensor::new(most_negative(scores.dtype()), scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    let cond = masked_out.broadcast_as(shape)?;
    Ok(cond.where_cond(&fill, scores)?)
}

/// Forces masked entries of `weights` to exactly zero.
pub fn zero_masked_weights(weights: &Tensor, masked_out: &Tensor) -> Result<Tensor> {
    let cond = masked_out.broadcast_as(weights.shape())?;
    Ok(cond.where_cond(&weights.zeros_like()?, weights)?)
}
