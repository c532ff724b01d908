//! Builders for decoder self-attention masks.

use candle_core::{Device, Tensor};

use crate::core::{AttentionError, Result};

/// Lower-triangular `[len, len]` mask: query `i` may attend keys `0..=i`.
pub fn subsequent_mask(device: &Device, len: usize) -> Result<Tensor> {
    let data: Vec<u8> = (0..len)
        .flat_map(|q| (0..len).map(move |k| u8::from(k <= q)))
        .collect();
    Ok(Tensor::from_vec(data, (len, len), device)?)
}

/// Combines a `[batch, 1, len]` padding mask with a `[len, len]` subsequent
/// mask into a `[batch, len, len]` mask valid only where both are.
pub fn combine_masks(padding: &Tensor, subsequent: &Tensor) -> Result<Tensor> {
    let (batch, one, len) = padding.dims3()?;
    let (q_len, k_len) = subsequent.dims2()?;
    if one != 1 || q_len != len || k_len != len {
        return Err(AttentionError::shape(format!(
            "cannot combine padding mask {:?} with subsequent mask {:?}",
            padding.dims(),
            subsequent.dims()
        )));
    }
    let padding = padding.to_dtype(subsequent.dtype())?;
    Ok(padding
        .broadcast_as((batch, len, len))?
        .mul(&subsequent.broadcast_as((batch, len, len))?)?)
}
