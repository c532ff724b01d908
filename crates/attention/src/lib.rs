//! Multi-head attention for speech transformers.
//!
//! Two interchangeable mechanisms share one projection layout and one
//! [`Attention`] interface:
//!
//! * [`StandardAttention`] computes the full scaled dot-product softmax with
//!   optional key masking and dropout on the weights.
//! * [`NystromAttention`] approximates it at linear cost in the sequence length
//!   from segment-averaged landmarks, an iterative pseudoinverse
//!   ([`iterative_inv`]) and a depthwise convolution over the values.
//!
//! Activations are `[batch, time, n_feat]`. Masks hold `1` for valid and `0`
//! for masked key positions, shaped `[batch, 1, k_len]` or
//! `[batch, q_len, k_len]`; see [`masks`]. Every forward call returns the
//! attention weights alongside the output instead of caching them, and dropout
//! draws from the random source carried by [`ForwardMode::Training`].
//!
//! [`AttentionLayer`] picks the mechanism from an [`AttentionConfig`], which can
//! be loaded from TOML or JSON.

pub mod core;
pub mod heads;
pub mod layer;
pub mod masks;
pub mod nystrom;
pub mod standard;

pub use crate::core::{
    Attention, AttentionConfig, AttentionError, AttentionKind, AttentionOutput, NystromConfig,
    ParamDType,
};
pub use heads::HeadProjection;
pub use layer::AttentionLayer;
pub use layers::ForwardMode;
pub use nystrom::{iterative_inv, iterative_inv_traced, NystromAttention, PinvTrace};
pub use standard::StandardAttention;
