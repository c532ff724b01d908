//! Core traits and types shared across attention implementations.
//!
//! Implementations consume activations laid out `[batch, time, feature]` and
//! return the same layout for the query's batch and time axes. Internally the
//! heads are processed as `[batch, head, time, head_dim]`, and every matmul,
//! softmax and reduction runs in the compute dtype of the module's
//! [`PrecisionPolicy`](layers::PrecisionPolicy).

pub mod config;
pub mod errors;

use candle_core::Tensor;
use layers::ForwardMode;

pub use config::{AttentionConfig, AttentionKind, NystromConfig, ParamDType};
pub use errors::{AttentionError, Result};

/// Result of a forward pass.
///
/// `weights` is a diagnostic side channel for inspection and visualisation; it
/// is shaped `[batch, head, q_len, k_len]`, kept in the compute dtype, and is
/// not part of the functional contract.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Attended values projected back to `[batch, q_len, n_feat]`.
    pub output: Tensor,
    /// Attention weights before dropout.
    pub weights: Tensor,
}

/// Unified interface for the attention mechanisms.
///
/// * `query` is `[batch, q_len, n_feat]`; `key` and `value` are
///   `[batch, k_len, n_feat]`.
/// * `mask`, when present, holds `1` for valid and `0` for masked key
///   positions, shaped `[batch, 1, k_len]` or `[batch, q_len, k_len]`.
/// * `mode` selects inference or training; stochastic regularisation draws
///   from the random source carried by [`ForwardMode::Training`].
///
/// Implementations keep no state between calls, so a shared reference may be
/// used from several threads at once.
pub trait Attention {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut ForwardMode<'_>,
    ) -> Result<AttentionOutput>;
}
