//! Config-driven choice between the attention mechanisms.

use candle_core::{Device, Tensor};
use layers::ForwardMode;

use crate::core::{Attention, AttentionConfig, AttentionKind, AttentionOutput, Result};
use crate::nystrom::NystromAttention;
use crate::standard::StandardAttention;

/// An attention sublayer whose mechanism is picked by configuration.
#[derive(Debug)]
pub enum AttentionLayer {
    Standard(StandardAttention),
    Nystrom(NystromAttention),
}

impl AttentionLayer {
    /// Validates `config` and builds the mechanism named by `config.kind`.
    pub fn from_config(config: &AttentionConfig, device: &Device) -> Result<Self> {
        match config.kind {
            AttentionKind::Standard => Ok(Self::Standard(StandardAttention::new(config, device)?)),
            AttentionKind::Nystrom(_) => Ok(Self::Nystrom(NystromAttention::new(config, device)?)),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Standard(_) => "standard",
            Self::Nystrom(_) => "nystrom",
        }
    }
}

impl Attention for AttentionLayer {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut ForwardMode<'_>,
    ) -> Result<AttentionOutput> {
        match self {
            Self::Standard(inner) => inner.forward(query, key, value, mask, mode),
            Self::Nystrom(inner) => inner.forward(query, key, value, mask, mode),
        }
    }
}

impl From<StandardAttention> for AttentionLayer {
    fn from(value: StandardAttention) -> Self {
        Self::Standard(value)
    }
}

impl From<NystromAttention> for AttentionLayer {
    fn from(value: NystromAttention) -> Self {
        Self::Nystrom(value)
    }
}
