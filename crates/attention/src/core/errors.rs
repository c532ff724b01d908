//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
///
/// Configuration problems are reported by constructors and config loaders,
/// never by a forward call. Numerical degeneracy (NaN/Inf) is not an error:
/// it propagates through the returned tensors.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Construction parameters violate a structural invariant.
    #[error("invalid attention configuration: {0}")]
    Config(String),
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A Candle operation failed.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
    #[error("failed to read attention config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse attention config: {0}")]
    ConfigFormat(String),
}

impl AttentionError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

impl From<toml::de::Error> for AttentionError {
    fn from(value: toml::de::Error) -> Self {
        AttentionError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for AttentionError {
    fn from(value: serde_json::Error) -> Self {
        AttentionError::ConfigFormat(value.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttentionError>;
