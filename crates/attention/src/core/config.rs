//! Configuration shared by all attention implementations.
//!
//! [`AttentionConfig`] captures the construction parameters of a multi-head
//! attention sublayer and which mechanism computes it. Configs deserialize
//! from TOML or JSON:
//!
//! ```toml
//! n_head = 4
//! n_feat = 256
//! n_attn = 256
//! dropout_rate = 0.1
//!
//! [kind]
//! type = "nystrom"
//! n_landmarks = 32
//! d_kernel = 33
//! ```

use std::{env, fs, path::Path};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Refinement steps of the pseudoinverse iteration when none is configured.
pub const DEFAULT_PINV_ITERATIONS: usize = 6;

/// Overrides the configured pseudoinverse iteration count.
pub const ENV_PINV_ITERS: &str = "ATTENTION_PINV_ITERS";
/// When set (to anything but `0`/`false`), forces the dropout rate to zero.
pub const ENV_DISABLE_DROPOUT: &str = "ATTENTION_DISABLE_DROPOUT";

/// Storage dtype for projection and convolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamDType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl From<ParamDType> for DType {
    fn from(value: ParamDType) -> Self {
        match value {
            ParamDType::F32 => DType::F32,
            ParamDType::F16 => DType::F16,
            ParamDType::Bf16 => DType::BF16,
        }
    }
}

/// Parameters specific to the Nyström approximation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NystromConfig {
    /// Number of segment-averaged landmark positions.
    pub n_landmarks: usize,
    /// Width of the depthwise convolution over values; must be odd.
    pub d_kernel: usize,
    #[serde(default = "default_pinv_iterations")]
    pub pinv_iterations: usize,
}

impl NystromConfig {
    pub fn new(n_landmarks: usize, d_kernel: usize) -> Self {
        Self {
            n_landmarks,
            d_kernel,
            pinv_iterations: DEFAULT_PINV_ITERATIONS,
        }
    }
}

fn default_pinv_iterations() -> usize {
    DEFAULT_PINV_ITERATIONS
}

/// Which mechanism computes the attention sublayer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionKind {
    /// Full scaled dot-product attention.
    #[default]
    Standard,
    /// Landmark-based linear-cost approximation.
    Nystrom(NystromConfig),
}

/// Construction parameters of a multi-head attention sublayer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Number of heads.
    pub n_head: usize,
    /// Feature size of the incoming and outgoing activations.
    pub n_feat: usize,
    /// Total attention width, split evenly across heads.
    pub n_attn: usize,
    /// Dropout applied to attention weights during training.
    #[serde(default)]
    pub dropout_rate: f32,
    #[serde(default)]
    pub dtype: ParamDType,
    #[serde(default)]
    pub kind: AttentionKind,
}

impl AttentionConfig {
    /// Standard attention with the given geometry.
    pub fn standard(n_head: usize, n_feat: usize, n_attn: usize, dropout_rate: f32) -> Self {
        Self {
            n_head,
            n_feat,
            n_attn,
            dropout_rate,
            dtype: ParamDType::default(),
            kind: AttentionKind::Standard,
        }
    }

    /// Nyström attention with the given geometry and default iteration count.
    pub fn nystrom(
        n_head: usize,
        n_feat: usize,
        n_attn: usize,
        n_landmarks: usize,
        d_kernel: usize,
    ) -> Self {
        Self {
            n_head,
            n_feat,
            n_attn,
            dropout_rate: 0.0,
            dtype: ParamDType::default(),
            kind: AttentionKind::Nystrom(NystromConfig::new(n_landmarks, d_kernel)),
        }
    }

    /// Per-head feature size. Only meaningful once [`validate`](Self::validate) passed.
    pub fn head_dim(&self) -> usize {
        self.n_attn / self.n_head.max(1)
    }

    /// Parameter storage dtype.
    pub fn param_dtype(&self) -> DType {
        self.dtype.into()
    }

    /// Reads a config from `.toml` (the default) or `.json` and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: AttentionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `ATTENTION_PINV_ITERS` / `ATTENTION_DISABLE_DROPOUT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(ENV_PINV_ITERS) {
            match (raw.trim().parse::<usize>(), &mut self.kind) {
                (Ok(iters), AttentionKind::Nystrom(nystrom)) => {
                    log::debug!("{ENV_PINV_ITERS} overrides pinv_iterations to {iters}");
                    nystrom.pinv_iterations = iters;
                }
                (Ok(_), AttentionKind::Standard) => {}
                (Err(err), _) => log::warn!("ignoring {ENV_PINV_ITERS}={raw:?}: {err}"),
            }
        }
        if let Ok(raw) = env::var(ENV_DISABLE_DROPOUT) {
            let raw = raw.trim();
            if !(raw.is_empty() || raw == "0" || raw.eq_ignore_ascii_case("false")) {
                self.dropout_rate = 0.0;
            }
        }
    }

    /// Checks every structural invariant, reporting all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.n_head == 0 {
            errors.push("n_head must be greater than zero".to_string());
        }
        if self.n_feat == 0 {
            errors.push("n_feat must be greater than zero".to_string());
        }
        if self.n_attn == 0 {
            errors.push("n_attn must be greater than zero".to_string());
        }
        if self.n_head > 0 && self.n_attn % self.n_head != 0 {
            errors.push(format!(
                "n_attn ({}) must be divisible by n_head ({})",
                self.n_attn, self.n_head
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            errors.push(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            ));
        }

        match &self.kind {
            AttentionKind::Standard => {
                if self.n_head > 0 && self.n_feat % self.n_head != 0 {
                    errors.push(format!(
                        "n_feat ({}) must be divisible by n_head ({})",
                        self.n_feat, self.n_head
                    ));
                }
            }
            AttentionKind::Nystrom(nystrom) => {
                if nystrom.n_landmarks == 0 {
                    errors.push("n_landmarks must be greater than zero".to_string());
                }
                if nystrom.d_kernel % 2 == 0 {
                    errors.push(format!(
                        "d_kernel must be odd so the convolution preserves length, got {}",
                        nystrom.d_kernel
                    ));
                }
                if self.dropout_rate > 0.0 {
                    log::warn!("dropout_rate has no effect on nystrom attention");
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_dim_divides_attention_width() {
        let cfg = AttentionConfig::standard(4, 16, 16, 0.0);
        cfg.validate().unwrap();
        assert_eq!(cfg.head_dim(), 4);
    }

    #[test]
    fn indivisible_attention_width_is_rejected() {
        let cfg = AttentionConfig::standard(3, 15, 16, 0.0);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, AttentionError::Config(_)));
        assert!(err.to_string().contains("n_attn (16)"));
    }

    #[test]
    fn validation_reports_every_violation() {
        let mut cfg = AttentionConfig::nystrom(0, 0, 16, 0, 4);
        cfg.dropout_rate = 1.5;
        let message = cfg.validate().unwrap_err().to_string();
        for needle in ["n_head", "n_feat", "dropout_rate", "n_landmarks", "d_kernel"] {
            assert!(message.contains(needle), "missing {needle} in {message}");
        }
    }

    #[test]
    fn toml_round_trips_nystrom_kind() {
        let raw = r#"
            n_head = 4
            n_feat = 16
            n_attn = 16

            [kind]
            type = "nystrom"
            n_landmarks = 4
            d_kernel = 3
        "#;
        let cfg: AttentionConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.kind, AttentionKind::Nystrom(NystromConfig::new(4, 3)));
        assert_eq!(cfg.dtype, ParamDType::F32);
        assert_eq!(cfg.dropout_rate, 0.0);

        let encoded = toml::to_string(&cfg).unwrap();
        let decoded: AttentionConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn json_defaults_to_standard_kind() {
        let cfg: AttentionConfig =
            serde_json::from_str(r#"{"n_head": 2, "n_feat": 8, "n_attn": 8, "dtype": "bf16"}"#)
                .unwrap();
        assert_eq!(cfg.kind, AttentionKind::Standard);
        assert_eq!(cfg.param_dtype(), DType::BF16);
    }
}
