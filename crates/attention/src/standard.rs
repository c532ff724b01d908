//! Multi-head scaled dot-product attention.
//!
//! The exact path: every query scores every key, the scores are masked and
//! softmax-normalised, dropout is applied to the weights, and the weighted
//! values are merged across heads and projected back to the feature size.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;
use layers::{Dropout, ForwardMode};

use crate::core::{Attention, AttentionConfig, AttentionError, AttentionOutput, Result};
use crate::heads::HeadProjection;
use crate::masks;

/// Standard multi-head attention with optional masking and dropout.
#[derive(Debug)]
pub struct StandardAttention {
    projection: HeadProjection,
    dropout: Dropout,
    first_call: OnceLock<()>,
}

impl StandardAttention {
    /// Builds randomly initialised attention from `config`.
    ///
    /// Only the shared geometry and dropout rate are read; the mechanism
    /// selector in `config.kind` is ignored.
    pub fn new(config: &AttentionConfig, device: &Device) -> Result<Self> {
        let mut standard = config.clone();
        standard.kind = Default::default();
        standard.validate()?;
        let projection = HeadProjection::with_init(
            standard.n_head,
            standard.n_feat,
            standard.n_attn,
            device,
            standard.param_dtype(),
        )?;
        log::debug!(
            "attention::standard built n_head={} n_feat={} n_attn={} dropout={}",
            standard.n_head,
            standard.n_feat,
            standard.n_attn,
            standard.dropout_rate
        );
        Self::from_projection(projection, standard.dropout_rate)
    }

    /// Wraps existing projections.
    pub fn from_projection(projection: HeadProjection, dropout_rate: f32) -> Result<Self> {
        if projection.n_feat() % projection.n_head() != 0 {
            return Err(AttentionError::config(format!(
                "n_feat ({}) must be divisible by n_head ({})",
                projection.n_feat(),
                projection.n_head()
            )));
        }
        let dropout = Dropout::new(dropout_rate).map_err(|err| AttentionError::config(err.to_string()))?;
        Ok(Self {
            projection,
            dropout,
            first_call: OnceLock::new(),
        })
    }

    pub fn projection(&self) -> &HeadProjection {
        &self.projection
    }

    pub fn dropout(&self) -> &Dropout {
        &self.dropout
    }

    /// Projects the inputs into heads; see [`HeadProjection::forward_qkv`].
    pub fn forward_qkv(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        self.projection.forward_qkv(query, key, value)
    }

    /// `Q·Kᵀ / sqrt(d_k)`, shaped `[batch, head, q_len, k_len]`.
    pub fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let k_t = k.t()?.contiguous()?;
        let scale = 1.0 / (self.projection.d_k() as f64).sqrt();
        Ok(q.matmul(&k_t)?.affine(scale, 0.0)?)
    }

    /// Turns raw scores into the attended output.
    ///
    /// `value` is `[batch, head, k_len, d_k]`, `scores` is
    /// `[batch, head, q_len, k_len]`. Masked keys get the most negative score
    /// before the softmax and are zeroed after it, so a row whose keys are all
    /// masked ends up with zero weight everywhere.
    pub fn forward_attention(
        &self,
        value: &Tensor,
        scores: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut ForwardMode<'_>,
    ) -> Result<AttentionOutput> {
        let (batch, _, q_len, k_len) = scores.dims4()?;

        let weights = match mask {
            Some(mask) => {
                let masked_out = masks::prepare_mask(mask, batch, q_len, k_len)?;
                let scores = masks::fill_masked_scores(scores, &masked_out)?;
                let weights = softmax(&scores, D::Minus1)?;
                masks::zero_masked_weights(&weights, &masked_out)?
            }
            None => softmax(scores, D::Minus1)?,
        };

        let dropped = self.dropout.forward(&weights, mode)?;
        let context = dropped.matmul(value)?;
        let output = self.projection.project_out(&context)?;
        Ok(AttentionOutput { output, weights })
    }

    fn log_first_call(&self, query: &Tensor, key: &Tensor, mask: Option<&Tensor>) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::standard init n_head={} d_k={} dropout={} query={:?} key={:?} mask={:?}",
                self.projection.n_head(),
                self.projection.d_k(),
                self.dropout.probability(),
                query.dims(),
                key.dims(),
                mask.map(|m| m.dims().to_vec())
            );
        }
    }
}

impl Attention for StandardAttention {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        mode: &mut ForwardMode<'_>,
    ) -> Result<AttentionOutput> {
        self.log_first_call(query, key, mask);
        let (q, k, v) = self.forward_qkv(query, key, value)?;
        let scores = self.scores(&q, &k)?;
        self.forward_attention(&v, &scores, mask, mode)
    }
}

/// Weight rows summed over the key axis, `[batch, head, q_len]` in `f32`.
pub fn weight_row_sums(weights: &Tensor) -> Result<Tensor> {
    Ok(weights.to_dtype(DType::F32)?.sum(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::non_pad_mask;
    use rand::{rngs::StdRng, SeedableRng};

    fn build(n_head: usize, n_feat: usize, dropout: f32) -> Result<StandardAttention> {
        StandardAttention::new(
            &AttentionConfig::standard(n_head, n_feat, n_feat, dropout),
            &Device::Cpu,
        )
    }

    fn naive_attention(q: &[f32], k: &[f32], v: &[f32], len: usize, dim: usize) -> Vec<f32> {
        let scale = 1.0 / (dim as f32).sqrt();
        let mut out = vec![0f32; len * dim];
        for i in 0..len {
            let row: Vec<f32> = (0..len)
                .map(|j| (0..dim).map(|d| q[i * dim + d] * k[j * dim + d]).sum::<f32>() * scale)
                .collect();
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
            let denom: f32 = exps.iter().sum();
            for d in 0..dim {
                out[i * dim + d] = (0..len).map(|j| exps[j] / denom * v[j * dim + d]).sum();
            }
        }
        out
    }

    #[test]
    fn forward_attention_matches_naive_single_head() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(1, 4, 0.0)?;
        let q = Tensor::randn(0f32, 1.0, (1, 1, 3, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 1, 3, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 1, 3, 4), &device)?;
        let scores = attention.scores(&q, &k)?;
        let weights = softmax(&scores, D::Minus1)?;
        let context = weights.matmul(&v)?.flatten_all()?.to_vec1::<f32>()?;

        let expected = naive_attention(
            &q.flatten_all()?.to_vec1::<f32>()?,
            &k.flatten_all()?.to_vec1::<f32>()?,
            &v.flatten_all()?.to_vec1::<f32>()?,
            3,
            4,
        );
        for (got, want) in context.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn masked_keys_receive_zero_weight() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(2, 8, 0.0)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let mask = non_pad_mask(&device, &[2, 4], 4)?;
        let out = attention.forward(&x, &x, &x, Some(&mask), &mut ForwardMode::Inference)?;

        let batch0 = out.weights.narrow(0, 0, 1)?;
        let padded = batch0.narrow(3, 2, 2)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(padded, 0.0);
        let sums = weight_row_sums(&out.weights)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn fully_masked_rows_sum_to_zero() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(2, 8, 0.0)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
        // Query 1 may attend nothing.
        let mask = Tensor::from_vec(vec![1u8, 1, 1, 0, 0, 0, 1, 0, 1], (1, 3, 3), &device)?;
        let out = attention.forward(&x, &x, &x, Some(&mask), &mut ForwardMode::Inference)?;

        let sums = weight_row_sums(&out.weights)?.squeeze(0)?.to_vec2::<f32>()?;
        for head in sums {
            assert!((head[0] - 1.0).abs() < 1e-5);
            assert_eq!(head[1], 0.0);
            assert!((head[2] - 1.0).abs() < 1e-5);
        }
        let finite = out.output.flatten_all()?.to_vec1::<f32>()?;
        assert!(finite.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_only_applies_in_training() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(2, 8, 0.5)?;
        let x = Tensor::randn(0f32, 1.0, (1, 6, 8), &device)?;

        let eval_a = attention.forward(&x, &x, &x, None, &mut ForwardMode::Inference)?;
        let eval_b = attention.forward(&x, &x, &x, None, &mut ForwardMode::Inference)?;
        let diff = eval_a
            .output
            .sub(&eval_b.output)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);

        let mut rng = StdRng::seed_from_u64(11);
        let train = attention.forward(&x, &x, &x, None, &mut ForwardMode::training(&mut rng))?;
        let diff = train
            .output
            .sub(&eval_a.output)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff > 0.0);
        // Returned weights are taken before dropout.
        let weight_diff = train
            .weights
            .sub(&eval_a.weights)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(weight_diff < 1e-6);
        Ok(())
    }

    #[test]
    fn seeded_training_runs_are_reproducible() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(2, 8, 0.3)?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let mut first = StdRng::seed_from_u64(5);
        let mut second = StdRng::seed_from_u64(5);
        let a = attention.forward(&x, &x, &x, None, &mut ForwardMode::training(&mut first))?;
        let b = attention.forward(&x, &x, &x, None, &mut ForwardMode::training(&mut second))?;
        let diff = a.output.sub(&b.output)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn half_precision_parameters_track_f32() -> Result<()> {
        let device = Device::Cpu;
        let mut config = AttentionConfig::standard(2, 8, 8, 0.0);
        config.dtype = crate::core::ParamDType::Bf16;
        let attention = StandardAttention::new(&config, &device)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?.to_dtype(DType::BF16)?;
        let out = attention.forward(&x, &x, &x, None, &mut ForwardMode::Inference)?;
        assert_eq!(out.output.dtype(), DType::BF16);
        assert_eq!(out.weights.dtype(), DType::F32);
        let sums = weight_row_sums(&out.weights)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn numerical_stability_with_large_inputs() -> Result<()> {
        let device = Device::Cpu;
        let attention = build(1, 4, 0.0)?;
        let q = Tensor::full(1.0e4f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-1.0e4f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let scores = attention.scores(&q, &k)?;
        let out = attention.forward_attention(&v, &scores, None, &mut ForwardMode::Inference)?;
        let values = out.output.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn indivisible_feature_size_fails_fast() {
        let err = StandardAttention::new(&AttentionConfig::standard(3, 16, 12, 0.0), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, AttentionError::Config(_)));
    }
}
