//! Query/key/value projections and the head split/merge reshapes.

use candle_core::{DType, Device, Tensor};
use layers::{checks, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionError, Result};

/// The four dense projections of a multi-head attention sublayer.
///
/// `linear_q`, `linear_k` and `linear_v` map `n_feat -> n_attn`; `linear_out`
/// maps `n_attn -> n_feat`. Both attention mechanisms share this layout so
/// their parameters are interchangeable.
#[derive(Debug, Clone)]
pub struct HeadProjection {
    n_head: usize,
    d_k: usize,
    n_feat: usize,
    policy: PrecisionPolicy,
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
}

impl HeadProjection {
    /// Randomly initialised projections with the customary fan-in uniform scheme.
    pub fn with_init(
        n_head: usize,
        n_feat: usize,
        n_attn: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        check_geometry(n_head, n_feat, n_attn)?;
        let init = LinearInit::FanInUniform;
        let build = |input: usize, output: usize| {
            Linear::with_init(LinearConfig::new(input, output), &init, device, dtype)
        };
        Self::from_linears(
            n_head,
            build(n_feat, n_attn)?,
            build(n_feat, n_attn)?,
            build(n_feat, n_attn)?,
            build(n_attn, n_feat)?,
        )
    }

    /// Assembles projections from existing layers, checking they agree.
    pub fn from_linears(
        n_head: usize,
        linear_q: Linear,
        linear_k: Linear,
        linear_v: Linear,
        linear_out: Linear,
    ) -> Result<Self> {
        let n_feat = linear_q.config().input_dim;
        let n_attn = linear_q.config().output_dim;
        check_geometry(n_head, n_feat, n_attn)?;

        for (name, linear) in [("linear_k", &linear_k), ("linear_v", &linear_v)] {
            let cfg = linear.config();
            if cfg.input_dim != n_feat || cfg.output_dim != n_attn {
                return Err(AttentionError::config(format!(
                    "{name} maps {} -> {}, expected {n_feat} -> {n_attn}",
                    cfg.input_dim, cfg.output_dim
                )));
            }
        }
        let out = linear_out.config();
        if out.input_dim != n_attn || out.output_dim != n_feat {
            return Err(AttentionError::config(format!(
                "linear_out maps {} -> {}, expected {n_attn} -> {n_feat}",
                out.input_dim, out.output_dim
            )));
        }

        let dtype = linear_q.weight().dtype();
        Ok(Self {
            n_head,
            d_k: n_attn / n_head,
            n_feat,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            linear_q,
            linear_k,
            linear_v,
            linear_out,
        })
    }

    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Per-head feature size.
    pub fn d_k(&self) -> usize {
        self.d_k
    }

    pub fn n_feat(&self) -> usize {
        self.n_feat
    }

    pub fn n_attn(&self) -> usize {
        self.n_head * self.d_k
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    /// Policy that keeps tensors in the compute dtype on both sides.
    pub fn compute_policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::new(self.policy.compute(), self.policy.compute())
    }

    pub fn linear_q(&self) -> &Linear {
        &self.linear_q
    }

    pub fn linear_k(&self) -> &Linear {
        &self.linear_k
    }

    pub fn linear_v(&self) -> &Linear {
        &self.linear_v
    }

    pub fn linear_out(&self) -> &Linear {
        &self.linear_out
    }

    /// Projects query, key and value and splits them into heads.
    ///
    /// Returns `[batch, head, time, d_k]` tensors in the compute dtype.
    pub fn forward_qkv(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        self.validate_inputs(query, key, value)?;
        let q = self.split_heads(&self.linear_q.forward(query, &self.policy)?)?;
        let k = self.split_heads(&self.linear_k.forward(key, &self.policy)?)?;
        let v = self.split_heads(&self.linear_v.forward(value, &self.policy)?)?;
        Ok((q, k, v))
    }

    /// `[batch, time, n_attn] -> [batch, head, time, d_k]`.
    pub fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, time, _) = tensor.dims3()?;
        let split = self
            .policy
            .cast_for_compute(tensor)?
            .reshape((batch, time, self.n_head, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(split)
    }

    /// `[batch, head, time, d_k] -> [batch, time, n_attn]`.
    pub fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, heads, time, d_k) = tensor.dims4()?;
        if heads != self.n_head || d_k != self.d_k {
            return Err(AttentionError::shape(format!(
                "merge_heads expected [_, {}, _, {}] got {:?}",
                self.n_head,
                self.d_k,
                tensor.dims()
            )));
        }
        Ok(tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, time, self.n_attn()))?)
    }

    /// Merges heads and applies the output projection back to `n_feat`.
    pub fn project_out(&self, heads: &Tensor) -> Result<Tensor> {
        let merged = self.merge_heads(heads)?;
        Ok(self.linear_out.forward(&merged, &self.policy)?)
    }

    fn validate_inputs(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<()> {
        for (label, tensor) in [("query", query), ("key", key), ("value", value)] {
            checks::expect_batch_time_feature(label, tensor, self.n_feat)
                .map_err(|err| AttentionError::shape(err.to_string()))?;
            if !tensor.device().same_device(query.device()) {
                return Err(AttentionError::shape(format!(
                    "{label} must reside on the same device as query"
                )));
            }
            if !matches!(
                tensor.dtype(),
                DType::F32 | DType::F16 | DType::BF16 | DType::F64
            ) {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("{label}: {:?}", tensor.dtype()),
                });
            }
        }

        let (q_batch, _, _) = query.dims3()?;
        let (k_batch, k_len, _) = key.dims3()?;
        let (v_batch, v_len, _) = value.dims3()?;
        if k_batch != q_batch || v_batch != q_batch {
            return Err(AttentionError::shape(format!(
                "batch mismatch: query {q_batch}, key {k_batch}, value {v_batch}"
            )));
        }
        if k_len != v_len {
            return Err(AttentionError::shape(format!(
                "key time {k_len} must match value time {v_len}"
            )));
        }
        Ok(())
    }
}

fn check_geometry(n_head: usize, n_feat: usize, n_attn: usize) -> Result<()> {
    if n_head == 0 || n_feat == 0 || n_attn == 0 {
        return Err(AttentionError::config(format!(
            "n_head ({n_head}), n_feat ({n_feat}) and n_attn ({n_attn}) must be non-zero"
        )));
    }
    if n_attn % n_head != 0 {
        return Err(AttentionError::config(format!(
            "n_attn ({n_attn}) must be divisible by n_head ({n_head})"
        )));
    }
    Ok(())
}
