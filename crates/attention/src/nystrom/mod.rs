//! Nyström approximation of multi-head attention.
//!
//! The full `q_len × k_len` softmax is replaced by three row-stochastic kernel
//! blocks built against `n_landmarks` segment-averaged positions:
//!
//! ```text
//! kernel_1 = softmax(Q · K̃ᵀ)   [q_len, m]
//! kernel_2 = softmax(Q̃ · K̃ᵀ)   [m, m]
//! kernel_3 = softmax(Q̃ · Kᵀ)   [m, k_len]
//! out      = kernel_1 · pinv(kernel_2) · (kernel_3 · V) + conv(V)
//! ```
//!
//! Q and K are each scaled by `d_k^-1/4` so the products carry the usual
//! `1/sqrt(d_k)` factor. The depthwise convolution over V restores local
//! detail the landmarks average away.
//!
//! Masks are accepted for interface parity and ignored. Padded frames take part
//! in the landmarks and in every kernel block, so callers that need them
//! excluded must zero them upstream.

pub mod landmarks;
pub mod pinv;

use std::sync::OnceLock;

use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use layers::{DepthwiseTimeConv, DepthwiseTimeConvConfig, ForwardMode};

use crate::core::{
    Attention, AttentionConfig, AttentionError, AttentionKind, AttentionOutput, Result,
};
use crate::heads::HeadProjection;

pub use landmarks::{segment_len, segment_means};
pub use pinv::{inverse_residual, iterative_inv, iterative_inv_traced, PinvTrace};

/// Landmark-based attention with a convolutional residual over values.
#[derive(Debug)]
pub struct NystromAttention {
    projection: HeadProjection,
    conv: DepthwiseTimeConv,
    n_landmarks: usize,
    pinv_iterations: usize,
    first_call: OnceLock<()>,
}

impl NystromAttention {
    /// Builds randomly initialised parameters from a `nystrom` config.
    pub fn new(config: &AttentionConfig, device: &Device) -> Result<Self> {
        let nystrom = match &config.kind {
            AttentionKind::Nystrom(nystrom) => nystrom,
            AttentionKind::Standard => {
                return Err(AttentionError::config(
                    "NystromAttention requires a config of kind `nystrom`",
                ))
            }
        };
        config.validate()?;

        let dtype = config.param_dtype();
        let projection =
            HeadProjection::with_init(config.n_head, config.n_feat, config.n_attn, device, dtype)?;
        let conv = DepthwiseTimeConv::with_init(
            DepthwiseTimeConvConfig::new(config.n_head, nystrom.d_kernel),
            device,
            dtype,
        )?;
        log::debug!(
            "attention::nystrom built n_head={} n_feat={} n_attn={} n_landmarks={} d_kernel={} pinv_iterations={}",
            config.n_head,
            config.n_feat,
            config.n_attn,
            nystrom.n_landmarks,
            nystrom.d_kernel,
            nystrom.pinv_iterations
        );
        Self::from_parts(projection, conv, nystrom.n_landmarks, nystrom.pinv_iterations)
    }

    /// Assembles the module from existing parameters.
    pub fn from_parts(
        projection: HeadProjection,
        conv: DepthwiseTimeConv,
        n_landmarks: usize,
        pinv_iterations: usize,
    ) -> Result<Self> {
        if n_landmarks == 0 {
            return Err(AttentionError::config("n_landmarks must be greater than zero"));
        }
        if conv.config().channels != projection.n_head() {
            return Err(AttentionError::config(format!(
                "convolution has {} channels but attention has {} heads",
                conv.config().channels,
                projection.n_head()
            )));
        }
        Ok(Self {
            projection,
            conv,
            n_landmarks,
            pinv_iterations,
            first_call: OnceLock::new(),
        })
    }

    pub fn projection(&self) -> &HeadProjection {
        &self.projection
    }

    pub fn conv(&self) -> &DepthwiseTimeConv {
        &self.conv
    }

    pub fn n_landmarks(&self) -> usize {
        self.n_landmarks
    }

    pub fn pinv_iterations(&self) -> usize {
        self.pinv_iterations
    }

    /// Runs a forward pass and records the pseudoinverse residuals.
    pub fn forward_traced(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(AttentionOutput, PinvTrace)> {
        let mut trace = PinvTrace::default();
        let output = self.approximate(query, key, value, Some(&mut trace))?;
        Ok((output, trace))
    }

    fn approximate(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        trace: Option<&mut PinvTrace>,
    ) -> Result<AttentionOutput> {
        let (q, k, v) = self.projection.forward_qkv(query, key, value)?;
        let scale = (self.projection.d_k() as f64).powf(-0.25);
        let q = q.affine(scale, 0.0)?;
        let k = k.affine(scale, 0.0)?;

        let q_landmarks = segment_means(&q, self.n_landmarks)?;
        let k_landmarks = segment_means(&k, self.n_landmarks)?;
        let k_landmarks_t = k_landmarks.t()?.contiguous()?;

        let kernel_1 = softmax(&q.matmul(&k_landmarks_t)?, D::Minus1)?;
        let kernel_2 = softmax(&q_landmarks.matmul(&k_landmarks_t)?, D::Minus1)?;
        let kernel_3 = softmax(&q_landmarks.matmul(&k.t()?.contiguous()?)?, D::Minus1)?;

        let kernel_2_inv = match trace {
            Some(trace) => {
                let (inv, recorded) = iterative_inv_traced(&kernel_2, self.pinv_iterations)?;
                *trace = recorded;
                inv
            }
            None => iterative_inv(&kernel_2, self.pinv_iterations)?,
        };

        let left = kernel_1.matmul(&kernel_2_inv)?;
        let context = left.matmul(&kernel_3.matmul(&v)?)?;
        let weights = left.matmul(&kernel_3)?;

        let local = self.conv.forward(&v, &self.projection.compute_policy())?;
        let output = self.projection.project_out(&(context + local)?)?;
        Ok(AttentionOutput { output, weights })
    }

    fn log_first_call(&self, query: &Tensor, key: &Tensor, mask: Option<&Tensor>) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::nystrom init n_head={} d_k={} n_landmarks={} d_kernel={} pinv_iterations={} query={:?} key={:?}",
                self.projection.n_head(),
                self.projection.d_k(),
                self.n_landmarks,
                self.conv.config().kernel_size,
                self.pinv_iterations,
                query.dims(),
                key.dims()
            );
            if mask.is_some() {
                log::debug!("attention::nystrom ignores the supplied mask");
            }
        }
    }
}

impl Attention for NystromAttention {
    /// `mask` and `mode` are accepted for interface parity; neither changes
    /// the result.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        _mode: &mut ForwardMode<'_>,
    ) -> Result<AttentionOutput> {
        self.log_first_call(query, key, mask);
        self.approximate(query, key, value, None)
    }
}
