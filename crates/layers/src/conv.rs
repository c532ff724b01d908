//! Depthwise convolution along the time axis of per-head activations.
//!
//! Inputs are laid out `(batch, channels, time, width)`; in the attention
//! modules `channels` are heads and `width` is the per-head feature size. Each
//! channel owns a single `(kernel_size, 1)` filter, so features never mix
//! across channels or across the width axis. Time is zero padded by
//! `kernel_size / 2` on both sides, which keeps the output length equal to the
//! input length for odd kernel sizes. There is no bias.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Shape parameters of a [`DepthwiseTimeConv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseTimeConvConfig {
    pub channels: usize,
    pub kernel_size: usize,
}

impl DepthwiseTimeConvConfig {
    pub fn new(channels: usize, kernel_size: usize) -> Self {
        Self {
            channels,
            kernel_size,
        }
    }

    /// Zero padding applied on each side of the time axis.
    pub fn padding(&self) -> usize {
        self.kernel_size / 2
    }

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::Msg("depthwise conv requires at least one channel".into()));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(Error::Msg(format!(
                "depthwise conv kernel size must be odd to preserve length, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }
}

/// Grouped convolution with one `(kernel_size, 1)` filter per channel.
#[derive(Debug, Clone)]
pub struct DepthwiseTimeConv {
    config: DepthwiseTimeConvConfig,
    weight: Tensor,
}

impl DepthwiseTimeConv {
    /// Wraps an existing weight shaped `(channels, 1, kernel_size, 1)`.
    pub fn new(config: DepthwiseTimeConvConfig, weight: Tensor) -> Result<Self> {
        config.validate()?;
        checks::expect_shape(
            "conv.weight",
            &weight,
            &[config.channels, 1, config.kernel_size, 1],
        )?;
        checks::expect_contiguous("conv.weight", &weight)?;
        Ok(Self { config, weight })
    }

    /// Uniform initialisation in `±1/sqrt(kernel_size)` (the filter fan-in).
    pub fn with_init(config: DepthwiseTimeConvConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let bound = 1.0 / (config.kernel_size as f32).sqrt();
        let weight = Tensor::rand(
            -bound,
            bound,
            (config.channels, 1, config.kernel_size, 1),
            device,
        )?
        .to_dtype(dtype)?;
        Self::new(config, weight)
    }

    /// A convolution whose output is identically zero.
    pub fn zeros(config: DepthwiseTimeConvConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let weight = Tensor::zeros((config.channels, 1, config.kernel_size, 1), dtype, device)?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &DepthwiseTimeConvConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Convolves `input` shaped `(batch, channels, time, width)`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (_, channels, _, _) = input.dims4()?;
        if channels != self.config.channels {
            return Err(Error::Msg(format!(
                "depthwise conv expects {} channels, got {channels}",
                self.config.channels
            )));
        }
        let pad = self.config.padding();
        let padded = policy.cast_for_compute(input)?.pad_with_zeros(2, pad, pad)?;
        let weight = policy.cast_for_compute(&self.weight)?;
        let output = padded.conv2d(&weight, 0, 1, 1, self.config.channels)?;
        policy.cast_to_storage(&output)
    }
}
