//! Affine projections used for the query/key/value and output transforms.
//!
//! Linear layers expect inputs shaped `(batch, time, in_dim)` (or `(rows,
//! in_dim)`) and return `(batch, time, out_dim)`. Weights follow the
//! `(out_dim, in_dim)` convention so checkpoints exported from other
//! frameworks load without transposition. Activations and weights are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is cast back with
//! [`PrecisionPolicy::cast_to_storage`].

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearInit {
    /// Uniform in `±1/sqrt(fan_in)` for both weight and bias, the customary
    /// default for freshly constructed dense layers.
    FanInUniform,
    /// Xavier/Glorot uniform initialisation (zero bias).
    XavierUniform,
    /// Xavier/Glorot normal initialisation (zero bias).
    XavierNormal,
}

impl LinearInit {
    fn sample_weight(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)
            }
        }
    }

    fn sample_bias(&self, out_dim: usize, in_dim: usize, device: &Device) -> Result<Tensor> {
        match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / (in_dim as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, out_dim, device)
            }
            _ => Tensor::zeros(out_dim, DType::F32, device),
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, &weight, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised parameters following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init
            .sample_weight((config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        let bias = if config.bias {
            Some(
                init.sample_bias(config.output_dim, config.input_dim, device)?
                    .to_dtype(dtype)?,
            )
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Weight tensor shaped `(output_dim, input_dim)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias tensor shaped `(output_dim,)`, if the layer has one.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_same_dtype("linear.bias", tensor, "linear.weight", weight)?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_compute(hidden)?;
        let weight_t = policy.cast_for_compute(&self.weight)?.t()?;

        let mut output = match input.dims() {
            &[batch, time, in_dim] if in_dim == self.config.input_dim => {
                let flat = input.reshape((batch * time, in_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, time, self.config.output_dim))?
            }
            &[_, in_dim] if in_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {}] or [T, {}], got {:?}",
                    self.config.input_dim, self.config.input_dim, dims
                )))
            }
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_compute(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
