//! Dropout gated by an explicit forward mode.
//!
//! There is no global train/eval switch: every forward call receives a
//! [`ForwardMode`]. In [`ForwardMode::Inference`] dropout is the identity; in
//! [`ForwardMode::Training`] the caller lends the random source used to sample
//! the keep mask, so two runs seeded alike drop the same entries.

use std::fmt;

use candle_core::{Error, Result, Tensor};
use rand::{Rng, RngCore};

/// Execution mode threaded through forward passes.
pub enum ForwardMode<'a> {
    /// Deterministic evaluation; stochastic regularisers are disabled.
    Inference,
    /// Training with the supplied random source.
    Training(&'a mut dyn RngCore),
}

impl<'a> ForwardMode<'a> {
    /// Convenience constructor for training mode.
    pub fn training(rng: &'a mut dyn RngCore) -> Self {
        ForwardMode::Training(rng)
    }

    pub fn is_training(&self) -> bool {
        matches!(self, ForwardMode::Training(_))
    }
}

impl fmt::Debug for ForwardMode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardMode::Inference => f.write_str("Inference"),
            ForwardMode::Training(_) => f.write_str("Training"),
        }
    }
}

/// Inverted dropout: survivors are scaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    /// Creates a dropout layer; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self { probability })
    }

    /// A dropout layer that never drops anything.
    pub fn disabled() -> Self {
        Self { probability: 0.0 }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Applies dropout to `input` according to `mode`.
    pub fn forward(&self, input: &Tensor, mode: &mut ForwardMode<'_>) -> Result<Tensor> {
        let rng = match mode {
            ForwardMode::Training(rng) if self.probability > 0.0 => rng,
            _ => return Ok(input.clone()),
        };

        let keep_prob = 1.0 - self.probability;
        let mask_data = sample_keep_mask(&mut **rng, input.elem_count(), keep_prob);
        let mask = Tensor::from_vec(mask_data, input.dims(), input.device())?
            .to_dtype(input.dtype())?;
        input
            .mul(&mask)?
            .affine(1.0 / f64::from(keep_prob), 0.0)
    }
}

fn sample_keep_mask(rng: &mut dyn RngCore, len: usize, keep_prob: f32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            if rng.gen::<f32>() < keep_prob {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}
