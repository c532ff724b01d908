//! Iterative Moore-Penrose pseudoinverse for row-stochastic kernels.
//!
//! A cubic Newton-Schulz style update refines a scaled transpose of the input
//! without ever calling a direct inverse, so the whole procedure stays
//! differentiable and batch-stable.

use candle_core::{DType, Device, Tensor, D};

use crate::core::Result;

/// Residuals recorded while refining a pseudoinverse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinvTrace {
    /// `‖K·V − I‖_F` for the initial guess followed by one entry per
    /// iteration; the maximum over all leading batch/head matrices.
    pub residuals: Vec<f32>,
}

impl PinvTrace {
    /// Residual of the returned approximation.
    pub fn final_residual(&self) -> Option<f32> {
        self.residuals.last().copied()
    }

    pub fn iterations(&self) -> usize {
        self.residuals.len().saturating_sub(1)
    }
}

/// Approximates the pseudoinverse of the square matrices in `mat` (`[.., n, n]`).
///
/// `V₀ = Kᵀ / c` with `c` the largest column sum of each matrix, then
/// `V ← ¼·V·(13I − KV·(15I − KV·(7I − KV)))` for exactly `n_iter` steps.
/// Degenerate inputs propagate NaN/Inf.
pub fn iterative_inv(mat: &Tensor, n_iter: usize) -> Result<Tensor> {
    refine(mat, n_iter, None)
}

/// Same as [`iterative_inv`] but also reports the residual after every step.
pub fn iterative_inv_traced(mat: &Tensor, n_iter: usize) -> Result<(Tensor, PinvTrace)> {
    let mut trace = PinvTrace::default();
    let inv = refine(mat, n_iter, Some(&mut trace))?;
    Ok((inv, trace))
}

/// Largest Frobenius norm of `K·V − I` across the leading dimensions.
pub fn inverse_residual(mat: &Tensor, inv: &Tensor) -> Result<f32> {
    let n = mat.dim(D::Minus1)?;
    let identity = identity(n, mat.dtype(), mat.device())?;
    residual_of(&mat.matmul(inv)?, &identity)
}

fn refine(mat: &Tensor, n_iter: usize, mut trace: Option<&mut PinvTrace>) -> Result<Tensor> {
    let n = mat.dim(D::Minus1)?;
    let identity = identity(n, mat.dtype(), mat.device())?;

    let col_sums = mat.sum_keepdim(D::Minus2)?;
    let scale = col_sums.max_keepdim(D::Minus1)?;
    let mut inv = mat.t()?.contiguous()?.broadcast_div(&scale)?;

    if let Some(trace) = trace.as_deref_mut() {
        trace.residuals.push(residual_of(&mat.matmul(&inv)?, &identity)?);
    }

    for step in 0..n_iter {
        let kv = mat.matmul(&inv)?;
        let inner = identity.affine(7.0, 0.0)?.broadcast_sub(&kv)?;
        let middle = identity.affine(15.0, 0.0)?.broadcast_sub(&kv.matmul(&inner)?)?;
        let outer = identity.affine(13.0, 0.0)?.broadcast_sub(&kv.matmul(&middle)?)?;
        inv = inv.matmul(&outer)?.affine(0.25, 0.0)?;

        if let Some(trace) = trace.as_deref_mut() {
            let residual = residual_of(&mat.matmul(&inv)?, &identity)?;
            log::trace!("pinv step {} residual {residual:.3e}", step + 1);
            trace.residuals.push(residual);
        }
    }
    Ok(inv)
}

fn identity(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut values = vec![0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(values, (n, n), device)?.to_dtype(dtype)?)
}

fn residual_of(product: &Tensor, identity: &Tensor) -> Result<f32> {
    let norms = product
        .broadcast_sub(identity)?
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sum_keepdim(D::Minus2)?
        .sqrt()?;
    Ok(norms.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}
