//! Closed-form conversions for each exponential-family member.
//!
//! Every module exposes the same set of pure functions over `ParamDict`s:
//! `nat_from_std`, `std_from_nat`, `unc_from_std`, `std_from_unc`,
//! `log_a`, `expected_stats`, `npf`, `log_h` and sampling. Mean parameters
//! (expected sufficient statistics) are keyed by the natural-parameter key
//! they pair with, so `ν·E[f]` is a key-by-key inner product.

pub mod beta;
pub mod categorical;
pub mod dirichlet;
pub mod gamma;
pub mod gaussian;
pub mod multivariate_gaussian;

use candle_core::{Tensor, D};

use crate::error::Result;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Sum everything but the leading sample dimension: (N, ...) -> (N,)
pub(crate) fn sum_event(x: &Tensor) -> Result<Tensor> {
    if x.rank() <= 1 {
        Ok(x.clone())
    } else {
        Ok(x.flatten_from(1)?.sum(1)?)
    }
}

/// A length-N vector filled with `value`, matching `like`'s dtype/device.
pub(crate) fn per_sample(value: f64, like: &Tensor) -> Result<Tensor> {
    let n = like.dim(0)?;
    Ok(Tensor::full(value, n, like.device())?.to_dtype(like.dtype())?)
}

/// Number of elements per sample of a (N, ...) batch.
pub(crate) fn event_size(thetas: &Tensor) -> Result<usize> {
    let n = thetas.dim(0)?.max(1);
    Ok(thetas.elem_count() / n)
}

/// Numerically stable softmax along the last dimension.
pub(crate) fn softmax_last(x: &Tensor) -> Result<Tensor> {
    let shifted = x.broadcast_sub(&x.max_keepdim(D::Minus1)?)?;
    let e = shifted.exp()?;
    Ok(e.broadcast_div(&e.sum_keepdim(D::Minus1)?)?)
}

pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Shape `(n, dims...)` for `n` draws of a parameter shaped `dims`.
pub(crate) fn sample_shape(n: usize, dims: &[usize]) -> Vec<usize> {
    let mut ret = Vec::with_capacity(dims.len() + 1);
    ret.push(n);
    ret.extend_from_slice(dims);
    ret
}
