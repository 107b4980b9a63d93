use candle_core::{DType, Device, Shape, Tensor};
use nalgebra::{DMatrix, DVector};

use crate::error::{ParamError, Result};

/// Flatten a tensor (any dtype, any rank) into `f64` values, row-major.
pub fn to_f64_vec(x: &Tensor) -> Result<Vec<f64>> {
    Ok(x.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}

/// Build a tensor of `shape` from `f64` values, cast to `dtype`.
pub fn from_f64_vec<S: Into<Shape>>(
    data: Vec<f64>,
    shape: S,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

/// Elementwise `f64` map, off-graph. Used for special functions
/// (`ln Γ`, `ψ`) that have no tensor kernel.
pub fn map_f64<F>(x: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(f64) -> f64,
{
    let data = to_f64_vec(x)?.into_iter().map(f).collect::<Vec<_>>();
    from_f64_vec(data, x.shape().clone(), x.dtype(), x.device())
}

pub fn sum_f64(x: &Tensor) -> Result<f64> {
    Ok(to_f64_vec(x)?.iter().sum())
}

pub fn scalar_f64(x: &Tensor) -> Result<f64> {
    let v = to_f64_vec(x)?;
    match v.as_slice() {
        [s] => Ok(*s),
        _ => Err(ParamError::ShapeMismatch {
            key: "scalar".to_string(),
            left: vec![],
            right: x.dims().to_vec(),
        }),
    }
}

pub fn to_dmatrix(x: &Tensor) -> Result<DMatrix<f64>> {
    let (nrow, ncol) = x.dims2()?;
    Ok(DMatrix::from_row_slice(nrow, ncol, &to_f64_vec(x)?))
}

pub fn to_dvector(x: &Tensor) -> Result<DVector<f64>> {
    Ok(DVector::from_vec(to_f64_vec(x)?))
}

pub fn dmatrix_to_tensor(m: &DMatrix<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
    // nalgebra is column-major
    let data = m.transpose().as_slice().to_vec();
    from_f64_vec(data, (m.nrows(), m.ncols()), dtype, device)
}

pub fn dvector_to_tensor(v: &DVector<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
    from_f64_vec(v.as_slice().to_vec(), v.len(), dtype, device)
}

/// Draw a tensor of i.i.d. standard normals from a seedable generator.
///
/// `Tensor::randn` uses the device RNG, which cannot be seeded on the CPU.
pub fn randn_seeded<S: Into<Shape>, R: rand::Rng>(
    shape: S,
    dtype: DType,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    use rand_distr::{Distribution, StandardNormal};
    let shape: Shape = shape.into();
    let data = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect::<Vec<f64>>();
    from_f64_vec(data, shape, dtype, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmatrix_round_trip_keeps_row_major_order() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]], &dev)?;
        let m = to_dmatrix(&x)?;
        assert_eq!(m[(0, 2)], 3.0);
        assert_eq!(m[(1, 0)], 4.0);
        let y = dmatrix_to_tensor(&m, DType::F64, &dev)?;
        assert_eq!(y.to_vec2::<f64>()?, x.to_vec2::<f64>()?);
        Ok(())
    }
}
