use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{ParamError, Result};
use crate::tensor_util::to_f64_vec;

/// Named tensors making up one parameterisation of a distribution or
/// factor (e.g. `np1`, `np2`).
///
/// Binary operations are key-by-key and require identical key sets and
/// shapes on both sides.
#[derive(Debug, Clone, Default)]
pub struct ParamDict {
    entries: BTreeMap<String, Tensor>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Tensor) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Tensor) -> Option<Tensor> {
        self.entries.insert(key.to_string(), value)
    }

    /// Look up `key`; a missing key is an error, never a default.
    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.entries.get(key).ok_or_else(|| ParamError::KeyMismatch {
            expected: vec![key.to_string()],
            got: self.keys(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    /// Copy with every tensor cut from the computation graph.
    pub fn detach(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.detach()))
                .collect(),
        }
    }

    /// Same keys, shapes and dtypes, all zeros.
    pub fn zeros_like(&self) -> Result<Self> {
        let mut ret = Self::new();
        for (k, v) in self.entries.iter() {
            ret.insert(k, v.zeros_like()?);
        }
        Ok(ret)
    }

    /// Fail unless `other` has exactly our keys with matching shapes.
    pub fn check_compatible(&self, other: &ParamDict) -> Result<()> {
        if self.keys() != other.keys() {
            return Err(ParamError::KeyMismatch {
                expected: self.keys(),
                got: other.keys(),
            });
        }
        for (k, v) in self.entries.iter() {
            let w = other.get(k)?;
            if v.dims() != w.dims() {
                return Err(ParamError::ShapeMismatch {
                    key: k.clone(),
                    left: v.dims().to_vec(),
                    right: w.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Apply `op` key-by-key after checking compatibility.
    pub fn zip_with<F>(&self, other: &ParamDict, op: F) -> Result<Self>
    where
        F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    {
        self.check_compatible(other)?;
        let mut ret = Self::new();
        for (k, v) in self.entries.iter() {
            ret.insert(k, op(v, other.get(k)?)?);
        }
        Ok(ret)
    }

    pub fn map<F>(&self, op: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        let mut ret = Self::new();
        for (k, v) in self.entries.iter() {
            ret.insert(k, op(v)?);
        }
        Ok(ret)
    }

    pub fn add(&self, other: &ParamDict) -> Result<Self> {
        self.zip_with(other, |a, b| a.add(b))
    }

    pub fn sub(&self, other: &ParamDict) -> Result<Self> {
        self.zip_with(other, |a, b| a.sub(b))
    }

    pub fn scale(&self, factor: f64) -> Result<Self> {
        self.map(|a| a.affine(factor, 0.0))
    }

    /// `self + factor * other`
    pub fn add_scaled(&self, other: &ParamDict, factor: f64) -> Result<Self> {
        self.zip_with(other, |a, b| a.add(&b.affine(factor, 0.0)?))
    }

    /// Largest absolute elementwise difference across all keys.
    pub fn max_abs_diff(&self, other: &ParamDict) -> Result<f64> {
        self.check_compatible(other)?;
        let mut ret = 0_f64;
        for (k, v) in self.entries.iter() {
            let a = to_f64_vec(v)?;
            let b = to_f64_vec(other.get(k)?)?;
            for (x, y) in a.iter().zip(b.iter()) {
                ret = ret.max((x - y).abs());
            }
        }
        Ok(ret)
    }
}

impl FromIterator<(String, Tensor)> for ParamDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn dict(a: &[f64], b: &[f64]) -> Result<ParamDict> {
        let dev = Device::Cpu;
        Ok(ParamDict::new()
            .with("np1", Tensor::new(a, &dev)?)
            .with("np2", Tensor::new(b, &dev)?))
    }

    #[test]
    fn add_sub_scale() -> Result<()> {
        let x = dict(&[1.0, 2.0], &[-1.0, -2.0])?;
        let y = dict(&[0.5, 0.5], &[-0.5, -0.5])?;

        let z = x.add_scaled(&y, 2.0)?;
        assert_eq!(to_f64_vec(z.get("np1")?)?, vec![2.0, 3.0]);
        assert_eq!(to_f64_vec(z.get("np2")?)?, vec![-2.0, -3.0]);

        let back = z.sub(&y.scale(2.0)?)?;
        assert!(back.max_abs_diff(&x)? < 1e-12);
        Ok(())
    }

    #[test]
    fn key_mismatch_is_an_error() -> Result<()> {
        let x = dict(&[1.0], &[-1.0])?;
        let y = ParamDict::new().with("np1", Tensor::new(&[1.0f64], &Device::Cpu)?);
        assert!(matches!(x.add(&y), Err(ParamError::KeyMismatch { .. })));
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_an_error() -> Result<()> {
        let x = dict(&[1.0], &[-1.0])?;
        let y = dict(&[1.0, 2.0], &[-1.0, -2.0])?;
        assert!(matches!(x.sub(&y), Err(ParamError::ShapeMismatch { .. })));
        Ok(())
    }
}
