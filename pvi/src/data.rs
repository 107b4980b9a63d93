use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{PviError, Result};

/// One client's partition: inputs `x` (N × D) and targets `y` (N, ...).
#[derive(Debug, Clone)]
pub struct Data {
    pub x: Tensor,
    pub y: Tensor,
}

impl Data {
    pub fn new(x: Tensor, y: Tensor) -> Result<Self> {
        let (nx, ny) = (x.dim(0)?, y.dim(0)?);
        if nx != ny {
            return Err(PviError::Config(format!(
                "x has {} rows but y has {}",
                nx, ny
            )));
        }
        Ok(Self { x, y })
    }

    /// Number of rows in `x`.
    pub fn len(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let idx = indices.iter().map(|&i| i as u32).collect::<Vec<_>>();
        let idx = Tensor::from_vec(idx, indices.len(), self.x.device())?;
        Ok(Self {
            x: self.x.index_select(&idx, 0)?,
            y: self.y.index_select(&idx, 0)?,
        })
    }

    /// Shuffle once and cut into batches of at most `batch_size` rows;
    /// every row appears in exactly one batch.
    pub fn minibatches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Vec<Self>> {
        if batch_size == 0 {
            return Err(PviError::Config("batch_size must be at least 1".into()));
        }
        let mut samples = (0..self.len()).collect::<Vec<_>>();
        samples.shuffle(rng);
        samples
            .chunks(batch_size)
            .map(|chunk| self.select(chunk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn minibatches_cover_every_row_once() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f64, 10f64, &dev)?.reshape((10, 1))?;
        let y = Tensor::arange(0f64, 10f64, &dev)?;
        let data = Data::new(x, y)?;

        let mut rng = StdRng::seed_from_u64(7);
        let batches = data.minibatches(3, &mut rng)?;
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![3, 3, 3, 1]);

        let mut seen = batches
            .iter()
            .flat_map(|b| b.y.to_vec1::<f64>().unwrap_or_default())
            .collect::<Vec<_>>();
        seen.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(seen, (0..10).map(|i| i as f64).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn mismatched_rows_are_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((3, 2), candle_core::DType::F64, &dev)?;
        let y = Tensor::zeros(4, candle_core::DType::F64, &dev)?;
        assert!(Data::new(x, y).is_err());
        Ok(())
    }
}
