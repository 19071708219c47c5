use anyhow::{Context, Result};
use aviary_core::replay_buffer::BatchBase;
use candle_core::{Device, IndexOp, Tensor};

/// Replay buffer storage backed by one [`Tensor`] whose first axis is the row.
///
/// The tensor is allocated on the CPU on the first push, with the shape of
/// the pushed data and `capacity` rows.
#[derive(Clone, Debug)]
pub struct TensorBatch {
    buf: Option<Tensor>,
    capacity: usize,
}

impl TensorBatch {
    /// Wraps a tensor whose first axis enumerates transitions.
    pub fn from_tensor(t: Tensor) -> Self {
        let capacity = t.dims()[0];
        Self {
            buf: Some(t),
            capacity,
        }
    }

    /// Returns the tensor moved to `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        match &self.buf {
            Some(buf) => Ok(buf.to_device(device)?),
            None => anyhow::bail!("TensorBatch is empty"),
        }
    }
}

impl BatchBase for TensorBatch {
    fn new(capacity: usize) -> Self {
        Self {
            buf: None,
            capacity,
        }
    }

    fn push(&mut self, index: usize, data: Self) -> Result<()> {
        let data = match data.buf {
            Some(data) => data.to_device(&Device::Cpu)?,
            None => return Ok(()),
        };
        let batch_size = data.dims()[0];
        if batch_size == 0 {
            return Ok(());
        }

        // Only the last `capacity` rows survive a push larger than the buffer.
        let (index, data) = if batch_size > self.capacity {
            let skip = batch_size - self.capacity;
            ((index + skip) % self.capacity, data.i((skip..,))?.contiguous()?)
        } else {
            (index % self.capacity, data)
        };
        let batch_size = data.dims()[0];

        if self.buf.is_none() {
            let mut shape = data.dims().to_vec();
            shape[0] = self.capacity;
            self.buf = Some(Tensor::zeros(shape, data.dtype(), &Device::Cpu)?);
        }
        let buf = self.buf.as_mut().context("TensorBatch is not allocated")?;

        if index + batch_size > self.capacity {
            let n = self.capacity - index;
            buf.slice_set(&data.i((..n,))?.contiguous()?, 0, index)?;
            buf.slice_set(&data.i((n..,))?.contiguous()?, 0, 0)?;
        } else {
            buf.slice_set(&data, 0, index)?;
        }
        Ok(())
    }

    fn sample(&self, ixs: &Vec<usize>) -> Result<Self> {
        let buf = match &self.buf {
            Some(buf) => buf,
            None => anyhow::bail!("TensorBatch is empty"),
        };
        let capacity = ixs.len();
        let ixs = {
            let ixs = ixs.iter().map(|x| *x as u32).collect::<Vec<_>>();
            Tensor::from_vec(ixs, &[capacity], buf.device())?
        };
        Ok(Self {
            buf: Some(buf.index_select(&ixs, 0)?),
            capacity,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_push_wraps_around() -> Result<()> {
        let mut batch = TensorBatch::new(3);
        let rows = |v: &[f32]| TensorBatch::from_tensor(Tensor::new(v, &Device::Cpu).unwrap().unsqueeze(1).unwrap());
        batch.push(0, rows(&[1., 2.]))?;
        batch.push(2, rows(&[3., 4.]))?;
        let t = batch.to_tensor(&Device::Cpu)?.squeeze(1)?.to_vec1::<f32>()?;
        assert_eq!(t, vec![4., 2., 3.]);

        let s = batch.sample(&vec![2, 0])?.to_tensor(&Device::Cpu)?;
        assert_eq!(s.squeeze(1)?.to_vec1::<f32>()?, vec![3., 4.]);
        Ok(())
    }

    #[test]
    fn test_push_larger_than_capacity() -> Result<()> {
        let mut batch = TensorBatch::new(4);
        let rows = |v: &[f32]| -> Result<TensorBatch> {
            Ok(TensorBatch::from_tensor(Tensor::new(v, &Device::Cpu)?.unsqueeze(1)?))
        };
        batch.push(0, rows(&[1., 2., 3.])?)?;

        // Rows 10..=15 written from index 3: slots 3, 0, 1, 2, 3, 0.
        batch.push(3, rows(&[10., 11., 12., 13., 14., 15.])?)?;
        let t = batch.to_tensor(&Device::Cpu)?.squeeze(1)?.to_vec1::<f32>()?;
        assert_eq!(t, vec![15., 12., 13., 14.]);
        Ok(())
    }
}
