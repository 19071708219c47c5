use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Random partition of a batch into equally sized minibatches.
///
/// Only the first `len / k * k` items take part; the remainder is dropped.
pub struct MinibatchSampler {
    num_minibatches: usize,
    rng: StdRng,
}

impl MinibatchSampler {
    pub fn new(num_minibatches: usize, seed: u64) -> Result<Self> {
        if num_minibatches == 0 {
            return Err(AviaryError::config("num_minibatches must be positive").into());
        }
        Ok(Self {
            num_minibatches,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Shuffled index sets of the given number of items.
    pub fn partition(&mut self, len: usize) -> Result<Vec<Vec<usize>>> {
        let k = self.num_minibatches;
        let size = len / k;
        if size == 0 {
            return Err(AviaryError::config(format!(
                "cannot split {} items into {} minibatches",
                len, k
            ))
            .into());
        }
        let mut ixs: Vec<usize> = (0..size * k).collect();
        ixs.shuffle(&mut self.rng);
        Ok(ixs.chunks(size).map(|c| c.to_vec()).collect())
    }

    /// Like [`MinibatchSampler::partition`], as index tensors.
    pub fn partition_tensors(&mut self, len: usize, device: &Device) -> Result<Vec<Tensor>> {
        self.partition(len)?
            .into_iter()
            .map(|ixs| {
                let ixs = ixs.into_iter().map(|i| i as u32).collect::<Vec<_>>();
                let n = ixs.len();
                Ok(Tensor::from_vec(ixs, n, device)?)
            })
            .collect()
    }
}
