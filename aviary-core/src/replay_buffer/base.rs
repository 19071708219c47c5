//! Circular replay buffer.
use super::{BatchBase, GenericTransitionBatch, SimpleReplayBufferConfig};
use crate::{error::AviaryError, ExperienceBufferBase, ReplayBufferBase};
use anyhow::Result;
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};

/// A circular replay buffer over generic observation and action storages.
pub struct SimpleReplayBuffer<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    capacity: usize,

    /// Next row to be written.
    i: usize,

    size: usize,
    obs: O,
    act: A,
    next_obs: O,
    reward: Vec<f32>,
    is_terminated: Vec<i8>,
    is_truncated: Vec<i8>,
    rng: StdRng,
}

impl<O, A> SimpleReplayBuffer<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    fn write<T: Copy>(buf: &mut [T], i: usize, data: &[T]) {
        let capacity = buf.len();
        for (k, v) in data.iter().enumerate() {
            buf[(i + k) % capacity] = *v;
        }
    }

    fn gather(&self, ixs: Vec<usize>) -> Result<GenericTransitionBatch<O, A>> {
        Ok(GenericTransitionBatch {
            obs: self.obs.sample(&ixs)?,
            act: self.act.sample(&ixs)?,
            next_obs: self.next_obs.sample(&ixs)?,
            reward: ixs.iter().map(|&ix| self.reward[ix]).collect(),
            is_terminated: ixs.iter().map(|&ix| self.is_terminated[ix]).collect(),
            is_truncated: ixs.iter().map(|&ix| self.is_truncated[ix]).collect(),
            ix_sample: Some(ixs),
        })
    }

    /// Capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Row holding the oldest transition.
    fn oldest(&self) -> usize {
        if self.size < self.capacity {
            0
        } else {
            self.i
        }
    }

    /// Samples `n` random windows of `seq_len` chronologically contiguous
    /// transitions.
    ///
    /// The returned batch holds `n * seq_len` transitions, window after window,
    /// each window in time order. Fails with
    /// [`AviaryError::InsufficientData`] when `seq_len` exceeds the number of
    /// stored transitions; the caller should shorten the window or collect
    /// more data.
    pub fn seq_batch(&mut self, n: usize, seq_len: usize) -> Result<GenericTransitionBatch<O, A>> {
        if seq_len == 0 || seq_len > self.size {
            return Err(AviaryError::InsufficientData {
                requested: seq_len,
                available: self.size,
            }
            .into());
        }

        let oldest = self.oldest();
        let n_starts = self.size - seq_len + 1;
        let mut ixs = Vec::with_capacity(n * seq_len);
        for _ in 0..n {
            let start = self.rng.gen_range(0..n_starts);
            ixs.extend((0..seq_len).map(|k| (oldest + start + k) % self.capacity));
        }

        self.gather(ixs)
    }

    /// Sum of all stored rewards.
    pub fn sum_rewards(&self) -> f32 {
        self.reward[..self.size].iter().sum()
    }
}

impl<O, A> ExperienceBufferBase for SimpleReplayBuffer<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    type Item = GenericTransitionBatch<O, A>;

    fn len(&self) -> usize {
        self.size
    }

    /// Appends transitions, overwriting the oldest ones when full.
    fn push(&mut self, tr: Self::Item) -> Result<()> {
        let len = tr.len();
        self.obs.push(self.i, tr.obs)?;
        self.act.push(self.i, tr.act)?;
        self.next_obs.push(self.i, tr.next_obs)?;
        Self::write(&mut self.reward, self.i, &tr.reward);
        Self::write(&mut self.is_terminated, self.i, &tr.is_terminated);
        Self::write(&mut self.is_truncated, self.i, &tr.is_truncated);

        self.i = (self.i + len) % self.capacity;
        self.size = (self.size + len).min(self.capacity);

        Ok(())
    }
}

impl<O, A> ReplayBufferBase for SimpleReplayBuffer<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    type Config = SimpleReplayBufferConfig;
    type Batch = GenericTransitionBatch<O, A>;

    fn build(config: &Self::Config) -> Self {
        let capacity = config.capacity;
        Self {
            capacity,
            i: 0,
            size: 0,
            obs: O::new(capacity),
            act: A::new(capacity),
            next_obs: O::new(capacity),
            reward: vec![0.; capacity],
            is_terminated: vec![0; capacity],
            is_truncated: vec![0; capacity],
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    /// Samples `size` distinct transitions uniformly at random.
    fn batch(&mut self, size: usize) -> Result<Self::Batch> {
        if size > self.size {
            return Err(AviaryError::InsufficientData {
                requested: size,
                available: self.size,
            }
            .into());
        }
        let ixs = index::sample(&mut self.rng, self.size, size).into_vec();
        self.gather(ixs)
    }
}
