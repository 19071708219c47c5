//! Storages and batches of transitions.
use anyhow::Result;

/// Storage of per-transition data.
///
/// An implementation holds `capacity` rows. `push` writes the rows of `data`
/// starting at `ix`, wrapping around at the end; `sample` gathers rows.
pub trait BatchBase: Sized {
    /// Creates a storage of the given capacity.
    fn new(capacity: usize) -> Self;

    /// Writes `data` starting at row `ix`, wrapping around at capacity.
    fn push(&mut self, ix: usize, data: Self) -> Result<()>;

    /// Gathers the given rows.
    fn sample(&self, ixs: &Vec<usize>) -> Result<Self>;
}

/// A batch of transitions.
///
/// Used both to push into and to sample from a
/// [`SimpleReplayBuffer`](super::SimpleReplayBuffer).
pub struct GenericTransitionBatch<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    /// Observations.
    pub obs: O,

    /// Actions.
    pub act: A,

    /// Next observations.
    pub next_obs: O,

    /// Rewards.
    pub reward: Vec<f32>,

    /// Termination flags; bootstrapping stops across these.
    pub is_terminated: Vec<i8>,

    /// Truncation flags, e.g. time limits.
    pub is_truncated: Vec<i8>,

    /// Buffer rows the transitions were sampled from.
    pub ix_sample: Option<Vec<usize>>,
}

impl<O, A> GenericTransitionBatch<O, A>
where
    O: BatchBase,
    A: BatchBase,
{
    /// Number of transitions.
    pub fn len(&self) -> usize {
        self.reward.len()
    }

    /// Returns `true` if the batch has no transitions.
    pub fn is_empty(&self) -> bool {
        self.reward.is_empty()
    }
}
