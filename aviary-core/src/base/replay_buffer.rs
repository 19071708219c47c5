//! Replay buffer interface.
use anyhow::Result;

/// Interface for buffers that store experiences.
pub trait ExperienceBufferBase {
    /// Items pushed into the buffer.
    type Item;

    /// Pushes an item into the buffer.
    fn push(&mut self, tr: Self::Item) -> Result<()>;

    /// The number of transitions held by the buffer.
    fn len(&self) -> usize;

    /// Returns `true` if no transition has been stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interface for replay buffers that generate batches for training.
pub trait ReplayBufferBase {
    /// Configuration parameters of the buffer.
    type Config: Clone;

    /// Batch generated for training.
    type Batch;

    /// Builds a buffer from the configuration.
    fn build(config: &Self::Config) -> Self;

    /// Samples a batch of the given size.
    ///
    /// Fails with [`AviaryError::InsufficientData`](crate::AviaryError::InsufficientData)
    /// when fewer than `size` transitions are stored.
    fn batch(&mut self, size: usize) -> Result<Self::Batch>;
}
