//! Generic circular replay buffer.
//!
//! [`SimpleReplayBuffer`] stores transitions of arbitrary observation and
//! action storages implementing [`BatchBase`]. Once `capacity` transitions
//! are stored, new ones overwrite the oldest. Batches are sampled uniformly
//! at random without replacement; contiguous windows can be sampled with
//! [`SimpleReplayBuffer::seq_batch`].
//!
//! The buffer is not synchronized. Wrap it in a `Mutex` when pushes and
//! samples come from different threads.
mod base;
mod batch;
mod config;
pub use base::SimpleReplayBuffer;
pub use batch::{BatchBase, GenericTransitionBatch};
pub use config::SimpleReplayBufferConfig;
