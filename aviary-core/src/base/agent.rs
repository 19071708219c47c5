//! Agent.
use crate::record::Record;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Represents a trainable policy consuming batches of type `B`.
///
/// A single call of [`Agent::train_op`] is one training iteration. It takes
/// `&mut self`, so training iterations on one agent are always serialized.
pub trait Agent<B> {
    /// Set the policy to training mode.
    fn train(&mut self);

    /// Set the policy to evaluation mode.
    fn eval(&mut self);

    /// Return if it is in training mode.
    fn is_train(&self) -> bool;

    /// Performs one training iteration on the given batch and returns diagnostics.
    fn train_op(&mut self, batch: &B) -> Result<Record>;

    /// Save the parameters of the agent in the given directory.
    ///
    /// Returns the paths of the written files.
    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Load the parameters of the agent from the given directory.
    fn load_params(&mut self, path: &Path) -> Result<()>;
}
