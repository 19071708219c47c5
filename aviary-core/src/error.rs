//! Errors in the library.
use thiserror::Error;

/// Errors raised by the trainer.
///
/// Functions return [`anyhow::Result`]; these variants travel inside it and
/// can be recovered with `downcast_ref::<AviaryError>()`.
#[derive(Debug, Error)]
pub enum AviaryError {
    /// Unsupported specification or configuration, detected at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tensor that must be finite contains NaN or infinity.
    #[error("Non-finite values in {0}")]
    NonFinite(String),

    /// More transitions (or a longer sub-sequence) were requested than stored.
    #[error("Requested {requested} transitions but only {available} are available")]
    InsufficientData {
        /// Number of requested transitions.
        requested: usize,
        /// Number of transitions held by the buffer.
        available: usize,
    },

    /// Tensors of a minibatch do not share the expected shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),
}

impl AviaryError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
