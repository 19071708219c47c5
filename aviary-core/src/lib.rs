#![warn(missing_docs)]
//! Core types of the aviary multi-agent trainer.
//!
//! This crate has no tensor backend. It holds the pieces shared by every
//! learner: the [`Agent`] trait, agent/observation specifications,
//! the diagnostic [`record`] types, the error taxonomy and a generic circular
//! [`replay_buffer`].
pub mod error;
pub mod record;
pub mod replay_buffer;
pub mod spec;

mod base;
pub use base::{Agent, ExperienceBufferBase, ReplayBufferBase};
pub use error::AviaryError;
pub use spec::{AgentSpec, ObservationSpec, TensorSpec};
