//! Diagnostics returned by training iterations.
//!
//! A training call returns a [`Record`], a map from names such as
//! `"drone/policy_loss"` to [`RecordValue`]s. Per-minibatch records are
//! collected in a [`RecordStorage`] and reduced before being handed to an
//! external logger.
//!
//! ```rust
//! use aviary_core::record::{Record, RecordValue};
//!
//! let mut record = Record::from_scalar("loss", 0.5);
//! record.insert("explained_var", RecordValue::Scalar(0.9));
//! assert_eq!(record.get_scalar("loss").unwrap(), 0.5);
//! ```
mod base;
mod storage;

pub use base::{Record, RecordValue};
pub use storage::RecordStorage;
