//! Encoders built from observation specs.
//!
//! The observation spec decides the encoder layout once, at construction:
//!
//! * a vector spec, or a composite with a single non-visual field, is encoded
//!   by [`VectorEncoder`] (LayerNorm and MLP);
//! * a composite of several non-visual fields is encoded by
//!   [`EntityEncoder`], one token group per field;
//! * a composite with one visual field (`[A, C, H, W]`) is encoded by
//!   [`MixedEncoder`], a CNN fused with the encoder of the remaining fields.
mod base;
mod config;
mod entity;
mod vector;
mod vision;
pub use base::Encoder;
pub use config::{EncoderConfig, VisionConfig};
pub use entity::EntityEncoder;
pub(crate) use entity::FieldLayout;
pub use vector::VectorEncoder;
pub use vision::{MixedEncoder, VisionEncoder};

use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::Tensor;

/// Flattens all axes before the last `feature_rank` ones into a single axis.
///
/// Returns the flattened leading axes, so that outputs can be restored with
/// [`restore_leading`].
pub(crate) fn flatten_leading(x: &Tensor, feature_rank: usize) -> Result<(Vec<usize>, Tensor)> {
    let dims = x.dims();
    if dims.len() < feature_rank {
        return Err(AviaryError::ShapeMismatch(format!(
            "expected at least {} axes, got {:?}",
            feature_rank, dims
        ))
        .into());
    }
    let (lead, feat) = dims.split_at(dims.len() - feature_rank);
    let mut shape = vec![lead.iter().product::<usize>()];
    shape.extend_from_slice(feat);
    Ok((lead.to_vec(), x.reshape(shape)?))
}

/// Inverse of [`flatten_leading`] on the first axis of `y`.
pub(crate) fn restore_leading(y: &Tensor, lead: &[usize]) -> Result<Tensor> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(&y.dims()[1..]);
    Ok(y.reshape(shape)?)
}
