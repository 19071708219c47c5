//! Multi-agent policy optimization implemented with [candle](https://crates.io/crates/candle-core).
//!
//! * [`gae`] and [`value_norm`] turn rollouts into normalized value targets.
//! * [`encoder`], [`actor`] and [`critic`] compose networks from
//!   [`AgentSpec`](aviary_core::AgentSpec)s.
//! * [`ppo`] implements PPO/MAPPO, [`adapt`] the encoder-adaptation variant
//!   and [`sac`] the off-policy sibling.
pub mod actor;
pub mod adapt;
pub mod attention;
pub mod batch;
pub mod critic;
pub mod distribution;
pub mod encoder;
pub mod gae;
pub mod gru;
pub mod mlp;
pub mod model;
pub mod opt;
pub mod ppo;
pub mod sac;
mod tensor_batch;
pub mod util;
pub mod value_norm;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
pub use tensor_batch::TensorBatch;

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The main GPU device.
    Cuda(usize),
}

impl TryFrom<Device> for candle_core::Device {
    type Error = candle_core::Error;

    fn try_from(device: Device) -> Result<Self, Self::Error> {
        match device {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(n) => candle_core::Device::new_cuda(n),
        }
    }
}

/// Activation functions.
#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
pub enum Activation {
    /// No activation.
    None,

    /// ReLU.
    ReLU,

    /// Leaky ReLU with slope 0.01.
    LeakyReLU,

    /// ELU with alpha 1.
    Elu,

    /// Mish, `x * tanh(softplus(x))`.
    Mish,

    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Applies the activation function.
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::None => Ok(xs.clone()),
            Self::ReLU => xs.relu(),
            Self::LeakyReLU => candle_nn::ops::leaky_relu(xs, 0.01),
            Self::Elu => xs.elu(1.0),
            Self::Mish => xs * util::softplus(xs)?.tanh()?,
            Self::Tanh => xs.tanh(),
        }
    }
}

