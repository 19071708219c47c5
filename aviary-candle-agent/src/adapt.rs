//! Encoder adaptation for PPO.
//!
//! Training runs in two phases. First, actor and critic learn with a context
//! latent encoded from privileged simulator parameters ("intrinsics"). Then an
//! adaptation module learns to infer that context from a window of past
//! observations, so the policy can run without privileged inputs.
mod base;
mod config;
mod context;
mod film;
mod loss;
mod tconv;
pub use base::{AdaptationModule, PpoAdaptive};
pub use config::{AdaptationPhase, AdaptationTarget, PpoAdaptiveConfig};
pub use context::{ContextEncoder, ContextEncoderConfig};
pub use film::{ConditionMode, Conditioner};
pub use loss::{bce_with_logits, discriminator_accuracy, AdaptationLoss, Discriminator};
pub use tconv::{TConv, TConvConfig};
