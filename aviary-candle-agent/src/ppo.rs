//! Proximal policy optimization for groups of agents (PPO/MAPPO).
//!
//! Each training call estimates advantages with GAE on denormalized values,
//! updates the value normalizer with the returns, then runs `ppo_epochs`
//! passes of shuffled minibatch updates of the actor and the critic.
mod base;
mod config;
mod loss;
mod minibatch;
pub use base::Ppo;
pub use config::PpoConfig;
pub use loss::{policy_loss, value_loss, ValueLossReduction};
pub use minibatch::MinibatchSampler;
