//! Soft actor-critic (SAC) for agent groups.
//!
//! Rollouts are stored as joint transitions of the whole group; the twin
//! critics see the flattened observations and actions of all agents.
mod base;
mod config;
mod critic;
mod ent_coef;
pub use base::Sac;
pub use config::SacConfig;
pub use critic::{MultiCritic, MultiCriticConfig};
pub use ent_coef::{EntCoef, EntCoefMode};
