//! Configuration of SAC agent.
use super::{EntCoefMode, MultiCriticConfig};
use crate::{
    actor::ActorConfig, distribution::DistributionKind, mlp::MlpConfig, opt::OptimizerConfig, util::CriticLoss,
    Device,
};
use anyhow::Result;
use aviary_core::replay_buffer::SimpleReplayBufferConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`Sac`](super::Sac).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SacConfig {
    /// Configuration of the actor. The distribution is always tanh-squashed.
    pub actor_config: ActorConfig,

    /// Configuration of the twin critics.
    pub critic_config: MultiCriticConfig<MlpConfig>,

    pub replay_buffer_config: SimpleReplayBufferConfig,

    /// Discount factor.
    pub gamma: f64,

    /// Soft update coefficient.
    pub tau: f64,

    /// How to update entropy coefficient.
    pub ent_coef_mode: EntCoefMode,

    /// Transitions per gradient step.
    pub batch_size: usize,

    /// Stored transitions required before training starts.
    pub warmup: usize,

    /// Gradient steps per training call.
    pub gradient_steps: usize,

    /// The actor and the temperature are updated every `actor_delay` steps.
    pub actor_delay: usize,

    /// Targets are updated every `target_update_interval` steps.
    pub target_update_interval: usize,

    /// Gradient norm limit of actor and critics.
    pub max_grad_norm: f64,

    /// Type of critic loss function.
    pub critic_loss: CriticLoss,

    /// Weights of reward heads. Defaults to all ones.
    pub reward_weights: Option<Vec<f32>>,

    /// Device for actor/critic models, CPU if not given.
    pub device: Option<Device>,
}

impl Default for SacConfig {
    fn default() -> Self {
        Self {
            actor_config: ActorConfig::default()
                .distribution(DistributionKind::TanhNormal)
                .state_dependent_std(true)
                .opt_config(OptimizerConfig::Adam { lr: 3e-4 }),
            critic_config: MultiCriticConfig {
                n_nets: 2,
                q_config: MlpConfig::new(0, vec![256, 256], Some(1)),
                opt_config: OptimizerConfig::Adam { lr: 3e-4 },
            },
            replay_buffer_config: SimpleReplayBufferConfig::default(),
            gamma: 0.99,
            tau: 0.005,
            ent_coef_mode: EntCoefMode::default(),
            batch_size: 256,
            warmup: 10_000,
            gradient_steps: 64,
            actor_delay: 2,
            target_update_interval: 1,
            max_grad_norm: 5.0,
            critic_loss: CriticLoss::Mse,
            reward_weights: None,
            device: None,
        }
    }
}

impl SacConfig {
    /// Configuration of actor.
    pub fn actor_config(mut self, v: ActorConfig) -> Self {
        self.actor_config = v;
        self
    }

    /// Configuration of critic.
    pub fn critic_config(mut self, v: MultiCriticConfig<MlpConfig>) -> Self {
        self.critic_config = v;
        self
    }

    pub fn replay_buffer_config(mut self, v: SimpleReplayBufferConfig) -> Self {
        self.replay_buffer_config = v;
        self
    }

    /// Discount factor.
    pub fn discount_factor(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Soft update coefficient.
    pub fn tau(mut self, v: f64) -> Self {
        self.tau = v;
        self
    }

    /// SAC-alpha.
    pub fn ent_coef_mode(mut self, v: EntCoefMode) -> Self {
        self.ent_coef_mode = v;
        self
    }

    /// Batch size.
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    /// Warm-up size of the replay buffer.
    pub fn warmup(mut self, v: usize) -> Self {
        self.warmup = v;
        self
    }

    /// Gradient steps per training call.
    pub fn gradient_steps(mut self, v: usize) -> Self {
        self.gradient_steps = v;
        self
    }

    /// Delay of actor updates.
    pub fn actor_delay(mut self, v: usize) -> Self {
        self.actor_delay = v;
        self
    }

    /// Interval of target updates.
    pub fn target_update_interval(mut self, v: usize) -> Self {
        self.target_update_interval = v;
        self
    }

    /// Gradient norm limit.
    pub fn max_grad_norm(mut self, v: f64) -> Self {
        self.max_grad_norm = v;
        self
    }

    /// Critic loss.
    pub fn critic_loss(mut self, v: CriticLoss) -> Self {
        self.critic_loss = v;
        self
    }

    /// Weights of reward heads.
    pub fn reward_weights(mut self, v: Vec<f32>) -> Self {
        self.reward_weights = Some(v);
        self
    }

    /// Device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Constructs [`SacConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of SAC agent from {:?}", path_);
        Ok(b)
    }

    /// Saves [`SacConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of SAC agent into {:?}", path_);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_serde_sac_config() -> Result<()> {
        let config = SacConfig::default()
            .batch_size(64)
            .ent_coef_mode(EntCoefMode::Fix(0.1))
            .critic_loss(CriticLoss::Huber(1.0));
        let dir = TempDir::new("sac_config")?;
        let path = dir.path().join("sac_config.yaml");
        config.save(&path)?;
        let config_ = SacConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }
}
