//! Configuration of PPO agent.
use super::ValueLossReduction;
use crate::{
    actor::ActorConfig, critic::CriticConfig, gae::GaeConfig, util::CriticLoss,
    value_norm::ValueNormConfig, Device,
};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`Ppo`](super::Ppo).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PpoConfig {
    /// Configuration of the actor.
    pub actor_config: ActorConfig,

    /// Configuration of the critic.
    pub critic_config: CriticConfig,

    /// Advantage estimation.
    pub gae: GaeConfig,

    /// Normalization of value targets.
    pub value_norm: ValueNormConfig,

    /// Clipping range of the probability ratio and of value updates.
    pub clip_param: f64,

    /// Weight of the entropy bonus.
    pub entropy_coef: f64,

    /// Passes over the batch per training call.
    pub ppo_epochs: usize,

    /// Minibatches per pass.
    pub num_minibatches: usize,

    /// Window length of recurrent actors.
    pub seq_len: usize,

    /// Gradient norm limit, applied to each network independently.
    pub max_grad_norm: f64,

    /// Element-wise value loss.
    pub critic_loss: CriticLoss,

    /// Reduction of the value loss.
    pub value_loss_reduction: ValueLossReduction,

    /// Normalize advantages over the batch.
    pub normalize_advantages: bool,

    /// Weights of reward heads. Defaults to all ones.
    pub reward_weights: Option<Vec<f32>>,

    /// Seed of the minibatch sampler.
    pub seed: u64,

    /// Device for actor/critic models, CPU if not given.
    pub device: Option<Device>,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            actor_config: ActorConfig::default(),
            critic_config: CriticConfig::default(),
            gae: GaeConfig::default(),
            value_norm: ValueNormConfig::default(),
            clip_param: 0.1,
            entropy_coef: 0.001,
            ppo_epochs: 4,
            num_minibatches: 8,
            seq_len: 16,
            max_grad_norm: 1.0,
            critic_loss: CriticLoss::Mse,
            value_loss_reduction: ValueLossReduction::SumHeads,
            normalize_advantages: true,
            reward_weights: None,
            seed: 42,
            device: None,
        }
    }
}

impl PpoConfig {
    /// Configuration of actor.
    pub fn actor_config(mut self, v: ActorConfig) -> Self {
        self.actor_config = v;
        self
    }

    /// Configuration of critic.
    pub fn critic_config(mut self, v: CriticConfig) -> Self {
        self.critic_config = v;
        self
    }

    /// Advantage estimation.
    pub fn gae(mut self, v: GaeConfig) -> Self {
        self.gae = v;
        self
    }

    /// Value normalization.
    pub fn value_norm(mut self, v: ValueNormConfig) -> Self {
        self.value_norm = v;
        self
    }

    /// Clipping range.
    pub fn clip_param(mut self, v: f64) -> Self {
        self.clip_param = v;
        self
    }

    /// Entropy bonus weight.
    pub fn entropy_coef(mut self, v: f64) -> Self {
        self.entropy_coef = v;
        self
    }

    /// Passes over the batch.
    pub fn ppo_epochs(mut self, v: usize) -> Self {
        self.ppo_epochs = v;
        self
    }

    /// Minibatches per pass.
    pub fn num_minibatches(mut self, v: usize) -> Self {
        self.num_minibatches = v;
        self
    }

    /// Window length of recurrent actors.
    pub fn seq_len(mut self, v: usize) -> Self {
        self.seq_len = v;
        self
    }

    /// Gradient norm limit.
    pub fn max_grad_norm(mut self, v: f64) -> Self {
        self.max_grad_norm = v;
        self
    }

    /// Element-wise value loss.
    pub fn critic_loss(mut self, v: CriticLoss) -> Self {
        self.critic_loss = v;
        self
    }

    /// Reduction of the value loss.
    pub fn value_loss_reduction(mut self, v: ValueLossReduction) -> Self {
        self.value_loss_reduction = v;
        self
    }

    /// Advantage normalization.
    pub fn normalize_advantages(mut self, v: bool) -> Self {
        self.normalize_advantages = v;
        self
    }

    /// Weights of reward heads.
    pub fn reward_weights(mut self, v: Vec<f32>) -> Self {
        self.reward_weights = Some(v);
        self
    }

    /// Seed of the minibatch sampler.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Constructs [`PpoConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of PPO agent from {:?}", path_);
        Ok(b)
    }

    /// Saves [`PpoConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of PPO agent into {:?}", path_);
        Ok(())
    }
}
