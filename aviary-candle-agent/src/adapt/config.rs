//! Configuration of the encoder-adaptation agent.
use super::{AdaptationLoss, ConditionMode, ContextEncoderConfig, TConvConfig};
use crate::{opt::OptimizerConfig, ppo::PpoConfig, ppo::ValueLossReduction, util::CriticLoss};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Training phase of [`PpoAdaptive`](super::PpoAdaptive).
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
pub enum AdaptationPhase {
    /// PPO with the context encoder reading privileged intrinsics.
    Encoder,

    /// Regression of the adaptation module onto the frozen context encoder.
    Adaptation,
}

impl Default for AdaptationPhase {
    fn default() -> Self {
        Self::Encoder
    }
}

/// What the adaptation module predicts from the observation history.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
pub enum AdaptationTarget {
    /// The context latent.
    Context,

    /// The raw intrinsics, decoded by the context encoder when acting.
    Intrinsics,
}

impl Default for AdaptationTarget {
    fn default() -> Self {
        Self::Context
    }
}

/// Configuration of [`PpoAdaptive`](super::PpoAdaptive).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PpoAdaptiveConfig {
    /// Configuration of the underlying PPO update.
    pub ppo: PpoConfig,

    /// How the context enters actor and critic. Overrides the modes of
    /// `ppo.actor_config` and `ppo.critic_config`.
    pub condition: ConditionMode,

    pub context_encoder: ContextEncoderConfig,

    /// Temporal convolution of the adaptation module and the discriminator.
    pub tconv: TConvConfig,

    /// Optimizer of the adaptation module and the discriminator.
    pub adaptation_opt_config: OptimizerConfig,

    pub loss: AdaptationLoss,

    pub target: AdaptationTarget,

    /// Passes over the batch in the adaptation phase.
    pub adaptation_epochs: usize,

    /// Phase at construction.
    pub phase: AdaptationPhase,
}

impl Default for PpoAdaptiveConfig {
    fn default() -> Self {
        Self {
            ppo: PpoConfig::default()
                .num_minibatches(16)
                .max_grad_norm(5.0)
                .critic_loss(CriticLoss::Huber(10.0))
                .value_loss_reduction(ValueLossReduction::Mean),
            condition: ConditionMode::default(),
            context_encoder: ContextEncoderConfig::default(),
            tconv: TConvConfig::default(),
            adaptation_opt_config: OptimizerConfig::default(),
            loss: AdaptationLoss::default(),
            target: AdaptationTarget::default(),
            adaptation_epochs: 4,
            phase: AdaptationPhase::default(),
        }
    }
}

impl PpoAdaptiveConfig {
    pub fn ppo(mut self, v: PpoConfig) -> Self {
        self.ppo = v;
        self
    }

    pub fn condition(mut self, v: ConditionMode) -> Self {
        self.condition = v;
        self
    }

    pub fn context_encoder(mut self, v: ContextEncoderConfig) -> Self {
        self.context_encoder = v;
        self
    }

    pub fn tconv(mut self, v: TConvConfig) -> Self {
        self.tconv = v;
        self
    }

    pub fn adaptation_opt_config(mut self, v: OptimizerConfig) -> Self {
        self.adaptation_opt_config = v;
        self
    }

    pub fn loss(mut self, v: AdaptationLoss) -> Self {
        self.loss = v;
        self
    }

    pub fn target(mut self, v: AdaptationTarget) -> Self {
        self.target = v;
        self
    }

    pub fn adaptation_epochs(mut self, v: usize) -> Self {
        self.adaptation_epochs = v;
        self
    }

    pub fn phase(mut self, v: AdaptationPhase) -> Self {
        self.phase = v;
        self
    }

    /// Constructs [`PpoAdaptiveConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of adaptive PPO agent from {:?}", path_);
        Ok(b)
    }

    /// Saves [`PpoAdaptiveConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of adaptive PPO agent into {:?}", path_);
        Ok(())
    }
}
