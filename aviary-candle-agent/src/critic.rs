//! State-value critics of the on-policy learners.
//!
//! Both critics output one value per agent and reward head, `[.., A, H]`.
use crate::{
    adapt::{ConditionMode, Conditioner},
    attention::{AttentionConfig, EntityTransformer},
    batch::Observation,
    encoder::{restore_leading, Encoder, EncoderConfig, FieldLayout},
    opt::{Optimizer, OptimizerConfig},
};
use anyhow::{Context, Result};
use aviary_core::{error::AviaryError, AgentSpec, ObservationSpec};
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// Layout of the critic.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum CriticKind {
    /// One network applied to the observation of every agent.
    Shared,

    /// Attention over the entities of the joint state, read out at the agent
    /// tokens.
    Centralized,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`Critic`].
pub struct CriticConfig {
    pub kind: CriticKind,

    /// Observation encoder of the shared critic.
    pub encoder: EncoderConfig,

    /// Attention of the centralized critic.
    #[serde(default)]
    pub attention: AttentionConfig,

    #[serde(default)]
    pub condition: ConditionMode,

    pub opt_config: OptimizerConfig,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            kind: CriticKind::Shared,
            encoder: EncoderConfig::default(),
            attention: AttentionConfig::default(),
            condition: ConditionMode::default(),
            opt_config: OptimizerConfig::default(),
        }
    }
}

impl CriticConfig {
    /// Sets the critic layout.
    pub fn kind(mut self, v: CriticKind) -> Self {
        self.kind = v;
        self
    }

    /// Sets the encoder configuration of the shared critic.
    pub fn encoder(mut self, v: EncoderConfig) -> Self {
        self.encoder = v;
        self
    }

    /// Sets the attention configuration of the centralized critic.
    pub fn attention(mut self, v: AttentionConfig) -> Self {
        self.attention = v;
        self
    }

    /// Sets the conditioning mode.
    pub fn condition(mut self, v: ConditionMode) -> Self {
        self.condition = v;
        self
    }

    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Loads [`CriticConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`CriticConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Per-agent critic: encoder and value head shared by all agents.
pub struct SharedCritic {
    encoder: Encoder,
    conditioner: Option<Conditioner>,
    v_out: Linear,
}

impl SharedCritic {
    fn build(
        vb: VarBuilder,
        spec: &AgentSpec,
        context_dim: Option<usize>,
        config: &CriticConfig,
    ) -> Result<Self> {
        let encoder = Encoder::build(vb.pp("encoder"), &spec.observation_spec, &config.encoder)?;
        let (conditioner, feature_dim) = build_conditioner(&vb, config.condition, encoder.out_dim(), context_dim)?;
        let v_out = linear(feature_dim, spec.n_reward_heads(), vb.pp("v_out"))?;
        Ok(Self {
            encoder,
            conditioner,
            v_out,
        })
    }

    /// `obs: [.., A, *]` to `[.., A, H]`.
    pub fn value(&self, obs: &Observation, context: Option<&Tensor>) -> Result<Tensor> {
        let f = self.encoder.forward(obs)?;
        let f = condition(self.conditioner.as_ref(), f, context)?;
        Ok(self.v_out.forward(&f)?)
    }
}

/// Centralized critic on the joint state.
///
/// The state is split into tokens (one per entity), the first `n_agents`
/// tokens of which belong to the agents of the group.
pub struct CentralizedCritic {
    layouts: Vec<FieldLayout>,
    transformer: EntityTransformer,
    conditioner: Option<Conditioner>,
    v_out: Linear,
    n_agents: usize,
}

impl CentralizedCritic {
    fn build(
        vb: VarBuilder,
        spec: &AgentSpec,
        context_dim: Option<usize>,
        config: &CriticConfig,
    ) -> Result<Self> {
        let state_spec = spec
            .state_spec
            .as_ref()
            .ok_or_else(|| AviaryError::config("a centralized critic requires a state spec"))?;
        let layouts = match state_spec {
            ObservationSpec::Vector(s) => vec![FieldLayout::from_feature_shape("", &s.shape)?],
            ObservationSpec::Composite(fields) => fields
                .iter()
                .map(|(name, s)| FieldLayout::from_feature_shape(name, &s.shape))
                .collect::<Result<Vec<_>>>()?,
        };
        let groups = layouts.iter().map(|l| l.group()).collect();
        let transformer = EntityTransformer::build(vb.pp("transformer"), groups, &config.attention)?;
        if transformer.n_tokens() < spec.n_agents {
            return Err(AviaryError::config(format!(
                "the state has {} tokens but the group has {} agents",
                transformer.n_tokens(),
                spec.n_agents
            ))
            .into());
        }
        let embed_dim = transformer.embed_dim();
        let (conditioner, feature_dim) = build_conditioner(&vb, config.condition, embed_dim, context_dim)?;
        let v_out = linear(feature_dim, spec.n_reward_heads(), vb.pp("v_out"))?;

        Ok(Self {
            layouts,
            transformer,
            conditioner,
            v_out,
            n_agents: spec.n_agents,
        })
    }

    /// `state: [.., *]` to `[.., A, H]`.
    pub fn value(&self, state: &Observation, context: Option<&Tensor>) -> Result<Tensor> {
        let mut lead = vec![];
        let mut tokens = Vec::with_capacity(self.layouts.len());
        for layout in self.layouts.iter() {
            let (l, t) = layout.tokens(state.field(&layout.name)?)?;
            lead = l;
            tokens.push(t);
        }
        let x = self.transformer.forward(&tokens)?.narrow(1, 0, self.n_agents)?;
        let context = context
            .map(|c| -> Result<Tensor> {
                let rows = x.dim(0)?;
                Ok(c.reshape((rows, self.n_agents, c.dim(candle_core::D::Minus1)?))?)
            })
            .transpose()?;
        let x = condition(self.conditioner.as_ref(), x, context.as_ref())?;
        restore_leading(&self.v_out.forward(&x)?, &lead)
    }
}

fn build_conditioner(
    vb: &VarBuilder,
    mode: ConditionMode,
    feature_dim: usize,
    context_dim: Option<usize>,
) -> Result<(Option<Conditioner>, usize)> {
    match context_dim {
        None => Ok((None, feature_dim)),
        Some(c) => {
            let cond = Conditioner::build(vb.pp("condition"), mode, feature_dim, c)?;
            let out_dim = cond.out_dim(feature_dim, c);
            Ok((Some(cond), out_dim))
        }
    }
}

fn condition(conditioner: Option<&Conditioner>, f: Tensor, context: Option<&Tensor>) -> Result<Tensor> {
    match conditioner {
        None => Ok(f),
        Some(cond) => {
            let context = context.context("the critic is conditioned on a context but none was given")?;
            cond.forward(&f, context)
        }
    }
}

/// Value network of a critic.
pub enum ValueCritic {
    Shared(SharedCritic),
    Centralized(CentralizedCritic),
}

/// A value critic with its parameters and optimizer.
pub struct Critic {
    varmap: VarMap,
    net: ValueCritic,
    opt: Optimizer,
}

impl Critic {
    /// Builds the critic. A centralized critic requires `spec.state_spec`
    /// with at least `spec.n_agents` tokens.
    pub fn build(config: CriticConfig, spec: &AgentSpec, context_dim: Option<usize>, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("critic");
        let net = match config.kind {
            CriticKind::Shared => ValueCritic::Shared(SharedCritic::build(vb, spec, context_dim, &config)?),
            CriticKind::Centralized => {
                ValueCritic::Centralized(CentralizedCritic::build(vb, spec, context_dim, &config)?)
            }
        };
        let opt = config.opt_config.build(varmap.all_vars())?;
        Ok(Self { varmap, net, opt })
    }

    /// Returns `true` if the critic reads the joint state.
    pub fn is_centralized(&self) -> bool {
        matches!(self.net, ValueCritic::Centralized(_))
    }

    /// Values `[.., A, H]`. `input` is the observation for a shared critic and
    /// the joint state for a centralized one.
    pub fn value(&self, input: &Observation, context: Option<&Tensor>) -> Result<Tensor> {
        match &self.net {
            ValueCritic::Shared(c) => c.value(input, context),
            ValueCritic::Centralized(c) => c.value(input, context),
        }
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Updates the parameters with precomputed gradients.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.step(grads)
    }

    /// Save variables to prefix + ".pt".
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<PathBuf> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.save(path.as_path())?;
        info!("Save critic parameters to {:?}", path);
        Ok(path)
    }

    /// Load variables from prefix + ".pt".
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<()> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.load(path.as_path())?;
        info!("Load critic parameters from {:?}", path);
        Ok(())
    }
}
