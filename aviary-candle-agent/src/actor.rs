//! Gaussian policy over the agents of a group.
use crate::{
    adapt::{ConditionMode, Conditioner},
    batch::Observation,
    distribution::{ActionDistribution, DistributionKind},
    encoder::{Encoder, EncoderConfig},
    gru::Gru,
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    opt::{Optimizer, OptimizerConfig},
};
use anyhow::{Context, Result};
use aviary_core::{error::AviaryError, AgentSpec};
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{Init, Linear, Module, VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`PolicyActor`].
pub struct ActorConfig {
    pub encoder: EncoderConfig,

    /// How a context latent enters the actor, if one is given at build time.
    #[serde(default)]
    pub condition: ConditionMode,

    /// Hidden units of an MLP after conditioning.
    #[serde(default)]
    pub trunk_units: Vec<usize>,

    /// Adds a GRU whose output is added to the features.
    #[serde(default)]
    pub rnn: bool,

    #[serde(default)]
    pub distribution: DistributionKind,

    /// Log std from a linear layer instead of a free parameter.
    #[serde(default)]
    pub state_dependent_std: bool,

    pub min_log_std: f64,
    pub max_log_std: f64,
    pub opt_config: OptimizerConfig,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            condition: ConditionMode::default(),
            trunk_units: vec![],
            rnn: false,
            distribution: DistributionKind::Normal,
            state_dependent_std: false,
            min_log_std: -20.0,
            max_log_std: 2.0,
            opt_config: OptimizerConfig::default(),
        }
    }
}

impl ActorConfig {
    /// Sets the encoder configuration.
    pub fn encoder(mut self, v: EncoderConfig) -> Self {
        self.encoder = v;
        self
    }

    /// Sets the conditioning mode.
    pub fn condition(mut self, v: ConditionMode) -> Self {
        self.condition = v;
        self
    }

    /// Sets hidden units after conditioning.
    pub fn trunk_units(mut self, v: Vec<usize>) -> Self {
        self.trunk_units = v;
        self
    }

    /// Enables the recurrent stage.
    pub fn rnn(mut self, v: bool) -> Self {
        self.rnn = v;
        self
    }

    /// Sets the distribution kind.
    pub fn distribution(mut self, v: DistributionKind) -> Self {
        self.distribution = v;
        self
    }

    /// Sets state-dependent log std.
    pub fn state_dependent_std(mut self, v: bool) -> Self {
        self.state_dependent_std = v;
        self
    }

    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Loads [`ActorConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`ActorConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Output of [`PolicyActor::act`].
#[derive(Debug, Clone)]
pub struct ActorOutput {
    /// `[.., A, act_dim]`.
    pub action: Tensor,

    /// `[.., A]`.
    pub log_prob: Tensor,

    /// Hidden state after the step, `[N, A, hidden]`, for recurrent actors.
    pub rnn_state: Option<Tensor>,
}

enum LogStd {
    Param(Tensor),
    Linear(Linear),
}

/// Encoder, optional conditioning, trunk and GRU, and a Gaussian head.
pub struct PolicyActor {
    config: ActorConfig,
    device: Device,
    varmap: VarMap,
    encoder: Encoder,
    conditioner: Option<Conditioner>,
    trunk: Option<Mlp>,
    gru: Option<Gru>,
    mean: Linear,
    log_std: LogStd,
    opt: Optimizer,
}

impl PolicyActor {
    /// Builds the actor for the observation and action specs of `spec`.
    ///
    /// `context_dim` enables conditioning on a context latent of that width.
    pub fn build(config: ActorConfig, spec: &AgentSpec, context_dim: Option<usize>, device: &Device) -> Result<Self> {
        let action_dim = spec.action_dim();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("actor");

        let encoder = Encoder::build(vb.pp("encoder"), &spec.observation_spec, &config.encoder)?;
        let mut feature_dim = encoder.out_dim();
        let conditioner = match context_dim {
            Some(c) => {
                let cond = Conditioner::build(vb.pp("condition"), config.condition, feature_dim, c)?;
                feature_dim = cond.out_dim(feature_dim, c);
                Some(cond)
            }
            None => None,
        };
        let trunk = match config.trunk_units.is_empty() {
            true => None,
            false => {
                let trunk = <Mlp as SubModel1>::build(
                    vb.pp("trunk"),
                    MlpConfig::new(feature_dim, config.trunk_units.clone(), None)
                        .activation(config.encoder.activation),
                )?;
                feature_dim = trunk.out_dim();
                Some(trunk)
            }
        };
        let gru = match config.rnn {
            true => Some(Gru::build(vb.pp("gru"), feature_dim, feature_dim)?),
            false => None,
        };

        let vb_head = vb.pp("mean");
        let w = vb_head.get_with_hints(
            (action_dim, feature_dim),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 0.01,
            },
        )?;
        let b = vb_head.get_with_hints(action_dim, "bias", Init::Const(0.))?;
        let mean = Linear::new(w, Some(b));
        let log_std = match config.state_dependent_std {
            true => LogStd::Linear(candle_nn::linear(feature_dim, action_dim, vb.pp("log_std"))?),
            false => LogStd::Param(vb.get_with_hints(action_dim, "log_std", Init::Const(0.))?),
        };
        let opt = config.opt_config.build(varmap.all_vars())?;

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            encoder,
            conditioner,
            trunk,
            gru,
            mean,
            log_std,
            opt,
        })
    }

    /// Returns `true` if the actor has a recurrent stage.
    pub fn is_recurrent(&self) -> bool {
        self.gru.is_some()
    }

    /// Width of the recurrent state, if any.
    pub fn hidden_dim(&self) -> Option<usize> {
        self.gru.as_ref().map(|g| g.hidden_dim())
    }

    /// Zero recurrent state for `n` environments of `n_agents` agents.
    pub fn initial_state(&self, n: usize, n_agents: usize) -> Result<Option<Tensor>> {
        self.hidden_dim()
            .map(|h| Ok(Tensor::zeros((n, n_agents, h), DType::F32, &self.device)?))
            .transpose()
    }

    fn features(&self, obs: &Observation, context: Option<&Tensor>) -> Result<Tensor> {
        let mut f = self.encoder.forward(obs)?;
        if let Some(cond) = &self.conditioner {
            let context = context.context("the actor is conditioned on a context but none was given")?;
            f = cond.forward(&f, context)?;
        }
        if let Some(trunk) = &self.trunk {
            f = SubModel1::forward(trunk, &f)?;
        }
        Ok(f)
    }

    fn head(&self, f: &Tensor) -> Result<ActionDistribution> {
        let mean = self.mean.forward(f)?;
        let log_std = match &self.log_std {
            LogStd::Param(t) => t.clone(),
            LogStd::Linear(ln) => ln.forward(f)?,
        }
        .clamp(self.config.min_log_std, self.config.max_log_std)?;
        ActionDistribution::new(self.config.distribution, mean, log_std)
    }

    /// Distribution of actions for `[N, A, ..]` observations.
    ///
    /// `rnn` is `(hidden, is_init)` with `hidden: [N, A, H]` the state fed into
    /// this step and `is_init: [N]`; a zero state is used when omitted.
    fn step_distribution(
        &self,
        obs: &Observation,
        context: Option<&Tensor>,
        rnn: Option<(&Tensor, &Tensor)>,
    ) -> Result<(ActionDistribution, Option<Tensor>)> {
        let f = self.features(obs, context)?;
        let (f, rnn_state) = match &self.gru {
            None => (f, None),
            Some(gru) => {
                let (n, a, _) = f.dims3()?;
                let (h, is_init) = match rnn {
                    Some((h, is_init)) => (h.clone(), is_init.clone()),
                    None => (
                        Tensor::zeros((n, a, gru.hidden_dim()), DType::F32, &self.device)?,
                        Tensor::zeros(n, DType::F32, &self.device)?,
                    ),
                };
                let (y, h_next) = gru.step(&f, &h, &is_init)?;
                ((f + y)?, Some(h_next))
            }
        };
        Ok((self.head(&f)?, rnn_state))
    }

    /// Samples actions, or returns the mode if `deterministic`.
    pub fn act(
        &self,
        obs: &Observation,
        context: Option<&Tensor>,
        rnn: Option<(&Tensor, &Tensor)>,
        deterministic: bool,
    ) -> Result<ActorOutput> {
        let (dist, rnn_state) = self.step_distribution(obs, context, rnn)?;
        let (action, log_prob) = dist.sample(deterministic)?;
        Ok(ActorOutput {
            action,
            log_prob,
            rnn_state,
        })
    }

    /// Log-probabilities and entropies of `action`, both `[.., A]`.
    ///
    /// A recurrent actor takes windows `[B, L, A, ..]` and `rnn = (h0, is_init)`
    /// with `h0: [B, A, H]` the state fed into the first step and
    /// `is_init: [B, L]`.
    pub fn evaluate(
        &self,
        obs: &Observation,
        action: &Tensor,
        context: Option<&Tensor>,
        rnn: Option<(&Tensor, &Tensor)>,
    ) -> Result<(Tensor, Tensor)> {
        let f = self.features(obs, context)?;
        let f = match &self.gru {
            None => f,
            Some(gru) => {
                let (h0, is_init) = rnn.ok_or_else(|| {
                    AviaryError::config("recurrent actor requires rnn_state and is_init")
                })?;
                let (ys, _) = gru.sequence(&f, h0, is_init)?;
                (f + ys)?
            }
        };
        let dist = self.head(&f)?;
        Ok((dist.log_prob(action)?, dist.entropy()?))
    }

    /// Trainable variables.
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

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.opt.backward_step(loss)
    }

    /// Save variables to prefix + ".pt".
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<PathBuf> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.save(path.as_path())?;
        info!("Save actor parameters to {:?}", path);
        Ok(path)
    }

    /// Load variables from prefix + ".pt".
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<()> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.load(path.as_path())?;
        info!("Load actor parameters from {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aviary_core::{ObservationSpec, TensorSpec};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn spec() -> AgentSpec {
        AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 6])), 3)
    }

    fn config() -> ActorConfig {
        ActorConfig::default().encoder(EncoderConfig::default().hidden_units(vec![16, 16]))
    }

    #[test]
    fn test_ratio_is_one_for_collected_actions() -> Result<()> {
        let actor = PolicyActor::build(config(), &spec(), None, &Device::Cpu)?;
        let obs: Observation = Tensor::randn(0f32, 1f32, (5, 2, 6), &Device::Cpu)?.into();
        let out = actor.act(&obs, None, None, false)?;
        assert_eq!(out.action.dims(), &[5, 2, 3]);
        assert_eq!(out.log_prob.dims(), &[5, 2]);

        let (logp, entropy) = actor.evaluate(&obs, &out.action, None, None)?;
        assert_eq!(entropy.dims(), &[5, 2]);
        let ratio = (logp - &out.log_prob)?.exp()?;
        let ones = ratio.ones_like()?;
        assert!(max_abs_diff(&ratio, &ones) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_recurrent_steps_match_sequence() -> Result<()> {
        let actor = PolicyActor::build(config().rnn(true), &spec(), None, &Device::Cpu)?;
        let (n, l, a) = (3, 4, 2);
        let obs = Tensor::randn(0f32, 1f32, (n, l, a, 6), &Device::Cpu)?;
        let is_init = Tensor::new(
            &[[1f32, 0., 0., 0.], [1., 0., 1., 0.], [0., 0., 0., 1.]],
            &Device::Cpu,
        )?;

        let mut h = Tensor::randn(0f32, 1f32, (n, a, 16), &Device::Cpu)?;
        let h0 = h.clone();
        let mut actions = vec![];
        let mut logps = vec![];
        for t in 0..l {
            let obs_t: Observation = obs.narrow(1, t, 1)?.squeeze(1)?.into();
            let init_t = is_init.narrow(1, t, 1)?.squeeze(1)?;
            let out = actor.act(&obs_t, None, Some((&h, &init_t)), false)?;
            h = out.rnn_state.context("rnn state")?;
            actions.push(out.action);
            logps.push(out.log_prob);
        }
        let actions = Tensor::stack(&actions, 1)?;
        let logps = Tensor::stack(&logps, 1)?;

        let (logp_seq, _) = actor.evaluate(&obs.into(), &actions, None, Some((&h0, &is_init)))?;
        assert_eq!(logp_seq.dims(), &[n, l, a]);
        assert!(max_abs_diff(&logp_seq, &logps) < 1e-4);
        Ok(())
    }

    #[test]
    fn test_context_is_required_when_conditioned() -> Result<()> {
        let actor = PolicyActor::build(
            config().condition(ConditionMode::Film),
            &spec(),
            Some(4),
            &Device::Cpu,
        )?;
        let obs: Observation = Tensor::randn(0f32, 1f32, (5, 2, 6), &Device::Cpu)?.into();
        assert!(actor.act(&obs, None, None, true).is_err());

        let ctx = Tensor::randn(0f32, 1f32, (5, 2, 4), &Device::Cpu)?;
        let out = actor.act(&obs, Some(&ctx), None, true)?;
        assert_eq!(out.action.dims(), &[5, 2, 3]);
        Ok(())
    }
}
