//! PPO agent.
use super::{policy_loss, value_loss, MinibatchSampler, PpoConfig};
use crate::{
    actor::{ActorOutput, PolicyActor},
    adapt::{ContextEncoder, ContextEncoderConfig},
    batch::{BatchAxes, Observation, TransitionBatch},
    critic::Critic,
    opt::clip_grad_norm,
    util::{ensure_finite, ensure_same_shape, explained_variance, mean_scalar, std_all, var_scalar, NamedTensors},
    value_norm::ValueNormalizer,
    Device,
};
use anyhow::Result;
use aviary_core::{
    error::AviaryError,
    record::{Record, RecordStorage, RecordValue},
    Agent, AgentSpec,
};
use candle_core::{Tensor, D};
use log::{debug, info, trace};
use std::{
    convert::TryInto,
    path::{Path, PathBuf},
};

/// Training data of one call, with leading axis `[M]` (or `[M, L]` windows for
/// recurrent actors).
struct Prepared {
    obs: Observation,
    state: Option<Observation>,
    action: Tensor,
    sample_log_prob: Tensor,
    advantage: Tensor,
    ret: Tensor,
    value: Tensor,
    intrinsics: Option<Tensor>,
    is_init: Option<Tensor>,
    rnn_state: Option<Tensor>,
}

impl Prepared {
    fn len(&self) -> Result<usize> {
        Ok(self.action.dim(0)?)
    }

    fn select(&self, ixs: &Tensor) -> Result<Self> {
        Ok(Self {
            obs: self.obs.select(ixs)?,
            state: self.state.select(ixs)?,
            action: self.action.select(ixs)?,
            sample_log_prob: self.sample_log_prob.select(ixs)?,
            advantage: self.advantage.select(ixs)?,
            ret: self.ret.select(ixs)?,
            value: self.value.select(ixs)?,
            intrinsics: self.intrinsics.select(ixs)?,
            is_init: self.is_init.select(ixs)?,
            rnn_state: self.rnn_state.select(ixs)?,
        })
    }
}

/// PPO agent for one group of homogeneous agents.
///
/// With a context encoder, actor and critic are conditioned on the encoding
/// of the privileged `intrinsics` of the batch, and the encoder is trained
/// jointly with them.
pub struct Ppo {
    spec: AgentSpec,
    config: PpoConfig,
    device: candle_core::Device,
    actor: PolicyActor,
    critic: Critic,
    context_encoder: Option<ContextEncoder>,
    value_norm: Box<dyn ValueNormalizer>,
    sampler: MinibatchSampler,
    reward_weights: Tensor,
    train: bool,
    n_updates: usize,
}

impl Ppo {
    /// Builds the agent for the given spec.
    pub fn build(config: PpoConfig, spec: AgentSpec) -> Result<Self> {
        Self::build_with_context(config, spec, None)
    }

    /// Builds the agent with a context encoder of the intrinsics of `spec`.
    pub fn build_with_context(
        config: PpoConfig,
        spec: AgentSpec,
        context_config: Option<&ContextEncoderConfig>,
    ) -> Result<Self> {
        let device: candle_core::Device = config.device.unwrap_or(Device::Cpu).try_into()?;
        let n_heads = spec.n_reward_heads();

        let context_encoder = match context_config {
            None => None,
            Some(c) => {
                let intrinsics = spec.intrinsics_spec.as_ref().ok_or_else(|| {
                    AviaryError::config("a context encoder requires an intrinsics spec")
                })?;
                Some(ContextEncoder::build(c, intrinsics.last_dim(), &device)?)
            }
        };
        let context_dim = context_encoder.as_ref().map(|c| c.out_dim());

        let actor = PolicyActor::build(config.actor_config.clone(), &spec, context_dim, &device)?;
        let critic = Critic::build(config.critic_config.clone(), &spec, context_dim, &device)?;
        let value_norm = config.value_norm.build(n_heads)?;
        let sampler = MinibatchSampler::new(config.num_minibatches, config.seed)?;

        let weights = match &config.reward_weights {
            Some(w) if w.len() != n_heads => {
                return Err(AviaryError::config(format!(
                    "{} reward weights given for {} reward heads",
                    w.len(),
                    n_heads
                ))
                .into())
            }
            Some(w) => w.clone(),
            None => vec![1f32; n_heads],
        };
        let reward_weights = Tensor::from_vec(weights, n_heads, &device)?;
        if actor.is_recurrent() && config.seq_len == 0 {
            return Err(AviaryError::config("seq_len must be positive for a recurrent actor").into());
        }

        Ok(Self {
            spec,
            config,
            device,
            actor,
            critic,
            context_encoder,
            value_norm,
            sampler,
            reward_weights,
            train: true,
            n_updates: 0,
        })
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn actor(&self) -> &PolicyActor {
        &self.actor
    }

    pub fn critic(&self) -> &Critic {
        &self.critic
    }

    pub fn context_encoder(&self) -> Option<&ContextEncoder> {
        self.context_encoder.as_ref()
    }

    pub fn value_norm(&self) -> &dyn ValueNormalizer {
        self.value_norm.as_ref()
    }

    pub fn device(&self) -> &candle_core::Device {
        &self.device
    }

    /// Context latent of the given intrinsics, if the agent has a context
    /// encoder.
    pub fn context(&self, intrinsics: Option<&Tensor>) -> Result<Option<Tensor>> {
        match (&self.context_encoder, intrinsics) {
            (None, _) => Ok(None),
            (Some(enc), Some(i)) => Ok(Some(enc.forward(i)?)),
            (Some(_), None) => Err(AviaryError::config("intrinsics are required by the context encoder").into()),
        }
    }

    /// Actions for `[N, A, ..]` observations. `context` is a context latent,
    /// see [`Ppo::context`].
    pub fn act(
        &self,
        obs: &Observation,
        context: Option<&Tensor>,
        rnn: Option<(&Tensor, &Tensor)>,
        deterministic: bool,
    ) -> Result<ActorOutput> {
        self.actor.act(obs, context, rnn, deterministic)
    }

    /// Normalized values `[.., A, H]`. A centralized critic reads `state`.
    pub fn value(&self, obs: &Observation, state: Option<&Observation>, context: Option<&Tensor>) -> Result<Tensor> {
        let input = self.critic_input(obs, state)?;
        self.critic.value(input, context)
    }

    fn critic_input<'a>(&self, obs: &'a Observation, state: Option<&'a Observation>) -> Result<&'a Observation> {
        match self.critic.is_centralized() {
            false => Ok(obs),
            true => state.ok_or_else(|| AviaryError::config("a centralized critic requires the joint state").into()),
        }
    }

    /// Snapshot of all parameters on the CPU.
    pub fn snapshot(&self) -> Result<NamedTensors> {
        let mut nt = NamedTensors::copy_from(self.actor.varmap())?;
        nt.extend(NamedTensors::copy_from(self.critic.varmap())?);
        if let Some(enc) = &self.context_encoder {
            nt.extend(NamedTensors::copy_from(enc.varmap())?);
        }
        Ok(nt)
    }

    /// Restores parameters from a snapshot.
    pub fn restore(&self, snapshot: &NamedTensors) -> Result<()> {
        snapshot.copy_to(self.actor.varmap(), "")?;
        snapshot.copy_to(self.critic.varmap(), "")?;
        if let Some(enc) = &self.context_encoder {
            snapshot.copy_to(enc.varmap(), "")?;
        }
        Ok(())
    }

    /// Value of the state after the last step, `[N, 1, A, H]`, normalized.
    fn bootstrap_value(&self, batch: &TransitionBatch, n_steps: usize) -> Result<Tensor> {
        let last = n_steps - 1;
        let next_obs = batch.next_obs.narrow(1, last, 1)?;
        let next_state = match &batch.next_state {
            Some(s) => Some(s.narrow(1, last, 1)?),
            None => None,
        };
        let next_intrinsics = match (&batch.next_intrinsics, &batch.intrinsics) {
            (Some(i), _) | (None, Some(i)) => Some(i.narrow(1, last, 1)?),
            (None, None) => None,
        };
        let context = self.context(next_intrinsics.as_ref())?;
        Ok(self
            .value(&next_obs, next_state.as_ref(), context.as_ref())?
            .detach())
    }

    /// Computes advantages and normalized returns, updates the value
    /// normalizer and returns per-call diagnostics.
    fn prepare(&mut self, batch: &TransitionBatch) -> Result<(Prepared, Record)> {
        batch.check_shapes(self.spec.n_agents, self.spec.action_dim())?;
        let (_, n_steps) = batch.batch_dims()?;

        // Normalized values at collection time.
        let value = match &batch.state_value {
            Some(v) => v.clone(),
            None => {
                let context = self.context(batch.intrinsics.as_ref())?;
                self.value(&batch.obs, batch.state.as_ref(), context.as_ref())?
                    .detach()
            }
        };
        let bootstrap = self.bootstrap_value(batch, n_steps)?;

        let value_raw = self.value_norm.denormalize(&value)?;
        let bootstrap_raw = self.value_norm.denormalize(&bootstrap)?;
        let (adv, ret) = self.config.gae.compute_with_bootstrap(
            &batch.reward,
            &batch.terminated.unsqueeze(D::Minus1)?,
            &batch.done.unsqueeze(D::Minus1)?,
            &value_raw,
            &bootstrap_raw,
        )?;
        ensure_finite(&ret, "returns")?;
        self.value_norm.update(&ret)?;
        let ret_normalized = self.value_norm.normalize(&ret)?;

        // Heads are combined into one advantage per agent.
        let adv = adv
            .broadcast_mul(&self.reward_weights)?
            .sum_keepdim(D::Minus1)?
            .squeeze(D::Minus1)?;
        let adv_mean = mean_scalar(&adv)?;
        let adv_std = std_all(&adv)?.to_scalar::<f32>()?;
        let adv = match self.config.normalize_advantages {
            true => ((adv - adv_mean as f64)? / adv_std.max(1e-7) as f64)?,
            false => adv,
        };

        let action_norm = mean_scalar(&batch.action.sqr()?.sum(D::Minus1)?.sqrt()?)?;
        let running_mean = self.value_norm.running_mean();
        let value_running_mean = running_mean.iter().sum::<f32>() / running_mean.len().max(1) as f32;
        let record = Record::from_slice(&[
            ("advantages_mean", RecordValue::Scalar(adv_mean)),
            ("advantages_std", RecordValue::Scalar(adv_std)),
            ("return_mean", RecordValue::Scalar(mean_scalar(&ret)?)),
            ("return_var", RecordValue::Scalar(var_scalar(&ret)?)),
            ("action_norm", RecordValue::Scalar(action_norm)),
            ("value_running_mean", RecordValue::Scalar(value_running_mean)),
        ]);

        let seq_len = match self.actor.is_recurrent() {
            true => self.config.seq_len,
            false => 1,
        };
        let (is_init, rnn_state) = match self.actor.is_recurrent() {
            false => (None, None),
            true => match (&batch.is_init, &batch.rnn_state) {
                (Some(is_init), Some(rnn_state)) => {
                    // The state fed into the first step of every window.
                    let h0 = rnn_state.fold_time(seq_len)?.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
                    (Some(is_init.fold_time(seq_len)?), Some(h0))
                }
                _ => {
                    return Err(AviaryError::config(
                        "a recurrent actor requires is_init and rnn_state in the batch",
                    )
                    .into())
                }
            },
        };
        let state = match self.critic.is_centralized() {
            true => batch.state.fold_time(seq_len)?,
            false => None,
        };
        let prepared = Prepared {
            obs: batch.obs.fold_time(seq_len)?,
            state,
            action: batch.action.fold_time(seq_len)?,
            sample_log_prob: batch.sample_log_prob.fold_time(seq_len)?,
            advantage: adv.fold_time(seq_len)?,
            ret: ret_normalized.fold_time(seq_len)?,
            value: value.fold_time(seq_len)?,
            intrinsics: batch.intrinsics.fold_time(seq_len)?,
            is_init,
            rnn_state,
        };

        Ok((prepared, record))
    }

    fn update_minibatch(&mut self, mb: &Prepared) -> Result<Record> {
        let context = self.context(mb.intrinsics.as_ref())?;
        let rnn = match (&mb.rnn_state, &mb.is_init) {
            (Some(h), Some(i)) => Some((h, i)),
            _ => None,
        };
        let (log_prob, entropy) = self
            .actor
            .evaluate(&mb.obs, &mb.action, context.as_ref(), rnn)?;
        let p_loss = policy_loss(
            &log_prob,
            &mb.sample_log_prob,
            &mb.advantage,
            self.config.clip_param,
            self.spec.action_dim(),
        )?;
        let entropy = entropy.mean_all()?;

        let input = self.critic_input(&mb.obs, mb.state.as_ref())?;
        let values = self.critic.value(input, context.as_ref())?;
        ensure_same_shape(("value", &values), ("return", &mb.ret))?;
        let v_loss = value_loss(
            &values,
            &mb.value,
            &mb.ret,
            self.config.clip_param,
            self.config.critic_loss,
            self.config.value_loss_reduction,
        )?;

        let loss = ((&p_loss + &v_loss)? - (&entropy * self.config.entropy_coef)?)?;
        let mut grads = loss.backward()?;
        let max_norm = self.config.max_grad_norm;
        let actor_grad_norm = clip_grad_norm(&mut grads, &self.actor.vars(), max_norm)?;
        let critic_grad_norm = clip_grad_norm(&mut grads, &self.critic.vars(), max_norm)?;
        self.actor.step(&grads)?;
        self.critic.step(&grads)?;

        let mut record = Record::from_slice(&[
            ("policy_loss", RecordValue::Scalar(p_loss.to_scalar::<f32>()?)),
            ("value_loss", RecordValue::Scalar(v_loss.to_scalar::<f32>()?)),
            ("entropy", RecordValue::Scalar(entropy.to_scalar::<f32>()?)),
            ("actor_grad_norm", RecordValue::Scalar(actor_grad_norm)),
            ("critic_grad_norm", RecordValue::Scalar(critic_grad_norm)),
            (
                "explained_var",
                RecordValue::Scalar(explained_variance(&values.detach(), &mb.ret)?),
            ),
        ]);
        if let Some(enc) = self.context_encoder.as_mut() {
            let norm = clip_grad_norm(&mut grads, &enc.vars(), max_norm)?;
            enc.step(&grads)?;
            record.insert("context_grad_norm", RecordValue::Scalar(norm));
        }
        trace!("minibatch loss {:?}", loss.to_scalar::<f32>()?);
        Ok(record)
    }
}

impl Agent<TransitionBatch> for Ppo {
    fn train(&mut self) {
        self.train = true;
    }

    fn eval(&mut self) {
        self.train = false;
    }

    fn is_train(&self) -> bool {
        self.train
    }

    /// One training iteration; diagnostics are prefixed with the group name.
    fn train_op(&mut self, batch: &TransitionBatch) -> Result<Record> {
        let (prepared, mut record) = self.prepare(batch)?;
        let len = prepared.len()?;

        let mut storage = RecordStorage::new();
        for epoch in 0..self.config.ppo_epochs {
            trace!("epoch {}", epoch);
            for ixs in self.sampler.partition_tensors(len, &self.device)? {
                let mb = prepared.select(&ixs)?;
                storage.store(self.update_minibatch(&mb)?);
            }
        }
        record.merge_inplace(storage.aggregate_mean());
        self.n_updates += 1;
        debug!(
            "{}: update {} on {} items, {} keys",
            self.spec.name,
            self.n_updates,
            len,
            record.len()
        );

        Ok(record.with_prefix(&self.spec.name))
    }

    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(path)?;
        let mut paths = vec![
            self.actor.save(path.join("actor"))?,
            self.critic.save(path.join("critic"))?,
        ];
        if let Some(enc) = &self.context_encoder {
            paths.push(enc.save(path.join("context_encoder"))?);
        }
        let value_norm_path = path.join("value_norm.pt");
        self.value_norm.save(&value_norm_path)?;
        paths.push(value_norm_path);
        info!("Save PPO agent {} to {:?}", self.spec.name, path);
        Ok(paths)
    }

    fn load_params(&mut self, path: &Path) -> Result<()> {
        self.actor.load(path.join("actor"))?;
        self.critic.load(path.join("critic"))?;
        if let Some(enc) = self.context_encoder.as_mut() {
            enc.load(path.join("context_encoder"))?;
        }
        self.value_norm.load(&path.join("value_norm.pt"))?;
        info!("Load PPO agent {} from {:?}", self.spec.name, path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;
    use crate::{actor::ActorConfig, critic::CriticConfig, encoder::EncoderConfig};
    use aviary_core::{ObservationSpec, TensorSpec};
    use candle_core::DType;

    fn spec() -> AgentSpec {
        AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 5])), 3).reward_heads(2)
    }

    fn config() -> PpoConfig {
        let encoder = EncoderConfig::default().hidden_units(vec![16]);
        PpoConfig::default()
            .actor_config(ActorConfig::default().encoder(encoder.clone()))
            .critic_config(CriticConfig::default().encoder(encoder))
            .num_minibatches(2)
            .ppo_epochs(2)
    }

    fn batch(n: usize, t: usize) -> Result<TransitionBatch> {
        let device = candle_core::Device::Cpu;
        let obs = Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?;
        let next_obs = Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?;
        let flags = Tensor::zeros((n, t, 2), DType::F32, &device)?;
        Ok(TransitionBatch::new(
            obs.into(),
            next_obs.into(),
            Tensor::randn(0f32, 0.5f32, (n, t, 2, 3), &device)?,
            Tensor::randn(-3f32, 0.1f32, (n, t, 2), &device)?,
            Tensor::randn(0f32, 1f32, (n, t, 2, 2), &device)?,
            flags.clone(),
            flags,
        ))
    }

    #[test]
    fn test_train_op_records() -> Result<()> {
        let mut ppo = Ppo::build(config(), spec())?;
        let record = ppo.train_op(&batch(2, 4)?)?;
        for key in [
            "policy_loss",
            "value_loss",
            "entropy",
            "actor_grad_norm",
            "critic_grad_norm",
            "explained_var",
            "advantages_mean",
            "advantages_std",
            "return_mean",
            "return_var",
            "action_norm",
            "value_running_mean",
        ] {
            let v = record.get_scalar(&format!("drone/{}", key))?;
            assert!(v.is_finite(), "{} = {}", key, v);
        }
        Ok(())
    }

    #[test]
    fn test_reward_weights_must_match_heads() {
        let config = config().reward_weights(vec![1.0]);
        assert!(Ppo::build(config, spec()).is_err());
    }

    #[test]
    fn test_recurrent_actor_requires_rnn_state() -> Result<()> {
        let encoder = EncoderConfig::default().hidden_units(vec![16]);
        let config = config()
            .seq_len(2)
            .actor_config(ActorConfig::default().encoder(encoder).rnn(true));
        let mut ppo = Ppo::build(config, spec())?;
        assert!(ppo.train_op(&batch(2, 4)?).is_err());

        let hidden = ppo.actor().hidden_dim().context("hidden")?;
        let device = candle_core::Device::Cpu;
        let batch = batch(2, 4)?.recurrent(
            Tensor::zeros((2, 4, 2, hidden), DType::F32, &device)?,
            Tensor::new(&[[1f32, 0., 0., 0.], [1., 0., 1., 0.]], &device)?,
        );
        let record = ppo.train_op(&batch)?;
        assert!(record.get_scalar("drone/policy_loss")?.is_finite());
        Ok(())
    }
}
