//! SAC agent.
use super::{EntCoef, MultiCritic, SacConfig};
use crate::{
    actor::{ActorOutput, PolicyActor},
    batch::{BatchAxes, Observation, TransitionBatch},
    distribution::DistributionKind,
    mlp::Mlp,
    opt::clip_grad_norm,
    util::{ensure_finite, mean_scalar, OutDim},
    Device, TensorBatch,
};
use anyhow::Result;
use aviary_core::{
    error::AviaryError,
    record::{Record, RecordStorage, RecordValue},
    replay_buffer::{GenericTransitionBatch, SimpleReplayBuffer},
    Agent, AgentSpec, ExperienceBufferBase, ObservationSpec, ReplayBufferBase,
};
use candle_core::{DType, Tensor, D};
use log::{debug, info, trace, warn};
use std::{
    convert::TryInto,
    path::{Path, PathBuf},
};

type ReplayBuffer = SimpleReplayBuffer<TensorBatch, TensorBatch>;

fn flags(xs: &Tensor) -> Result<Vec<bool>> {
    let v = xs.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(v.into_iter().map(|x| x > 0.5).collect())
}

fn to_tensor_f32(v: &[i8], device: &candle_core::Device) -> Result<Tensor> {
    let v = v.iter().map(|x| *x as f32).collect::<Vec<_>>();
    let n = v.len();
    Ok(Tensor::from_vec(v, n, device)?)
}

/// `[B, A, ..]` to `[B, A * ..]`.
fn joint(xs: &Tensor) -> Result<Tensor> {
    Ok(xs.flatten_from(1)?)
}

/// Soft actor-critic agent for one group of homogeneous agents.
///
/// Every call of [`Agent::train_op`] stores the rollout in the replay buffer,
/// then runs `gradient_steps` updates once the buffer holds `warmup`
/// transitions.
pub struct Sac {
    spec: AgentSpec,
    config: SacConfig,
    device: candle_core::Device,
    actor: PolicyActor,
    critic: MultiCritic<Mlp>,
    ent_coef: EntCoef,
    buffer: ReplayBuffer,
    reward_weights: Tensor,
    train: bool,
    n_updates: usize,
}

impl Sac {
    /// Builds the agent for the given spec.
    ///
    /// Observations must be a single vector per agent and the actor must be
    /// feed-forward.
    pub fn build(config: SacConfig, spec: AgentSpec) -> Result<Self> {
        let device: candle_core::Device = config.device.unwrap_or(Device::Cpu).try_into()?;
        let obs_dim = match &spec.observation_spec {
            ObservationSpec::Vector(s) => s.numel(),
            ObservationSpec::Composite(_) => {
                return Err(AviaryError::config("SAC requires a vector observation").into())
            }
        };
        if config.actor_config.rnn {
            return Err(AviaryError::config("SAC does not support a recurrent actor").into());
        }
        for (name, v) in [
            ("batch_size", config.batch_size),
            ("actor_delay", config.actor_delay),
            ("target_update_interval", config.target_update_interval),
        ] {
            if v == 0 {
                return Err(AviaryError::config(format!("{} must be positive", name)).into());
            }
        }

        let actor_config = config
            .actor_config
            .clone()
            .distribution(DistributionKind::TanhNormal);
        let actor = PolicyActor::build(actor_config, &spec, None, &device)?;

        let mut critic_config = config.critic_config.clone();
        let mut q_config = critic_config
            .q_config
            .clone()
            .in_dim(obs_dim + spec.n_agents * spec.action_dim());
        q_config.set_out_dim(1);
        critic_config.q_config = q_config;
        let critic = MultiCritic::build(critic_config, &device)?;

        let ent_coef = EntCoef::new(&config.ent_coef_mode, spec.action_dim(), &device)?;
        let buffer = ReplayBuffer::build(&config.replay_buffer_config);

        let n_heads = spec.n_reward_heads();
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

        Ok(Self {
            spec,
            config,
            device,
            actor,
            critic,
            ent_coef,
            buffer,
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

    pub fn critic(&self) -> &MultiCritic<Mlp> {
        &self.critic
    }

    pub fn ent_coef(&self) -> &EntCoef {
        &self.ent_coef
    }

    /// Number of stored transitions.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Actions for `obs: [.., A, D]`, the mode if `deterministic`.
    pub fn act(&self, obs: &Observation, deterministic: bool) -> Result<ActorOutput> {
        self.actor.act(obs, None, None, deterministic)
    }

    /// Flattens `[N, T]` of the rollout into joint transitions of the group.
    fn transitions(&self, batch: &TransitionBatch) -> Result<GenericTransitionBatch<TensorBatch, TensorBatch>> {
        batch.check_shapes(self.spec.n_agents, self.spec.action_dim())?;
        let vector = |obs: &Observation| -> Result<Tensor> {
            match obs {
                Observation::Vector(t) => t.fold_time(1),
                Observation::Composite(_) => Err(AviaryError::config("SAC requires a vector observation").into()),
            }
        };

        let reward = batch
            .reward
            .to_device(&self.device)?
            .broadcast_mul(&self.reward_weights)?
            .sum(D::Minus1)?
            .mean(D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let terminated = flags(&batch.terminated.max(D::Minus1)?)?;
        let done = flags(&batch.done.max(D::Minus1)?)?;
        let is_truncated = done
            .iter()
            .zip(terminated.iter())
            .map(|(d, t)| (*d && !*t) as i8)
            .collect();
        let is_terminated = terminated.into_iter().map(|t| t as i8).collect();

        Ok(GenericTransitionBatch {
            obs: TensorBatch::from_tensor(vector(&batch.obs)?),
            act: TensorBatch::from_tensor(batch.action.fold_time(1)?),
            next_obs: TensorBatch::from_tensor(vector(&batch.next_obs)?),
            reward,
            is_terminated,
            is_truncated,
            ix_sample: None,
        })
    }

    fn update_critic(
        &mut self,
        obs: &Tensor,
        act: &Tensor,
        next_obs: &Tensor,
        reward: &Tensor,
        terminated: &Tensor,
    ) -> Result<Record> {
        let alpha = self.ent_coef.alpha()?;
        let target = {
            let next = self.actor.act(&next_obs.clone().into(), None, None, false)?;
            let next_logp = next.log_prob.mean(D::Minus1)?;
            let next_q = self.critic.qvals_min_tgt(&joint(next_obs)?, &joint(&next.action)?)?;
            let next_v = (next_q - alpha.broadcast_mul(&next_logp)?)?;
            let not_term = terminated.ones_like()?.sub(terminated)?;
            (reward + (not_term * next_v)? * self.config.gamma)?.detach()
        };
        ensure_finite(&target, "SAC critic target")?;

        let qs = self.critic.qvals(&joint(obs)?, &joint(act)?)?;
        let mut loss = target.zeros_like()?.sum_all()?;
        for q in qs.iter() {
            loss = (loss + self.config.critic_loss.elementwise(q, &target)?.mean_all()?)?;
        }
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.critic.vars(), self.config.max_grad_norm)?;
        self.critic.step(&grads)?;

        Ok(Record::from_slice(&[
            ("critic_loss", RecordValue::Scalar(loss.to_scalar::<f32>()?)),
            ("critic_grad_norm", RecordValue::Scalar(grad_norm)),
            ("q_taken", RecordValue::Scalar(mean_scalar(&Tensor::stack(&qs, 0)?)?)),
        ]))
    }

    fn update_actor(&mut self, obs: &Tensor) -> Result<Record> {
        let alpha = self.ent_coef.alpha()?;
        let out = self.actor.act(&obs.clone().into(), None, None, false)?;
        let logp = out.log_prob.mean(D::Minus1)?;
        let q = self.critic.qvals_min(&joint(obs)?, &joint(&out.action)?)?;
        let loss = (alpha.broadcast_mul(&logp)? - q)?.mean_all()?;

        // Critic gradients are computed too but never applied here.
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.actor.vars(), self.config.max_grad_norm)?;
        self.actor.step(&grads)?;

        let mut record = Record::from_slice(&[
            ("actor_loss", RecordValue::Scalar(loss.to_scalar::<f32>()?)),
            ("actor_grad_norm", RecordValue::Scalar(grad_norm)),
        ]);
        if let Some(alpha_loss) = self.ent_coef.update(&logp)? {
            record.insert("alpha_loss", RecordValue::Scalar(alpha_loss));
        }
        Ok(record)
    }

    fn gradient_step(&mut self, step: usize) -> Result<Record> {
        let batch = self.buffer.batch(self.config.batch_size)?;
        let obs = batch.obs.to_tensor(&self.device)?;
        let act = batch.act.to_tensor(&self.device)?;
        let next_obs = batch.next_obs.to_tensor(&self.device)?;
        let n = batch.len();
        let reward = Tensor::from_vec(batch.reward, n, &self.device)?;
        let terminated = to_tensor_f32(&batch.is_terminated, &self.device)?;

        trace!("gradient step {}", step);
        let mut record = self.update_critic(&obs, &act, &next_obs, &reward, &terminated)?;

        // Counted from the first step, so a single step still reaches the actor.
        if (step - 1) % self.config.actor_delay == 0 {
            record.merge_inplace(self.update_actor(&obs)?);
        }
        if step % self.config.target_update_interval == 0 {
            self.critic.soft_update(self.config.tau)?;
        }
        Ok(record)
    }
}

impl Agent<TransitionBatch> for Sac {
    fn train(&mut self) {
        self.train = true;
    }

    fn eval(&mut self) {
        self.train = false;
    }

    fn is_train(&self) -> bool {
        self.train
    }

    /// Stores the rollout and trains once the buffer is warm.
    ///
    /// Returns an empty record while below warm-up.
    fn train_op(&mut self, batch: &TransitionBatch) -> Result<Record> {
        let transitions = self.transitions(batch)?;
        self.buffer.push(transitions)?;

        if self.buffer.len() < self.config.warmup {
            warn!(
                "{}: {} of {} warm-up transitions stored, training skipped",
                self.spec.name,
                self.buffer.len(),
                self.config.warmup
            );
            return Ok(Record::empty());
        }

        let mut storage = RecordStorage::new();
        for step in 1..=self.config.gradient_steps {
            storage.store(self.gradient_step(step)?);
        }
        let mut record = storage.aggregate_mean();
        record.insert("alpha", RecordValue::Scalar(self.ent_coef.alpha_scalar()?));
        self.n_updates += 1;
        debug!(
            "{}: update {} with {} stored transitions",
            self.spec.name,
            self.n_updates,
            self.buffer.len()
        );

        Ok(record.with_prefix(&self.spec.name))
    }

    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(path)?;
        let mut paths = vec![self.actor.save(path.join("actor"))?];
        paths.extend(self.critic.save(path)?);
        let ent_coef_path = path.join("ent_coef.pt");
        self.ent_coef.save(&ent_coef_path)?;
        paths.push(ent_coef_path);
        info!("Save SAC agent {} to {:?}", self.spec.name, path);
        Ok(paths)
    }

    fn load_params(&mut self, path: &Path) -> Result<()> {
        self.actor.load(path.join("actor"))?;
        self.critic.load(path)?;
        self.ent_coef.load(path.join("ent_coef.pt"))?;
        info!("Load SAC agent {} from {:?}", self.spec.name, path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        actor::ActorConfig,
        encoder::EncoderConfig,
        mlp::MlpConfig,
        sac::{EntCoefMode, MultiCriticConfig},
    };
    use aviary_core::{replay_buffer::SimpleReplayBufferConfig, TensorSpec};

    fn spec() -> AgentSpec {
        AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 5])), 3)
    }

    fn config() -> SacConfig {
        let critic_config = SacConfig::default().critic_config.q_config(MlpConfig::new(0, vec![16], Some(1)));
        SacConfig::default()
            .actor_config(
                ActorConfig::default()
                    .encoder(EncoderConfig::default().hidden_units(vec![16]))
                    .state_dependent_std(true),
            )
            .critic_config(critic_config)
            .replay_buffer_config(SimpleReplayBufferConfig::default().capacity(100).seed(0))
            .batch_size(4)
            .warmup(8)
            .gradient_steps(3)
    }

    fn batch(n: usize, t: usize) -> Result<TransitionBatch> {
        let device = candle_core::Device::Cpu;
        let flags = Tensor::zeros((n, t, 2), DType::F32, &device)?;
        Ok(TransitionBatch::new(
            Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?.into(),
            Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?.into(),
            Tensor::randn(0f32, 0.3f32, (n, t, 2, 3), &device)?.tanh()?,
            Tensor::zeros((n, t, 2), DType::F32, &device)?,
            Tensor::randn(0f32, 1f32, (n, t, 2, 1), &device)?,
            flags.clone(),
            flags,
        ))
    }

    #[test]
    fn test_warmup_returns_empty_record() -> Result<()> {
        let mut sac = Sac::build(config(), spec())?;
        let record = sac.train_op(&batch(2, 3)?)?;
        assert_eq!(record.len(), 0);
        assert_eq!(sac.buffer_len(), 6);
        Ok(())
    }

    #[test]
    fn test_train_op_records() -> Result<()> {
        let mut sac = Sac::build(config(), spec())?;
        sac.train_op(&batch(2, 3)?)?;
        let record = sac.train_op(&batch(2, 3)?)?;
        for key in [
            "critic_loss",
            "critic_grad_norm",
            "q_taken",
            "actor_loss",
            "actor_grad_norm",
            "alpha",
            "alpha_loss",
        ] {
            let v = record.get_scalar(&format!("drone/{}", key))?;
            assert!(v.is_finite(), "{} = {}", key, v);
        }
        Ok(())
    }

    #[test]
    fn test_rollout_larger_than_capacity() -> Result<()> {
        let config = config().replay_buffer_config(SimpleReplayBufferConfig::default().capacity(10).seed(0));
        let mut sac = Sac::build(config, spec())?;
        sac.train_op(&batch(1, 3)?)?;
        let record = sac.train_op(&batch(4, 6)?)?;
        assert_eq!(sac.buffer_len(), 10);
        assert!(record.get_scalar("drone/critic_loss")?.is_finite());
        Ok(())
    }

    #[test]
    fn test_fixed_alpha_has_no_alpha_loss() -> Result<()> {
        let config = config().ent_coef_mode(EntCoefMode::Fix(0.2));
        let mut sac = Sac::build(config, spec())?;
        sac.train_op(&batch(4, 3)?)?;
        let record = sac.train_op(&batch(4, 3)?)?;
        assert!(record.get_scalar("drone/alpha_loss").is_err());
        assert!((record.get_scalar("drone/alpha")? - 0.2).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let composite = AgentSpec::new(
            "drone",
            2,
            ObservationSpec::composite([("state", TensorSpec::new(&[2, 5]))]),
            3,
        );
        assert!(Sac::build(config(), composite).is_err());

        let recurrent = config().actor_config(ActorConfig::default().rnn(true));
        assert!(Sac::build(recurrent, spec()).is_err());

        let single = config().critic_config(MultiCriticConfig {
            n_nets: 1,
            ..SacConfig::default().critic_config
        });
        assert!(Sac::build(single, spec()).is_err());
    }
}
