//! Adaptive PPO agent.
use super::{
    discriminator_accuracy, AdaptationPhase, AdaptationTarget, Discriminator, PpoAdaptiveConfig, TConv,
    TConvConfig,
};
use crate::{
    actor::ActorOutput,
    batch::{BatchAxes, Observation, TransitionBatch},
    opt::{Optimizer, OptimizerConfig},
    ppo::{MinibatchSampler, Ppo},
    util::mean_scalar,
};
use anyhow::Result;
use aviary_core::{
    error::AviaryError,
    record::{Record, RecordStorage, RecordValue},
    Agent, AgentSpec,
};
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info, trace};
use std::path::{Path, PathBuf};

/// Predicts the adaptation target from windows of past observations.
pub struct AdaptationModule {
    varmap: VarMap,
    tconv: TConv,
    opt: Optimizer,
}

impl AdaptationModule {
    pub fn build(
        tconv_config: &TConvConfig,
        opt_config: &OptimizerConfig,
        obs_dim: usize,
        window: usize,
        target_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("adaptation");
        let tconv = TConv::build(vb, obs_dim, window, target_dim, tconv_config)?;
        let opt = opt_config.build(varmap.all_vars())?;
        Ok(Self { varmap, tconv, opt })
    }

    /// `[.., D, W]` to `[.., target_dim]`.
    pub fn forward(&self, obs_history: &Tensor) -> Result<Tensor> {
        self.tconv.forward(obs_history)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.step(grads)
    }

    /// Save variables to prefix + ".pt".
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<PathBuf> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.save(path.as_path())?;
        info!("Save adaptation module parameters to {:?}", path);
        Ok(path)
    }

    /// Load variables from prefix + ".pt".
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<()> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.load(path.as_path())?;
        info!("Load adaptation module parameters from {:?}", path);
        Ok(())
    }
}

/// PPO conditioned on a context of privileged intrinsics, with an adaptation
/// module that learns to infer that context from the observation history.
///
/// In the [`AdaptationPhase::Encoder`] phase, `train_op` runs the PPO update
/// with the context encoder trained jointly. In the
/// [`AdaptationPhase::Adaptation`] phase, only the adaptation module (and the
/// discriminator of adversarial losses) is trained, against targets of the
/// frozen context encoder. The phase also selects where the context comes from
/// when acting.
pub struct PpoAdaptive {
    config: PpoAdaptiveConfig,
    ppo: Ppo,
    adaptation: AdaptationModule,
    discriminator: Option<Discriminator>,
    sampler: MinibatchSampler,
    phase: AdaptationPhase,
}

impl PpoAdaptive {
    /// `spec` must have intrinsics and observation history specs.
    pub fn build(config: PpoAdaptiveConfig, spec: AgentSpec) -> Result<Self> {
        let intrinsics_dim = spec
            .intrinsics_spec
            .as_ref()
            .ok_or_else(|| AviaryError::config("adaptive PPO requires an intrinsics spec"))?
            .last_dim();
        let (obs_dim, window) = match spec.observation_history_spec.as_ref().map(|s| s.shape.as_slice()) {
            Some([_, d, w]) => (*d, *w),
            Some(shape) => {
                return Err(AviaryError::config(format!(
                    "observation history must be [A, D, W], got {:?}",
                    shape
                ))
                .into())
            }
            None => return Err(AviaryError::config("adaptive PPO requires an observation history spec").into()),
        };

        let mut ppo_config = config.ppo.clone();
        ppo_config.actor_config = ppo_config.actor_config.condition(config.condition);
        ppo_config.critic_config = ppo_config.critic_config.condition(config.condition);
        let ppo = Ppo::build_with_context(ppo_config, spec, Some(&config.context_encoder))?;
        let device = ppo.device().clone();

        let target_dim = match config.target {
            AdaptationTarget::Context => ppo.context_encoder().map(|c| c.out_dim()).unwrap_or(intrinsics_dim),
            AdaptationTarget::Intrinsics => intrinsics_dim,
        };
        let adaptation = AdaptationModule::build(
            &config.tconv,
            &config.adaptation_opt_config,
            obs_dim,
            window,
            target_dim,
            &device,
        )?;
        let discriminator = match config.loss.is_adversarial() {
            true => Some(Discriminator::build(
                &config.tconv,
                &config.adaptation_opt_config,
                obs_dim,
                window,
                target_dim,
                &device,
            )?),
            false => None,
        };
        let sampler = MinibatchSampler::new(config.ppo.num_minibatches, config.ppo.seed)?;
        let phase = config.phase;

        Ok(Self {
            config,
            ppo,
            adaptation,
            discriminator,
            sampler,
            phase,
        })
    }

    pub fn phase(&self) -> AdaptationPhase {
        self.phase
    }

    /// Switches the training phase.
    pub fn set_phase(&mut self, phase: AdaptationPhase) {
        if phase != self.phase {
            info!("{}: phase {:?} -> {:?}", self.ppo.spec().name, self.phase, phase);
        }
        self.phase = phase;
    }

    pub fn ppo(&self) -> &Ppo {
        &self.ppo
    }

    pub fn adaptation_module(&self) -> &AdaptationModule {
        &self.adaptation
    }

    fn encode(&self, intrinsics: &Tensor) -> Result<Tensor> {
        self.ppo
            .context(Some(intrinsics))?
            .ok_or_else(|| AviaryError::config("adaptive PPO has no context encoder").into())
    }

    /// Context latent of the current phase: encoded intrinsics in the encoder
    /// phase, inferred from the observation history in the adaptation phase.
    pub fn context(&self, intrinsics: Option<&Tensor>, obs_history: Option<&Tensor>) -> Result<Tensor> {
        match self.phase {
            AdaptationPhase::Encoder => {
                let intrinsics = intrinsics
                    .ok_or_else(|| AviaryError::config("intrinsics are required in the encoder phase"))?;
                self.encode(intrinsics)
            }
            AdaptationPhase::Adaptation => {
                let history = obs_history
                    .ok_or_else(|| AviaryError::config("observation history is required in the adaptation phase"))?;
                let pred = self.adaptation.forward(history)?;
                match self.config.target {
                    AdaptationTarget::Context => Ok(pred),
                    AdaptationTarget::Intrinsics => self.encode(&pred),
                }
            }
        }
    }

    /// Actions for `[N, A, ..]` observations.
    pub fn act(
        &self,
        obs: &Observation,
        intrinsics: Option<&Tensor>,
        obs_history: Option<&Tensor>,
        deterministic: bool,
    ) -> Result<ActorOutput> {
        let context = self.context(intrinsics, obs_history)?;
        self.ppo.act(obs, Some(&context), None, deterministic)
    }

    /// Normalized values `[.., A, H]`.
    pub fn value(
        &self,
        obs: &Observation,
        state: Option<&Observation>,
        intrinsics: Option<&Tensor>,
        obs_history: Option<&Tensor>,
    ) -> Result<Tensor> {
        let context = self.context(intrinsics, obs_history)?;
        self.ppo.value(obs, state, Some(&context))
    }

    fn adaptation_step(&mut self, window: &Tensor, target: &Tensor) -> Result<Record> {
        let pred = self.adaptation.forward(window)?;
        let mse = (&pred - target)?.sqr()?.mean_all()?;
        let disc = match self.discriminator.as_mut() {
            None => {
                let grads = mse.backward()?;
                self.adaptation.step(&grads)?;
                let loss = mse.to_scalar::<f32>()?;
                return Ok(Record::from_slice(&[
                    ("adapt_loss", RecordValue::Scalar(loss)),
                    ("adapt_mse", RecordValue::Scalar(loss)),
                ]));
            }
            Some(disc) => disc,
        };

        let loss_kind = self.config.loss;
        let real = disc.forward(target, window)?;
        let fake = disc.forward(&pred.detach(), window)?;
        let d_loss = loss_kind.discriminator_loss(&real, &fake)?;
        let accuracy = discriminator_accuracy(&real.detach(), &fake.detach())?;
        let grads = d_loss.backward()?;
        disc.step(&grads)?;

        // Only the adaptation module is stepped; the discriminator stays fixed.
        let fake = disc.forward(&pred, window)?;
        let g_loss = loss_kind.generator_loss(&fake)?;
        let grads = g_loss.backward()?;
        self.adaptation.step(&grads)?;

        let d_loss = d_loss.to_scalar::<f32>()?;
        let g_loss = g_loss.to_scalar::<f32>()?;
        Ok(Record::from_slice(&[
            ("adapt_loss", RecordValue::Scalar(d_loss + g_loss)),
            ("adapt_mse", RecordValue::Scalar(mse.to_scalar::<f32>()?)),
            ("discriminator_loss", RecordValue::Scalar(d_loss)),
            ("generator_loss", RecordValue::Scalar(g_loss)),
            ("discriminator_accuracy", RecordValue::Scalar(accuracy)),
        ]))
    }

    fn train_adaptation(&mut self, batch: &TransitionBatch) -> Result<Record> {
        let history = batch
            .obs_history
            .as_ref()
            .ok_or_else(|| AviaryError::config("the adaptation phase requires obs_history in the batch"))?;
        let intrinsics = batch
            .intrinsics
            .as_ref()
            .ok_or_else(|| AviaryError::config("the adaptation phase requires intrinsics in the batch"))?;
        let target = match self.config.target {
            AdaptationTarget::Context => self.encode(intrinsics)?.detach(),
            AdaptationTarget::Intrinsics => intrinsics.clone(),
        };
        let history = history.fold_time(1)?;
        let target = target.fold_time(1)?;
        let len = history.dim(0)?;
        let device = history.device().clone();

        let mut storage = RecordStorage::new();
        for epoch in 0..self.config.adaptation_epochs {
            trace!("adaptation epoch {}", epoch);
            for ixs in self.sampler.partition_tensors(len, &device)? {
                let record = self.adaptation_step(&history.select(&ixs)?, &target.select(&ixs)?)?;
                storage.store(record);
            }
        }
        let mut record = storage.aggregate_mean();
        record.insert("target_mean", RecordValue::Scalar(mean_scalar(&target)?));
        debug!("{}: adaptation update on {} items", self.ppo.spec().name, len);
        Ok(record.with_prefix(&self.ppo.spec().name))
    }
}

impl Agent<TransitionBatch> for PpoAdaptive {
    fn train(&mut self) {
        self.ppo.train();
    }

    fn eval(&mut self) {
        self.ppo.eval();
    }

    fn is_train(&self) -> bool {
        self.ppo.is_train()
    }

    /// PPO update in the encoder phase, adaptation update otherwise.
    fn train_op(&mut self, batch: &TransitionBatch) -> Result<Record> {
        match self.phase {
            AdaptationPhase::Encoder => self.ppo.train_op(batch),
            AdaptationPhase::Adaptation => self.train_adaptation(batch),
        }
    }

    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = self.ppo.save_params(path)?;
        paths.push(self.adaptation.save(path.join("adaptation"))?);
        if let Some(disc) = &self.discriminator {
            paths.push(disc.save(path.join("discriminator"))?);
        }
        Ok(paths)
    }

    fn load_params(&mut self, path: &Path) -> Result<()> {
        self.ppo.load_params(path)?;
        self.adaptation.load(path.join("adaptation"))?;
        if let Some(disc) = self.discriminator.as_mut() {
            disc.load(path.join("discriminator"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        actor::ActorConfig, adapt::AdaptationLoss, adapt::ContextEncoderConfig, critic::CriticConfig,
        encoder::EncoderConfig,
    };
    use aviary_core::{ObservationSpec, TensorSpec};

    const WINDOW: usize = 15;

    fn spec() -> AgentSpec {
        AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 5])), 3)
            .intrinsics_dim(4)
            .observation_history(5, WINDOW)
    }

    fn config(loss: AdaptationLoss) -> PpoAdaptiveConfig {
        let encoder = EncoderConfig::default().hidden_units(vec![16]);
        let ppo = PpoAdaptiveConfig::default()
            .ppo
            .actor_config(ActorConfig::default().encoder(encoder.clone()).trunk_units(vec![16]))
            .critic_config(CriticConfig::default().encoder(encoder))
            .num_minibatches(2)
            .ppo_epochs(1);
        PpoAdaptiveConfig::default()
            .ppo(ppo)
            .context_encoder(ContextEncoderConfig {
                hidden_units: vec![8],
                ..Default::default()
            })
            .tconv(TConvConfig::default().channels(8).hidden_units(vec![16]))
            .adaptation_opt_config(OptimizerConfig::Adam { lr: 1e-3 })
            .adaptation_epochs(1)
            .loss(loss)
    }

    fn batch(n: usize, t: usize) -> Result<TransitionBatch> {
        let device = Device::Cpu;
        let flags = Tensor::zeros((n, t, 2), DType::F32, &device)?;
        let intrinsics = Tensor::randn(0f32, 1f32, (n, t, 2, 4), &device)?;
        Ok(TransitionBatch::new(
            Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?.into(),
            Tensor::randn(0f32, 1f32, (n, t, 2, 5), &device)?.into(),
            Tensor::randn(0f32, 0.5f32, (n, t, 2, 3), &device)?,
            Tensor::randn(-3f32, 0.1f32, (n, t, 2), &device)?,
            Tensor::randn(0f32, 1f32, (n, t, 2, 1), &device)?,
            flags.clone(),
            flags,
        )
        .intrinsics(intrinsics.clone(), intrinsics)
        .obs_history(Tensor::randn(0f32, 1f32, (n, t, 2, 5, WINDOW), &device)?))
    }

    #[test]
    fn test_phase_dispatch() -> Result<()> {
        let mut agent = PpoAdaptive::build(config(AdaptationLoss::Mse), spec())?;
        let batch = batch(2, 4)?;
        let record = agent.train_op(&batch)?;
        assert!(record.get_scalar("drone/policy_loss").is_ok());
        assert!(record.get_scalar("drone/adapt_loss").is_err());

        agent.set_phase(AdaptationPhase::Adaptation);
        let record = agent.train_op(&batch)?;
        assert!(record.get_scalar("drone/adapt_loss").is_ok());
        assert!(record.get_scalar("drone/policy_loss").is_err());
        Ok(())
    }

    #[test]
    fn test_acting_source_follows_phase() -> Result<()> {
        let mut agent = PpoAdaptive::build(config(AdaptationLoss::Mse), spec())?;
        let obs: Observation = Tensor::randn(0f32, 1f32, (3, 2, 5), &Device::Cpu)?.into();
        let intrinsics = Tensor::randn(0f32, 1f32, (3, 2, 4), &Device::Cpu)?;
        let history = Tensor::randn(0f32, 1f32, (3, 2, 5, WINDOW), &Device::Cpu)?;

        assert!(agent.act(&obs, None, Some(&history), true).is_err());
        let out = agent.act(&obs, Some(&intrinsics), None, true)?;
        assert_eq!(out.action.dims(), &[3, 2, 3]);

        agent.set_phase(AdaptationPhase::Adaptation);
        assert!(agent.act(&obs, Some(&intrinsics), None, true).is_err());
        let out = agent.act(&obs, None, Some(&history), true)?;
        assert_eq!(out.action.dims(), &[3, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_mse_adaptation_decreases_loss() -> Result<()> {
        let mut agent = PpoAdaptive::build(
            config(AdaptationLoss::Mse).phase(AdaptationPhase::Adaptation),
            spec(),
        )?;
        let batch = batch(2, 3)?;
        let first = agent.train_op(&batch)?.get_scalar("drone/adapt_mse")?;
        let mut last = first;
        for _ in 0..100 {
            last = agent.train_op(&batch)?.get_scalar("drone/adapt_mse")?;
        }
        assert!(last < first, "{} >= {}", last, first);
        Ok(())
    }

    #[test]
    fn test_adversarial_losses() -> Result<()> {
        for loss in [AdaptationLoss::Gan, AdaptationLoss::LsGan] {
            let config = config(loss)
                .phase(AdaptationPhase::Adaptation)
                .target(AdaptationTarget::Intrinsics);
            let mut agent = PpoAdaptive::build(config, spec())?;
            let record = agent.train_op(&batch(2, 3)?)?;
            let accuracy = record.get_scalar("drone/discriminator_accuracy")?;
            assert!((0.0..=1.0).contains(&accuracy));
            assert!(record.get_scalar("drone/generator_loss")?.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_config_errors() {
        let no_history = AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 5])), 3)
            .intrinsics_dim(4);
        assert!(PpoAdaptive::build(config(AdaptationLoss::Mse), no_history).is_err());

        let short = spec().observation_history(5, WINDOW - 1);
        assert!(PpoAdaptive::build(config(AdaptationLoss::Mse), short).is_err());

        let no_intrinsics = AgentSpec::new("drone", 2, ObservationSpec::Vector(TensorSpec::new(&[2, 5])), 3)
            .observation_history(5, WINDOW);
        assert!(PpoAdaptive::build(config(AdaptationLoss::Mse), no_intrinsics).is_err());
    }
}
