use anyhow::Result;
use aviary_candle_agent::{
    actor::ActorConfig,
    adapt::{AdaptationLoss, AdaptationPhase, AdaptationTarget, ContextEncoderConfig, PpoAdaptive, PpoAdaptiveConfig},
    batch::{Observation, TransitionBatch},
    critic::CriticConfig,
    encoder::EncoderConfig,
};
use aviary_core::{Agent, AgentSpec, ObservationSpec, TensorSpec};
use candle_core::{DType, Device, Tensor};
use tempdir::TempDir;

const N_AGENTS: usize = 2;
const OBS_DIM: usize = 5;
const ACT_DIM: usize = 3;
const INTRINSICS_DIM: usize = 4;
const WINDOW: usize = 16;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spec() -> AgentSpec {
    AgentSpec::new(
        "drone",
        N_AGENTS,
        ObservationSpec::Vector(TensorSpec::new(&[N_AGENTS, OBS_DIM])),
        ACT_DIM,
    )
    .intrinsics_dim(INTRINSICS_DIM)
    .observation_history(OBS_DIM, WINDOW)
}

fn config() -> PpoAdaptiveConfig {
    let encoder = EncoderConfig::default().hidden_units(vec![16]);
    let ppo = PpoAdaptiveConfig::default()
        .ppo
        .actor_config(ActorConfig::default().encoder(encoder.clone()))
        .critic_config(CriticConfig::default().encoder(encoder))
        .num_minibatches(2)
        .ppo_epochs(1);
    PpoAdaptiveConfig::default()
        .ppo(ppo)
        .context_encoder(ContextEncoderConfig {
            hidden_units: vec![8],
            ..Default::default()
        })
        .adaptation_epochs(2)
}

fn rollout(n: usize, t: usize) -> Result<TransitionBatch> {
    let device = Device::Cpu;
    let flags = Tensor::zeros((n, t, N_AGENTS), DType::F32, &device)?;
    let intrinsics = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, INTRINSICS_DIM), &device)?;
    Ok(TransitionBatch::new(
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?.into(),
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?.into(),
        Tensor::randn(0f32, 0.5f32, (n, t, N_AGENTS, ACT_DIM), &device)?,
        Tensor::randn(-3f32, 0.1f32, (n, t, N_AGENTS), &device)?,
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, 1), &device)?,
        flags.clone(),
        flags,
    )
    .intrinsics(intrinsics.clone(), intrinsics)
    .obs_history(Tensor::randn(
        0f32,
        1f32,
        (n, t, N_AGENTS, OBS_DIM, WINDOW),
        &device,
    )?))
}

#[test]
fn test_encoder_then_adaptation() -> Result<()> {
    init_logger();
    let mut agent = PpoAdaptive::build(config(), spec())?;
    assert_eq!(agent.phase(), AdaptationPhase::Encoder);

    let batch = rollout(2, 4)?;
    for _ in 0..2 {
        let record = agent.train_op(&batch)?;
        assert!(record.get_scalar("drone/policy_loss")?.is_finite());
        assert!(record.get_scalar("drone/context_grad_norm")?.is_finite());
    }

    agent.set_phase(AdaptationPhase::Adaptation);
    let record = agent.train_op(&batch)?;
    assert!(record.get_scalar("drone/adapt_loss")?.is_finite());

    let obs: Observation = Tensor::randn(0f32, 1f32, (3, N_AGENTS, OBS_DIM), &Device::Cpu)?.into();
    let history = Tensor::randn(0f32, 1f32, (3, N_AGENTS, OBS_DIM, WINDOW), &Device::Cpu)?;
    let out = agent.act(&obs, None, Some(&history), true)?;
    assert_eq!(out.action.dims(), &[3, N_AGENTS, ACT_DIM]);
    Ok(())
}

#[test]
fn test_intrinsics_target_and_lsgan() -> Result<()> {
    init_logger();
    let config = config()
        .target(AdaptationTarget::Intrinsics)
        .loss(AdaptationLoss::LsGan)
        .phase(AdaptationPhase::Adaptation);
    let mut agent = PpoAdaptive::build(config, spec())?;
    let record = agent.train_op(&rollout(2, 3)?)?;
    for key in ["adapt_loss", "adapt_mse", "discriminator_loss", "generator_loss"] {
        assert!(record.get_scalar(&format!("drone/{}", key))?.is_finite(), "{}", key);
    }
    Ok(())
}

#[test]
fn test_save_load_round_trip() -> Result<()> {
    init_logger();
    let tmp_dir = TempDir::new("ppo_adapt")?;
    let model_dir = tmp_dir.path();

    let mut agent = PpoAdaptive::build(config().loss(AdaptationLoss::Gan), spec())?;
    let batch = rollout(2, 4)?;
    agent.train_op(&batch)?;
    agent.set_phase(AdaptationPhase::Adaptation);
    agent.train_op(&batch)?;
    let paths = agent.save_params(model_dir)?;
    assert!(paths.iter().all(|p| p.exists()));

    let mut loaded = PpoAdaptive::build(config().loss(AdaptationLoss::Gan), spec())?;
    loaded.load_params(model_dir)?;
    loaded.set_phase(AdaptationPhase::Adaptation);

    let history = Tensor::randn(0f32, 1f32, (3, N_AGENTS, OBS_DIM, WINDOW), &Device::Cpu)?;
    let c1 = agent.context(None, Some(&history))?;
    let c2 = loaded.context(None, Some(&history))?;
    let diff = (c1 - c2)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}
