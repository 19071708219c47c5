use anyhow::Result;
use aviary_candle_agent::{
    actor::ActorConfig,
    batch::{Observation, TransitionBatch},
    encoder::EncoderConfig,
    mlp::MlpConfig,
    sac::{EntCoefMode, Sac, SacConfig},
};
use aviary_core::{replay_buffer::SimpleReplayBufferConfig, Agent, AgentSpec, ObservationSpec, TensorSpec};
use candle_core::{DType, Device, Tensor};
use tempdir::TempDir;

const N_AGENTS: usize = 3;
const OBS_DIM: usize = 4;
const ACT_DIM: usize = 2;

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
    .reward_heads(2)
}

fn config() -> SacConfig {
    let critic_config = SacConfig::default()
        .critic_config
        .q_config(MlpConfig::new(0, vec![32, 32], Some(1)));
    SacConfig::default()
        .actor_config(ActorConfig::default().encoder(EncoderConfig::default().hidden_units(vec![32])))
        .critic_config(critic_config)
        .replay_buffer_config(SimpleReplayBufferConfig::default().capacity(1000).seed(42))
        .ent_coef_mode(EntCoefMode::Auto {
            target_entropy: None,
            lr: 1e-3,
        })
        .reward_weights(vec![1.0, 0.5])
        .batch_size(16)
        .warmup(32)
        .gradient_steps(4)
        .actor_delay(2)
        .target_update_interval(2)
}

fn rollout(agent: &Sac, n: usize, t: usize) -> Result<TransitionBatch> {
    let device = Device::Cpu;
    let obs = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?;
    let out = agent.act(&obs.clone().into(), false)?;
    let next_obs = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?;
    let reward = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, 2), &device)?;
    let terminated = Tensor::zeros((n, t, N_AGENTS), DType::F32, &device)?;
    let done = Tensor::ones((n, t, N_AGENTS), DType::F32, &device)?;
    Ok(TransitionBatch::new(
        obs.into(),
        next_obs.into(),
        out.action.detach(),
        out.log_prob.detach(),
        reward,
        terminated,
        done,
    ))
}

#[test]
fn test_warmup_then_training() -> Result<()> {
    init_logger();
    let mut agent = Sac::build(config(), spec())?;

    // 4 x 4 = 16 transitions per call.
    let record = agent.train_op(&rollout(&agent, 4, 4)?)?;
    assert!(record.is_empty());
    let record = agent.train_op(&rollout(&agent, 4, 4)?)?;
    assert_eq!(agent.buffer_len(), 32);
    for key in ["critic_loss", "q_taken", "actor_loss", "alpha", "alpha_loss"] {
        assert!(record.get_scalar(&format!("drone/{}", key))?.is_finite(), "{}", key);
    }

    let alpha0 = agent.ent_coef().alpha_scalar()?;
    for _ in 0..3 {
        agent.train_op(&rollout(&agent, 4, 4)?)?;
    }
    assert_ne!(agent.ent_coef().alpha_scalar()?, alpha0);
    Ok(())
}

#[test]
fn test_actions_are_bounded() -> Result<()> {
    init_logger();
    let agent = Sac::build(config(), spec())?;
    let obs: Observation = (Tensor::randn(0f32, 1f32, (64, N_AGENTS, OBS_DIM), &Device::Cpu)? * 100.0)?.into();
    let action = agent.act(&obs, false)?.action;
    assert_eq!(action.dims(), &[64, N_AGENTS, ACT_DIM]);
    assert!(action.abs()?.max_all()?.to_scalar::<f32>()? <= 1.0);
    Ok(())
}

#[test]
fn test_save_load_round_trip() -> Result<()> {
    init_logger();
    let tmp_dir = TempDir::new("sac")?;
    let model_dir = tmp_dir.path();

    let mut agent = Sac::build(config(), spec())?;
    agent.train_op(&rollout(&agent, 4, 4)?)?;
    agent.train_op(&rollout(&agent, 4, 4)?)?;
    let paths = agent.save_params(model_dir)?;
    for name in ["actor.pt", "critic.pt", "critic_tgt.pt", "ent_coef.pt"] {
        assert!(paths.contains(&model_dir.join(name)), "{}", name);
    }

    let mut loaded = Sac::build(config(), spec())?;
    loaded.load_params(model_dir)?;
    let obs: Observation = Tensor::randn(0f32, 1f32, (5, N_AGENTS, OBS_DIM), &Device::Cpu)?.into();
    let a1 = agent.act(&obs, true)?.action;
    let a2 = loaded.act(&obs, true)?.action;
    let diff = (a1 - a2)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    assert_eq!(agent.ent_coef().alpha_scalar()?, loaded.ent_coef().alpha_scalar()?);
    Ok(())
}
