use anyhow::Result;
use aviary_candle_agent::{
    actor::ActorConfig,
    attention::AttentionConfig,
    batch::{Observation, TransitionBatch},
    critic::{CriticConfig, CriticKind},
    encoder::EncoderConfig,
    ppo::{Ppo, PpoConfig},
};
use aviary_core::{Agent, AgentSpec, ObservationSpec, TensorSpec};
use candle_core::{DType, Device, Tensor};
use tempdir::TempDir;

const N_AGENTS: usize = 2;
const OBS_DIM: usize = 5;
const ACT_DIM: usize = 3;

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
}

fn config() -> PpoConfig {
    let encoder = EncoderConfig::default().hidden_units(vec![32]);
    PpoConfig::default()
        .actor_config(ActorConfig::default().encoder(encoder.clone()))
        .critic_config(CriticConfig::default().encoder(encoder))
        .num_minibatches(4)
        .ppo_epochs(2)
}

fn rollout(agent: &Ppo, n: usize, t: usize) -> Result<TransitionBatch> {
    let device = Device::Cpu;
    let obs = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?;
    let out = agent.act(&obs.clone().into(), None, None, false)?;
    let next_obs = Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?;
    // Reward for actions close to the origin.
    let reward = (out.action.detach().sqr()?.sum_keepdim(3)? * -1.0)?;
    let flags = Tensor::zeros((n, t, N_AGENTS), DType::F32, &device)?;
    Ok(TransitionBatch::new(
        obs.into(),
        next_obs.into(),
        out.action.detach(),
        out.log_prob.detach(),
        reward,
        flags.clone(),
        flags,
    ))
}

/// Rollout with random actions, for actors that cannot act on `[N, T]` at once.
fn random_rollout(n: usize, t: usize) -> Result<TransitionBatch> {
    let device = Device::Cpu;
    let flags = Tensor::zeros((n, t, N_AGENTS), DType::F32, &device)?;
    Ok(TransitionBatch::new(
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?.into(),
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, OBS_DIM), &device)?.into(),
        Tensor::randn(0f32, 0.5f32, (n, t, N_AGENTS, ACT_DIM), &device)?,
        Tensor::randn(-3f32, 0.1f32, (n, t, N_AGENTS), &device)?,
        Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, 1), &device)?,
        flags.clone(),
        flags,
    ))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

#[test]
fn test_ppo_iterations() -> Result<()> {
    init_logger();
    let mut agent = Ppo::build(config(), spec())?;
    for _ in 0..3 {
        let batch = rollout(&agent, 4, 8)?;
        let record = agent.train_op(&batch)?;
        for key in ["policy_loss", "value_loss", "entropy", "explained_var"] {
            assert!(record.get_scalar(&format!("drone/{}", key))?.is_finite());
        }
    }
    Ok(())
}

#[test]
fn test_recurrent_ppo() -> Result<()> {
    init_logger();
    let encoder = EncoderConfig::default().hidden_units(vec![16]);
    let config = config()
        .actor_config(ActorConfig::default().encoder(encoder).rnn(true))
        .seq_len(4);
    let mut agent = Ppo::build(config, spec())?;
    let hidden = agent.actor().hidden_dim().expect("recurrent actor");

    let (n, t) = (2, 8);
    let device = Device::Cpu;
    let is_init = Tensor::zeros((n, t), DType::F32, &device)?;
    let batch = random_rollout(n, t)?.recurrent(
        Tensor::zeros((n, t, N_AGENTS, hidden), DType::F32, &device)?,
        is_init,
    );
    let record = agent.train_op(&batch)?;
    assert!(record.get_scalar("drone/policy_loss")?.is_finite());
    Ok(())
}

#[test]
fn test_mappo_centralized_critic() -> Result<()> {
    init_logger();
    let spec = spec().state_spec(ObservationSpec::composite([
        ("drones", TensorSpec::new(&[N_AGENTS, 10])),
        ("payload", TensorSpec::new(&[6])),
    ]));
    let critic_config = CriticConfig::default()
        .kind(CriticKind::Centralized)
        .attention(AttentionConfig {
            embed_dim: 16,
            num_heads: 2,
            ff_dim: 16,
            num_layers: 1,
        });
    let mut agent = Ppo::build(config().critic_config(critic_config), spec)?;
    assert!(agent.critic().is_centralized());

    let (n, t) = (3, 4);
    let device = Device::Cpu;
    let state = || -> Result<Observation> {
        Ok(Observation::composite([
            ("drones", Tensor::randn(0f32, 1f32, (n, t, N_AGENTS, 10), &device)?),
            ("payload", Tensor::randn(0f32, 1f32, (n, t, 6), &device)?),
        ]))
    };
    let batch = rollout(&agent, n, t)?.state(state()?, state()?);
    let record = agent.train_op(&batch)?;
    assert!(record.get_scalar("drone/value_loss")?.is_finite());
    assert!(record.get_scalar("drone/critic_grad_norm")?.is_finite());
    Ok(())
}

#[test]
fn test_save_load_round_trip() -> Result<()> {
    init_logger();
    let tmp_dir = TempDir::new("ppo")?;
    let model_dir = tmp_dir.path();

    let mut agent = Ppo::build(config(), spec())?;
    let batch = rollout(&agent, 4, 8)?;
    agent.train_op(&batch)?;
    let paths = agent.save_params(model_dir)?;
    assert!(paths.iter().all(|p| p.exists()));

    let mut loaded = Ppo::build(config().seed(7), spec())?;
    loaded.load_params(model_dir)?;

    let obs: Observation = Tensor::randn(0f32, 1f32, (5, N_AGENTS, OBS_DIM), &Device::Cpu)?.into();
    let a1 = agent.act(&obs, None, None, true)?.action;
    let a2 = loaded.act(&obs, None, None, true)?.action;
    assert!(max_abs_diff(&a1, &a2)? < 1e-6);

    let v1 = agent.value(&obs, None, None)?;
    let v2 = loaded.value(&obs, None, None)?;
    assert!(max_abs_diff(&v1, &v2)? < 1e-6);
    assert_eq!(agent.value_norm().running_mean(), loaded.value_norm().running_mean());
    Ok(())
}

#[test]
fn test_snapshot_restore() -> Result<()> {
    init_logger();
    let mut agent = Ppo::build(config(), spec())?;
    let obs: Observation = Tensor::randn(0f32, 1f32, (5, N_AGENTS, OBS_DIM), &Device::Cpu)?.into();
    let snapshot = agent.snapshot()?;
    let before = agent.act(&obs, None, None, true)?.action;

    let batch = rollout(&agent, 4, 8)?;
    agent.train_op(&batch)?;
    assert!(max_abs_diff(&before, &agent.act(&obs, None, None, true)?.action)? > 0.0);

    agent.restore(&snapshot)?;
    assert!(max_abs_diff(&before, &agent.act(&obs, None, None, true)?.action)? < 1e-6);
    Ok(())
}
