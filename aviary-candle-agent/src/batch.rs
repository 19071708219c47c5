//! Rollout batches handed over by the data collector.
//!
//! Tensors carry the leading axes `[N, T]` (environments, time), followed by
//! the agent axis where applicable.
use anyhow::{Context, Result};
use aviary_core::error::AviaryError;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

/// An observation, either a single tensor or named tensors.
#[derive(Clone, Debug)]
pub enum Observation {
    /// A single tensor.
    Vector(Tensor),

    /// Named tensors sharing their leading axes.
    Composite(BTreeMap<String, Tensor>),
}

impl From<Tensor> for Observation {
    fn from(t: Tensor) -> Self {
        Self::Vector(t)
    }
}

impl Observation {
    /// Composite observation from `(name, tensor)` pairs.
    pub fn composite<'a>(fields: impl IntoIterator<Item = (&'a str, Tensor)>) -> Self {
        Self::Composite(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Applies `f` to every tensor.
    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        match self {
            Self::Vector(t) => Ok(Self::Vector(f(t)?)),
            Self::Composite(fields) => {
                let mut out = BTreeMap::new();
                for (k, v) in fields.iter() {
                    out.insert(k.clone(), f(v)?);
                }
                Ok(Self::Composite(out))
            }
        }
    }

    /// The tensor of the named field. A vector observation answers to any name.
    pub fn field(&self, name: &str) -> Result<&Tensor> {
        match self {
            Self::Vector(t) => Ok(t),
            Self::Composite(fields) => fields
                .get(name)
                .with_context(|| format!("observation field {} is missing", name)),
        }
    }

    /// Any tensor of the observation, used to read the leading axes.
    pub fn first(&self) -> Result<&Tensor> {
        match self {
            Self::Vector(t) => Ok(t),
            Self::Composite(fields) => fields
                .values()
                .next()
                .context("composite observation has no fields"),
        }
    }

    /// Device of the tensors.
    pub fn device(&self) -> Result<Device> {
        Ok(self.first()?.device().clone())
    }

    /// Detached copy.
    pub fn detach(&self) -> Result<Self> {
        self.map(|t| Ok(t.detach()))
    }

    /// Narrows every tensor along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        self.map(|t| Ok(t.narrow(dim, start, len)?))
    }
}

/// Leading-axis manipulations shared by tensors and observations.
pub(crate) trait BatchAxes: Sized {
    /// `[N, T, ..]` to `[N * T, ..]` when `seq_len == 1`, otherwise to
    /// `[N * (T / seq_len), seq_len, ..]` after truncating `T` to a multiple of
    /// `seq_len`. Windows never cross environment boundaries.
    fn fold_time(&self, seq_len: usize) -> Result<Self>;

    /// Selects rows of the first axis.
    fn select(&self, ixs: &Tensor) -> Result<Self>;
}

impl BatchAxes for Tensor {
    fn fold_time(&self, seq_len: usize) -> Result<Self> {
        let dims = self.dims();
        let (n, t) = (dims[0], dims[1]);
        if seq_len <= 1 {
            return Ok(self.flatten(0, 1)?);
        }
        let t = t / seq_len * seq_len;
        let mut shape = vec![n * t / seq_len, seq_len];
        shape.extend_from_slice(&dims[2..]);
        Ok(self.narrow(1, 0, t)?.contiguous()?.reshape(shape)?)
    }

    fn select(&self, ixs: &Tensor) -> Result<Self> {
        Ok(self.index_select(ixs, 0)?)
    }
}

impl BatchAxes for Observation {
    fn fold_time(&self, seq_len: usize) -> Result<Self> {
        self.map(|t| t.fold_time(seq_len))
    }

    fn select(&self, ixs: &Tensor) -> Result<Self> {
        self.map(|t| t.select(ixs))
    }
}

impl<T: BatchAxes> BatchAxes for Option<T> {
    fn fold_time(&self, seq_len: usize) -> Result<Self> {
        self.as_ref().map(|t| t.fold_time(seq_len)).transpose()
    }

    fn select(&self, ixs: &Tensor) -> Result<Self> {
        self.as_ref().map(|t| t.select(ixs)).transpose()
    }
}

/// A rollout of `T` steps from `N` environments for one agent group of `A` agents.
///
/// Read-only for the trainer. Derived quantities (advantages, returns) live in
/// separate tensors for the duration of one training call.
#[derive(Clone, Debug)]
pub struct TransitionBatch {
    /// Observations, `[N, T, A, ..]`.
    pub obs: Observation,

    /// Observations after each step, `[N, T, A, ..]`. The last step provides
    /// the bootstrap value.
    pub next_obs: Observation,

    /// Joint state for a centralized critic, `[N, T, ..]`.
    pub state: Option<Observation>,

    /// Joint state after each step, `[N, T, ..]`.
    pub next_state: Option<Observation>,

    /// Actions, `[N, T, A, act_dim]`.
    pub action: Tensor,

    /// Log-probabilities of the actions at collection time, `[N, T, A]`.
    pub sample_log_prob: Tensor,

    /// Rewards per head, `[N, T, A, H]`.
    pub reward: Tensor,

    /// Termination flags, `[N, T, A]`. Bootstrapping stops across these.
    pub terminated: Tensor,

    /// Episode end flags for any reason, `[N, T, A]`.
    pub done: Tensor,

    /// Normalized critic outputs at collection time, `[N, T, A, H]`.
    pub state_value: Option<Tensor>,

    /// Sequence start markers, `[N, T]`.
    pub is_init: Option<Tensor>,

    /// Hidden state fed into each step, `[N, T, A, hidden]`.
    pub rnn_state: Option<Tensor>,

    /// Privileged parameters, `[N, T, A, I]`.
    pub intrinsics: Option<Tensor>,

    /// Privileged parameters after each step, `[N, T, A, I]`.
    pub next_intrinsics: Option<Tensor>,

    /// Windows of past observations, `[N, T, A, D, W]`.
    pub obs_history: Option<Tensor>,
}

impl TransitionBatch {
    /// Batch with the required fields.
    pub fn new(
        obs: Observation,
        next_obs: Observation,
        action: Tensor,
        sample_log_prob: Tensor,
        reward: Tensor,
        terminated: Tensor,
        done: Tensor,
    ) -> Self {
        Self {
            obs,
            next_obs,
            state: None,
            next_state: None,
            action,
            sample_log_prob,
            reward,
            terminated,
            done,
            state_value: None,
            is_init: None,
            rnn_state: None,
            intrinsics: None,
            next_intrinsics: None,
            obs_history: None,
        }
    }

    /// Sets the joint states.
    pub fn state(mut self, state: Observation, next_state: Observation) -> Self {
        self.state = Some(state);
        self.next_state = Some(next_state);
        self
    }

    /// Sets the critic outputs at collection time.
    pub fn state_value(mut self, v: Tensor) -> Self {
        self.state_value = Some(v);
        self
    }

    /// Sets recurrent states and sequence start markers.
    pub fn recurrent(mut self, rnn_state: Tensor, is_init: Tensor) -> Self {
        self.rnn_state = Some(rnn_state);
        self.is_init = Some(is_init);
        self
    }

    /// Sets privileged parameters.
    pub fn intrinsics(mut self, intrinsics: Tensor, next_intrinsics: Tensor) -> Self {
        self.intrinsics = Some(intrinsics);
        self.next_intrinsics = Some(next_intrinsics);
        self
    }

    /// Sets windows of past observations.
    pub fn obs_history(mut self, v: Tensor) -> Self {
        self.obs_history = Some(v);
        self
    }

    /// `(N, T)`.
    pub fn batch_dims(&self) -> Result<(usize, usize)> {
        let dims = self.reward.dims();
        if dims.len() != 4 {
            return Err(AviaryError::ShapeMismatch(format!(
                "reward must be [N, T, A, H], got {:?}",
                dims
            ))
            .into());
        }
        Ok((dims[0], dims[1]))
    }

    /// Checks the shapes of the required fields against `reward`.
    ///
    /// Per-agent scalars and actions must match exactly; observations and
    /// rewards only on their leading axes.
    pub fn check_shapes(&self, n_agents: usize, action_dim: usize) -> Result<()> {
        let (n, t) = self.batch_dims()?;
        let expect = |name: &str, t_: &Tensor, shape: &[usize]| -> Result<()> {
            if t_.dims().len() < shape.len() || &t_.dims()[..shape.len()] != shape {
                return Err(AviaryError::ShapeMismatch(format!(
                    "{} must start with {:?}, got {:?}",
                    name,
                    shape,
                    t_.dims()
                ))
                .into());
            }
            Ok(())
        };
        let expect_exact = |name: &str, t_: &Tensor, shape: &[usize]| -> Result<()> {
            if t_.dims() != shape {
                return Err(AviaryError::ShapeMismatch(format!(
                    "{} must be {:?}, got {:?}",
                    name,
                    shape,
                    t_.dims()
                ))
                .into());
            }
            Ok(())
        };
        expect("reward", &self.reward, &[n, t, n_agents])?;
        expect_exact("action", &self.action, &[n, t, n_agents, action_dim])?;
        expect_exact("sample_log_prob", &self.sample_log_prob, &[n, t, n_agents])?;
        expect_exact("terminated", &self.terminated, &[n, t, n_agents])?;
        expect_exact("done", &self.done, &[n, t, n_agents])?;
        expect("obs", self.obs.first()?, &[n, t, n_agents])?;
        if let Some(is_init) = &self.is_init {
            expect("is_init", is_init, &[n, t])?;
        }
        if let Some(v) = &self.state_value {
            expect("state_value", v, self.reward.dims())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_fold_time_keeps_windows() -> Result<()> {
        // [N=2, T=5, 1], values encode (env, step).
        let v: Vec<f32> = (0..2)
            .flat_map(|n| (0..5).map(move |t| (10 * n + t) as f32))
            .collect();
        let x = Tensor::from_vec(v, (2, 5, 1), &Device::Cpu)?;

        let flat = x.fold_time(1)?;
        assert_eq!(flat.dims(), &[10, 1]);

        let windows = x.fold_time(2)?;
        assert_eq!(windows.dims(), &[4, 2, 1]);
        let w = windows.squeeze(2)?.to_vec2::<f32>()?;
        assert_eq!(w, vec![vec![0., 1.], vec![2., 3.], vec![10., 11.], vec![12., 13.]]);
        Ok(())
    }

    fn batch(flag_shape: &[usize]) -> Result<TransitionBatch> {
        let device = Device::Cpu;
        let obs = Tensor::zeros((2, 3, 2, 5), DType::F32, &device)?;
        Ok(TransitionBatch::new(
            obs.clone().into(),
            obs.into(),
            Tensor::zeros((2, 3, 2, 4), DType::F32, &device)?,
            Tensor::zeros((2, 3, 2), DType::F32, &device)?,
            Tensor::zeros((2, 3, 2, 1), DType::F32, &device)?,
            Tensor::zeros(flag_shape, DType::F32, &device)?,
            Tensor::zeros((2, 3, 2), DType::F32, &device)?,
        ))
    }

    #[test]
    fn test_check_shapes_rejects_trailing_axes() -> Result<()> {
        batch(&[2, 3, 2])?.check_shapes(2, 4)?;

        let err = batch(&[2, 3, 2, 2])?.check_shapes(2, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AviaryError>(),
            Some(AviaryError::ShapeMismatch(_))
        ));
        assert!(batch(&[2, 3, 2])?.check_shapes(2, 3).is_err());
        Ok(())
    }
}
