//! Generalized advantage estimation.
use crate::util::ensure_same_shape;
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Generalized advantage estimation.
///
/// All inputs have the time axis at position 1, `[N, T, ..]`. The recursion
/// runs backward over time and is vectorized over every other axis:
///
/// ```text
/// not_done = 1 - done[t]
/// delta    = r[t] + gamma * v[t + 1] * not_done - v[t]
/// adv[t]   = delta + gamma * lmbda * not_done * (1 - term[t]) * adv[t + 1]
/// ret[t]   = adv[t] + v[t]
/// ```
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct GaeConfig {
    /// Discount factor.
    pub gamma: f64,

    /// Exponential weight of multi-step TD errors.
    pub lmbda: f64,
}

impl Default for GaeConfig {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            lmbda: 0.95,
        }
    }
}

impl GaeConfig {
    /// Sets the discount factor.
    pub fn gamma(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Sets lambda.
    pub fn lmbda(mut self, v: f64) -> Self {
        self.lmbda = v;
        self
    }

    /// Returns `(advantage, return)` given the value of the state after every step.
    ///
    /// `terminated` and `done` must broadcast to the shape of `value`; `reward`,
    /// `value` and `next_value` must share one shape.
    pub fn compute(
        &self,
        reward: &Tensor,
        terminated: &Tensor,
        done: &Tensor,
        value: &Tensor,
        next_value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        ensure_same_shape(("reward", reward), ("value", value))?;
        ensure_same_shape(("next_value", next_value), ("value", value))?;
        let n_steps = value.dim(1)?;

        let not_done = done.ones_like()?.sub(done)?;
        let not_term = terminated.ones_like()?.sub(terminated)?;

        let mut advs = Vec::with_capacity(n_steps);
        let mut adv_next = value.narrow(1, 0, 1)?.zeros_like()?;
        for t in (0..n_steps).rev() {
            let r = reward.narrow(1, t, 1)?;
            let v = value.narrow(1, t, 1)?;
            let v_next = next_value.narrow(1, t, 1)?;
            let nd = not_done.narrow(1, t, 1)?;
            let nt = not_term.narrow(1, t, 1)?;

            let delta = ((r + (v_next.broadcast_mul(&nd)? * self.gamma)?)? - v)?;
            let carry = (adv_next.broadcast_mul(&nd)?.broadcast_mul(&nt)?
                * (self.gamma * self.lmbda))?;
            let adv = (delta + carry)?;
            advs.push(adv.clone());
            adv_next = adv;
        }
        advs.reverse();

        let adv = Tensor::cat(&advs, 1)?;
        let ret = (&adv + value)?;
        Ok((adv, ret))
    }

    /// Like [`GaeConfig::compute`], with `next_value = [v[1..T], bootstrap]`.
    ///
    /// `bootstrap` is the value of the state after the last step, `[N, 1, ..]`.
    pub fn compute_with_bootstrap(
        &self,
        reward: &Tensor,
        terminated: &Tensor,
        done: &Tensor,
        value: &Tensor,
        bootstrap: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let n_steps = value.dim(1)?;
        let next_value = match n_steps {
            1 => bootstrap.clone(),
            _ => Tensor::cat(&[&value.narrow(1, 1, n_steps - 1)?, bootstrap], 1)?,
        };
        self.compute(reward, terminated, done, value, &next_value)
    }

    /// Loads [`GaeConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`GaeConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
