//! Action distributions of the policy head.
use crate::util::atanh;
use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

const LN_2PI: f64 = 1.8378770664093453;

/// Kind of action distribution.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum DistributionKind {
    /// Diagonal Gaussian.
    Normal,

    /// Diagonal Gaussian squashed by `tanh`.
    TanhNormal,
}

impl Default for DistributionKind {
    fn default() -> Self {
        Self::Normal
    }
}

/// Diagonal Gaussian over the last axis.
#[derive(Debug, Clone)]
pub struct DiagGaussian {
    mean: Tensor,
    log_std: Tensor,
}

impl DiagGaussian {
    /// `log_std` is broadcast to the shape of `mean`.
    pub fn new(mean: Tensor, log_std: Tensor) -> Result<Self> {
        let log_std = log_std.broadcast_as(mean.shape())?.contiguous()?;
        Ok(Self { mean, log_std })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn std(&self) -> Result<Tensor> {
        Ok(self.log_std.exp()?)
    }

    /// Log density summed over the last axis.
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let z = ((x - &self.mean)? / self.std()?)?;
        let logp = ((z.sqr()? * -0.5)? - &self.log_std)? - 0.5 * LN_2PI;
        Ok(logp?.sum(D::Minus1)?)
    }

    /// Entropy summed over the last axis.
    pub fn entropy(&self) -> Result<Tensor> {
        Ok(((&self.log_std + 0.5)? + 0.5 * LN_2PI)?.sum(D::Minus1)?)
    }

    /// Reparameterized sample.
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = self.mean.randn_like(0., 1.)?;
        Ok((&self.mean + (eps * self.std()?)?)?)
    }

    pub fn mode(&self) -> Tensor {
        self.mean.clone()
    }
}

/// Diagonal Gaussian followed by `tanh`, with actions in `(-1, 1)`.
#[derive(Debug, Clone)]
pub struct TanhGaussian {
    base: DiagGaussian,
    epsilon: f64,
}

impl TanhGaussian {
    pub fn new(base: DiagGaussian) -> Self {
        Self { base, epsilon: 1e-6 }
    }

    fn log_jacobian(&self, a: &Tensor) -> Result<Tensor> {
        Ok(((a.sqr()?.neg()? + 1.0)? + self.epsilon)?.log()?.sum(D::Minus1)?)
    }

    /// Log density of squashed actions.
    pub fn log_prob(&self, a: &Tensor) -> Result<Tensor> {
        let bound = 1.0 - self.epsilon;
        let u = atanh(&a.clamp(-bound, bound)?)?;
        Ok((self.base.log_prob(&u)? - self.log_jacobian(a)?)?)
    }

    /// Reparameterized sample and its log density, computed from the
    /// pre-squash sample.
    pub fn rsample_with_log_prob(&self) -> Result<(Tensor, Tensor)> {
        let u = self.base.rsample()?;
        let a = u.tanh()?;
        let logp = (self.base.log_prob(&u)? - self.log_jacobian(&a)?)?;
        Ok((a, logp))
    }

    /// Single-sample estimate, `-log p(a)` for a fresh sample.
    pub fn entropy(&self) -> Result<Tensor> {
        let (_, logp) = self.rsample_with_log_prob()?;
        Ok(logp.neg()?)
    }

    pub fn mode(&self) -> Result<Tensor> {
        Ok(self.base.mean.tanh()?)
    }
}

/// Distribution produced by the policy head.
#[derive(Debug, Clone)]
pub enum ActionDistribution {
    Normal(DiagGaussian),
    TanhNormal(TanhGaussian),
}

impl ActionDistribution {
    /// Builds a distribution of the given kind from its parameters.
    pub fn new(kind: DistributionKind, mean: Tensor, log_std: Tensor) -> Result<Self> {
        let base = DiagGaussian::new(mean, log_std)?;
        Ok(match kind {
            DistributionKind::Normal => Self::Normal(base),
            DistributionKind::TanhNormal => Self::TanhNormal(TanhGaussian::new(base)),
        })
    }

    pub fn log_prob(&self, a: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal(d) => d.log_prob(a),
            Self::TanhNormal(d) => d.log_prob(a),
        }
    }

    pub fn entropy(&self) -> Result<Tensor> {
        match self {
            Self::Normal(d) => d.entropy(),
            Self::TanhNormal(d) => d.entropy(),
        }
    }

    pub fn mode(&self) -> Result<Tensor> {
        match self {
            Self::Normal(d) => Ok(d.mode()),
            Self::TanhNormal(d) => d.mode(),
        }
    }

    /// Action and its log density. `deterministic` returns the mode.
    pub fn sample(&self, deterministic: bool) -> Result<(Tensor, Tensor)> {
        match (self, deterministic) {
            (Self::TanhNormal(d), false) => d.rsample_with_log_prob(),
            (Self::Normal(d), false) => {
                let a = d.rsample()?;
                let logp = d.log_prob(&a)?;
                Ok((a, logp))
            }
            (_, true) => {
                let a = self.mode()?;
                let logp = self.log_prob(&a)?;
                Ok((a, logp))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    fn scalars(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_standard_normal() -> Result<()> {
        let mean = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu)?;
        let log_std = Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu)?;
        let d = DiagGaussian::new(mean.clone(), log_std)?;

        let logp = scalars(&d.log_prob(&mean)?);
        let expected = -1.5 * LN_2PI as f32;
        assert!(logp.iter().all(|v| (v - expected).abs() < 1e-5));

        let ent = scalars(&d.entropy()?);
        let expected = 3.0 * (0.5 + 0.5 * LN_2PI as f32);
        assert!(ent.iter().all(|v| (v - expected).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn test_log_prob_shifted() -> Result<()> {
        // N(1, e^2) at x = 3: z = 2 / e.
        let mean = Tensor::new(&[[1f32]], &Device::Cpu)?;
        let log_std = Tensor::new(&[1f32], &Device::Cpu)?;
        let d = DiagGaussian::new(mean, log_std)?;
        let logp = scalars(&d.log_prob(&Tensor::new(&[[3f32]], &Device::Cpu)?)?)[0];
        let z = 2.0 / std::f32::consts::E;
        let expected = -0.5 * z * z - 1.0 - 0.5 * LN_2PI as f32;
        assert!((logp - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_tanh_sample_log_prob_consistent() -> Result<()> {
        let mean = Tensor::new(&[[0.3f32, -0.2], [0.1, 0.0]], &Device::Cpu)?;
        let log_std = Tensor::new(&[-1f32, -0.5], &Device::Cpu)?;
        let d = ActionDistribution::new(DistributionKind::TanhNormal, mean, log_std)?;
        let (a, logp) = d.sample(false)?;
        assert!(scalars(&a).iter().all(|v| v.abs() < 1.0));

        let logp2 = d.log_prob(&a)?;
        for (x, y) in scalars(&logp).iter().zip(scalars(&logp2).iter()) {
            assert!((x - y).abs() < 1e-3, "{} vs {}", x, y);
        }

        let (mode, _) = d.sample(true)?;
        let expected = [0.3f32.tanh(), (-0.2f32).tanh(), 0.1f32.tanh(), 0.0];
        for (x, y) in scalars(&mode).iter().zip(expected.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }
}
