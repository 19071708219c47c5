//! Entropy coefficient of SAC.
use crate::opt::{Optimizer, OptimizerConfig};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{init::Init, VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Mode of the entropy coefficient of SAC.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum EntCoefMode {
    /// Use a constant as alpha.
    Fix(f64),

    /// Automatic tuning, starting from alpha = 1.
    Auto {
        /// Target entropy; `-action_dim` if not given.
        target_entropy: Option<f64>,

        /// Learning rate of `log_alpha`.
        lr: f64,
    },
}

impl Default for EntCoefMode {
    fn default() -> Self {
        Self::Auto {
            target_entropy: None,
            lr: 3e-4,
        }
    }
}

/// The entropy coefficient of SAC.
pub struct EntCoef {
    varmap: VarMap,
    log_alpha: Tensor,
    target_entropy: Option<f64>,
    opt: Option<Optimizer>,
}

impl EntCoef {
    /// Constructs an instance of `EntCoef`. `action_dim` gives the default
    /// target entropy.
    pub fn new(mode: &EntCoefMode, action_dim: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (log_alpha, target_entropy, opt) = match mode {
            EntCoefMode::Fix(alpha) => {
                let log_alpha = vb.get_with_hints(1, "log_alpha", Init::Const(alpha.ln()))?;
                (log_alpha, None, None)
            }
            EntCoefMode::Auto { target_entropy, lr } => {
                let log_alpha = vb.get_with_hints(1, "log_alpha", Init::Const(0.0))?;
                let opt = OptimizerConfig::default()
                    .learning_rate(*lr)
                    .build(varmap.all_vars())?;
                let target_entropy = target_entropy.unwrap_or(-(action_dim as f64));
                (log_alpha, Some(target_entropy), Some(opt))
            }
        };

        Ok(Self {
            varmap,
            log_alpha,
            target_entropy,
            opt,
        })
    }

    /// Returns the entropy coefficient, `[1]`.
    pub fn alpha(&self) -> Result<Tensor> {
        Ok(self.log_alpha.detach().exp()?)
    }

    /// Returns the entropy coefficient as a scalar.
    pub fn alpha_scalar(&self) -> Result<f32> {
        Ok(self.alpha()?.to_vec1::<f32>()?[0])
    }

    /// Updates `log_alpha` given log-probabilities of sampled actions.
    ///
    /// Returns the temperature loss, `None` for a fixed coefficient.
    pub fn update(&mut self, logp: &Tensor) -> Result<Option<f32>> {
        let (target_entropy, opt) = match (self.target_entropy, self.opt.as_mut()) {
            (Some(t), Some(opt)) => (t, opt),
            _ => return Ok(None),
        };
        let loss = (self.log_alpha.broadcast_mul(&(logp.detach() + target_entropy)?)? * -1f64)?.mean_all()?;
        opt.backward_step(&loss)?;
        Ok(Some(loss.to_scalar::<f32>()?))
    }

    /// Save the parameter into a file.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.varmap.save(&path)?;
        info!("Save entropy coefficient to {:?}", path.as_ref());
        Ok(())
    }

    /// Load the parameter from a file.
    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.varmap.load(&path)?;
        info!("Load entropy coefficient from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fixed_alpha() -> Result<()> {
        let mut ent_coef = EntCoef::new(&EntCoefMode::Fix(0.2), 3, &Device::Cpu)?;
        let logp = Tensor::new(&[1f32, 2.], &Device::Cpu)?;
        assert!(ent_coef.update(&logp)?.is_none());
        assert!((ent_coef.alpha_scalar()? - 0.2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_alpha_decreases_when_entropy_is_above_target() -> Result<()> {
        let mode = EntCoefMode::Auto {
            target_entropy: None,
            lr: 1e-2,
        };
        let mut ent_coef = EntCoef::new(&mode, 2, &Device::Cpu)?;
        assert!((ent_coef.alpha_scalar()? - 1.0).abs() < 1e-6);

        // Entropy 5 is above the target -2, so alpha shrinks.
        let logp = Tensor::new(&[-5f32, -5.], &Device::Cpu)?;
        for _ in 0..10 {
            ent_coef.update(&logp)?;
        }
        assert!(ent_coef.alpha_scalar()? < 1.0);
        Ok(())
    }
}
