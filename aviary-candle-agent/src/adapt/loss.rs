use super::{TConv, TConvConfig};
use crate::{
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    opt::{Optimizer, OptimizerConfig},
    util::softplus,
    Activation,
};
use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Objective of the adaptation module.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum AdaptationLoss {
    /// Regression on the target.
    Mse,

    /// Adversarial, with a binary cross-entropy discriminator.
    Gan,

    /// Adversarial, with least-squares targets `1` (real) and `-1` (fake).
    LsGan,
}

impl Default for AdaptationLoss {
    fn default() -> Self {
        Self::Mse
    }
}

impl AdaptationLoss {
    pub fn is_adversarial(&self) -> bool {
        !matches!(self, Self::Mse)
    }

    /// Loss of the discriminator on logits of real and generated targets.
    pub fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mse => Ok(real.zeros_like()?.sum_all()?),
            Self::Gan => Ok((bce_with_logits(real, 1.0)? + bce_with_logits(fake, 0.0)?)?),
            Self::LsGan => {
                let real = (real - 1.0)?.sqr()?.mean_all()?;
                let fake = (fake + 1.0)?.sqr()?.mean_all()?;
                Ok((real + fake)?)
            }
        }
    }

    /// Loss of the generator on logits of generated targets.
    pub fn generator_loss(&self, fake: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mse => Ok(fake.zeros_like()?.sum_all()?),
            Self::Gan => bce_with_logits(fake, 1.0),
            Self::LsGan => Ok((fake - 1.0)?.sqr()?.mean_all()?),
        }
    }
}

/// Mean binary cross-entropy of logits against a constant label.
pub fn bce_with_logits(logits: &Tensor, label: f64) -> Result<Tensor> {
    Ok((softplus(logits)? - (logits * label)?)?.mean_all()?)
}

/// Share of real logits above zero and fake logits below zero.
pub fn discriminator_accuracy(real: &Tensor, fake: &Tensor) -> Result<f32> {
    let hits = (real.gt(0.0)?.to_dtype(DType::F32)?.sum_all()?
        + fake.le(0.0)?.to_dtype(DType::F32)?.sum_all()?)?
        .to_scalar::<f32>()?;
    Ok(hits / (real.elem_count() + fake.elem_count()) as f32)
}

/// Scores `(target, window)` pairs; high for targets of the context encoder.
pub struct Discriminator {
    varmap: VarMap,
    embed: TConv,
    head: Mlp,
    opt: Optimizer,
}

impl Discriminator {
    /// Width of the window embedding.
    const EMBED_DIM: usize = 128;

    pub fn build(
        tconv_config: &TConvConfig,
        opt_config: &OptimizerConfig,
        obs_dim: usize,
        window: usize,
        target_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("discriminator");
        let embed = TConv::build(vb.pp("embed"), obs_dim, window, Self::EMBED_DIM, tconv_config)?;
        let head_config = MlpConfig::new(
            target_dim + Self::EMBED_DIM,
            tconv_config.hidden_units.clone(),
            Some(1),
        )
        .activation(Activation::LeakyReLU)
        .layer_norm(true);
        let head = <Mlp as SubModel1>::build(vb.pp("head"), head_config)?;
        let opt = opt_config.build(varmap.all_vars())?;
        Ok(Self {
            varmap,
            embed,
            head,
            opt,
        })
    }

    /// Logits `[.., 1]` for `target: [.., T]` and `window: [.., D, W]`.
    pub fn forward(&self, target: &Tensor, window: &Tensor) -> Result<Tensor> {
        let embedding = self.embed.forward(window)?;
        SubModel1::forward(&self.head, &Tensor::cat(&[target, &embedding], D::Minus1)?)
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
        info!("Save discriminator parameters to {:?}", path);
        Ok(path)
    }

    /// Load variables from prefix + ".pt".
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<()> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.load(path.as_path())?;
        info!("Load discriminator parameters from {:?}", path);
        Ok(())
    }
}
