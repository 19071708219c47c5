use crate::{
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    opt::{Optimizer, OptimizerConfig},
};
use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration of [`ContextEncoder`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ContextEncoderConfig {
    pub hidden_units: Vec<usize>,
    pub opt_config: OptimizerConfig,
}

impl Default for ContextEncoderConfig {
    fn default() -> Self {
        Self {
            hidden_units: vec![64, 64],
            opt_config: OptimizerConfig::default(),
        }
    }
}

/// Encodes privileged parameters into a context latent, LayerNorm then MLP.
pub struct ContextEncoder {
    varmap: VarMap,
    norm: LayerNorm,
    mlp: Mlp,
    opt: Optimizer,
}

impl ContextEncoder {
    pub fn build(config: &ContextEncoderConfig, in_dim: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("context_encoder");
        let norm = layer_norm(in_dim, 1e-5, vb.pp("norm"))?;
        let mlp = <Mlp as SubModel1>::build(
            vb.pp("mlp"),
            MlpConfig::new(in_dim, config.hidden_units.clone(), None),
        )?;
        let opt = config.opt_config.build(varmap.all_vars())?;
        Ok(Self {
            varmap,
            norm,
            mlp,
            opt,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    /// `[.., I]` to `[.., out_dim]`.
    pub fn forward(&self, intrinsics: &Tensor) -> Result<Tensor> {
        SubModel1::forward(&self.mlp, &self.norm.forward(intrinsics)?)
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
        info!("Save context encoder parameters to {:?}", path);
        Ok(path)
    }

    /// Load variables from prefix + ".pt".
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<()> {
        let mut path = PathBuf::from(prefix.as_ref());
        path.set_extension("pt");
        self.varmap.load(path.as_path())?;
        info!("Load context encoder parameters from {:?}", path);
        Ok(())
    }
}
