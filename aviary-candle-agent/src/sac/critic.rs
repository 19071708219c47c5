//! Twin Q critics with target copies.
use crate::{
    model::SubModel2,
    opt::{Optimizer, OptimizerConfig},
    util::track_with_replace_substring,
};
use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`MultiCritic`].
pub struct MultiCriticConfig<Q> {
    /// The number of critic networks, at least 2.
    pub n_nets: usize,

    /// Configuration of critic networks. The input width is set from the
    /// agent spec at build time.
    pub q_config: Q,

    /// Configuration of the optimizer.
    pub opt_config: OptimizerConfig,
}

impl<Q> MultiCriticConfig<Q>
where
    Q: DeserializeOwned + Serialize,
{
    /// Sets the number of critic networks.
    pub fn n_nets(mut self, v: usize) -> Self {
        self.n_nets = v;
        self
    }

    /// Sets configurations for action-value function.
    pub fn q_config(mut self, v: Q) -> Self {
        self.q_config = v;
        self
    }

    /// Sets optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Constructs [`MultiCriticConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`MultiCriticConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Ensemble of independently initialized Q functions and their target copies.
///
/// Target networks live in their own [`VarMap`] and change only through
/// [`MultiCritic::soft_update`].
pub struct MultiCritic<Q>
where
    Q: SubModel2<Output = Tensor>,
{
    varmap: VarMap,
    varmap_tgt: VarMap,
    qs: Vec<Q>,
    qs_tgt: Vec<Q>,

    /// Shared by all critic networks.
    opt: Optimizer,
}

impl<Q> MultiCritic<Q>
where
    Q: SubModel2<Output = Tensor>,
    Q::Config: Clone,
{
    /// Constructs [`MultiCritic`]; targets start as exact copies.
    pub fn build(config: MultiCriticConfig<Q::Config>, device: &Device) -> Result<Self> {
        if config.n_nets < 2 {
            return Err(AviaryError::config(format!(
                "at least 2 critic networks are required, got {}",
                config.n_nets
            ))
            .into());
        }
        let (varmap, qs) = Self::build_critic_networks(&config.q_config, device, config.n_nets, "critic")?;
        let (varmap_tgt, qs_tgt) =
            Self::build_critic_networks(&config.q_config, device, config.n_nets, "critic_tgt")?;
        let opt = config.opt_config.build(varmap.all_vars())?;

        track_with_replace_substring(&varmap_tgt, &varmap, 1.0, ("critic", "critic_tgt"))?;

        Ok(Self {
            varmap,
            varmap_tgt,
            qs,
            qs_tgt,
            opt,
        })
    }

    fn build_critic_networks(
        q_config: &Q::Config,
        device: &Device,
        n_nets: usize,
        prefix: &str,
    ) -> Result<(VarMap, Vec<Q>)> {
        let varmap = VarMap::new();
        let qs = (0..n_nets)
            .map(|ix| {
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp(format!("{}{}", prefix, ix));
                Q::build(vb, q_config.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((varmap, qs))
    }
}

impl<Q> MultiCritic<Q>
where
    Q: SubModel2<Output = Tensor>,
{
    /// `target <- tau * source + (1 - tau) * target`, matched by name.
    pub fn soft_update(&mut self, tau: f64) -> Result<()> {
        track_with_replace_substring(&self.varmap_tgt, &self.varmap, tau, ("critic", "critic_tgt"))
    }

    fn eval(qs: &[Q], obs: &Q::Input1, act: &Q::Input2) -> Result<Vec<Tensor>> {
        qs.iter()
            .map(|q| Ok(q.forward(obs, act)?.squeeze(D::Minus1)?))
            .collect()
    }

    /// Action values of every critic, each `[batch_size]`.
    pub fn qvals(&self, obs: &Q::Input1, act: &Q::Input2) -> Result<Vec<Tensor>> {
        Self::eval(&self.qs, obs, act)
    }

    /// Minimum over critics, `[batch_size]`.
    pub fn qvals_min(&self, obs: &Q::Input1, act: &Q::Input2) -> Result<Tensor> {
        Ok(Tensor::stack(&self.qvals(obs, act)?, 0)?.min(0)?)
    }

    /// Minimum over target critics, `[batch_size]`.
    pub fn qvals_min_tgt(&self, obs: &Q::Input1, act: &Q::Input2) -> Result<Tensor> {
        Ok(Tensor::stack(&Self::eval(&self.qs_tgt, obs, act)?, 0)?.min(0)?)
    }

    pub fn n_nets(&self) -> usize {
        self.qs.len()
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_tgt(&self) -> &VarMap {
        &self.varmap_tgt
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.step(grads)
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.opt.backward_step(loss)
    }

    /// Saves critics and targets as `critic.pt` and `critic_tgt.pt` in `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let path_critic = path.as_ref().join("critic.pt");
        let path_critic_tgt = path.as_ref().join("critic_tgt.pt");
        self.varmap.save(&path_critic)?;
        self.varmap_tgt.save(&path_critic_tgt)?;
        info!("Save critics to {:?}", path_critic);
        Ok(vec![path_critic, path_critic_tgt])
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path_critic = path.as_ref().join("critic.pt");
        self.varmap.load(&path_critic)?;
        self.varmap_tgt.load(path.as_ref().join("critic_tgt.pt"))?;
        info!("Load critics from {:?}", path_critic);
        Ok(())
    }
}
