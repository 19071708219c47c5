use crate::{util::OutDim, Activation};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`Mlp`](super::Mlp).
///
/// Every hidden layer is `Linear -> activation -> (LayerNorm)`. If `out_dim`
/// is given, a final linear layer without activation follows.
pub struct MlpConfig {
    pub(super) in_dim: usize,
    pub(super) units: Vec<usize>,
    pub(super) out_dim: Option<usize>,
    pub(super) activation: Activation,
    pub(super) layer_norm: bool,
}

impl MlpConfig {
    /// Creates configuration of MLP.
    pub fn new(in_dim: usize, units: Vec<usize>, out_dim: Option<usize>) -> Self {
        Self {
            in_dim,
            units,
            out_dim,
            activation: Activation::LeakyReLU,
            layer_norm: true,
        }
    }

    /// Sets the activation of hidden layers.
    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// Enables layer normalization after every hidden activation.
    pub fn layer_norm(mut self, v: bool) -> Self {
        self.layer_norm = v;
        self
    }

    /// Sets the input width.
    pub fn in_dim(mut self, v: usize) -> Self {
        self.in_dim = v;
        self
    }

    /// Loads [`MlpConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`MlpConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

impl OutDim for MlpConfig {
    fn get_out_dim(&self) -> usize {
        match self.out_dim {
            Some(out_dim) => out_dim,
            None => self.units.last().copied().unwrap_or(self.in_dim),
        }
    }

    fn set_out_dim(&mut self, out_dim: usize) {
        self.out_dim = Some(out_dim);
    }
}
