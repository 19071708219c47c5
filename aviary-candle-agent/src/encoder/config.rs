use crate::{attention::AttentionConfig, Activation};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of the convolutional part of [`MixedEncoder`](super::MixedEncoder).
///
/// `channels`, `kernels` and `strides` describe one conv layer per entry.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct VisionConfig {
    pub channels: Vec<usize>,
    pub kernels: Vec<usize>,
    pub strides: Vec<usize>,
    pub out_dim: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            channels: vec![32, 64, 64],
            kernels: vec![8, 4, 3],
            strides: vec![4, 2, 1],
            out_dim: 256,
        }
    }
}

/// Configuration of [`Encoder`](super::Encoder).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct EncoderConfig {
    /// Hidden units of the vector encoder.
    pub hidden_units: Vec<usize>,

    /// Activation of hidden layers.
    #[serde(default = "default_activation")]
    pub activation: Activation,

    /// LayerNorm after hidden activations.
    #[serde(default = "default_layer_norm")]
    pub layer_norm: bool,

    /// Self-attention of the entity encoder.
    #[serde(default)]
    pub attention: AttentionConfig,

    /// Output width of the entity encoder. Defaults to the token width.
    #[serde(default)]
    pub entity_out_dim: Option<usize>,

    /// Convolutional encoder of a visual field.
    #[serde(default)]
    pub vision: VisionConfig,

    /// Hidden units of the MLP fusing visual and non-visual features.
    #[serde(default = "default_fusion_units")]
    pub fusion_units: Vec<usize>,
}

fn default_activation() -> Activation {
    Activation::LeakyReLU
}

fn default_layer_norm() -> bool {
    true
}

fn default_fusion_units() -> Vec<usize> {
    vec![256]
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_units: vec![256, 128],
            activation: default_activation(),
            layer_norm: default_layer_norm(),
            attention: AttentionConfig::default(),
            entity_out_dim: None,
            vision: VisionConfig::default(),
            fusion_units: default_fusion_units(),
        }
    }
}

impl EncoderConfig {
    /// Sets the hidden units of the vector encoder.
    pub fn hidden_units(mut self, v: Vec<usize>) -> Self {
        self.hidden_units = v;
        self
    }

    /// Sets the activation.
    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// Sets the attention configuration.
    pub fn attention(mut self, v: AttentionConfig) -> Self {
        self.attention = v;
        self
    }

    /// Sets the output width of the entity encoder.
    pub fn entity_out_dim(mut self, v: usize) -> Self {
        self.entity_out_dim = Some(v);
        self
    }

    /// Sets the vision configuration.
    pub fn vision(mut self, v: VisionConfig) -> Self {
        self.vision = v;
        self
    }

    /// Sets the hidden units of the fusion MLP.
    pub fn fusion_units(mut self, v: Vec<usize>) -> Self {
        self.fusion_units = v;
        self
    }

    /// Loads [`EncoderConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`EncoderConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
