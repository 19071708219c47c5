use crate::{
    encoder::{flatten_leading, restore_leading},
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    Activation,
};
use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::{Tensor, D};
use candle_nn::{
    conv::Conv1dConfig,
    conv1d,
    sequential::{seq, Sequential},
    Module, VarBuilder,
};
use serde::{Deserialize, Serialize};

/// Kernel and stride of the two temporal convolutions after the pointwise one.
const TEMPORAL_LAYERS: [(usize, usize); 2] = [(7, 2), (5, 2)];

/// Configuration of [`TConv`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct TConvConfig {
    /// Channels of every convolution.
    pub channels: usize,

    /// Hidden units of the MLP after the convolutions.
    pub hidden_units: Vec<usize>,
}

impl Default for TConvConfig {
    fn default() -> Self {
        Self {
            channels: 64,
            hidden_units: vec![256, 256],
        }
    }
}

impl TConvConfig {
    pub fn channels(mut self, v: usize) -> Self {
        self.channels = v;
        self
    }

    pub fn hidden_units(mut self, v: Vec<usize>) -> Self {
        self.hidden_units = v;
        self
    }
}

/// Temporal convolution over windows `[.., D, W]` of past observations.
///
/// A pointwise convolution is followed by two strided temporal ones, all with
/// ELU. The flattened result is concatenated with the latest frame and fed
/// through an MLP and an output layer.
pub struct TConv {
    convs: Sequential,
    mlp: Mlp,
    out_dim: usize,
}

impl TConv {
    /// Smallest window the convolutions accept.
    pub fn min_window() -> usize {
        TEMPORAL_LAYERS
            .iter()
            .rev()
            .fold(1, |len, (k, s)| (len - 1) * s + k)
    }

    pub fn build(vb: VarBuilder, obs_dim: usize, window: usize, out_dim: usize, config: &TConvConfig) -> Result<Self> {
        if window < Self::min_window() {
            return Err(AviaryError::config(format!(
                "observation history window {} is shorter than {}",
                window,
                Self::min_window()
            ))
            .into());
        }
        let c = config.channels;
        let mut convs = seq()
            .add(conv1d(obs_dim, c, 1, Default::default(), vb.pp("c0"))?)
            .add_fn(|xs| xs.elu(1.0));
        let mut len = window;
        for (i, &(k, s)) in TEMPORAL_LAYERS.iter().enumerate() {
            let cfg = Conv1dConfig {
                stride: s,
                ..Default::default()
            };
            convs = convs
                .add(conv1d(c, c, k, cfg, vb.pp(format!("c{}", i + 1)))?)
                .add_fn(|xs| xs.elu(1.0));
            len = (len - k) / s + 1;
        }
        let convs = convs.add_fn(|xs| xs.flatten_from(1));

        let mlp_config = MlpConfig::new(c * len + obs_dim, config.hidden_units.clone(), Some(out_dim))
            .activation(Activation::LeakyReLU)
            .layer_norm(true);
        let mlp = <Mlp as SubModel1>::build(vb.pp("mlp"), mlp_config)?;

        Ok(Self { convs, mlp, out_dim })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `[.., D, W]` to `[.., out_dim]`.
    pub fn forward(&self, window: &Tensor) -> Result<Tensor> {
        let (lead, x) = flatten_leading(window, 2)?;
        let w = x.dim(D::Minus1)?;
        let latest = x.narrow(2, w - 1, 1)?.squeeze(2)?;
        let h = self.convs.forward(&x.contiguous()?)?;
        let y = SubModel1::forward(&self.mlp, &Tensor::cat(&[&h, &latest], 1)?)?;
        restore_leading(&y, &lead)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_min_window() {
        assert_eq!(TConv::min_window(), 15);
    }

    #[test]
    fn test_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = TConvConfig::default().channels(8).hidden_units(vec![16]);
        let tconv = TConv::build(vb, 6, 32, 4, &config)?;
        let x = Tensor::randn(0f32, 1f32, (3, 5, 2, 6, 32), &Device::Cpu)?;
        assert_eq!(tconv.forward(&x)?.dims(), &[3, 5, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_short_window_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = TConv::build(vb, 6, 14, 4, &TConvConfig::default()).err().unwrap();
        assert!(matches!(err.downcast_ref::<AviaryError>(), Some(AviaryError::Config(_))));
    }
}
