use super::{flatten_leading, restore_leading, Encoder, EncoderConfig, VisionConfig};
use crate::{
    batch::Observation,
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
};
use anyhow::Result;
use aviary_core::{error::AviaryError, TensorSpec};
use candle_core::{Tensor, D};
use candle_nn::{
    conv::Conv2dConfig,
    conv2d, linear,
    sequential::{seq, Sequential},
    Module, VarBuilder,
};

/// Convolutional encoder of `[.., C, H, W]` images.
pub struct VisionEncoder {
    seq: Sequential,
    out_dim: usize,
}

impl VisionEncoder {
    fn stride(s: usize) -> Conv2dConfig {
        Conv2dConfig {
            stride: s,
            ..Default::default()
        }
    }

    /// `spec` is `[A, C, H, W]`.
    pub fn build(vb: VarBuilder, name: &str, spec: &TensorSpec, config: &VisionConfig) -> Result<Self> {
        let (c, mut h, mut w) = match spec.shape.as_slice() {
            [_, c, h, w] => (*c, *h, *w),
            shape => {
                return Err(AviaryError::config(format!(
                    "visual field {} must be [A, C, H, W], got {:?}",
                    name, shape
                ))
                .into())
            }
        };
        if config.kernels.len() != config.channels.len() || config.strides.len() != config.channels.len()
        {
            return Err(AviaryError::config("channels, kernels and strides must have the same length").into());
        }

        let mut net = seq();
        let mut in_channels = c;
        let layers = config.channels.iter().zip(config.kernels.iter()).zip(config.strides.iter());
        for (i, ((&out_channels, &k), &s)) in layers.enumerate() {
            if k > h || k > w || s == 0 {
                return Err(AviaryError::config(format!(
                    "conv layer {} (kernel {}, stride {}) does not fit a {}x{} input of {}",
                    i, k, s, h, w, name
                ))
                .into());
            }
            net = net
                .add(conv2d(in_channels, out_channels, k, Self::stride(s), vb.pp(format!("c{}", i)))?)
                .add_fn(|xs| xs.relu());
            h = (h - k) / s + 1;
            w = (w - k) / s + 1;
            in_channels = out_channels;
        }
        let flat = in_channels * h * w;
        let net = net
            .add_fn(|xs| xs.flatten_from(1))
            .add(linear(flat, config.out_dim, vb.pp("out"))?)
            .add_fn(|xs| xs.relu());

        Ok(Self {
            seq: net,
            out_dim: config.out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `[.., C, H, W]` to `[.., out_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (lead, x) = flatten_leading(x, 3)?;
        let y = self.seq.forward(&x)?;
        restore_leading(&y, &lead)
    }
}

/// A visual field encoded by [`VisionEncoder`], fused with the encoding of
/// the remaining fields by an MLP.
pub struct MixedEncoder {
    vision_field: String,
    vision: VisionEncoder,
    state: Option<Box<Encoder>>,
    fusion: Mlp,
}

impl MixedEncoder {
    /// `state` encodes the non-visual fields, if any.
    pub fn build(
        vb: VarBuilder,
        vision_field: &str,
        vision_spec: &TensorSpec,
        state: Option<Box<Encoder>>,
        config: &EncoderConfig,
    ) -> Result<Self> {
        let vision = VisionEncoder::build(vb.pp("vision"), vision_field, vision_spec, &config.vision)?;
        let in_dim = vision.out_dim() + state.as_ref().map(|s| s.out_dim()).unwrap_or(0);
        let fusion_config = MlpConfig::new(in_dim, config.fusion_units.clone(), None)
            .activation(config.activation)
            .layer_norm(config.layer_norm);
        let fusion = <Mlp as SubModel1>::build(vb.pp("fusion"), fusion_config)?;

        Ok(Self {
            vision_field: vision_field.to_string(),
            vision,
            state,
            fusion,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.fusion.out_dim()
    }

    pub fn forward(&self, obs: &Observation) -> Result<Tensor> {
        let v = self.vision.forward(obs.field(&self.vision_field)?)?;
        let x = match &self.state {
            Some(state) => Tensor::cat(&[&state.forward(obs)?, &v], D::Minus1)?,
            None => v,
        };
        SubModel1::forward(&self.fusion, &x)
    }
}
