use super::MlpConfig;
use crate::{
    model::{SubModel1, SubModel2},
    util::{apply_flat, OutDim},
};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

/// Multilayer perceptron.
///
/// Accepts any number of leading batch axes.
pub struct Mlp {
    config: MlpConfig,
    layers: Vec<(Linear, Option<LayerNorm>)>,
    out: Option<Linear>,
}

impl Mlp {
    /// Output width.
    pub fn out_dim(&self) -> usize {
        self.config.get_out_dim()
    }

    fn forward_2d(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (ln, norm) in self.layers.iter() {
            xs = self.config.activation.forward(&ln.forward(&xs)?)?;
            if let Some(norm) = norm {
                xs = norm.forward(&xs)?;
            }
        }
        match &self.out {
            Some(out) => Ok(out.forward(&xs)?),
            None => Ok(xs),
        }
    }
}

impl SubModel1 for Mlp {
    type Config = MlpConfig;
    type Input = Tensor;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self> {
        let mut in_dim = config.in_dim;
        let mut layers = Vec::with_capacity(config.units.len());
        for (i, &units) in config.units.iter().enumerate() {
            let ln = linear(in_dim, units, vb.pp(format!("ln{}", i)))?;
            let norm = match config.layer_norm {
                true => Some(layer_norm(units, 1e-5, vb.pp(format!("norm{}", i)))?),
                false => None,
            };
            layers.push((ln, norm));
            in_dim = units;
        }
        let out = match config.out_dim {
            Some(out_dim) => Some(linear(in_dim, out_dim, vb.pp("out"))?),
            None => None,
        };

        Ok(Self {
            config,
            layers,
            out,
        })
    }

    fn forward(&self, xs: &Self::Input) -> Result<Tensor> {
        apply_flat(xs, |xs| self.forward_2d(xs))
    }
}

impl SubModel2 for Mlp {
    type Config = MlpConfig;
    type Input1 = Tensor;
    type Input2 = Tensor;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self> {
        <Self as SubModel1>::build(vb, config)
    }

    /// Concatenates the inputs on the last axis, e.g. observation and action
    /// of a Q-function.
    fn forward(&self, input1: &Self::Input1, input2: &Self::Input2) -> Result<Tensor> {
        let input = Tensor::cat(&[input1, input2], D::Minus1)?;
        apply_flat(&input, |xs| self.forward_2d(xs))
    }
}
