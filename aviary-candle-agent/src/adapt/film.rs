use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

/// How a context latent is combined with encoded features.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum ConditionMode {
    /// Concatenation on the feature axis.
    Cat,

    /// Feature-wise linear modulation, `elu(w * f + b) + f` with
    /// `(w, b) = Linear(context)`.
    Film,
}

impl Default for ConditionMode {
    fn default() -> Self {
        Self::Cat
    }
}

/// Applies a [`ConditionMode`].
pub enum Conditioner {
    Cat,
    Film(Linear),
}

impl Conditioner {
    pub fn build(vb: VarBuilder, mode: ConditionMode, feature_dim: usize, context_dim: usize) -> Result<Self> {
        Ok(match mode {
            ConditionMode::Cat => Self::Cat,
            ConditionMode::Film => Self::Film(linear(context_dim, 2 * feature_dim, vb.pp("film"))?),
        })
    }

    /// Width of the conditioned features.
    pub fn out_dim(&self, feature_dim: usize, context_dim: usize) -> usize {
        match self {
            Self::Cat => feature_dim + context_dim,
            Self::Film(_) => feature_dim,
        }
    }

    /// `features: [.., F]`, `context: [.., C]` with the same leading axes.
    pub fn forward(&self, features: &Tensor, context: &Tensor) -> Result<Tensor> {
        match self {
            Self::Cat => Ok(Tensor::cat(&[features, context], D::Minus1)?),
            Self::Film(ln) => {
                let wb = ln.forward(context)?.chunk(2, D::Minus1)?;
                let modulated = ((features * &wb[0])? + &wb[1])?.elu(1.0)?;
                Ok((modulated + features)?)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_condition_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let f = Tensor::randn(0f32, 1f32, (4, 2, 8), &Device::Cpu)?;
        let c = Tensor::randn(0f32, 1f32, (4, 2, 3), &Device::Cpu)?;

        let cat = Conditioner::build(vb.pp("cat"), ConditionMode::Cat, 8, 3)?;
        assert_eq!(cat.out_dim(8, 3), 11);
        assert_eq!(cat.forward(&f, &c)?.dims(), &[4, 2, 11]);

        let film = Conditioner::build(vb.pp("film"), ConditionMode::Film, 8, 3)?;
        assert_eq!(film.out_dim(8, 3), 8);
        assert_eq!(film.forward(&f, &c)?.dims(), &[4, 2, 8]);
        Ok(())
    }
}
