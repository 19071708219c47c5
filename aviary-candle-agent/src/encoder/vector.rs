use super::{flatten_leading, restore_leading, EncoderConfig};
use crate::{
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
};
use anyhow::Result;
use aviary_core::TensorSpec;
use candle_core::Tensor;
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder};

/// LayerNorm over the flattened field, then an MLP.
pub struct VectorEncoder {
    field: String,
    feature_rank: usize,
    in_dim: usize,
    norm: LayerNorm,
    mlp: Mlp,
}

impl VectorEncoder {
    /// `spec` includes the agent axis; the remaining axes are flattened.
    pub fn build(vb: VarBuilder, field: &str, spec: &TensorSpec, config: &EncoderConfig) -> Result<Self> {
        let feature_rank = spec.rank().saturating_sub(1);
        let in_dim = spec.shape.iter().skip(1).product::<usize>();
        let norm = layer_norm(in_dim, 1e-5, vb.pp("norm"))?;
        let mlp_config = MlpConfig::new(in_dim, config.hidden_units.clone(), None)
            .activation(config.activation)
            .layer_norm(config.layer_norm);
        let mlp = <Mlp as SubModel1>::build(vb.pp("mlp"), mlp_config)?;

        Ok(Self {
            field: field.to_string(),
            feature_rank,
            in_dim,
            norm,
            mlp,
        })
    }

    /// Name of the encoded field, empty for a vector observation.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn out_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    /// `[.., *feature]` to `[.., out_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (lead, x) = flatten_leading(x, self.feature_rank)?;
        let x = x.reshape((x.dim(0)?, self.in_dim))?;
        let y = SubModel1::forward(&self.mlp, &self.norm.forward(&x)?)?;
        restore_leading(&y, &lead)
    }
}
