use super::{flatten_leading, restore_leading, EncoderConfig};
use crate::attention::{EntityTransformer, TokenGroup};
use anyhow::Result;
use aviary_core::{error::AviaryError, TensorSpec};
use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Token layout of one field: feature rank after the agent axis, and the
/// `[tokens, dim]` view used for embedding.
#[derive(Debug, Clone)]
pub(crate) struct FieldLayout {
    pub(crate) name: String,
    feature_rank: usize,
    tokens: usize,
    dim: usize,
}

impl FieldLayout {
    /// `shape` excludes leading batch and agent axes: `[]`, `[D]` or `[K, D]`.
    pub(crate) fn from_feature_shape(name: &str, shape: &[usize]) -> Result<Self> {
        let (tokens, dim) = match shape {
            [] => (1, 1),
            [d] => (1, *d),
            [k, d] => (*k, *d),
            _ => {
                return Err(AviaryError::config(format!(
                    "field {} of shape {:?} cannot be split into tokens",
                    name, shape
                ))
                .into())
            }
        };
        Ok(Self {
            name: name.to_string(),
            feature_rank: shape.len(),
            tokens,
            dim,
        })
    }

    pub(crate) fn group(&self) -> TokenGroup {
        TokenGroup {
            name: self.name.clone(),
            tokens: self.tokens,
            dim: self.dim,
        }
    }

    /// `[.., *feature]` to `([..], [rows, tokens, dim])`.
    pub(crate) fn tokens(&self, x: &Tensor) -> Result<(Vec<usize>, Tensor)> {
        let (lead, x) = flatten_leading(x, self.feature_rank)?;
        let rows = x.dim(0)?;
        Ok((lead, x.reshape((rows, self.tokens, self.dim))?))
    }
}

/// Splits the fields into tokens, embeds them, applies self-attention and
/// mean-pools the tokens.
pub struct EntityEncoder {
    layouts: Vec<FieldLayout>,
    transformer: EntityTransformer,
    out: Linear,
    out_dim: usize,
}

impl EntityEncoder {
    /// `fields` are per-agent specs including the agent axis.
    pub fn build(vb: VarBuilder, fields: &[(&str, &TensorSpec)], config: &EncoderConfig) -> Result<Self> {
        let layouts = fields
            .iter()
            .map(|(name, spec)| {
                FieldLayout::from_feature_shape(name, spec.shape.get(1..).unwrap_or(&[]))
            })
            .collect::<Result<Vec<_>>>()?;
        let groups = layouts.iter().map(|l| l.group()).collect();
        let transformer = EntityTransformer::build(vb.pp("transformer"), groups, &config.attention)?;
        let embed_dim = transformer.embed_dim();
        let out_dim = config.entity_out_dim.unwrap_or(embed_dim);
        let out = linear(embed_dim, out_dim, vb.pp("out"))?;
        Ok(Self {
            layouts,
            transformer,
            out,
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Names of the encoded fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.layouts.iter().map(|l| l.name.as_str())
    }

    /// `inputs[i]` belongs to the i-th field; returns `[.., out_dim]`.
    pub fn forward(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let mut lead = None;
        let mut tokens = Vec::with_capacity(inputs.len());
        for (layout, x) in self.layouts.iter().zip(inputs.iter()) {
            let (l, t) = layout.tokens(x)?;
            match &lead {
                None => lead = Some(l),
                Some(prev) if *prev != l => {
                    return Err(AviaryError::ShapeMismatch(format!(
                        "field {} has leading axes {:?}, expected {:?}",
                        layout.name, l, prev
                    ))
                    .into())
                }
                _ => {}
            }
            tokens.push(t);
        }
        let lead = lead.unwrap_or_default();
        let h = self.transformer.forward(&tokens)?.mean(1)?;
        restore_leading(&self.out.forward(&h)?, &lead)
    }
}
