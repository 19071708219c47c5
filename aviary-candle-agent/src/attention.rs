//! Self-attention over entity tokens.
//!
//! Used by the entity encoder of composite observations and by the
//! centralized critic, where every agent (or every entity of the joint
//! state) is one token.
use anyhow::{ensure, Result};
use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, ops::softmax, LayerNorm, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

/// Configuration of [`EntityTransformer`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct AttentionConfig {
    /// Token width.
    pub embed_dim: usize,

    /// Number of attention heads; must divide `embed_dim`.
    pub num_heads: usize,

    /// Hidden width of the feed-forward block.
    pub ff_dim: usize,

    /// Number of encoder layers.
    pub num_layers: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            embed_dim: 128,
            num_heads: 1,
            ff_dim: 128,
            num_layers: 1,
        }
    }
}

/// Multi-head self-attention on `[batch, tokens, embed_dim]`.
pub struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    /// Builds the projections.
    pub fn build(vb: VarBuilder, embed_dim: usize, num_heads: usize) -> Result<Self> {
        ensure!(
            num_heads > 0 && embed_dim % num_heads == 0,
            "embed_dim ({}) must be divisible by num_heads ({})",
            embed_dim,
            num_heads
        );
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            o_proj: linear(embed_dim, embed_dim, vb.pp("o_proj"))?,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// Attends every token to every token, no mask.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (m, k, e) = x.dims3()?;
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((m, k, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(x)?)?;
        let key = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scores = (q.matmul(&key.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let attn = softmax(&scores, D::Minus1)?;
        let y = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((m, k, e))?;
        Ok(self.o_proj.forward(&y)?)
    }
}

/// Post-norm transformer encoder layer with ReLU feed-forward block.
struct EncoderLayer {
    attn: SelfAttention,
    norm1: LayerNorm,
    ff1: Linear,
    ff2: Linear,
    norm2: LayerNorm,
}

impl EncoderLayer {
    fn build(vb: VarBuilder, config: &AttentionConfig) -> Result<Self> {
        let e = config.embed_dim;
        Ok(Self {
            attn: SelfAttention::build(vb.pp("attn"), e, config.num_heads)?,
            norm1: layer_norm(e, 1e-5, vb.pp("norm1"))?,
            ff1: linear(e, config.ff_dim, vb.pp("ff1"))?,
            ff2: linear(config.ff_dim, e, vb.pp("ff2"))?,
            norm2: layer_norm(e, 1e-5, vb.pp("norm2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.norm1.forward(&(x + self.attn.forward(x)?)?)?;
        let ff = self.ff2.forward(&self.ff1.forward(&x)?.relu()?)?;
        Ok(self.norm2.forward(&(x + ff)?)?)
    }
}

/// One group of tokens: `tokens` rows of width `dim` each.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGroup {
    /// Field name, used as parameter prefix.
    pub name: String,

    /// Number of tokens contributed by the field.
    pub tokens: usize,

    /// Width of each token before embedding.
    pub dim: usize,
}

/// Embeds groups of tokens with per-group linear maps, adds a learned
/// embedding of the token position and applies transformer layers.
///
/// Token positions are fixed by the group order, so the output at position
/// `i` always belongs to the same entity.
pub struct EntityTransformer {
    embeddings: Vec<(TokenGroup, Linear)>,
    position: Tensor,
    layers: Vec<EncoderLayer>,
    embed_dim: usize,
}

impl EntityTransformer {
    /// Builds the transformer for the given token groups.
    pub fn build(vb: VarBuilder, groups: Vec<TokenGroup>, config: &AttentionConfig) -> Result<Self> {
        ensure!(!groups.is_empty(), "at least one token group is required");
        let e = config.embed_dim;
        let n_tokens = groups.iter().map(|g| g.tokens).sum::<usize>();
        let embeddings = groups
            .into_iter()
            .map(|g| {
                let ln = linear(g.dim, e, vb.pp(format!("embed_{}", g.name)))?;
                Ok((g, ln))
            })
            .collect::<Result<Vec<_>>>()?;
        let position = vb.get_with_hints(
            (n_tokens, e),
            "position",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        )?;
        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::build(vb.pp(format!("layer{}", i)), config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embeddings,
            position,
            layers,
            embed_dim: e,
        })
    }

    /// Total number of tokens.
    pub fn n_tokens(&self) -> usize {
        self.position.dims()[0]
    }

    /// Token width.
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// `inputs[g]` is `[M, tokens_g, dim_g]`; returns `[M, n_tokens, embed_dim]`.
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        ensure!(
            inputs.len() == self.embeddings.len(),
            "expected {} token groups, got {}",
            self.embeddings.len(),
            inputs.len()
        );
        let tokens = self
            .embeddings
            .iter()
            .zip(inputs.iter())
            .map(|((_, ln), x)| Ok(ln.forward(x)?))
            .collect::<Result<Vec<_>>>()?;
        let mut x = Tensor::cat(&tokens, 1)?.broadcast_add(&self.position)?;
        for layer in self.layers.iter() {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_entity_transformer_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let groups = vec![
            TokenGroup {
                name: "drones".to_string(),
                tokens: 3,
                dim: 7,
            },
            TokenGroup {
                name: "payload".to_string(),
                tokens: 1,
                dim: 4,
            },
        ];
        let config = AttentionConfig {
            embed_dim: 16,
            num_heads: 2,
            ff_dim: 32,
            num_layers: 2,
        };
        let tf = EntityTransformer::build(vb, groups, &config)?;
        let x1 = Tensor::randn(0f32, 1f32, (5, 3, 7), &Device::Cpu)?;
        let x2 = Tensor::randn(0f32, 1f32, (5, 1, 4), &Device::Cpu)?;
        let y = tf.forward(&[x1, x2])?;
        assert_eq!(y.dims(), &[5, 4, 16]);
        assert_eq!(tf.n_tokens(), 4);
        Ok(())
    }

    #[test]
    fn test_heads_must_divide_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(SelfAttention::build(vb, 10, 3).is_err());
    }
}
