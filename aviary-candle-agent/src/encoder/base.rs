use super::{EncoderConfig, EntityEncoder, MixedEncoder, VectorEncoder};
use crate::batch::Observation;
use anyhow::Result;
use aviary_core::{error::AviaryError, ObservationSpec, TensorSpec};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use log::debug;

/// Observation encoder, selected from the observation spec at construction.
pub enum Encoder {
    /// A single non-visual field.
    Vector(VectorEncoder),

    /// Several non-visual fields as entity tokens.
    Entity(EntityEncoder),

    /// One visual field and optionally non-visual fields.
    Mixed(MixedEncoder),
}

impl Encoder {
    /// Builds the encoder. Fails with [`AviaryError::Config`] for more than one
    /// visual field or for visual fields other than `[A, C, H, W]`.
    pub fn build(vb: VarBuilder, spec: &ObservationSpec, config: &EncoderConfig) -> Result<Self> {
        let encoder = match spec {
            ObservationSpec::Vector(s) => Self::Vector(VectorEncoder::build(vb.pp("vector"), "", s, config)?),
            ObservationSpec::Composite(_) => {
                let (state, visual) = spec.partition_visual();
                if visual.len() > 1 {
                    return Err(AviaryError::config(format!(
                        "at most one visual field is supported, got {:?}",
                        visual.iter().map(|(k, _)| *k).collect::<Vec<_>>()
                    ))
                    .into());
                }
                let state = Self::build_state(vb.clone(), &state, config)?;
                match visual.first() {
                    None => state.ok_or_else(|| AviaryError::config("composite observation spec has no fields"))?,
                    Some((name, s)) => Self::Mixed(MixedEncoder::build(
                        vb.pp("mixed"),
                        name,
                        s,
                        state.map(Box::new),
                        config,
                    )?),
                }
            }
        };
        debug!("built {} encoder with out_dim {}", encoder.kind(), encoder.out_dim());
        Ok(encoder)
    }

    fn build_state(vb: VarBuilder, fields: &[(&str, &TensorSpec)], config: &EncoderConfig) -> Result<Option<Self>> {
        let encoder = match fields {
            [] => None,
            [(name, s)] => Some(Self::Vector(VectorEncoder::build(vb.pp("vector"), name, s, config)?)),
            _ => Some(Self::Entity(EntityEncoder::build(vb.pp("entity"), fields, config)?)),
        };
        Ok(encoder)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Entity(_) => "entity",
            Self::Mixed(_) => "mixed",
        }
    }

    /// Width of the encoded features.
    pub fn out_dim(&self) -> usize {
        match self {
            Self::Vector(e) => e.out_dim(),
            Self::Entity(e) => e.out_dim(),
            Self::Mixed(e) => e.out_dim(),
        }
    }

    /// Encodes `[.., A, *field]` tensors to `[.., A, out_dim]`.
    pub fn forward(&self, obs: &Observation) -> Result<Tensor> {
        match self {
            Self::Vector(e) => e.forward(obs.field(e.field())?),
            Self::Entity(e) => {
                let inputs = e.fields().map(|f| obs.field(f)).collect::<Result<Vec<_>>>()?;
                e.forward(&inputs)
            }
            Self::Mixed(e) => e.forward(obs),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{attention::AttentionConfig, encoder::VisionConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> EncoderConfig {
        EncoderConfig::default()
            .hidden_units(vec![32, 16])
            .attention(AttentionConfig {
                embed_dim: 16,
                num_heads: 2,
                ff_dim: 16,
                num_layers: 1,
            })
            .vision(VisionConfig {
                channels: vec![4, 8],
                kernels: vec![4, 3],
                strides: vec![2, 2],
                out_dim: 24,
            })
            .fusion_units(vec![20])
    }

    fn build(spec: &ObservationSpec) -> Result<Encoder> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Encoder::build(vb, spec, &small_config())
    }

    fn randn(shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::randn(0f32, 1f32, shape, &Device::Cpu)?)
    }

    fn is_config_error(e: &anyhow::Error) -> bool {
        matches!(e.downcast_ref::<AviaryError>(), Some(AviaryError::Config(_)))
    }

    #[test]
    fn test_vector_spec() -> Result<()> {
        let encoder = build(&ObservationSpec::Vector(TensorSpec::new(&[3, 9])))?;
        assert!(matches!(encoder, Encoder::Vector(_)));
        let y = encoder.forward(&randn(&[4, 5, 3, 9])?.into())?;
        assert_eq!(y.dims(), &[4, 5, 3, 16]);
        Ok(())
    }

    #[test]
    fn test_single_field_composite_uses_vector_path() -> Result<()> {
        let spec = ObservationSpec::composite([("state", TensorSpec::new(&[2, 7]))]);
        let encoder = build(&spec)?;
        assert!(matches!(encoder, Encoder::Vector(_)));
        let obs = Observation::composite([("state", randn(&[6, 2, 7])?)]);
        assert_eq!(encoder.forward(&obs)?.dims(), &[6, 2, 16]);
        Ok(())
    }

    #[test]
    fn test_entity_spec() -> Result<()> {
        let spec = ObservationSpec::composite([
            ("state", TensorSpec::new(&[2, 7])),
            ("others", TensorSpec::new(&[2, 1, 10])),
            ("obstacles", TensorSpec::new(&[2, 5, 3])),
        ]);
        let encoder = build(&spec)?;
        assert!(matches!(encoder, Encoder::Entity(_)));
        assert_eq!(encoder.out_dim(), 16);
        let obs = Observation::composite([
            ("state", randn(&[4, 3, 2, 7])?),
            ("others", randn(&[4, 3, 2, 1, 10])?),
            ("obstacles", randn(&[4, 3, 2, 5, 3])?),
        ]);
        assert_eq!(encoder.forward(&obs)?.dims(), &[4, 3, 2, 16]);
        Ok(())
    }

    #[test]
    fn test_mixed_spec() -> Result<()> {
        let spec = ObservationSpec::composite([
            ("state", TensorSpec::new(&[2, 7])),
            ("depth", TensorSpec::new(&[2, 1, 16, 16])),
        ]);
        let encoder = build(&spec)?;
        assert!(matches!(encoder, Encoder::Mixed(_)));
        let obs = Observation::composite([
            ("state", randn(&[3, 2, 7])?),
            ("depth", randn(&[3, 2, 1, 16, 16])?),
        ]);
        assert_eq!(encoder.forward(&obs)?.dims(), &[3, 2, 20]);

        // Vision only.
        let spec = ObservationSpec::composite([("depth", TensorSpec::new(&[2, 1, 16, 16]))]);
        let encoder = build(&spec)?;
        let obs = Observation::composite([("depth", randn(&[3, 2, 1, 16, 16])?)]);
        assert_eq!(encoder.forward(&obs)?.dims(), &[3, 2, 20]);
        Ok(())
    }

    #[test]
    fn test_config_errors() {
        let two_cameras = ObservationSpec::composite([
            ("depth", TensorSpec::new(&[2, 1, 16, 16])),
            ("rgb", TensorSpec::new(&[2, 3, 16, 16])),
        ]);
        assert!(build(&two_cameras).err().map_or(false, |e| is_config_error(&e)));

        let video = ObservationSpec::composite([("video", TensorSpec::new(&[2, 4, 1, 16, 16]))]);
        assert!(build(&video).err().map_or(false, |e| is_config_error(&e)));

        let too_small = ObservationSpec::composite([("depth", TensorSpec::new(&[2, 1, 3, 3]))]);
        assert!(build(&too_small).err().map_or(false, |e| is_config_error(&e)));

        let empty = ObservationSpec::Composite(Default::default());
        assert!(build(&empty).err().map_or(false, |e| is_config_error(&e)));
    }
}
