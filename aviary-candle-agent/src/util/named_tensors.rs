use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::{collections::HashMap, path::Path};

/// A detached copy of model parameters on the CPU, keyed by name.
///
/// Used as the parameter snapshot handed to external persistence.
#[derive(Clone, Debug, Default)]
pub struct NamedTensors {
    /// Parameters by name.
    pub named_tensors: HashMap<String, Tensor>,
}

impl NamedTensors {
    /// Copy data of [`VarMap`] to CPU.
    pub fn copy_from(vs: &VarMap) -> Result<Self> {
        Self::copy_from_with_prefix(vs, "")
    }

    /// Copy data of [`VarMap`] to CPU, prepending `prefix` to every name.
    pub fn copy_from_with_prefix(vs: &VarMap, prefix: &str) -> Result<Self> {
        let data = vs.data().lock().unwrap();
        let mut named_tensors = HashMap::new();
        for (k, v) in data.iter() {
            let t = v.as_tensor().detach().to_device(&Device::Cpu)?.copy()?;
            named_tensors.insert(format!("{}{}", prefix, k), t);
        }
        Ok(Self { named_tensors })
    }

    /// Moves all entries of `other` into `self`.
    pub fn extend(&mut self, other: NamedTensors) {
        self.named_tensors.extend(other.named_tensors);
    }

    /// Copy named tensors to [`VarMap`].
    ///
    /// Every variable of `vs` must have an entry named `prefix + name`.
    pub fn copy_to(&self, vs: &VarMap, prefix: &str) -> Result<()> {
        let data = vs.data().lock().unwrap();
        for (name, dest) in data.iter() {
            let key = format!("{}{}", prefix, name);
            let src = self.named_tensors.get(&key).ok_or_else(|| {
                AviaryError::config(format!("parameter {} is missing in the snapshot", key))
            })?;
            dest.set(&src.to_device(dest.device())?)?;
        }
        Ok(())
    }

    /// Writes the tensors as a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        candle_core::safetensors::save(&self.named_tensors, path)?;
        Ok(())
    }

    /// Reads tensors from a safetensors file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let named_tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        Ok(Self { named_tensors })
    }
}

#[cfg(test)]
mod test {
    use super::NamedTensors;
    use anyhow::Result;
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::{linear, VarBuilder, VarMap};

    #[test]
    fn test_named_tensors() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::new(&[[1f32, 2., 3.]], &device)?;

        let vs1 = VarMap::new();
        let model1 = linear(3, 2, VarBuilder::from_varmap(&vs1, DType::F32, &device).pp("layer1"))?;
        let vs2 = VarMap::new();
        let model2 = linear(3, 2, VarBuilder::from_varmap(&vs2, DType::F32, &device).pp("layer1"))?;

        let t1 = model1.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        let nt = NamedTensors::copy_from(&vs1)?;
        nt.copy_to(&vs2, "")?;
        let t3 = model2.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;

        assert_eq!(t1, t3);
        Ok(())
    }
}
