//! Running normalization of value targets.
//!
//! Statistics are kept per reward head (the last axis) and reduced over all
//! other axes. A training iteration must denormalize value estimates, compute
//! returns, [`ValueNormalizer::update`] with those returns and only then
//! normalize the targets; the statistics never see estimates produced with
//! themselves in the same pass.
use anyhow::{Context, Result};
use aviary_core::error::AviaryError;
use candle_core::{DType, Device, Tensor};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Interface of value normalizers.
///
/// Callers hold a `Box<dyn ValueNormalizer>` and never branch on the kind.
pub trait ValueNormalizer {
    /// Folds a batch of returns, `[.., H]`, into the running statistics.
    fn update(&mut self, x: &Tensor) -> Result<()>;

    /// `(x - mean) / sqrt(var + eps)`.
    fn normalize(&self, x: &Tensor) -> Result<Tensor>;

    /// `x * sqrt(var + eps) + mean`.
    fn denormalize(&self, x: &Tensor) -> Result<Tensor>;

    /// Current mean per head.
    fn running_mean(&self) -> Vec<f32>;

    /// Restores the initial statistics, zero mean and unit variance.
    fn reset(&mut self);

    /// Writes the statistics to a file.
    fn save(&self, path: &Path) -> Result<()>;

    /// Reads the statistics from a file.
    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Configuration of value normalization.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum ValueNormConfig {
    /// No normalization.
    Fake,

    /// Debiased exponential moving average of the first two moments.
    Ema {
        /// Decay of the moving average.
        beta: f64,
        /// Offset added to the variance.
        epsilon: f64,
    },

    /// Count-weighted running average over all updates.
    Cumulative {
        /// Offset added to the variance.
        epsilon: f64,
    },
}

impl Default for ValueNormConfig {
    fn default() -> Self {
        Self::Ema {
            beta: 0.995,
            epsilon: 1e-5,
        }
    }
}

impl ValueNormConfig {
    /// Builds a normalizer for `n_heads` reward heads.
    pub fn build(&self, n_heads: usize) -> Result<Box<dyn ValueNormalizer>> {
        match self {
            Self::Fake => Ok(Box::new(FakeValueNorm)),
            Self::Ema { beta, epsilon } => {
                if !(0.0..1.0).contains(beta) {
                    return Err(AviaryError::config(format!("beta must be in [0, 1), got {}", beta)).into());
                }
                Ok(Box::new(EmaValueNorm::new(n_heads, *beta, *epsilon)))
            }
            Self::Cumulative { epsilon } => Ok(Box::new(CumulativeValueNorm::new(n_heads, *epsilon))),
        }
    }

    /// Loads [`ValueNormConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`ValueNormConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Per-head mean and sample mean of squares of a batch.
fn batch_moments(x: &Tensor, n_heads: usize) -> Result<(Vec<f64>, Vec<f64>, usize)> {
    let h = x.dims().last().copied().unwrap_or(1);
    if h != n_heads {
        return Err(AviaryError::ShapeMismatch(format!(
            "value normalizer has {} heads, got a tensor of shape {:?}",
            n_heads,
            x.dims()
        ))
        .into());
    }
    let rows = x.elem_count() / h;
    let x = x.detach().to_dtype(DType::F64)?.reshape((rows, h))?;
    let mean = x.mean(0)?.to_vec1::<f64>()?;
    let mean_sq = x.sqr()?.mean(0)?.to_vec1::<f64>()?;
    Ok((mean, mean_sq, rows))
}

/// Broadcasts per-head `(mean, std)` against `x`.
fn stats_tensors(mean: &[f64], std: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)> {
    let to_tensor = |v: &[f64]| -> Result<Tensor> {
        Ok(Tensor::from_slice(v, (v.len(),), x.device())?.to_dtype(x.dtype())?)
    };
    Ok((to_tensor(mean)?, to_tensor(std)?))
}

fn apply_normalize(mean: &[f64], std: &[f64], x: &Tensor) -> Result<Tensor> {
    let (mean, std) = stats_tensors(mean, std, x)?;
    Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

fn apply_denormalize(mean: &[f64], std: &[f64], x: &Tensor) -> Result<Tensor> {
    let (mean, std) = stats_tensors(mean, std, x)?;
    Ok(x.broadcast_mul(&std)?.broadcast_add(&mean)?)
}

fn save_stats(path: &Path, stats: &[(&str, &[f64])]) -> Result<()> {
    let mut tensors = HashMap::new();
    for (name, v) in stats.iter() {
        tensors.insert(name.to_string(), Tensor::from_slice(v, (v.len(),), &Device::Cpu)?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    info!("Save value normalizer to {:?}", path);
    Ok(())
}

fn load_stats(path: &Path, names: &[&str]) -> Result<Vec<Vec<f64>>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let stats = names
        .iter()
        .map(|name| {
            let t = tensors
                .get(*name)
                .with_context(|| format!("{} is missing in {:?}", name, path))?;
            Ok(t.to_dtype(DType::F64)?.to_vec1::<f64>()?)
        })
        .collect::<Result<Vec<_>>>()?;
    info!("Load value normalizer from {:?}", path);
    Ok(stats)
}

/// Debiased exponential moving average of the first two moments.
///
/// The variance is floored at `1e-2`.
pub struct EmaValueNorm {
    beta: f64,
    epsilon: f64,
    running_mean: Vec<f64>,
    running_mean_sq: Vec<f64>,
    debiasing_term: f64,
}

impl EmaValueNorm {
    /// Normalizer for `n_heads` heads.
    pub fn new(n_heads: usize, beta: f64, epsilon: f64) -> Self {
        Self {
            beta,
            epsilon,
            running_mean: vec![0.; n_heads],
            running_mean_sq: vec![0.; n_heads],
            debiasing_term: 0.,
        }
    }

    /// Debiased `(mean, std)` per head.
    fn mean_std(&self) -> (Vec<f64>, Vec<f64>) {
        if self.debiasing_term == 0. {
            let n = self.running_mean.len();
            return (vec![0.; n], vec![(1. + self.epsilon).sqrt(); n]);
        }
        let debias = self.debiasing_term.max(self.epsilon);
        let mean: Vec<f64> = self.running_mean.iter().map(|m| m / debias).collect();
        let std = self
            .running_mean_sq
            .iter()
            .zip(mean.iter())
            .map(|(sq, m)| ((sq / debias - m * m).max(1e-2) + self.epsilon).sqrt())
            .collect();
        (mean, std)
    }
}

impl ValueNormalizer for EmaValueNorm {
    fn update(&mut self, x: &Tensor) -> Result<()> {
        let (mean, mean_sq, _) = batch_moments(x, self.running_mean.len())?;
        let beta = self.beta;
        for (r, b) in self.running_mean.iter_mut().zip(mean.iter()) {
            *r = beta * *r + (1. - beta) * b;
        }
        for (r, b) in self.running_mean_sq.iter_mut().zip(mean_sq.iter()) {
            *r = beta * *r + (1. - beta) * b;
        }
        self.debiasing_term = beta * self.debiasing_term + (1. - beta);
        Ok(())
    }

    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.mean_std();
        apply_normalize(&mean, &std, x)
    }

    fn denormalize(&self, x: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.mean_std();
        apply_denormalize(&mean, &std, x)
    }

    fn running_mean(&self) -> Vec<f32> {
        self.mean_std().0.iter().map(|v| *v as f32).collect()
    }

    fn reset(&mut self) {
        self.running_mean.iter_mut().for_each(|v| *v = 0.);
        self.running_mean_sq.iter_mut().for_each(|v| *v = 0.);
        self.debiasing_term = 0.;
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_stats(
            path,
            &[
                ("running_mean", self.running_mean.as_slice()),
                ("running_mean_sq", self.running_mean_sq.as_slice()),
                ("debiasing_term", &[self.debiasing_term][..]),
            ],
        )
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let mut stats = load_stats(path, &["running_mean", "running_mean_sq", "debiasing_term"])?;
        self.debiasing_term = stats[2].first().copied().unwrap_or(0.);
        self.running_mean_sq = stats.remove(1);
        self.running_mean = stats.remove(0);
        Ok(())
    }
}

/// Count-weighted running mean and variance, combined with the parallel
/// variance formula.
pub struct CumulativeValueNorm {
    epsilon: f64,
    mean: Vec<f64>,
    var: Vec<f64>,
    count: f64,
}

impl CumulativeValueNorm {
    /// Normalizer for `n_heads` heads.
    pub fn new(n_heads: usize, epsilon: f64) -> Self {
        Self {
            epsilon,
            mean: vec![0.; n_heads],
            var: vec![1.; n_heads],
            count: 1e-4,
        }
    }

    fn std(&self) -> Vec<f64> {
        self.var.iter().map(|v| (v + self.epsilon).sqrt()).collect()
    }
}

impl ValueNormalizer for CumulativeValueNorm {
    fn update(&mut self, x: &Tensor) -> Result<()> {
        let (b_mean, b_mean_sq, b_count) = batch_moments(x, self.mean.len())?;
        let b_count = b_count as f64;
        let tot = self.count + b_count;
        for h in 0..self.mean.len() {
            let b_var = (b_mean_sq[h] - b_mean[h] * b_mean[h]).max(0.);
            let delta = b_mean[h] - self.mean[h];
            let m2 = self.var[h] * self.count
                + b_var * b_count
                + delta * delta * self.count * b_count / tot;
            self.mean[h] += delta * b_count / tot;
            self.var[h] = m2 / tot;
        }
        self.count = tot;
        Ok(())
    }

    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        apply_normalize(&self.mean, &self.std(), x)
    }

    fn denormalize(&self, x: &Tensor) -> Result<Tensor> {
        apply_denormalize(&self.mean, &self.std(), x)
    }

    fn running_mean(&self) -> Vec<f32> {
        self.mean.iter().map(|v| *v as f32).collect()
    }

    fn reset(&mut self) {
        self.mean.iter_mut().for_each(|v| *v = 0.);
        self.var.iter_mut().for_each(|v| *v = 1.);
        self.count = 1e-4;
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_stats(
            path,
            &[
                ("mean", self.mean.as_slice()),
                ("var", self.var.as_slice()),
                ("count", &[self.count][..]),
            ],
        )
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let mut stats = load_stats(path, &["mean", "var", "count"])?;
        self.count = stats[2].first().copied().unwrap_or(1e-4);
        self.var = stats.remove(1);
        self.mean = stats.remove(0);
        Ok(())
    }
}

/// Pass-through normalizer.
pub struct FakeValueNorm;

impl ValueNormalizer for FakeValueNorm {
    fn update(&mut self, _x: &Tensor) -> Result<()> {
        Ok(())
    }

    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn denormalize(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn running_mean(&self) -> Vec<f32> {
        vec![]
    }

    fn reset(&mut self) {}

    fn save(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn load(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
