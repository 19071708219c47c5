//! Utilities.
use anyhow::Result;
use aviary_core::error::AviaryError;
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use log::trace;
use serde::{Deserialize, Serialize};
mod named_tensors;
pub use named_tensors::NamedTensors;

/// Element-wise loss between predictions and targets of a value function.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum CriticLoss {
    /// Squared error.
    Mse,

    /// Huber loss with the given threshold.
    Huber(f64),
}

impl CriticLoss {
    /// Element-wise loss, without reduction.
    pub fn elementwise(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mse => Ok((pred - target)?.sqr()?),
            Self::Huber(delta) => huber(pred, target, *delta),
        }
    }
}

/// Element-wise Huber loss.
///
/// See <https://pytorch.org/docs/stable/generated/torch.nn.HuberLoss.html>.
pub fn huber(x: &Tensor, y: &Tensor, delta: f64) -> Result<Tensor> {
    let d = (x - y)?.abs()?;
    let quadratic = (0.5 * d.sqr()?)?;
    let linear = ((&d - 0.5 * delta)? * delta)?;
    Ok(d.lt(delta)?.where_cond(&quadratic, &linear)?)
}

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
pub fn track(dest: &VarMap, src: &VarMap, tau: f64) -> Result<()> {
    track_with_replace_substring(dest, src, tau, ("", ""))
}

/// Soft update where the name of a source variable is obtained by replacing
/// `ss_dest` with `ss_src` in the name of the destination variable.
pub fn track_with_replace_substring(
    dest: &VarMap,
    src: &VarMap,
    tau: f64,
    (ss_src, ss_dest): (&str, &str),
) -> Result<()> {
    trace!("soft update with tau = {}", tau);
    let dest = dest.data().lock().unwrap();
    let src = src.data().lock().unwrap();

    for (k_dest, v_dest) in dest.iter() {
        let k_src = if ss_dest.is_empty() {
            k_dest.clone()
        } else {
            k_dest.replace(ss_dest, ss_src)
        };
        let v_src = src.get(&k_src).ok_or_else(|| {
            AviaryError::config(format!("{} is not found in the source parameters", k_src))
        })?;
        let t_dest = ((tau * v_src.as_tensor())? + ((1.0 - tau) * v_dest.as_tensor())?)?;
        v_dest.set(&t_dest)?;
    }

    Ok(())
}

/// Interface for handling output dimensions.
pub trait OutDim {
    /// Returns the output dimension.
    fn get_out_dim(&self) -> usize;

    /// Sets the output dimension.
    fn set_out_dim(&mut self, v: usize);
}

/// Applies `f` to `xs` viewed as a matrix `[prod(leading), last]` and restores
/// the leading axes on the output.
pub fn apply_flat<F>(xs: &Tensor, f: F) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    let dims = xs.dims();
    if dims.len() == 2 {
        return f(xs);
    }
    let (lead, last) = dims.split_at(dims.len() - 1);
    let rows = lead.iter().product::<usize>();
    let ys = f(&xs.reshape((rows, last[0]))?)?;
    let mut shape = lead.to_vec();
    shape.push(ys.dim(1)?);
    Ok(ys.reshape(shape)?)
}

/// `ln(1 + exp(x))`, computed without overflow.
pub fn softplus(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.0)?.log()?
}

/// Inverse hyperbolic tangent.
pub fn atanh(xs: &Tensor) -> Result<Tensor> {
    let num = (xs + 1.0)?;
    let den = (xs.neg()? + 1.0)?;
    Ok(((num / den)?.log()? * 0.5)?)
}

/// Mean of all elements as a scalar.
pub fn mean_scalar(xs: &Tensor) -> Result<f32> {
    Ok(xs.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Population variance of all elements.
pub fn var_scalar(xs: &Tensor) -> Result<f32> {
    let mean = xs.mean_all()?;
    mean_scalar(&xs.broadcast_sub(&mean)?.sqr()?)
}

/// Sample standard deviation of all elements, as `torch.std`.
pub fn std_all(xs: &Tensor) -> Result<Tensor> {
    let n = xs.elem_count();
    let mean = xs.mean_all()?;
    let ss = xs.broadcast_sub(&mean)?.sqr()?.sum_all()?;
    Ok((ss / (n.max(2) - 1) as f64)?.sqrt()?)
}

/// `1 - Var(target - pred) / Var(target)`.
///
/// Returns 0 when the targets have no variance.
pub fn explained_variance(pred: &Tensor, target: &Tensor) -> Result<f32> {
    let var_y = var_scalar(target)?;
    if var_y <= f32::EPSILON {
        return Ok(0.0);
    }
    Ok(1.0 - var_scalar(&(target - pred)?)? / var_y)
}

/// Fails with [`AviaryError::NonFinite`] if `xs` contains NaN or infinity.
pub fn ensure_finite(xs: &Tensor, name: &str) -> Result<()> {
    let values = xs.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(AviaryError::NonFinite(name.to_string()).into())
    }
}

/// Fails with [`AviaryError::ShapeMismatch`] unless both tensors have the same shape.
pub fn ensure_same_shape((name1, t1): (&str, &Tensor), (name2, t2): (&str, &Tensor)) -> Result<()> {
    if t1.dims() == t2.dims() {
        Ok(())
    } else {
        Err(AviaryError::ShapeMismatch(format!(
            "{} has shape {:?} but {} has shape {:?}",
            name1,
            t1.dims(),
            name2,
            t2.dims()
        ))
        .into())
    }
}
