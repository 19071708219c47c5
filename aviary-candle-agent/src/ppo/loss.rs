//! Losses of the PPO update.
use crate::util::{ensure_same_shape, CriticLoss};
use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

/// Reduction of the element-wise value loss `[.., A, H]`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum ValueLossReduction {
    /// Sum over reward heads, then mean.
    SumHeads,

    /// Mean over all elements.
    Mean,
}

/// Clipped surrogate objective, negated and scaled by the action width.
///
/// `log_prob`, `old_log_prob` and `advantage` share one shape.
pub fn policy_loss(
    log_prob: &Tensor,
    old_log_prob: &Tensor,
    advantage: &Tensor,
    clip_param: f64,
    action_dim: usize,
) -> Result<Tensor> {
    ensure_same_shape(("log_prob", log_prob), ("sample_log_prob", old_log_prob))?;
    ensure_same_shape(("log_prob", log_prob), ("advantage", advantage))?;
    let ratio = (log_prob - old_log_prob)?.exp()?;
    let surr1 = (&ratio * advantage)?;
    let surr2 = (ratio.clamp(1.0 - clip_param, 1.0 + clip_param)? * advantage)?;
    Ok((surr1.minimum(&surr2)?.mean_all()? * -(action_dim as f64))?)
}

/// Pessimistic value loss `max(l(pred), l(clipped_pred))`, where the clipped
/// prediction stays within `clip_param` of the value at collection time.
pub fn value_loss(
    pred: &Tensor,
    old_value: &Tensor,
    ret: &Tensor,
    clip_param: f64,
    loss: CriticLoss,
    reduction: ValueLossReduction,
) -> Result<Tensor> {
    ensure_same_shape(("value", pred), ("return", ret))?;
    ensure_same_shape(("value", pred), ("state_value", old_value))?;
    let clipped = (old_value + (pred - old_value)?.clamp(-clip_param, clip_param)?)?;
    let l_orig = loss.elementwise(pred, ret)?;
    let l_clip = loss.elementwise(&clipped, ret)?;
    let l = l_orig.maximum(&l_clip)?;
    Ok(match reduction {
        ValueLossReduction::SumHeads => l.sum(D::Minus1)?.mean_all()?,
        ValueLossReduction::Mean => l.mean_all()?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use aviary_core::error::AviaryError;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_policy_loss_unit_ratio() -> Result<()> {
        let logp = Tensor::new(&[[-1f32, -2.], [-0.5, -0.1]], &Device::Cpu)?;
        let adv = Tensor::new(&[[1f32, -1.], [2., 0.]], &Device::Cpu)?;
        let l = policy_loss(&logp, &logp, &adv, 0.1, 3)?;
        // -mean(adv) * 3
        assert!((scalar(&l) + 1.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_policy_loss_clipping() -> Result<()> {
        let old = Tensor::new(&[0f32, 0.], &Device::Cpu)?;
        let logp = Tensor::new(&[2f32.ln(), 2f32.ln()], &Device::Cpu)?;
        let adv = Tensor::new(&[1f32, -1.], &Device::Cpu)?;
        let l = policy_loss(&logp, &old, &adv, 0.1, 1)?;
        // min(2, 1.1) = 1.1 and min(-2, -1.1) = -2
        assert!((scalar(&l) - 0.45).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_value_loss_takes_max() -> Result<()> {
        let old = Tensor::new(&[[0f32, 0.]], &Device::Cpu)?;
        let pred = Tensor::new(&[[1f32, 0.05]], &Device::Cpu)?;
        let ret = Tensor::new(&[[1f32, 0.05]], &Device::Cpu)?;
        // Head 0: clipped prediction 0.1 is worse, (0.9)^2. Head 1: no clipping.
        let l = value_loss(&pred, &old, &ret, 0.1, CriticLoss::Mse, ValueLossReduction::SumHeads)?;
        assert!((scalar(&l) - 0.81).abs() < 1e-5);
        let l = value_loss(&pred, &old, &ret, 0.1, CriticLoss::Mse, ValueLossReduction::Mean)?;
        assert!((scalar(&l) - 0.405).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let a = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((2, 1), candle_core::DType::F32, &Device::Cpu)?;
        let err = policy_loss(&a, &a, &b, 0.1, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AviaryError>(),
            Some(AviaryError::ShapeMismatch(_))
        ));
        Ok(())
    }
}
