//! Gated recurrent unit with episode-start masking.
//!
//! The hidden state is zeroed for the environments whose `is_init` flag is
//! set before the step is applied, so that recurrent state never leaks across
//! episode boundaries.
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{linear, ops::sigmoid, Linear, Module, VarBuilder};

/// GRU cell, `h' = (1 - z) * n + z * h`.
pub struct Gru {
    x_proj: Linear,
    h_proj: Linear,
    hidden_dim: usize,
}

impl Gru {
    pub fn build(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        Ok(Self {
            x_proj: linear(in_dim, 3 * hidden_dim, vb.pp("x_proj"))?,
            h_proj: linear(hidden_dim, 3 * hidden_dim, vb.pp("h_proj"))?,
            hidden_dim,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// `x: [M, F]`, `h: [M, H]`.
    fn cell(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gx = self.x_proj.forward(x)?.chunk(3, D::Minus1)?;
        let gh = self.h_proj.forward(h)?.chunk(3, D::Minus1)?;
        let r = sigmoid(&(&gx[0] + &gh[0])?)?;
        let z = sigmoid(&(&gx[1] + &gh[1])?)?;
        let n = (&gx[2] + (r * &gh[2])?)?.tanh()?;
        let h_new = ((z.ones_like()? - &z)? * n)? + (z * h)?;
        Ok(h_new?)
    }

    /// Single step. `x: [N, A, F]`, `h: [N, A, H]`, `is_init: [N]`.
    ///
    /// Returns the output and the next hidden state, both `[N, A, H]`; for a
    /// GRU they coincide.
    pub fn step(&self, x: &Tensor, h: &Tensor, is_init: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, a, f) = x.dims3()?;
        let keep = (is_init.ones_like()? - is_init)?
            .to_dtype(h.dtype())?
            .reshape((n, 1, 1))?;
        let h = h.broadcast_mul(&keep)?;
        let h_new = self
            .cell(&x.reshape((n * a, f))?, &h.reshape((n * a, self.hidden_dim))?)?
            .reshape((n, a, self.hidden_dim))?;
        Ok((h_new.clone(), h_new))
    }

    /// Unrolls over windows. `x: [B, L, A, F]`, `h0: [B, A, H]` (the state fed
    /// into the first step), `is_init: [B, L]`.
    ///
    /// Returns outputs `[B, L, A, H]` and the final hidden state.
    pub fn sequence(&self, x: &Tensor, h0: &Tensor, is_init: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = x.dim(1)?;
        let mut h = h0.clone();
        let mut ys = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = x.narrow(1, t, 1)?.squeeze(1)?;
            let init_t = is_init.narrow(1, t, 1)?.squeeze(1)?;
            let (y, h_next) = self.step(&x_t, &h, &init_t)?;
            ys.push(y);
            h = h_next;
        }
        Ok((Tensor::stack(&ys, 1)?, h))
    }
}
