//! Building blocks shared by the three networks.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::context::Context;
use crate::{Error, Result};

const NORM_EPS: f64 = 1e-5;

/// Instance normalization with a learned per-channel affine.
///
/// Accepts `[B, C, T]` or `[B, C, H, W]`; statistics are taken over every
/// non-channel axis of each sample.
pub struct InstanceNorm {
    weight: Tensor,
    bias: Tensor,
    channels: usize,
}

impl InstanceNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            channels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shape = x.shape().clone();
        let normed = normalize(x)?;
        let c = self.channels;
        let out = normed
            .broadcast_mul(&self.weight.reshape((1, c, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1))?)?;
        Ok(out.reshape(shape)?)
    }
}

/// Parameter-free instance normalization, returned as `[B, C, N]` where `N`
/// is the product of the spatial axes.
fn normalize(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    if dims.len() < 3 {
        return Err(Error::dims("instance norm input", "[B, C, ...]", dims));
    }
    let (b, c) = (dims[0], dims[1]);
    let x = x.reshape((b, c, ()))?;
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)?)
}

/// Adaptive instance normalization: the affine comes from a conditioning
/// vector instead of learned constants, `(1 + gamma) * norm(x) + beta`.
pub struct AdaIn {
    fc: candle_nn::Linear,
    channels: usize,
}

impl AdaIn {
    pub fn new(channels: usize, cond_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc = candle_nn::linear(cond_dim, 2 * channels, vb.pp("fc"))?;
        Ok(Self { fc, channels })
    }

    /// `x`: `[B, C, T]`, `cond`: `[B, cond_dim]`.
    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let h = self.fc.forward(cond)?.unsqueeze(2)?;
        let gamma = h.narrow(1, 0, self.channels)?;
        let beta = h.narrow(1, self.channels, self.channels)?;
        let normed = normalize(x)?;
        Ok(normed.broadcast_mul(&(gamma + 1.0)?)?.broadcast_add(&beta)?)
    }
}

/// Gated linear unit over channels: first half times sigmoid of second half.
pub fn glu(x: &Tensor) -> Result<Tensor> {
    let c = x.dim(1)?;
    if c % 2 != 0 {
        return Err(Error::dims("glu channels", "even", c));
    }
    let half = c / 2;
    let a = x.narrow(1, 0, half)?;
    let gate = candle_nn::ops::sigmoid(&x.narrow(1, half, half)?)?;
    Ok((a * gate)?)
}

/// Move channel groups into time: `[B, C, T]` -> `[B, C / r, T * r]`.
///
/// Plain row-major reinterpretation, matching a `view` on a contiguous tensor.
pub fn pixel_shuffle_1d(x: &Tensor, r: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    if c % r != 0 {
        return Err(Error::dims("pixel shuffle channels", format!("multiple of {r}"), c));
    }
    Ok(x.contiguous()?.reshape((b, c / r, t * r))?)
}

/// `[B, n]` one-hot rows for `labels`.
pub fn one_hot(labels: &Tensor, n: usize, ctx: &Context) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let mut data = vec![0f32; labels.len() * n];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= n {
            return Err(Error::dims("speaker label", format!("< {n}"), label));
        }
        data[row * n + label] = 1.0;
    }
    Ok(Tensor::from_vec(data, (labels.len(), n), &ctx.device)?.to_dtype(ctx.dtype)?)
}

pub(crate) fn conv1d_cfg(padding: usize, stride: usize) -> candle_nn::Conv1dConfig {
    candle_nn::Conv1dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

pub(crate) fn conv2d_cfg(padding: usize, stride: usize) -> candle_nn::Conv2dConfig {
    candle_nn::Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    }
}
