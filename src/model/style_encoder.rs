//! Speaker style encoder: features + speaker label -> style vector.
//!
//! A shared conv trunk pools each utterance to one vector; a bank of
//! per-speaker linear heads maps it to `style_dim`, and the head belonging
//! to each sample's label is selected.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::{InstanceNorm, conv1d_cfg, glu, one_hot};
use crate::config::{ModelConfig, StyleEncoderKind};
use crate::context::Context;
use crate::{Error, Result};

struct EncoderBlock {
    conv: candle_nn::Conv1d,
    norm: InstanceNorm,
}

impl EncoderBlock {
    fn new(dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv1d(dim_in, 2 * dim_out, 5, conv1d_cfg(2, 2), vb.pp("conv"))?;
        let norm = InstanceNorm::new(2 * dim_out, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        glu(&self.norm.forward(&self.conv.forward(x)?)?)
    }
}

pub struct StyleEncoder {
    conv_in: candle_nn::Conv1d,
    blocks: Vec<EncoderBlock>,
    heads: candle_nn::Linear,
    classifier: candle_nn::Linear,
    pooling: StyleEncoderKind,
    num_mcep: usize,
    num_speakers: usize,
    style_dim: usize,
    ctx: Context,
}

impl StyleEncoder {
    pub fn new(cfg: &ModelConfig, ctx: &Context, vb: VarBuilder) -> Result<Self> {
        let mut dim = cfg.enc_conv_dim.min(cfg.enc_max_dim);
        let conv_in = candle_nn::conv1d(cfg.num_mcep, 2 * dim, 3, conv1d_cfg(1, 1), vb.pp("conv_in"))?;
        let mut blocks = Vec::with_capacity(cfg.enc_repeat_num);
        for i in 0..cfg.enc_repeat_num {
            let next = (dim * 2).min(cfg.enc_max_dim);
            blocks.push(EncoderBlock::new(dim, next, vb.pp(format!("blocks.{i}")))?);
            dim = next;
        }
        let heads = candle_nn::linear(dim, cfg.num_speakers * cfg.style_dim, vb.pp("heads"))?;
        let classifier = candle_nn::linear(dim, cfg.num_speakers, vb.pp("classifier"))?;
        Ok(Self {
            conv_in,
            blocks,
            heads,
            classifier,
            pooling: cfg.style_encoder,
            num_mcep: cfg.num_mcep,
            num_speakers: cfg.num_speakers,
            style_dim: cfg.style_dim,
            ctx: ctx.clone(),
        })
    }

    /// Style `[B, style_dim]` of `features` `[B, D, T]` for `labels` `[B]`.
    pub fn forward(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let pooled = self.pooled(features, labels)?;
        self.select_head(&pooled, labels)
    }

    /// Style plus speaker logits `[B, num_speakers]` from the classification head.
    pub fn forward_with_logits(&self, features: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        let pooled = self.pooled(features, labels)?;
        let style = self.select_head(&pooled, labels)?;
        let logits = self.classifier.forward(&pooled)?;
        Ok((style, logits))
    }

    fn pooled(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (b, d, t) = features.dims3()?;
        if d != self.num_mcep {
            return Err(Error::dims("style encoder input channels", self.num_mcep, d));
        }
        if t == 0 {
            return Err(Error::dims("style encoder input frames", "> 0", t));
        }
        if labels.dims() != [b] {
            return Err(Error::dims("style encoder labels", [b], labels.dims()));
        }
        let mut h = glu(&self.conv_in.forward(features)?)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(match self.pooling {
            StyleEncoderKind::MeanPool => h.mean(D::Minus1)?,
            StyleEncoderKind::MaxPool => h.max(D::Minus1)?,
        })
    }

    fn select_head(&self, pooled: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let b = pooled.dim(0)?;
        let all = self
            .heads
            .forward(pooled)?
            .reshape((b, self.num_speakers, self.style_dim))?;
        let mask = one_hot(labels, self.num_speakers, &self.ctx)?.unsqueeze(2)?;
        Ok(all.broadcast_mul(&mask)?.sum(1)?)
    }
}
