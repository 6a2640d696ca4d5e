//! Patch discriminator over the MCEP "image" `[B, 1, D, T]`.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::{InstanceNorm, conv2d_cfg, glu};
use crate::config::{DiscriminatorKind, ModelConfig};
use crate::{Error, Result};

struct DownBlock2d {
    conv: candle_nn::Conv2d,
    norm: InstanceNorm,
}

impl DownBlock2d {
    fn new(dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv2d(dim_in, dim_out, 3, conv2d_cfg(1, 2), vb.pp("conv"))?;
        let norm = InstanceNorm::new(dim_out, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        glu(&self.norm.forward(&self.conv.forward(x)?)?)
    }
}

/// `<h, W [emb(a); emb(b)]>` per patch, conditioning the score on the
/// ordered label pair.
struct LabelProjection {
    embed: candle_nn::Embedding,
    proj: candle_nn::Linear,
}

impl LabelProjection {
    fn new(num_speakers: usize, embed_dim: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        let embed = candle_nn::embedding(num_speakers, embed_dim, vb.pp("embed"))?;
        let proj = candle_nn::linear_no_bias(2 * embed_dim, channels, vb.pp("proj"))?;
        Ok(Self { embed, proj })
    }

    /// `h`: `[B, H, W, C]` -> `[B, H, W]`.
    fn forward(&self, h: &Tensor, label_a: &Tensor, label_b: &Tensor) -> Result<Tensor> {
        let emb = Tensor::cat(&[self.embed.forward(label_a)?, self.embed.forward(label_b)?], 1)?;
        let w = self.proj.forward(&emb)?;
        let (b, c) = w.dims2()?;
        Ok(h.broadcast_mul(&w.reshape((b, 1, 1, c))?)?.sum(D::Minus1)?)
    }
}

pub struct Discriminator {
    conv_in: candle_nn::Conv2d,
    blocks: Vec<DownBlock2d>,
    out: candle_nn::Linear,
    projection: Option<LabelProjection>,
    num_mcep: usize,
    num_speakers: usize,
}

impl Discriminator {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.dis_conv_dim;
        let conv_in = candle_nn::conv2d(1, 2 * c, 3, conv2d_cfg(1, 1), vb.pp("conv_in"))?;
        let mut blocks = Vec::with_capacity(cfg.dis_repeat_num);
        let mut dim = c;
        for i in 0..cfg.dis_repeat_num {
            blocks.push(DownBlock2d::new(dim, 4 * dim, vb.pp(format!("blocks.{i}")))?);
            dim *= 2;
        }
        let out = candle_nn::linear(dim, 1, vb.pp("out"))?;
        let projection = match cfg.discriminator {
            DiscriminatorKind::Patch => Some(LabelProjection::new(
                cfg.num_speakers,
                cfg.dis_embed_dim,
                dim,
                vb.pp("projection"),
            )?),
            DiscriminatorKind::Unconditional => None,
        };
        Ok(Self {
            conv_in,
            blocks,
            out,
            projection,
            num_mcep: cfg.num_mcep,
            num_speakers: cfg.num_speakers,
        })
    }

    /// Realness of each patch of `x` `[B, D, T]`, in `[0, 1]`, shape `[B, H, W]`.
    ///
    /// Labels are `u32` speaker indices of shape `[B]`.
    pub fn forward(&self, x: &Tensor, label_a: &Tensor, label_b: &Tensor) -> Result<Tensor> {
        let (b, d, _t) = x.dims3()?;
        if d != self.num_mcep {
            return Err(Error::dims("discriminator input channels", self.num_mcep, d));
        }
        for labels in [label_a, label_b] {
            if labels.dims() != [b] {
                return Err(Error::dims("discriminator labels", [b], labels.dims()));
            }
        }
        if let Some(max) = label_a
            .to_vec1::<u32>()?
            .into_iter()
            .chain(label_b.to_vec1::<u32>()?)
            .max()
            && max as usize >= self.num_speakers
        {
            return Err(Error::dims("speaker label", format!("< {}", self.num_speakers), max));
        }

        let mut h = glu(&self.conv_in.forward(&x.unsqueeze(1)?)?)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        // [B, C, H, W] -> [B, H, W, C]
        let h = h.permute((0, 2, 3, 1))?.contiguous()?;
        let mut logits = self.out.forward(&h)?.squeeze(D::Minus1)?;
        if let Some(projection) = &self.projection {
            logits = (logits + projection.forward(&h, label_a, label_b)?)?;
        }
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }
}
