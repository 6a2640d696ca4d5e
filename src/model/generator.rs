//! Style-conditioned MCEP generator.
//!
//! ```text
//! x [B, D, T]
//!   → Conv1d(D → 2c, k15) + GLU                          [B, c, T]
//!   → Conv1d(c → 2c, k5, s2) + IN + GLU                  [B, c, T/2]
//!   → Conv1d(c → 4c, k5, s2) + IN + GLU                  [B, 2c, T/4]
//!   → N × (x + GLU(AdaIN(Conv1d(2c → 4c, k3), [s_src; s_trg])))
//!   → Conv1d(2c → 4c, k5) + shuffle + IN + GLU           [B, c, T/2]
//!   → Conv1d(c → 2c, k5) + shuffle + IN + GLU            [B, c/2, T]
//!   → Conv1d(c/2 → D, k15)                               [B, D, T]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::{AdaIn, InstanceNorm, conv1d_cfg, glu, pixel_shuffle_1d};
use crate::config::ModelConfig;
use crate::{Error, Result};

struct DownBlock {
    conv: candle_nn::Conv1d,
    norm: InstanceNorm,
}

impl DownBlock {
    fn new(dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv1d_no_bias(dim_in, dim_out, 5, conv1d_cfg(2, 2), vb.pp("conv"))?;
        let norm = InstanceNorm::new(dim_out, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        glu(&self.norm.forward(&self.conv.forward(x)?)?)
    }
}

struct UpBlock {
    conv: candle_nn::Conv1d,
    norm: InstanceNorm,
}

impl UpBlock {
    fn new(dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv1d_no_bias(dim_in, dim_out, 5, conv1d_cfg(2, 1), vb.pp("conv"))?;
        // normalised after the shuffle, which halves the channels
        let norm = InstanceNorm::new(dim_out / 2, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = pixel_shuffle_1d(&self.conv.forward(x)?, 2)?;
        glu(&self.norm.forward(&h)?)
    }
}

struct AdaInResBlock {
    conv: candle_nn::Conv1d,
    adain: AdaIn,
}

impl AdaInResBlock {
    fn new(dim: usize, cond_dim: usize, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv1d_no_bias(dim, 2 * dim, 3, conv1d_cfg(1, 1), vb.pp("conv"))?;
        let adain = AdaIn::new(2 * dim, cond_dim, vb.pp("adain"))?;
        Ok(Self { conv, adain })
    }

    fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let h = glu(&self.adain.forward(&self.conv.forward(x)?, cond)?)?;
        Ok((x + h)?)
    }
}

pub struct Generator {
    conv_in: candle_nn::Conv1d,
    down: [DownBlock; 2],
    blocks: Vec<AdaInResBlock>,
    up: [UpBlock; 2],
    conv_out: candle_nn::Conv1d,
    num_mcep: usize,
    style_dim: usize,
}

impl Generator {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.gen_conv_dim;
        let d = cfg.num_mcep;
        let cond_dim = 2 * cfg.style_dim;

        let conv_in = candle_nn::conv1d_no_bias(d, 2 * c, 15, conv1d_cfg(7, 1), vb.pp("conv_in"))?;
        let down = [
            DownBlock::new(c, 2 * c, vb.pp("down.0"))?,
            DownBlock::new(c, 4 * c, vb.pp("down.1"))?,
        ];
        let blocks = (0..cfg.gen_repeat_num)
            .map(|i| AdaInResBlock::new(2 * c, cond_dim, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let up = [
            UpBlock::new(2 * c, 4 * c, vb.pp("up.0"))?,
            UpBlock::new(c, 2 * c, vb.pp("up.1"))?,
        ];
        let conv_out = candle_nn::conv1d_no_bias(c / 2, d, 15, conv1d_cfg(7, 1), vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            down,
            blocks,
            up,
            conv_out,
            num_mcep: d,
            style_dim: cfg.style_dim,
        })
    }

    /// Convert `x` `[B, D, T]` from the source style towards the target style.
    ///
    /// `T` must be a multiple of 4 so the two downsampling stages invert exactly.
    pub fn forward(&self, x: &Tensor, source_style: &Tensor, target_style: &Tensor) -> Result<Tensor> {
        let (b, d, t) = x.dims3()?;
        if d != self.num_mcep {
            return Err(Error::dims("generator input channels", self.num_mcep, d));
        }
        if t % 4 != 0 || t == 0 {
            return Err(Error::dims("generator input frames", "non-zero multiple of 4", t));
        }
        for style in [source_style, target_style] {
            let dims = style.dims();
            if dims != [b, self.style_dim] {
                return Err(Error::dims("generator style", [b, self.style_dim], dims));
            }
        }
        let cond = Tensor::cat(&[source_style, target_style], 1)?;

        let mut h = glu(&self.conv_in.forward(x)?)?;
        for block in &self.down {
            h = block.forward(&h)?;
        }
        for block in &self.blocks {
            h = block.forward(&h, &cond)?;
        }
        for block in &self.up {
            h = block.forward(&h)?;
        }
        Ok(self.conv_out.forward(&h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> ModelConfig {
        ModelConfig {
            num_mcep: 8,
            num_speakers: 3,
            style_dim: 4,
            gen_conv_dim: 8,
            gen_repeat_num: 2,
            ..Default::default()
        }
    }

    fn build() -> (Generator, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let g = Generator::new(&small_config(), vb).unwrap();
        (g, varmap)
    }

    #[test]
    fn test_shape_preserved() {
        let (g, _) = build();
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 32), &device).unwrap();
        let s = Tensor::randn(0f32, 1.0, (2, 4), &device).unwrap();
        let y = g.forward(&x, &s, &s).unwrap();
        assert_eq!(y.dims(), &[2, 8, 32]);
    }

    #[test]
    fn test_styles_act_distinctly() {
        let (g, _) = build();
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 8, 16), &device).unwrap();
        let a = Tensor::randn(0f32, 1.0, (1, 4), &device).unwrap();
        let b = Tensor::randn(0f32, 1.0, (1, 4), &device).unwrap();
        let ab = g.forward(&x, &a, &b).unwrap();
        let ba = g.forward(&x, &b, &a).unwrap();
        let diff = (ab - ba).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let (g, _) = build();
        let device = Device::Cpu;
        let s = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let wrong_dim = Tensor::zeros((1, 7, 16), DType::F32, &device).unwrap();
        assert!(matches!(
            g.forward(&wrong_dim, &s, &s),
            Err(Error::DimensionMismatch { .. })
        ));
        let wrong_len = Tensor::zeros((1, 8, 18), DType::F32, &device).unwrap();
        assert!(g.forward(&wrong_len, &s, &s).is_err());
        let x = Tensor::zeros((1, 8, 16), DType::F32, &device).unwrap();
        let wide = Tensor::zeros((1, 5), DType::F32, &device).unwrap();
        assert!(g.forward(&x, &s, &wide).is_err());
        let batch2 = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(g.forward(&x, &batch2, &batch2).is_err());
    }

    #[test]
    fn test_parameter_names() {
        let (_, varmap) = build();
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("conv_in.weight"));
        assert!(data.contains_key("blocks.1.adain.fc.weight"));
        assert!(data.contains_key("up.1.norm.bias"));
        assert!(!data.contains_key("conv_in.bias"));
    }
}
