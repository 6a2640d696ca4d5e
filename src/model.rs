//! The three trained networks and their parameter stores.
//!
//! ## Components
//!
//! - [`generator`] — style-conditioned conv encoder/decoder over `[B, D, T]`
//! - [`style_encoder`] — per-speaker style vectors plus speaker logits
//! - [`discriminator`] — label-projected patch discriminator
//! - [`layers`] — instance norm, AdaIN, GLU, 1-D pixel shuffle

pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod style_encoder;

use std::collections::HashMap;
use std::sync::MutexGuard;

use candle_core::{Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub use discriminator::Discriminator;
pub use generator::Generator;
pub use style_encoder::StyleEncoder;

use crate::config::ModelConfig;
use crate::context::Context;
use crate::{Error, Result};

/// Generator, discriminator and style encoder, each with its own `VarMap`
/// so they can be optimized and checkpointed independently.
pub struct Networks {
    pub generator: Generator,
    pub discriminator: Discriminator,
    pub style_encoder: StyleEncoder,
    pub g_vars: VarMap,
    pub d_vars: VarMap,
    pub e_vars: VarMap,
}

impl Networks {
    /// Build all three networks with parameters drawn from `seed`.
    pub fn new(cfg: &ModelConfig, ctx: &Context, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let g_vars = VarMap::new();
        let d_vars = VarMap::new();
        let e_vars = VarMap::new();

        let generator = Generator::new(cfg, VarBuilder::from_varmap(&g_vars, ctx.dtype, &ctx.device))?;
        let discriminator =
            Discriminator::new(cfg, VarBuilder::from_varmap(&d_vars, ctx.dtype, &ctx.device))?;
        let style_encoder =
            StyleEncoder::new(cfg, ctx, VarBuilder::from_varmap(&e_vars, ctx.dtype, &ctx.device))?;

        // distinct streams so adding a layer to one network leaves the others unchanged
        seeded_init(&g_vars, seed, 0)?;
        seeded_init(&d_vars, seed, 1)?;
        seeded_init(&e_vars, seed, 2)?;

        Ok(Self {
            generator,
            discriminator,
            style_encoder,
            g_vars,
            d_vars,
            e_vars,
        })
    }

    /// `(name, parameter count)` for logging.
    pub fn summary(&self) -> Result<[(&'static str, usize); 3]> {
        Ok([
            ("Generator", parameter_count(&self.g_vars)?),
            ("Discriminator", parameter_count(&self.d_vars)?),
            ("SpeakerEncoder", parameter_count(&self.e_vars)?),
        ])
    }
}

pub(crate) fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| Error::Candle(candle_core::Error::Msg("parameter store lock poisoned".into())))
}

pub fn parameter_count(varmap: &VarMap) -> Result<usize> {
    Ok(lock_vars(varmap)?.values().map(|v| v.elem_count()).sum())
}

/// Overwrite every parameter from a ChaCha8 stream, visiting names in sorted
/// order so the result is independent of hash-map iteration.
///
/// Matrices and kernels: uniform in `±1/sqrt(fan_in)`. Vectors named
/// `*weight` (norm scales): ones. Other vectors (biases): zeros.
pub fn seeded_init(varmap: &VarMap, seed: u64, stream: u64) -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);

    let vars = lock_vars(varmap)?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        let var = &vars[name];
        let dims = var.dims().to_vec();
        let count: usize = dims.iter().product();
        let values: Vec<f32> = if dims.len() >= 2 {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            (0..count).map(|_| rng.random_range(-bound..=bound)).collect()
        } else if name.ends_with("weight") {
            vec![1.0; count]
        } else {
            vec![0.0; count]
        };
        let init = Tensor::from_vec(values, dims, var.device())?.to_dtype(var.dtype())?;
        var.set(&init)?;
    }
    Ok(())
}
