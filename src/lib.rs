//! StarGAN-VC voice conversion training in pure Rust.
//!
//! A candle-based trainer for many-to-many voice conversion on WORLD
//! mel-cepstral features. A generator converts source MCEPs towards a target
//! speaker, conditioned on AdaIN style vectors from a speaker style encoder,
//! while a patch discriminator scores realness of the (source, target) pair.
//!
//! ## Training data flow
//!
//! ```text
//! <train>/<spk>/*.npy ──→ PairDataset ──→ loader (prefetch workers)
//!                                              ↓ HostBatch
//!                         style encoder ──→ s_src, s_trg
//!                                              ↓
//!                generator(src, s_src, s_trg) → fake ──→ discriminator
//!                                              ↓
//!          checkpoints (G / D / sp)   metrics.jsonl   WORLD samples
//! ```
//!
//! ## Modules
//!
//! - [`config`] — model / training / audio / directory configuration
//! - [`data`] — speaker list, normalization stats, pair sampling, loaders
//! - [`model`] — generator, style encoder, discriminator
//! - [`train`] — solver loop, losses, checkpoints, metrics, evaluation
//! - [`scheduler`] — learning-rate schedules
//! - [`vocoder`] — WORLD contract, pure-Rust spectral backend, pitch conversion, padding
//! - [`audio`] — WAV I/O and log-mel distortion

pub mod audio;
pub mod config;
pub mod context;
pub mod data;
pub mod model;
pub mod scheduler;
pub mod train;
pub mod vocoder;

mod error;

pub use context::Context;
pub use error::{Error, Result};
