//! Audio-domain conversion samples written during training.

use std::path::{Path, PathBuf};

use candle_core::Tensor;

use crate::audio::{MelConfig, MelSpectrogram, log_mel_distortion, write_wav_pcm16};
use crate::config::AudioConfig;
use crate::context::Context;
use crate::data::{EvalSet, EvalUtterance, Utterance};
use crate::model::Networks;
use crate::vocoder::{Vocoder, pitch_conversion};
use crate::{Error, Result};

/// Converts the evaluation set with the current networks and writes WAVs.
pub struct Evaluator {
    vocoder: Box<dyn Vocoder>,
    eval: EvalSet,
    audio: AudioConfig,
    sample_dir: PathBuf,
    num_mcep: usize,
    mel: MelSpectrogram,
    copy_synthesis_done: bool,
}

impl Evaluator {
    pub fn new(
        vocoder: Box<dyn Vocoder>,
        eval: EvalSet,
        audio: AudioConfig,
        sample_dir: impl Into<PathBuf>,
        num_mcep: usize,
    ) -> Self {
        let mel = MelSpectrogram::new(MelConfig::for_sample_rate(
            audio.sampling_rate,
            audio.hop_samples().round() as usize,
        ));
        Self {
            vocoder,
            eval,
            audio,
            sample_dir: sample_dir.into(),
            num_mcep,
            mel,
            copy_synthesis_done: false,
        }
    }

    /// Convert every evaluation utterance; `step` is the one-based iteration
    /// used in file names. Copy-synthesis files are written on the first call only.
    pub fn run(&mut self, step: usize, nets: &Networks, ctx: &Context) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.eval.utterances.len());
        for utt in &self.eval.utterances {
            written.push(self.convert(step, utt, nets, ctx)?);
        }
        if !self.copy_synthesis_done {
            for utt in &self.eval.utterances {
                written.push(self.copy_synthesis(utt)?);
            }
            self.copy_synthesis_done = true;
        }
        tracing::info!(step, files = written.len(), dir = %self.sample_dir.display(), "wrote conversion samples");
        Ok(written)
    }

    fn convert(&self, step: usize, utt: &EvalUtterance, nets: &Networks, ctx: &Context) -> Result<PathBuf> {
        let fs = self.audio.sampling_rate;
        let fp = self.audio.frame_period_ms;
        let wav: Vec<f64> = utt.wav.iter().map(|&s| s as f64).collect();

        let world = self.vocoder.analyze(&wav, fs, fp)?;
        let f0 = pitch_conversion(&world.f0, self.eval.src_stats.log_f0(), self.eval.trg_stats.log_f0());
        let coded_sp = self.vocoder.encode_spectral_envelope(&world.spectral_envelope, fs, self.num_mcep)?;
        let normed = self.eval.src_stats.normalize(&coded_sp)?;

        let frames = normed.len();
        if frames == 0 {
            return Err(Error::Vocoder(format!("analysis of {} produced no frames", utt.name)));
        }
        let padded_frames = frames.div_ceil(4) * 4;
        let x = frames_to_tensor(&normed, self.num_mcep, padded_frames, ctx)?;

        let src_style = nets.style_encoder.forward(
            &reference_tensor(&utt.src_reference, self.num_mcep, ctx)?,
            &label_tensor(self.eval.src_label, ctx)?,
        )?;
        let trg_style = nets.style_encoder.forward(
            &reference_tensor(&utt.trg_reference, self.num_mcep, ctx)?,
            &label_tensor(self.eval.trg_label, ctx)?,
        )?;
        let converted = nets
            .generator
            .forward(&x, &src_style, &trg_style)?
            .detach()
            .narrow(2, 0, frames)?;
        let converted = tensor_to_frames(&converted)?;
        let converted = self.eval.trg_stats.denormalize(&converted)?;

        let out = self
            .vocoder
            .synthesize(&f0, &converted, &world.aperiodicity, fs, fp)?;
        let path = self.sample_dir.join(format!(
            "{step}-{}-vcto-{}.wav",
            utt.name, self.eval.trg_speaker
        ));
        write_samples(&path, &out, fs)?;
        Ok(path)
    }

    fn copy_synthesis(&self, utt: &EvalUtterance) -> Result<PathBuf> {
        let fs = self.audio.sampling_rate;
        let fp = self.audio.frame_period_ms;
        let wav: Vec<f64> = utt.wav.iter().map(|&s| s as f64).collect();
        let world = self.vocoder.analyze(&wav, fs, fp)?;
        let coded_sp = self.vocoder.encode_spectral_envelope(&world.spectral_envelope, fs, self.num_mcep)?;
        let out = self
            .vocoder
            .synthesize(&world.f0, &coded_sp, &world.aperiodicity, fs, fp)?;

        let path = self.sample_dir.join(format!("cpsyn-{}.wav", utt.name));
        write_samples(&path, &out, fs)?;

        let resynth: Vec<f32> = out.iter().map(|&s| s as f32).collect();
        let distortion = log_mel_distortion(&self.mel, &utt.wav, &resynth)?;
        if distortion > self.audio.copy_synthesis_tolerance {
            tracing::warn!(
                utterance = %utt.name,
                distortion,
                tolerance = self.audio.copy_synthesis_tolerance,
                "copy synthesis deviates from the input"
            );
        } else {
            tracing::debug!(utterance = %utt.name, distortion, "copy synthesis ok");
        }
        Ok(path)
    }
}

fn write_samples(path: &Path, samples: &[f64], fs: u32) -> Result<()> {
    let samples: Vec<f32> = samples.iter().map(|&s| s as f32).collect();
    write_wav_pcm16(path, &samples, fs)
}

/// Frame-major `[T][D]` values into `[1, D, padded]`, zero-filling the tail.
fn frames_to_tensor(frames: &[Vec<f64>], dim: usize, padded: usize, ctx: &Context) -> Result<Tensor> {
    let mut data = vec![0f32; dim * padded];
    for (t, frame) in frames.iter().enumerate() {
        if frame.len() != dim {
            return Err(Error::dims("coded spectral envelope", dim, frame.len()));
        }
        for (d, &v) in frame.iter().enumerate() {
            data[d * padded + t] = v as f32;
        }
    }
    Ok(Tensor::from_vec(data, (1, dim, padded), &ctx.device)?.to_dtype(ctx.dtype)?)
}

/// `[1, D, T]` tensor back to frame-major `[T][D]`.
fn tensor_to_frames(x: &Tensor) -> Result<Vec<Vec<f64>>> {
    let rows = x.squeeze(0)?.t()?.to_dtype(candle_core::DType::F64)?.to_vec2::<f64>()?;
    Ok(rows)
}

fn reference_tensor(utt: &Utterance, dim: usize, ctx: &Context) -> Result<Tensor> {
    Ok(Tensor::from_slice(&utt.features, (1, dim, utt.num_frames), &ctx.device)?.to_dtype(ctx.dtype)?)
}

fn label_tensor(label: u32, ctx: &Context) -> Result<Tensor> {
    Ok(Tensor::new(&[label], &ctx.device)?)
}
