//! Log-mel spectrogram used to score copy synthesis.
//!
//! Defaults target 16 kHz speech: 1024-point FFT, 80-sample hop (the 5 ms
//! WORLD frame), 80 Slaney mel bands up to 8 kHz, `ln(max(mel, 1e-5))`.

use std::sync::Arc;

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 1024,
            hop_length: 80,
            n_mels: 80,
            f_min: 0.0,
            f_max: 8000.0,
        }
    }
}

impl MelConfig {
    /// Defaults with the sample rate (and Nyquist-limited f_max) replaced.
    pub fn for_sample_rate(sample_rate: u32, hop_length: usize) -> Self {
        Self {
            sample_rate,
            hop_length: hop_length.max(1),
            f_max: sample_rate as f64 / 2.0,
            ..Self::default()
        }
    }
}

/// Precomputed window, FFT plan and filterbank.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let window = hann_window(config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    /// Log-mel frames, `[num_frames][n_mels]`. Input is reflect-padded by
    /// `n_fft / 2` on each side so frame `k` is centred on sample `k * hop`.
    pub fn log_mel(&self, samples: &[f32]) -> Vec<Vec<f64>> {
        if samples.is_empty() {
            return Vec::new();
        }
        let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&signal, pad, pad);

        self.power_frames(&padded)
            .into_iter()
            .map(|spectrum| {
                self.filterbank
                    .iter()
                    .map(|filter| {
                        let energy: f64 = filter
                            .iter()
                            .zip(spectrum.iter())
                            .filter(|(w, _)| **w > 0.0)
                            .map(|(w, m)| w * m)
                            .sum();
                        energy.max(1e-5).ln()
                    })
                    .collect()
            })
            .collect()
    }

    fn power_frames(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        if padded.len() < n_fft {
            return Vec::new();
        }
        let num_frames = (padded.len() - n_fft) / hop + 1;

        (0..num_frames)
            .map(|frame| {
                let start = frame * hop;
                let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                    .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                    .collect();
                self.fft.process(&mut buffer);
                buffer[..num_bins]
                    .iter()
                    .map(|c| (c.re * c.re + c.im * c.im + 1e-9).sqrt())
                    .collect()
            })
            .collect()
    }
}

/// Mean absolute log-mel difference between two waveforms over their common
/// frames. Used as a copy-synthesis sanity check, not as a training signal.
pub fn log_mel_distortion(mel: &MelSpectrogram, reference: &[f32], test: &[f32]) -> Result<f64> {
    let a = mel.log_mel(reference);
    let b = mel.log_mel(test);
    let frames = a.len().min(b.len());
    if frames == 0 {
        return Err(Error::Audio(
            "log-mel distortion needs at least one frame from each signal".into(),
        ));
    }
    let mut total = 0.0;
    let mut count = 0usize;
    for (fa, fb) in a.iter().zip(b.iter()).take(frames) {
        for (x, y) in fa.iter().zip(fb.iter()) {
            total += (x - y).abs();
            count += 1;
        }
    }
    Ok(total / count as f64)
}

pub(crate) fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect without repeating the edge sample; short signals fall back to
/// edge clamping.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let last = len - 1;
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(last)]);
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right {
        padded.push(signal[last.saturating_sub(1 + i)]);
    }
    padded
}

fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    let edges: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..num_bins).map(|i| sr * i as f64 / n_fft as f64).collect();

    edges
        .windows(3)
        .map(|edge| {
            let (left, center, right) = (edge[0], edge[1], edge[2]);
            let norm = 2.0 / (right - left);
            bin_freqs
                .iter()
                .map(|&f| {
                    if f < left || f > right {
                        0.0
                    } else if f <= center {
                        norm * (f - left) / (center - left)
                    } else {
                        norm * (right - f) / (right - center)
                    }
                })
                .collect()
        })
        .collect()
}

// Slaney scale: linear below 1 kHz, logarithmic above.
fn hz_to_mel(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / 6.4_f64.ln()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * 6.4_f64.ln() / 27.0).exp()
    }
}
