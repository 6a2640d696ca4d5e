//! WORLD vocoder contract and the signal helpers around it.
//!
//! The training loop only needs analysis (F0, spectral envelope,
//! aperiodicity), MCEP coding and synthesis through [`Vocoder`];
//! [`SpectralVocoder`] is the built-in backend. Everything here works
//! frame-major: `[frames][bins]`.

mod spectral;

pub use spectral::{SpectralConfig, SpectralVocoder, fft_size};

use crate::{Error, Result};

/// Output of WORLD analysis for one waveform.
#[derive(Debug, Clone, Default)]
pub struct WorldFeatures {
    /// Fundamental frequency per frame in Hz; `0` marks unvoiced frames.
    pub f0: Vec<f64>,
    /// Smoothed spectral envelope, `[frames][fft_size / 2 + 1]`.
    pub spectral_envelope: Vec<Vec<f64>>,
    /// Band aperiodicity, same layout as the envelope.
    pub aperiodicity: Vec<Vec<f64>>,
}

impl WorldFeatures {
    pub fn num_frames(&self) -> usize {
        self.f0.len()
    }
}

/// WORLD analysis/synthesis backend.
pub trait Vocoder {
    /// Decompose a mono waveform sampled at `fs` with the given frame period.
    fn analyze(&self, wav: &[f64], fs: u32, frame_period_ms: f64) -> Result<WorldFeatures>;

    /// Compress a spectral envelope to `dim` mel-cepstral coefficients per frame.
    fn encode_spectral_envelope(
        &self,
        spectral_envelope: &[Vec<f64>],
        fs: u32,
        dim: usize,
    ) -> Result<Vec<Vec<f64>>>;

    /// Resynthesize a waveform from F0, coded envelope and aperiodicity.
    fn synthesize(
        &self,
        f0: &[f64],
        coded_sp: &[Vec<f64>],
        aperiodicity: &[Vec<f64>],
        fs: u32,
        frame_period_ms: f64,
    ) -> Result<Vec<f64>>;
}

/// Mean and standard deviation of log-F0 over voiced frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogF0Stats {
    pub mean: f64,
    pub std: f64,
}

/// Map F0 from the source speaker's log-F0 Gaussian onto the target's.
///
/// Unvoiced frames (`f0 <= 0`) stay at zero.
pub fn pitch_conversion(f0: &[f64], source: LogF0Stats, target: LogF0Stats) -> Vec<f64> {
    let scale = if source.std > 0.0 {
        target.std / source.std
    } else {
        0.0
    };
    f0.iter()
        .map(|&f| {
            if f > 0.0 {
                ((f.ln() - source.mean) * scale + target.mean).exp()
            } else {
                0.0
            }
        })
        .collect()
}

/// Log-F0 statistics pooled over several utterances, voiced frames only.
pub fn log_f0_statistics<'a, I>(f0s: I) -> Result<LogF0Stats>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let logs: Vec<f64> = f0s
        .into_iter()
        .flat_map(|f0| f0.iter().copied())
        .filter(|&f| f > 0.0)
        .map(f64::ln)
        .collect();
    if logs.is_empty() {
        return Err(Error::Audio("no voiced frames for log-F0 statistics".into()));
    }
    let n = logs.len() as f64;
    let mean = logs.iter().sum::<f64>() / n;
    let var = logs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Ok(LogF0Stats {
        mean,
        std: var.sqrt(),
    })
}

/// Zero-pad a waveform on both sides so WORLD analysis at `frame_period_ms`
/// yields a frame count divisible by `multiple`.
///
/// WORLD produces `floor(n / hop) + 1` frames for `n` samples; the padded
/// length is chosen as `(k * multiple - 1) * hop` for the smallest `k` that
/// leaves room for the original signal, with one extra block of headroom.
pub fn wav_padding(wav: &[f32], sample_rate: u32, frame_period_ms: f64, multiple: usize) -> Result<Vec<f32>> {
    if multiple == 0 {
        return Err(Error::Audio("padding multiple must be at least 1".into()));
    }
    let hop = sample_rate as f64 * frame_period_ms / 1000.0;
    if hop <= 0.0 {
        return Err(Error::Audio(format!(
            "invalid hop from sample_rate={sample_rate}, frame_period={frame_period_ms}"
        )));
    }
    let multiple = multiple as f64;
    let frames = (wav.len() as f64 / hop).floor() + 1.0;
    let padded_len = (((frames / multiple).ceil() + 1.0) * multiple - 1.0) * hop;
    let padded_len = padded_len as usize;

    let diff = padded_len.saturating_sub(wav.len());
    let left = diff / 2;
    let right = diff - left;

    let mut padded = Vec::with_capacity(wav.len() + diff);
    padded.resize(left, 0.0);
    padded.extend_from_slice(wav);
    padded.resize(left + wav.len() + right, 0.0);
    Ok(padded)
}

/// Number of frames WORLD analysis returns for `num_samples` samples.
pub fn world_frame_count(num_samples: usize, sample_rate: u32, frame_period_ms: f64) -> usize {
    let hop = sample_rate as f64 * frame_period_ms / 1000.0;
    (num_samples as f64 / hop).floor() as usize + 1
}
