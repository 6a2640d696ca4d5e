//! Pure-Rust source-filter backend on the WORLD frame grid.
//!
//! F0 comes from normalized autocorrelation, the envelope from a cepstrally
//! liftered power spectrum and aperiodicity from voicing strength (one value
//! per frame, repeated over bins). Envelopes are coded the way WORLD codes
//! them: log power sampled on a mel axis, then an orthonormal DCT-II.
//! Synthesis shapes a pulse/noise excitation per frame in the frequency
//! domain and overlap-adds the result.

use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use super::{Vocoder, WorldFeatures, world_frame_count};
use crate::audio::hann_window;
use crate::{Error, Result};

/// Lowest frequency on the coded envelope's mel axis.
const CODING_FLOOR_HZ: f64 = 40.0;
const POWER_FLOOR: f64 = 1e-12;
/// Mean of the squared Hann window.
const HANN_POWER: f64 = 0.375;
/// Autocorrelation peaks within this fraction of the best one count as the
/// fundamental, so the shortest such lag wins over its subharmonics.
const SUBHARMONIC_TOLERANCE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralConfig {
    /// Lowest F0 searched; also sets the FFT size.
    pub f0_floor: f64,
    pub f0_ceil: f64,
    /// Minimum normalized autocorrelation for a voiced frame.
    pub voicing_threshold: f64,
    /// Frames quieter than this RMS are unvoiced.
    pub silence_rms: f64,
    pub noise_seed: u64,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            f0_floor: 71.0,
            f0_ceil: 800.0,
            voicing_threshold: 0.5,
            silence_rms: 1e-4,
            noise_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpectralVocoder {
    config: SpectralConfig,
}

impl SpectralVocoder {
    pub fn new(config: SpectralConfig) -> Result<Self> {
        let SpectralConfig {
            f0_floor,
            f0_ceil,
            voicing_threshold,
            silence_rms,
            ..
        } = config;
        if !(f0_floor > 0.0 && f0_ceil > f0_floor && f0_ceil.is_finite()) {
            return Err(Error::Audio(format!(
                "invalid F0 search range {f0_floor}..{f0_ceil} Hz"
            )));
        }
        if !(voicing_threshold > 0.0 && voicing_threshold <= 1.0) {
            return Err(Error::Audio(format!(
                "voicing threshold must be in (0, 1], got {voicing_threshold}"
            )));
        }
        if !(silence_rms >= 0.0) {
            return Err(Error::Audio(format!("invalid silence RMS {silence_rms}")));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.config
    }

    fn lifter(&self, fs: u32, n: usize) -> usize {
        ((fs as f64 / self.config.f0_ceil).floor() as usize).clamp(1, n / 2 - 1)
    }

    fn detect_pitch(&self, wav: &[f64], center: isize, fs: f64) -> Pitch {
        let min_lag = ((fs / self.config.f0_ceil).floor() as usize).max(2);
        let max_lag = ((fs / self.config.f0_floor).ceil() as usize).max(min_lag + 1);
        let len = max_lag;
        let start = center - max_lag as isize;
        let seg: Vec<f64> = (0..2 * max_lag + 1)
            .map(|i| sample(wav, start + i as isize))
            .collect();
        let rms = (seg.iter().map(|x| x * x).sum::<f64>() / seg.len() as f64).sqrt();
        let energy: f64 = seg[..len].iter().map(|x| x * x).sum();

        let corr = |lag: usize| {
            let (mut xy, mut yy) = (0.0, 0.0);
            for i in 0..len {
                let y = seg[i + lag];
                xy += seg[i] * y;
                yy += y * y;
            }
            let denom = (energy * yy).sqrt();
            if denom > 0.0 { xy / denom } else { 0.0 }
        };
        let lags: Vec<usize> = (min_lag - 1..=max_lag + 1).collect();
        let r: Vec<f64> = lags.iter().map(|&lag| corr(lag)).collect();

        let peaks: Vec<usize> = (1..r.len() - 1)
            .filter(|&j| r[j] > 0.0 && r[j] >= r[j - 1] && r[j] >= r[j + 1])
            .collect();
        let best = peaks.iter().map(|&j| r[j]).fold(0.0, f64::max);
        let Some(&j) = peaks
            .iter()
            .find(|&&j| r[j] >= SUBHARMONIC_TOLERANCE * best)
        else {
            return Pitch { f0: 0.0, strength: 0.0, rms };
        };

        let curvature = r[j - 1] - 2.0 * r[j] + r[j + 1];
        let offset = if curvature < 0.0 {
            (0.5 * (r[j - 1] - r[j + 1]) / curvature).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        Pitch {
            f0: fs / (lags[j] as f64 + offset),
            strength: r[j],
            rms,
        }
    }

    fn excitation(
        &self,
        f0: &[f64],
        aperiodicity: &[f64],
        fs: f64,
        hop: f64,
        half: usize,
        len: usize,
    ) -> Vec<f64> {
        let sigma = 1.0 / (HANN_POWER * (2 * half) as f64).sqrt();
        let uniform_scale = 3f64.sqrt() * sigma;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.noise_seed);
        let mut phase = 1.0;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let pos = i as f64 - half as f64;
            let t = ((pos / hop).round().max(0.0) as usize).min(f0.len() - 1);
            let noise = rng.random_range(-1.0f64..1.0) * uniform_scale;
            let f = f0[t];
            if f <= 0.0 {
                phase = 1.0;
                out.push(noise);
                continue;
            }
            phase += f / fs;
            let pulse = if phase >= 1.0 {
                phase -= phase.floor();
                (fs / f).sqrt() * sigma
            } else {
                0.0
            };
            let a = aperiodicity[t];
            out.push((1.0 - a).sqrt() * pulse + a.sqrt() * noise);
        }
        out
    }
}

struct Pitch {
    f0: f64,
    strength: f64,
    rms: f64,
}

/// FFT length CheapTrick uses: three periods of `f0_floor`, rounded up past
/// the next power of two.
pub fn fft_size(fs: u32, f0_floor: f64) -> usize {
    let periods = 3.0 * fs as f64 / f0_floor;
    1usize << (1 + periods.log2().floor().max(0.0) as u32)
}

fn hop_length(fs: u32, frame_period_ms: f64) -> Result<f64> {
    let hop = fs as f64 * frame_period_ms / 1000.0;
    if !(hop >= 1.0) || !hop.is_finite() {
        return Err(Error::Audio(format!(
            "invalid hop from sample_rate={fs}, frame_period={frame_period_ms}"
        )));
    }
    Ok(hop)
}

fn sample(wav: &[f64], index: isize) -> f64 {
    usize::try_from(index)
        .ok()
        .and_then(|i| wav.get(i))
        .copied()
        .unwrap_or(0.0)
}

fn hz_to_mel(hz: f64) -> f64 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// `dim` mel-spaced frequencies from the coding floor up to Nyquist.
fn coding_axis(fs: u32, dim: usize) -> Result<Vec<f64>> {
    let nyquist = fs as f64 / 2.0;
    if dim == 0 || nyquist <= CODING_FLOOR_HZ {
        return Err(Error::Audio(format!(
            "cannot code an envelope at {fs} Hz into {dim} coefficients"
        )));
    }
    let lo = hz_to_mel(CODING_FLOOR_HZ);
    let hi = hz_to_mel(nyquist);
    if dim == 1 {
        return Ok(vec![mel_to_hz(0.5 * (lo + hi))]);
    }
    Ok((0..dim)
        .map(|j| mel_to_hz(lo + (hi - lo) * j as f64 / (dim - 1) as f64))
        .collect())
}

/// Piecewise-linear interpolation over ascending `xs`, held flat outside.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let last = xs.len() - 1;
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[last] {
        return ys[last];
    }
    let i = xs.partition_point(|&v| v <= x).clamp(1, last);
    let w = (x - xs[i - 1]) / (xs[i] - xs[i - 1]);
    ys[i - 1] + w * (ys[i] - ys[i - 1])
}

fn bin_frequencies(fs: u32, bins: usize) -> Vec<f64> {
    let step = fs as f64 / (2 * (bins - 1)) as f64;
    (0..bins).map(|k| k as f64 * step).collect()
}

fn dct_scale(k: usize, n: usize) -> f64 {
    if k == 0 {
        (1.0 / n as f64).sqrt()
    } else {
        (2.0 / n as f64).sqrt()
    }
}

/// Orthonormal DCT-II.
fn dct(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    (0..n)
        .map(|k| {
            let sum: f64 = x
                .iter()
                .enumerate()
                .map(|(j, v)| v * (PI * k as f64 * (j as f64 + 0.5) / n as f64).cos())
                .sum();
            dct_scale(k, n) * sum
        })
        .collect()
}

/// Inverse of [`dct`].
fn idct(c: &[f64]) -> Vec<f64> {
    let n = c.len();
    (0..n)
        .map(|j| {
            c.iter()
                .enumerate()
                .map(|(k, v)| dct_scale(k, n) * v * (PI * k as f64 * (j as f64 + 0.5) / n as f64).cos())
                .sum()
        })
        .collect()
}

/// Linear-frequency power envelope with `bins` bins from coded coefficients.
fn decode_envelope(coded: &[f64], axis: &[f64], fs: u32, bins: usize) -> Vec<f64> {
    let logs = idct(coded);
    bin_frequencies(fs, bins)
        .into_iter()
        .map(|f| interpolate(axis, &logs, f).exp())
        .collect()
}

impl Vocoder for SpectralVocoder {
    fn analyze(&self, wav: &[f64], fs: u32, frame_period_ms: f64) -> Result<WorldFeatures> {
        let hop = hop_length(fs, frame_period_ms)?;
        let n = fft_size(fs, self.config.f0_floor);
        let bins = n / 2 + 1;
        let half = (n / 2) as isize;
        let frames = world_frame_count(wav.len(), fs, frame_period_ms);
        let window = hann_window(n);
        let lifter = self.lifter(fs, n);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);

        let mut features = WorldFeatures {
            f0: Vec::with_capacity(frames),
            spectral_envelope: Vec::with_capacity(frames),
            aperiodicity: Vec::with_capacity(frames),
        };
        for t in 0..frames {
            let center = (t as f64 * hop).round() as isize;
            let pitch = self.detect_pitch(wav, center, fs as f64);
            let voiced = pitch.strength >= self.config.voicing_threshold
                && pitch.rms >= self.config.silence_rms
                && (self.config.f0_floor..=self.config.f0_ceil).contains(&pitch.f0);

            let mut buf: Vec<Complex<f64>> = (0..n)
                .map(|i| Complex::new(sample(wav, center - half + i as isize) * window[i], 0.0))
                .collect();
            fft.process(&mut buf);
            for c in buf.iter_mut() {
                *c = Complex::new((c.norm_sqr() + POWER_FLOOR).ln(), 0.0);
            }
            ifft.process(&mut buf);
            for c in &mut buf[lifter + 1..n - lifter] {
                *c = Complex::new(0.0, 0.0);
            }
            fft.process(&mut buf);
            let scale = 1.0 / n as f64;
            features
                .spectral_envelope
                .push(buf[..bins].iter().map(|c| (c.re * scale).exp()).collect());

            let ap = if voiced {
                (1.0 - pitch.strength).clamp(1e-3, 1.0)
            } else {
                1.0
            };
            features.f0.push(if voiced { pitch.f0 } else { 0.0 });
            features.aperiodicity.push(vec![ap; bins]);
        }
        Ok(features)
    }

    fn encode_spectral_envelope(
        &self,
        spectral_envelope: &[Vec<f64>],
        fs: u32,
        dim: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let axis = coding_axis(fs, dim)?;
        spectral_envelope
            .iter()
            .map(|frame| {
                if frame.len() < 2 {
                    return Err(Error::Audio(format!(
                        "spectral envelope frame has {} bins, need at least 2",
                        frame.len()
                    )));
                }
                let freqs = bin_frequencies(fs, frame.len());
                let logs: Vec<f64> = frame.iter().map(|&p| p.max(POWER_FLOOR).ln()).collect();
                let sampled: Vec<f64> = axis.iter().map(|&f| interpolate(&freqs, &logs, f)).collect();
                Ok(dct(&sampled))
            })
            .collect()
    }

    fn synthesize(
        &self,
        f0: &[f64],
        coded_sp: &[Vec<f64>],
        aperiodicity: &[Vec<f64>],
        fs: u32,
        frame_period_ms: f64,
    ) -> Result<Vec<f64>> {
        let hop = hop_length(fs, frame_period_ms)?;
        let frames = f0.len();
        if coded_sp.len() != frames || aperiodicity.len() != frames {
            return Err(Error::Audio(format!(
                "synthesis inputs disagree: {frames} F0 frames, {} envelope frames, {} aperiodicity frames",
                coded_sp.len(),
                aperiodicity.len()
            )));
        }
        let Some(dim) = coded_sp.first().map(Vec::len) else {
            return Ok(Vec::new());
        };
        if let Some(t) = coded_sp.iter().position(|c| c.len() != dim) {
            return Err(Error::Audio(format!(
                "coded envelope frame {t} has {} coefficients, expected {dim}",
                coded_sp[t].len()
            )));
        }
        let axis = coding_axis(fs, dim)?;

        let n = fft_size(fs, self.config.f0_floor);
        let half = n / 2;
        let bins = half + 1;
        let window = hann_window(n);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);

        let ap_mean: Vec<f64> = aperiodicity
            .iter()
            .map(|row| {
                if row.is_empty() {
                    1.0
                } else {
                    (row.iter().sum::<f64>() / row.len() as f64).clamp(0.0, 1.0)
                }
            })
            .collect();
        let out_len = ((frames - 1) as f64 * hop).round() as usize + 1;
        let excitation = self.excitation(f0, &ap_mean, fs as f64, hop, half, out_len + n);

        let mut out = vec![0.0; out_len];
        let mut weight = vec![0.0; out_len];
        let scale = 1.0 / n as f64;
        for (t, coded) in coded_sp.iter().enumerate() {
            let amplitude: Vec<f64> = decode_envelope(coded, &axis, fs, bins)
                .into_iter()
                .map(f64::sqrt)
                .collect();
            let center = (t as f64 * hop).round() as usize;
            // excitation[i] is output sample i - half
            let mut buf: Vec<Complex<f64>> = (0..n)
                .map(|i| Complex::new(excitation[center + i] * window[i], 0.0))
                .collect();
            fft.process(&mut buf);
            for (k, c) in buf.iter_mut().enumerate() {
                *c *= amplitude[k.min(n - k)];
            }
            ifft.process(&mut buf);
            for (i, c) in buf.iter().enumerate() {
                let Some(pos) = (center + i).checked_sub(half) else {
                    continue;
                };
                if pos >= out_len {
                    break;
                }
                out[pos] += c.re * scale;
                weight[pos] += window[i];
            }
        }
        for (y, w) in out.iter_mut().zip(&weight) {
            if *w > 1e-3 {
                *y /= w;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: u32 = 16000;
    const FRAME_MS: f64 = 5.0;

    fn tone(freq: f64, samples: usize, amplitude: f64) -> Vec<f64> {
        (0..samples)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / FS as f64).sin())
            .collect()
    }

    fn noise(samples: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..samples).map(|_| rng.random_range(-0.1f64..0.1)).collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    fn median(mut x: Vec<f64>) -> f64 {
        x.sort_by(f64::total_cmp);
        x[x.len() / 2]
    }

    #[test]
    fn test_fft_size_follows_f0_floor() {
        assert_eq!(fft_size(16000, 71.0), 1024);
        assert_eq!(fft_size(24000, 71.0), 1024);
        assert_eq!(fft_size(48000, 71.0), 2048);
    }

    #[test]
    fn test_new_rejects_bad_range() {
        let bad = SpectralConfig {
            f0_floor: 300.0,
            f0_ceil: 100.0,
            ..SpectralConfig::default()
        };
        assert!(SpectralVocoder::new(bad).is_err());
        assert!(SpectralVocoder::new(SpectralConfig::default()).is_ok());
    }

    #[test]
    fn test_tone_f0_tracked() {
        let vocoder = SpectralVocoder::default();
        let wav = tone(200.0, 8000, 0.5);
        let features = vocoder.analyze(&wav, FS, FRAME_MS).unwrap();
        assert_eq!(features.num_frames(), world_frame_count(wav.len(), FS, FRAME_MS));
        assert_eq!(features.spectral_envelope[0].len(), 513);
        for t in 5..features.num_frames() - 5 {
            let f0 = features.f0[t];
            assert!((f0 - 200.0).abs() < 4.0, "frame {t}: f0={f0}");
            assert!(features.aperiodicity[t][0] < 0.1);
        }
    }

    #[test]
    fn test_silence_unvoiced() {
        let vocoder = SpectralVocoder::default();
        let features = vocoder.analyze(&vec![0.0; 4000], FS, FRAME_MS).unwrap();
        assert!(features.f0.iter().all(|&f| f == 0.0));
        assert!(features.aperiodicity.iter().flatten().all(|&a| a == 1.0));
        assert!(
            features
                .spectral_envelope
                .iter()
                .flatten()
                .all(|&p| p.is_finite() && p > 0.0)
        );
    }

    #[test]
    fn test_constant_envelope_codes_to_dc() {
        let vocoder = SpectralVocoder::default();
        let sp = vec![vec![2.0; 513]; 3];
        let coded = vocoder.encode_spectral_envelope(&sp, FS, 16).unwrap();
        assert_eq!(coded.len(), 3);
        for frame in &coded {
            assert_eq!(frame.len(), 16);
            assert!((frame[0] - 4.0 * 2f64.ln()).abs() < 1e-9);
            assert!(frame[1..].iter().all(|c| c.abs() < 1e-9));
        }
    }

    #[test]
    fn test_smooth_envelope_survives_coding() {
        let vocoder = SpectralVocoder::default();
        let freqs = bin_frequencies(FS, 513);
        let envelope: Vec<f64> = freqs.iter().map(|f| (-f / 2000.0).exp()).collect();
        let coded = vocoder
            .encode_spectral_envelope(std::slice::from_ref(&envelope), FS, 36)
            .unwrap();
        let axis = coding_axis(FS, 36).unwrap();
        let decoded = decode_envelope(&coded[0], &axis, FS, 513);
        for (k, (a, b)) in envelope.iter().zip(&decoded).enumerate() {
            assert!((a.ln() - b.ln()).abs() < 0.05, "bin {k}: {a} vs {b}");
        }
    }

    #[test]
    fn test_synthesis_length_and_shape_checks() {
        let vocoder = SpectralVocoder::default();
        let f0 = vec![0.0; 11];
        let coded = vec![vec![0.0; 24]; 11];
        let ap = vec![vec![1.0; 513]; 11];
        let wav = vocoder.synthesize(&f0, &coded, &ap, FS, FRAME_MS).unwrap();
        assert_eq!(wav.len(), 801);
        assert!(wav.iter().all(|s| s.is_finite()));

        assert!(vocoder.synthesize(&f0, &coded, &ap[..10], FS, FRAME_MS).is_err());
        let mut ragged = coded.clone();
        ragged[3].pop();
        assert!(vocoder.synthesize(&f0, &ragged, &ap, FS, FRAME_MS).is_err());
    }

    #[test]
    fn test_noise_copy_synthesis_keeps_level() {
        let vocoder = SpectralVocoder::default();
        let wav = noise(8000, 3);
        let features = vocoder.analyze(&wav, FS, FRAME_MS).unwrap();
        let coded = vocoder
            .encode_spectral_envelope(&features.spectral_envelope, FS, 40)
            .unwrap();
        let out = vocoder
            .synthesize(&features.f0, &coded, &features.aperiodicity, FS, FRAME_MS)
            .unwrap();
        assert_eq!(out.len(), 8001);
        let ratio = rms(&out) / rms(&wav);
        assert!((0.3..3.0).contains(&ratio), "rms ratio {ratio}");
    }

    #[test]
    fn test_tone_resynthesis_keeps_pitch() {
        let vocoder = SpectralVocoder::default();
        let wav = tone(200.0, 8000, 0.5);
        let features = vocoder.analyze(&wav, FS, FRAME_MS).unwrap();
        let coded = vocoder
            .encode_spectral_envelope(&features.spectral_envelope, FS, 36)
            .unwrap();
        let out = vocoder
            .synthesize(&features.f0, &coded, &features.aperiodicity, FS, FRAME_MS)
            .unwrap();
        let again = vocoder.analyze(&out, FS, FRAME_MS).unwrap();
        let middle: Vec<f64> = again.f0[10..again.num_frames() - 10].to_vec();
        let f0 = median(middle);
        assert!((f0 - 200.0).abs() < 5.0, "median f0 {f0}");
    }
}
