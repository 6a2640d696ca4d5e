//! Per-speaker normalization statistics (`<speaker>_stats.npz`).

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::vocoder::{LogF0Stats, log_f0_statistics};
use crate::{Error, Result};

const KEY_LOG_F0_MEAN: &str = "log_f0s_mean";
const KEY_LOG_F0_STD: &str = "log_f0s_std";
const KEY_MCEP_MEAN: &str = "coded_sps_mean";
const KEY_MCEP_STD: &str = "coded_sps_std";

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerStats {
    pub log_f0_mean: f64,
    pub log_f0_std: f64,
    pub mcep_mean: Vec<f64>,
    pub mcep_std: Vec<f64>,
}

impl SpeakerStats {
    /// Compute statistics from one speaker's analysed utterances.
    ///
    /// `coded_sps` are frame-major MCEPs; mean and std are per dimension over
    /// all frames of all utterances.
    pub fn from_features(f0s: &[Vec<f64>], coded_sps: &[Vec<Vec<f64>>]) -> Result<Self> {
        let LogF0Stats { mean, std } = log_f0_statistics(f0s.iter().map(Vec::as_slice))?;

        let dim = coded_sps
            .iter()
            .flat_map(|utt| utt.iter())
            .map(Vec::len)
            .next()
            .ok_or_else(|| Error::Dataset("no MCEP frames for statistics".into()))?;
        let mut sum = vec![0.0; dim];
        let mut sum_sq = vec![0.0; dim];
        let mut count = 0usize;
        for frame in coded_sps.iter().flat_map(|utt| utt.iter()) {
            if frame.len() != dim {
                return Err(Error::dims("mcep statistics", dim, frame.len()));
            }
            for (d, &v) in frame.iter().enumerate() {
                sum[d] += v;
                sum_sq[d] += v * v;
            }
            count += 1;
        }
        let n = count as f64;
        let mcep_mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let mcep_std = sum_sq
            .iter()
            .zip(&mcep_mean)
            .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
            .collect();

        let stats = Self {
            log_f0_mean: mean,
            log_f0_std: std,
            mcep_mean,
            mcep_std,
        };
        stats.check_spread("computed statistics")?;
        Ok(stats)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::Dataset(format!(
                "speaker statistics not found: {}",
                path.display()
            )));
        }
        let arrays = Tensor::read_npz(path)?;
        let get = |key: &str| -> Result<Vec<f64>> {
            let tensor = arrays
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, t)| t)
                .ok_or_else(|| {
                    Error::Dataset(format!("{} is missing array {key}", path.display()))
                })?;
            Ok(tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
        };

        let scalar = |key: &str| -> Result<f64> {
            get(key)?.first().copied().ok_or_else(|| {
                Error::Dataset(format!("{} has an empty {key}", path.display()))
            })
        };

        let stats = Self {
            log_f0_mean: scalar(KEY_LOG_F0_MEAN)?,
            log_f0_std: scalar(KEY_LOG_F0_STD)?,
            mcep_mean: get(KEY_MCEP_MEAN)?,
            mcep_std: get(KEY_MCEP_STD)?,
        };
        if stats.mcep_mean.len() != stats.mcep_std.len() {
            return Err(Error::dims(
                "speaker statistics",
                stats.mcep_mean.len(),
                stats.mcep_std.len(),
            ));
        }
        stats.check_spread(&path.display().to_string())?;
        Ok(stats)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let device = Device::Cpu;
        let arrays = [
            (KEY_LOG_F0_MEAN, Tensor::new(self.log_f0_mean, &device)?),
            (KEY_LOG_F0_STD, Tensor::new(self.log_f0_std, &device)?),
            (KEY_MCEP_MEAN, Tensor::new(self.mcep_mean.as_slice(), &device)?),
            (KEY_MCEP_STD, Tensor::new(self.mcep_std.as_slice(), &device)?),
        ];
        Tensor::write_npz(&arrays, path)?;
        Ok(())
    }

    pub fn num_mcep(&self) -> usize {
        self.mcep_mean.len()
    }

    pub fn log_f0(&self) -> LogF0Stats {
        LogF0Stats {
            mean: self.log_f0_mean,
            std: self.log_f0_std,
        }
    }

    /// `(x - mean) / std` per dimension, frame-major.
    pub fn normalize(&self, coded_sp: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_dim(coded_sp)?;
        Ok(coded_sp
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .zip(self.mcep_mean.iter().zip(&self.mcep_std))
                    .map(|(x, (m, s))| (x - m) / s)
                    .collect()
            })
            .collect())
    }

    /// Inverse of [`Self::normalize`].
    pub fn denormalize(&self, coded_sp: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_dim(coded_sp)?;
        Ok(coded_sp
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .zip(self.mcep_mean.iter().zip(&self.mcep_std))
                    .map(|(x, (m, s))| x * s + m)
                    .collect()
            })
            .collect())
    }

    /// Every standard deviation must be a positive finite number, otherwise
    /// normalization and pitch conversion divide by zero.
    fn check_spread(&self, origin: &str) -> Result<()> {
        if !(self.log_f0_std.is_finite() && self.log_f0_std > 0.0) {
            return Err(Error::Dataset(format!(
                "{origin}: log-F0 std must be positive, got {}",
                self.log_f0_std
            )));
        }
        if let Some((d, s)) = self
            .mcep_std
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.is_finite() && **s > 0.0))
        {
            return Err(Error::Dataset(format!(
                "{origin}: MCEP dimension {d} has std {s}"
            )));
        }
        Ok(())
    }

    fn check_dim(&self, coded_sp: &[Vec<f64>]) -> Result<()> {
        match coded_sp.iter().find(|f| f.len() != self.num_mcep()) {
            Some(frame) => Err(Error::dims("mcep normalization", self.num_mcep(), frame.len())),
            None => Ok(()),
        }
    }
}
