//! Held-out utterances converted at each sampling step.

use std::path::{Path, PathBuf};

use crate::audio::read_wav;
use crate::config::{AudioConfig, DirConfig};
use crate::data::{SpeakerList, SpeakerStats, Utterance};
use crate::vocoder::wav_padding;
use crate::{Error, Result};

/// One source utterance plus the reference features used to derive styles.
#[derive(Debug, Clone)]
pub struct EvalUtterance {
    pub name: String,
    /// Source waveform, padded so WORLD yields a multiple of 4 frames.
    pub wav: Vec<f32>,
    /// Normalized features of this utterance (source style reference).
    pub src_reference: Utterance,
    /// Normalized features of a target-speaker utterance (target style reference).
    pub trg_reference: Utterance,
}

/// Fixed source -> target evaluation pair.
#[derive(Debug, Clone)]
pub struct EvalSet {
    pub src_speaker: String,
    pub src_label: u32,
    pub trg_speaker: String,
    pub trg_label: u32,
    pub src_stats: SpeakerStats,
    pub trg_stats: SpeakerStats,
    pub utterances: Vec<EvalUtterance>,
}

impl EvalSet {
    /// Collect up to `audio.num_eval_utterances` source utterances that have
    /// both cached test features and a WAV file.
    ///
    /// Statistics come from `<train_data_dir>/<spk>_stats.npz`; target style
    /// references cycle through the target speaker's test features.
    pub fn load(
        dirs: &DirConfig,
        audio: &AudioConfig,
        speakers: &SpeakerList,
        num_mcep: usize,
    ) -> Result<Self> {
        let label = |name: &str| {
            speakers
                .label_of(name)
                .ok_or_else(|| Error::Dataset(format!("evaluation speaker {name} not in speaker list")))
        };
        let src_label = label(&audio.test_src_spk)?;
        let trg_label = label(&audio.test_trg_spk)?;

        let stats_path =
            |spk: &str| dirs.train_data_dir.join(format!("{spk}_stats.npz"));
        let src_stats = SpeakerStats::load(stats_path(&audio.test_src_spk))?;
        let trg_stats = SpeakerStats::load(stats_path(&audio.test_trg_spk))?;

        let src_feats = npy_files(&dirs.test_data_dir.join(&audio.test_src_spk))?;
        let trg_feats = npy_files(&dirs.test_data_dir.join(&audio.test_trg_spk))?;
        if trg_feats.is_empty() {
            return Err(Error::Dataset(format!(
                "no test features for target speaker {}",
                audio.test_trg_spk
            )));
        }

        let mut utterances = Vec::new();
        for (i, feat_path) in src_feats.iter().enumerate() {
            if utterances.len() >= audio.num_eval_utterances {
                break;
            }
            let stem = feat_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let wav_path = dirs.wav_dir.join(&audio.test_src_spk).join(format!("{stem}.wav"));
            if !wav_path.is_file() {
                tracing::debug!(wav = %wav_path.display(), "no waveform for test utterance, skipping");
                continue;
            }
            let (wav, sr) = read_wav(&wav_path)?;
            if sr != audio.sampling_rate {
                return Err(Error::Audio(format!(
                    "{} is {sr} Hz, expected {} Hz",
                    wav_path.display(),
                    audio.sampling_rate
                )));
            }
            let wav = wav_padding(&wav, sr, audio.frame_period_ms, 4)?;
            let src_reference = Utterance::read_npy(feat_path, num_mcep)?;
            let trg_reference = Utterance::read_npy(&trg_feats[i % trg_feats.len()], num_mcep)?;
            utterances.push(EvalUtterance {
                name: stem,
                wav,
                src_reference,
                trg_reference,
            });
        }
        if utterances.is_empty() {
            return Err(Error::Dataset(format!(
                "no evaluation utterances for {} (features in {}, audio in {})",
                audio.test_src_spk,
                dirs.test_data_dir.display(),
                dirs.wav_dir.display()
            )));
        }
        tracing::info!(
            src = %audio.test_src_spk,
            trg = %audio.test_trg_spk,
            utterances = utterances.len(),
            "evaluation set ready"
        );

        Ok(Self {
            src_speaker: audio.test_src_spk.clone(),
            src_label,
            trg_speaker: audio.test_trg_spk.clone(),
            trg_label,
            src_stats,
            trg_stats,
            utterances,
        })
    }
}

fn npy_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "npy"))
        .collect();
    files.sort();
    Ok(files)
}
