//! Shared fixtures: a tiny model and a synthetic feature set.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use stargan_vc_rs::config::{DirConfig, ModelConfig, TrainConfig};
use stargan_vc_rs::data::{PairDataset, SpeakerList, Utterance};

pub const NUM_MCEP: usize = 8;
pub const MIN_LENGTH: usize = 32;
pub const SPEAKERS: [&str; 4] = ["p225", "p226", "p227", "p228"];

pub fn speakers() -> SpeakerList {
    SpeakerList::new(SPEAKERS.iter().map(|s| s.to_string()).collect()).unwrap()
}

pub fn tiny_model() -> ModelConfig {
    ModelConfig {
        num_mcep: NUM_MCEP,
        num_speakers: SPEAKERS.len(),
        style_dim: 4,
        gen_conv_dim: 4,
        gen_repeat_num: 1,
        dis_conv_dim: 4,
        dis_repeat_num: 2,
        dis_embed_dim: 4,
        enc_conv_dim: 4,
        enc_max_dim: 8,
        enc_repeat_num: 2,
        ..Default::default()
    }
}

pub fn tiny_train(num_iters: usize) -> TrainConfig {
    TrainConfig {
        batch_size: 2,
        min_length: MIN_LENGTH,
        num_iters,
        n_critic: 1,
        drop_id_step: 5,
        log_step: 1,
        model_save_step: 5,
        sample_step: 1000,
        lr_update_step: 1,
        num_workers: 0,
        seed: 7,
        ..Default::default()
    }
}

pub fn dirs(root: &Path) -> DirConfig {
    DirConfig {
        train_data_dir: root.join("train"),
        test_data_dir: root.join("test"),
        wav_dir: root.join("wav"),
        log_dir: root.join("logs"),
        model_save_dir: root.join("models"),
        sample_dir: root.join("samples"),
        speaker_path: None,
    }
}

/// Smooth, speaker-dependent features, `[NUM_MCEP, frames]` channel-major.
pub fn utterance(speaker: usize, index: usize, frames: usize) -> Utterance {
    let mut features = Vec::with_capacity(NUM_MCEP * frames);
    for d in 0..NUM_MCEP {
        for t in 0..frames {
            let phase = (t as f32 * 0.3) + d as f32 * 0.7 + index as f32;
            features.push((phase.sin() * 0.5) + speaker as f32 * 0.1 - 0.15);
        }
    }
    Utterance::new(format!("{}_{index:03}", SPEAKERS[speaker]), NUM_MCEP, features).unwrap()
}

/// Two utterances per speaker, eight in total.
pub fn dataset() -> Arc<PairDataset> {
    let by_speaker = (0..SPEAKERS.len())
        .map(|spk| (0..2).map(|i| utterance(spk, i, 40 + 4 * i)).collect())
        .collect();
    Arc::new(PairDataset::from_utterances(speakers(), by_speaker, NUM_MCEP, MIN_LENGTH).unwrap())
}
