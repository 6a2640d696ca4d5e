//! Model, training, audio and directory configuration.
//!
//! Defaults follow the original StarGAN-VC (AdaIN) training recipe on VCTK:
//! 36-dim MCEPs at 16 kHz, 5 ms frames, 256-frame training crops.
//! Every struct deserializes from JSON with per-field defaults, so a config
//! file only needs to name the values it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Shortest training crop accepted by [`TrainConfig::validate`].
pub const MIN_CROP_FRAMES: usize = 32;

/// Discriminator implementation, selected by name in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscriminatorKind {
    /// Patch discriminator with a (source, target) label projection term.
    #[default]
    Patch,
    /// Same trunk without label conditioning.
    Unconditional,
}

/// Style encoder implementation, selected by name in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleEncoderKind {
    /// Average over time before the style heads.
    #[default]
    MeanPool,
    /// Max over time before the style heads.
    MaxPool,
}

/// Network architecture. Must match between a run and the checkpoints it resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// MCEP dimension `D` of the feature tensors.
    #[serde(default = "default_num_mcep")]
    pub num_mcep: usize,

    /// Number of speakers; fixed by the speaker list.
    #[serde(default = "default_num_speakers")]
    pub num_speakers: usize,

    /// Width of the style/conditioning vector.
    #[serde(default = "default_style_dim")]
    pub style_dim: usize,

    /// Generator base channel count (must be even).
    #[serde(default = "default_gen_conv_dim")]
    pub gen_conv_dim: usize,

    /// Number of AdaIN residual blocks in the generator bottleneck.
    #[serde(default = "default_gen_repeat_num")]
    pub gen_repeat_num: usize,

    /// Discriminator base channel count.
    #[serde(default = "default_dis_conv_dim")]
    pub dis_conv_dim: usize,

    /// Number of strided discriminator blocks.
    #[serde(default = "default_dis_repeat_num")]
    pub dis_repeat_num: usize,

    /// Label embedding width used by the patch discriminator.
    #[serde(default = "default_dis_embed_dim")]
    pub dis_embed_dim: usize,

    /// Style encoder base channel count.
    #[serde(default = "default_enc_conv_dim")]
    pub enc_conv_dim: usize,

    /// Channel cap of the style encoder.
    #[serde(default = "default_enc_max_dim")]
    pub enc_max_dim: usize,

    /// Number of strided style encoder blocks.
    #[serde(default = "default_enc_repeat_num")]
    pub enc_repeat_num: usize,

    #[serde(default)]
    pub discriminator: DiscriminatorKind,

    #[serde(default)]
    pub style_encoder: StyleEncoderKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_mcep: default_num_mcep(),
            num_speakers: default_num_speakers(),
            style_dim: default_style_dim(),
            gen_conv_dim: default_gen_conv_dim(),
            gen_repeat_num: default_gen_repeat_num(),
            dis_conv_dim: default_dis_conv_dim(),
            dis_repeat_num: default_dis_repeat_num(),
            dis_embed_dim: default_dis_embed_dim(),
            enc_conv_dim: default_enc_conv_dim(),
            enc_max_dim: default_enc_max_dim(),
            enc_repeat_num: default_enc_repeat_num(),
            discriminator: DiscriminatorKind::default(),
            style_encoder: StyleEncoderKind::default(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_speakers == 0 {
            return Err(Error::Config("num_speakers must be at least 1".into()));
        }
        if self.num_mcep == 0 || self.style_dim == 0 {
            return Err(Error::Config("num_mcep and style_dim must be non-zero".into()));
        }
        if self.gen_conv_dim < 2 || self.gen_conv_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "gen_conv_dim must be even and >= 2, got {}",
                self.gen_conv_dim
            )));
        }
        if self.dis_conv_dim == 0 || self.enc_conv_dim == 0 || self.enc_max_dim == 0 {
            return Err(Error::Config("channel dims must be non-zero".into()));
        }
        Ok(())
    }

    /// Check that a `frames`-long crop survives every stage of all three
    /// networks with enough length left for the backward pass.
    ///
    /// A stride-1 conv with padding `p` needs `2p + 1` input frames and a
    /// stride-2 conv needs `p + 1` output frames; shorter inputs underflow
    /// the transposed convolution computed for the gradient.
    pub fn check_crop_length(&self, frames: usize) -> Result<()> {
        let halve = |n: usize, times: usize| (0..times).fold(n, |n, _| n.div_ceil(2));
        let mut stages = vec![
            ("generator input", frames, 15),
            ("generator bottleneck", frames / 4, 5),
            ("discriminator mcep axis", self.num_mcep, 3),
        ];
        for k in 1..=self.enc_repeat_num {
            stages.push(("style encoder block", halve(frames, k), 3));
        }
        for k in 1..=self.dis_repeat_num {
            stages.push(("discriminator time axis", halve(frames, k), 2));
            stages.push(("discriminator mcep axis", halve(self.num_mcep, k), 2));
        }
        for (stage, len, needed) in stages {
            if len < needed {
                return Err(Error::Config(format!(
                    "{stage} is {len} long for a {frames}-frame crop, needs at least {needed}: \
                     raise min_length or reduce the repeat counts"
                )));
            }
        }
        Ok(())
    }
}

/// Loss weights, optimizer settings and step schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Weight of the speaker classification loss.
    #[serde(default = "default_lambda_cls")]
    pub lambda_cls: f64,
    /// Weight of the cycle reconstruction loss.
    #[serde(default = "default_lambda_rec")]
    pub lambda_rec: f64,
    /// Gradient penalty weight. Only 0 is supported.
    #[serde(default)]
    pub lambda_gp: f64,
    /// Weight of both adversarial terms.
    #[serde(default = "default_lambda_adv")]
    pub lambda_adv: f64,
    /// Weight of the identity mapping loss until `drop_id_step`.
    #[serde(default = "default_lambda_id")]
    pub lambda_id: f64,
    /// Weight of the style identity loss.
    #[serde(default = "default_lambda_spid")]
    pub lambda_spid: f64,
    /// Train the style encoder with an auxiliary speaker classifier.
    #[serde(default)]
    pub spk_cls: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Crop length in frames (multiple of 4).
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_num_iters")]
    pub num_iters: usize,
    /// Identity loss weight is zero for iterations past this index.
    #[serde(default = "default_drop_id_step")]
    pub drop_id_step: usize,
    /// Length of the final linear decay window.
    #[serde(default = "default_num_iters_decay")]
    pub num_iters_decay: usize,
    /// Enable linear learning-rate decay.
    #[serde(default)]
    pub lr_decay: bool,
    #[serde(default = "default_g_lr")]
    pub g_lr: f64,
    #[serde(default = "default_d_lr")]
    pub d_lr: f64,
    /// Discriminator updates per generator update.
    #[serde(default = "default_n_critic")]
    pub n_critic: usize,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Resume from the checkpoint set saved at this iteration.
    #[serde(default)]
    pub resume_iters: Option<usize>,
    /// Seed for parameter init and batch sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_log_step")]
    pub log_step: usize,
    #[serde(default = "default_sample_step")]
    pub sample_step: usize,
    #[serde(default = "default_model_save_step")]
    pub model_save_step: usize,
    #[serde(default = "default_lr_update_step")]
    pub lr_update_step: usize,
    /// Qualitative samples are written only from this iteration on.
    #[serde(default)]
    pub pretrain_iters: usize,

    /// Prefetch worker threads (0 = load on the training thread).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Maximum number of prefetched batches in flight.
    #[serde(default = "default_prefetch_capacity")]
    pub prefetch_capacity: usize,
    /// Append scalar losses to `log_dir/metrics.jsonl`.
    #[serde(default = "default_use_metrics_log")]
    pub use_metrics_log: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lambda_cls: default_lambda_cls(),
            lambda_rec: default_lambda_rec(),
            lambda_gp: 0.0,
            lambda_adv: default_lambda_adv(),
            lambda_id: default_lambda_id(),
            lambda_spid: default_lambda_spid(),
            spk_cls: false,
            batch_size: default_batch_size(),
            min_length: default_min_length(),
            num_iters: default_num_iters(),
            drop_id_step: default_drop_id_step(),
            num_iters_decay: default_num_iters_decay(),
            lr_decay: false,
            g_lr: default_g_lr(),
            d_lr: default_d_lr(),
            n_critic: default_n_critic(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            resume_iters: None,
            seed: default_seed(),
            log_step: default_log_step(),
            sample_step: default_sample_step(),
            model_save_step: default_model_save_step(),
            lr_update_step: default_lr_update_step(),
            pretrain_iters: 0,
            num_workers: default_num_workers(),
            prefetch_capacity: default_prefetch_capacity(),
            use_metrics_log: default_use_metrics_log(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let steps = [
            ("batch_size", self.batch_size),
            ("n_critic", self.n_critic),
            ("log_step", self.log_step),
            ("sample_step", self.sample_step),
            ("model_save_step", self.model_save_step),
            ("lr_update_step", self.lr_update_step),
        ];
        for (name, value) in steps {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        if self.min_length < MIN_CROP_FRAMES || self.min_length % 4 != 0 {
            return Err(Error::Config(format!(
                "min_length must be a multiple of 4 and at least {MIN_CROP_FRAMES}, got {}",
                self.min_length
            )));
        }
        if self.lambda_gp != 0.0 {
            return Err(Error::Config(
                "lambda_gp must be 0: the gradient penalty needs second-order gradients, \
                 which candle does not provide"
                    .into(),
            ));
        }
        if self.lr_decay && self.num_iters_decay == 0 {
            return Err(Error::Config("lr_decay needs num_iters_decay > 0".into()));
        }
        if let Some(resume) = self.resume_iters
            && resume >= self.num_iters
        {
            return Err(Error::Config(format!(
                "resume_iters ({resume}) must be below num_iters ({})",
                self.num_iters
            )));
        }
        if self.prefetch_capacity == 0 {
            return Err(Error::Config("prefetch_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// WORLD analysis/synthesis settings for sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    #[serde(default = "default_frame_period_ms")]
    pub frame_period_ms: f64,
    /// Maximum mean absolute log-mel difference accepted for copy synthesis.
    #[serde(default = "default_copy_synthesis_tolerance")]
    pub copy_synthesis_tolerance: f64,
    /// Utterances converted at each sampling step.
    #[serde(default = "default_num_eval_utterances")]
    pub num_eval_utterances: usize,
    #[serde(default = "default_test_src_spk")]
    pub test_src_spk: String,
    #[serde(default = "default_test_trg_spk")]
    pub test_trg_spk: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            frame_period_ms: default_frame_period_ms(),
            copy_synthesis_tolerance: default_copy_synthesis_tolerance(),
            num_eval_utterances: default_num_eval_utterances(),
            test_src_spk: default_test_src_spk(),
            test_trg_spk: default_test_trg_spk(),
        }
    }
}

impl AudioConfig {
    /// WORLD hop size in samples.
    pub fn hop_samples(&self) -> f64 {
        self.sampling_rate as f64 * self.frame_period_ms / 1000.0
    }
}

/// Input and output locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirConfig {
    #[serde(default = "default_train_data_dir")]
    pub train_data_dir: PathBuf,
    #[serde(default = "default_test_data_dir")]
    pub test_data_dir: PathBuf,
    #[serde(default = "default_wav_dir")]
    pub wav_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_model_save_dir")]
    pub model_save_dir: PathBuf,
    #[serde(default = "default_sample_dir")]
    pub sample_dir: PathBuf,
    /// JSON speaker list; required.
    #[serde(default)]
    pub speaker_path: Option<PathBuf>,
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            train_data_dir: default_train_data_dir(),
            test_data_dir: default_test_data_dir(),
            wav_dir: default_wav_dir(),
            log_dir: default_log_dir(),
            model_save_dir: default_model_save_dir(),
            sample_dir: default_sample_dir(),
            speaker_path: None,
        }
    }
}

impl DirConfig {
    /// Create log, checkpoint and sample directories.
    pub fn create_output_dirs(&self) -> Result<()> {
        for dir in [&self.log_dir, &self.model_save_dir, &self.sample_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create {}: {e}", dir.display()),
                ))
            })?;
        }
        Ok(())
    }

    /// Speaker list path, or an error when none is configured.
    pub fn speaker_path(&self) -> Result<&Path> {
        self.speaker_path
            .as_deref()
            .ok_or_else(|| Error::Config("speaker_path is required".into()))
    }
}

/// Everything a training run needs, as read from a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub dirs: DirConfig,
}

impl RunConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.train.validate()?;
        self.model.check_crop_length(self.train.min_length)?;
        if self.audio.sampling_rate == 0 || self.audio.frame_period_ms <= 0.0 {
            return Err(Error::Config(
                "sampling_rate and frame_period_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_num_mcep() -> usize {
    36
}
fn default_num_speakers() -> usize {
    10
}
fn default_style_dim() -> usize {
    64
}
fn default_gen_conv_dim() -> usize {
    128
}
fn default_gen_repeat_num() -> usize {
    6
}
fn default_dis_conv_dim() -> usize {
    64
}
fn default_dis_repeat_num() -> usize {
    3
}
fn default_dis_embed_dim() -> usize {
    16
}
fn default_enc_conv_dim() -> usize {
    64
}
fn default_enc_max_dim() -> usize {
    256
}
fn default_enc_repeat_num() -> usize {
    3
}
fn default_lambda_cls() -> f64 {
    10.0
}
fn default_lambda_rec() -> f64 {
    10.0
}
fn default_lambda_adv() -> f64 {
    10.0
}
fn default_lambda_id() -> f64 {
    5.0
}
fn default_lambda_spid() -> f64 {
    5.0
}
fn default_batch_size() -> usize {
    8
}
fn default_min_length() -> usize {
    256
}
fn default_num_iters() -> usize {
    500_000
}
fn default_drop_id_step() -> usize {
    10_000
}
fn default_num_iters_decay() -> usize {
    100_000
}
fn default_g_lr() -> f64 {
    2e-4
}
fn default_d_lr() -> f64 {
    1e-4
}
fn default_n_critic() -> usize {
    1
}
fn default_beta1() -> f64 {
    0.5
}
fn default_beta2() -> f64 {
    0.999
}
fn default_seed() -> u64 {
    1234
}
fn default_log_step() -> usize {
    10
}
fn default_sample_step() -> usize {
    1000
}
fn default_model_save_step() -> usize {
    1000
}
fn default_lr_update_step() -> usize {
    1000
}
fn default_num_workers() -> usize {
    1
}
fn default_prefetch_capacity() -> usize {
    8
}
fn default_use_metrics_log() -> bool {
    true
}
fn default_sampling_rate() -> u32 {
    16000
}
fn default_frame_period_ms() -> f64 {
    5.0
}
fn default_copy_synthesis_tolerance() -> f64 {
    1.0
}
fn default_num_eval_utterances() -> usize {
    10
}
fn default_test_src_spk() -> String {
    "VCC2SF1".to_string()
}
fn default_test_trg_spk() -> String {
    "VCC2SM1".to_string()
}
fn default_train_data_dir() -> PathBuf {
    PathBuf::from("./data/mc/train")
}
fn default_test_data_dir() -> PathBuf {
    PathBuf::from("./data/mc/test")
}
fn default_wav_dir() -> PathBuf {
    PathBuf::from("./data/VCTK-Corpus/wav16")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_model_save_dir() -> PathBuf {
    PathBuf::from("./models")
}
fn default_sample_dir() -> PathBuf {
    PathBuf::from("./samples")
}
