//! StarGAN-VC training CLI.
//!
//! Trains the generator, style encoder and discriminator on a cached MCEP
//! training set (`<train-data-dir>/<speaker>/*.npy`), writing checkpoint sets
//! to `--model-save-dir` and scalar losses to `<log-dir>/metrics.jsonl`.
//!
//! Settings come from an optional JSON `--config` file; flags given on the
//! command line override it. Conversion samples for the configured
//! evaluation pair are written every `--sample-step` iterations unless
//! `--no-sampling` is set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use stargan_vc_rs::{
    Context,
    config::{DiscriminatorKind, RunConfig, StyleEncoderKind},
    data::{EvalSet, PairDataset, SpeakerList, make_loader},
    train::{Evaluator, Solver, latest_iteration},
    vocoder::{SpectralConfig, SpectralVocoder},
};

#[derive(Parser, Debug)]
#[command(
    name = "stargan-vc",
    about = "StarGAN-VC voice conversion training",
    long_about = "Train a style-conditioned StarGAN-VC model on normalized MCEP features.\n\
                  Flags override values from --config."
)]
struct Args {
    /// JSON run configuration (model / train / audio / dirs sections).
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON array of speaker ids; label i is the i-th entry.
    #[arg(long)]
    speaker_path: Option<PathBuf>,

    #[arg(long)]
    train_data_dir: Option<PathBuf>,

    #[arg(long)]
    test_data_dir: Option<PathBuf>,

    #[arg(long)]
    wav_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    model_save_dir: Option<PathBuf>,

    #[arg(long)]
    sample_dir: Option<PathBuf>,

    #[arg(long)]
    num_iters: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Training crop length in frames (multiple of 4).
    #[arg(long)]
    min_length: Option<usize>,

    #[arg(long)]
    g_lr: Option<f64>,

    #[arg(long)]
    d_lr: Option<f64>,

    #[arg(long)]
    n_critic: Option<usize>,

    #[arg(long)]
    lambda_adv: Option<f64>,

    #[arg(long)]
    lambda_rec: Option<f64>,

    #[arg(long)]
    lambda_id: Option<f64>,

    #[arg(long)]
    lambda_spid: Option<f64>,

    #[arg(long)]
    lambda_cls: Option<f64>,

    /// Identity loss weight drops to zero after this iteration.
    #[arg(long)]
    drop_id_step: Option<usize>,

    /// Train the style encoder with an auxiliary speaker classifier.
    #[arg(long)]
    spk_cls: bool,

    /// Decay both learning rates linearly over the last num_iters_decay iterations.
    #[arg(long)]
    lr_decay: bool,

    #[arg(long)]
    num_iters_decay: Option<usize>,

    /// Iteration to resume from, or "latest" for the newest complete checkpoint set.
    #[arg(long)]
    resume_iters: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    log_step: Option<usize>,

    #[arg(long)]
    model_save_step: Option<usize>,

    #[arg(long)]
    sample_step: Option<usize>,

    /// Batch prefetch threads (0 loads on the training thread).
    #[arg(long)]
    num_workers: Option<usize>,

    /// Skip conversion samples (no test features or WAVs needed).
    #[arg(long)]
    no_sampling: bool,

    /// "patch" or "unconditional".
    #[arg(long, value_parser = parse_discriminator)]
    discriminator: Option<DiscriminatorKind>,

    /// "mean_pool" or "max_pool".
    #[arg(long, value_parser = parse_style_encoder)]
    style_encoder: Option<StyleEncoderKind>,

    /// "cpu", "cuda" or "cuda:N". CUDA falls back to CPU when unavailable.
    #[arg(long, default_value = "cuda")]
    device: String,
}

fn parse_discriminator(s: &str) -> Result<DiscriminatorKind, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn parse_style_encoder(s: &str) -> Result<StyleEncoderKind, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn parse_device(s: &str) -> anyhow::Result<Context> {
    match s {
        "cpu" => Ok(Context::cpu()),
        "cuda" => Ok(Context::preferred(0)),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .with_context(|| format!("invalid --device '{other}'"))?;
            Ok(Context::preferred(ordinal))
        }
    }
}

impl Args {
    fn apply(&self, cfg: &mut RunConfig) {
        macro_rules! set {
            ($src:ident => $dst:expr) => {
                if let Some(v) = self.$src.clone() {
                    $dst = v;
                }
            };
        }
        set!(train_data_dir => cfg.dirs.train_data_dir);
        set!(test_data_dir => cfg.dirs.test_data_dir);
        set!(wav_dir => cfg.dirs.wav_dir);
        set!(log_dir => cfg.dirs.log_dir);
        set!(model_save_dir => cfg.dirs.model_save_dir);
        set!(sample_dir => cfg.dirs.sample_dir);
        set!(num_iters => cfg.train.num_iters);
        set!(batch_size => cfg.train.batch_size);
        set!(min_length => cfg.train.min_length);
        set!(g_lr => cfg.train.g_lr);
        set!(d_lr => cfg.train.d_lr);
        set!(n_critic => cfg.train.n_critic);
        set!(lambda_adv => cfg.train.lambda_adv);
        set!(lambda_rec => cfg.train.lambda_rec);
        set!(lambda_id => cfg.train.lambda_id);
        set!(lambda_spid => cfg.train.lambda_spid);
        set!(lambda_cls => cfg.train.lambda_cls);
        set!(drop_id_step => cfg.train.drop_id_step);
        set!(num_iters_decay => cfg.train.num_iters_decay);
        set!(seed => cfg.train.seed);
        set!(log_step => cfg.train.log_step);
        set!(model_save_step => cfg.train.model_save_step);
        set!(sample_step => cfg.train.sample_step);
        set!(num_workers => cfg.train.num_workers);
        set!(discriminator => cfg.model.discriminator);
        set!(style_encoder => cfg.model.style_encoder);
        if self.speaker_path.is_some() {
            cfg.dirs.speaker_path = self.speaker_path.clone();
        }
        if self.spk_cls {
            cfg.train.spk_cls = true;
        }
        if self.lr_decay {
            cfg.train.lr_decay = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => RunConfig::from_json_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => RunConfig::default(),
    };
    args.apply(&mut cfg);

    cfg.dirs
        .create_output_dirs()
        .context("failed to create output directories")?;

    cfg.train.resume_iters = match args.resume_iters.as_deref() {
        None => cfg.train.resume_iters,
        Some("latest") => {
            let latest = latest_iteration(&cfg.dirs.model_save_dir)?;
            if latest.is_none() {
                tracing::warn!(dir = %cfg.dirs.model_save_dir.display(), "no complete checkpoint set, starting from scratch");
            }
            latest
        }
        Some(n) => Some(
            n.parse::<usize>()
                .with_context(|| format!("invalid --resume-iters '{n}'"))?,
        ),
    };

    let speaker_path = cfg.dirs.speaker_path()?.to_path_buf();
    let speakers = SpeakerList::load(&speaker_path)
        .with_context(|| format!("failed to load speaker list {}", speaker_path.display()))?;
    cfg.model.num_speakers = speakers.len();
    cfg.validate()?;
    tracing::info!(speakers = ?speakers.names(), "speaker list");

    let ctx = parse_device(&args.device)?;
    tracing::info!(device = ?ctx.device, "training device");

    let dataset = Arc::new(
        PairDataset::load(
            &cfg.dirs.train_data_dir,
            &speakers,
            cfg.model.num_mcep,
            cfg.train.min_length,
        )
        .context("failed to load training features")?,
    );

    let mut solver = Solver::new(cfg.model.clone(), cfg.train.clone(), cfg.dirs.clone(), ctx)?;
    if args.no_sampling {
        tracing::info!("audio sampling disabled");
    } else {
        let eval = EvalSet::load(&cfg.dirs, &cfg.audio, &speakers, cfg.model.num_mcep)
            .context("failed to load evaluation set (pass --no-sampling to skip)")?;
        tracing::info!(
            src = %cfg.audio.test_src_spk,
            trg = %cfg.audio.test_trg_spk,
            utterances = eval.utterances.len(),
            "evaluation set"
        );
        let vocoder = SpectralVocoder::new(SpectralConfig {
            noise_seed: cfg.train.seed,
            ..SpectralConfig::default()
        })?;
        solver = solver.with_evaluator(Evaluator::new(
            Box::new(vocoder),
            eval,
            cfg.audio.clone(),
            &cfg.dirs.sample_dir,
            cfg.model.num_mcep,
        ));
    }

    let mut loader = make_loader(
        dataset,
        cfg.train.batch_size,
        cfg.train.seed,
        solver.start_iteration() as u64,
        cfg.train.num_workers,
        cfg.train.prefetch_capacity,
    )?;

    let summary = solver.train(loader.as_mut())?;
    tracing::info!(
        iterations = summary.iterations_run,
        checkpoints = summary.checkpoints.len(),
        "training finished"
    );
    if let Some(last) = summary.last {
        println!(
            "{}",
            serde_json::json!({
                "iteration": last.iteration + 1,
                "losses": last
                    .entries()
                    .iter()
                    .map(|(tag, value)| (tag.to_string(), *value))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            })
        );
    }
    Ok(())
}
