//! Adversarial training loop.
//!
//! One iteration:
//! 1. discriminator update on (real source, detached conversion);
//! 2. every `n_critic` iterations, a joint generator + style encoder update
//!    on adversarial, cycle, identity, style-identity and (optionally)
//!    speaker-classification losses;
//! 3. logging, checkpointing, sampling and learning-rate updates on their
//!    step boundaries, strictly between updates.

use std::time::{Duration, Instant};

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use super::checkpoint::{load_checkpoint, save_checkpoint};
use super::losses::{self, IterationLosses};
use super::metrics::{JsonlMetrics, MetricsSink};
use super::sample::Evaluator;
use crate::config::{DirConfig, ModelConfig, TrainConfig};
use crate::context::Context;
use crate::data::{BatchSource, HostBatch};
use crate::model::Networks;
use crate::scheduler::{LrSchedule, schedule_for};
use crate::{Error, Result};

/// A training batch on the training device.
pub struct PairBatch {
    /// `[B, D, L]`
    pub src: Tensor,
    /// `u32 [B]`
    pub src_labels: Tensor,
    /// `[B, D, L]`
    pub trg: Tensor,
    /// `u32 [B]`
    pub trg_labels: Tensor,
}

impl PairBatch {
    pub fn from_host(batch: &HostBatch, ctx: &Context) -> Result<Self> {
        let shape = (batch.batch_size, batch.num_mcep, batch.length);
        let features = |data: &[f32]| -> Result<Tensor> {
            Ok(Tensor::from_slice(data, shape, &ctx.device)?.to_dtype(ctx.dtype)?)
        };
        let labels = |data: &[u32]| -> Result<Tensor> {
            Ok(Tensor::from_slice(data, batch.batch_size, &ctx.device)?)
        };
        Ok(Self {
            src: features(&batch.src)?,
            src_labels: labels(&batch.src_labels)?,
            trg: features(&batch.trg)?,
            trg_labels: labels(&batch.trg_labels)?,
        })
    }
}

/// What a call to [`Solver::train`] did.
#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub start_iteration: usize,
    pub iterations_run: usize,
    /// Losses of every iteration that hit a log step.
    pub logged: Vec<IterationLosses>,
    /// One-based iterations at which checkpoint sets were written.
    pub checkpoints: Vec<usize>,
    pub last: Option<IterationLosses>,
}

pub struct Solver {
    model_cfg: ModelConfig,
    cfg: TrainConfig,
    dirs: DirConfig,
    ctx: Context,
    nets: Networks,
    g_optimizer: AdamW,
    d_optimizer: AdamW,
    g_schedule: Box<dyn LrSchedule>,
    d_schedule: Box<dyn LrSchedule>,
    evaluator: Option<Evaluator>,
    metrics: Option<Box<dyn MetricsSink>>,
    start_iters: usize,
}

impl Solver {
    /// Create output directories, build and initialise the networks and
    /// optimizers, and restore `cfg.resume_iters` if set.
    pub fn new(model_cfg: ModelConfig, cfg: TrainConfig, dirs: DirConfig, ctx: Context) -> Result<Self> {
        model_cfg.validate()?;
        cfg.validate()?;
        model_cfg.check_crop_length(cfg.min_length)?;
        dirs.create_output_dirs()?;

        let nets = Networks::new(&model_cfg, &ctx, cfg.seed)?;
        for (name, count) in nets.summary()? {
            tracing::info!(network = name, parameters = count, "built network");
        }

        let adam = |lr: f64| ParamsAdamW {
            lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let mut g_params = nets.g_vars.all_vars();
        g_params.extend(nets.e_vars.all_vars());
        let g_optimizer = AdamW::new(g_params, adam(cfg.g_lr))?;
        let d_optimizer = AdamW::new(nets.d_vars.all_vars(), adam(cfg.d_lr))?;

        let metrics: Option<Box<dyn MetricsSink>> = if cfg.use_metrics_log {
            Some(Box::new(JsonlMetrics::new(dirs.log_dir.join("metrics.jsonl"))?))
        } else {
            None
        };

        let mut solver = Self {
            g_schedule: schedule_for(&cfg, cfg.g_lr),
            d_schedule: schedule_for(&cfg, cfg.d_lr),
            model_cfg,
            cfg,
            dirs,
            ctx,
            nets,
            g_optimizer,
            d_optimizer,
            evaluator: None,
            metrics,
            start_iters: 0,
        };
        if let Some(iteration) = solver.cfg.resume_iters {
            solver.restore(iteration)?;
        }
        Ok(solver)
    }

    /// Enable audio sampling every `sample_step` iterations.
    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Replace the metrics sink.
    pub fn with_metrics(mut self, metrics: Box<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load the checkpoint set saved after `iteration` iterations and continue
    /// from there. Optimizer moments start fresh.
    pub fn restore(&mut self, iteration: usize) -> Result<()> {
        if iteration >= self.cfg.num_iters {
            return Err(Error::Config(format!(
                "cannot resume at {iteration}: num_iters is {}",
                self.cfg.num_iters
            )));
        }
        tracing::info!(iteration, "resuming");
        load_checkpoint(&self.dirs.model_save_dir, iteration, &self.nets)?;
        self.start_iters = iteration;
        self.apply_learning_rates(iteration);
        Ok(())
    }

    pub fn networks(&self) -> &Networks {
        &self.nets
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_cfg
    }

    pub fn start_iteration(&self) -> usize {
        self.start_iters
    }

    /// Current `(generator, discriminator)` learning rates.
    pub fn learning_rates(&self) -> (f64, f64) {
        (self.g_optimizer.learning_rate(), self.d_optimizer.learning_rate())
    }

    /// Run iterations `[start, num_iters)`.
    pub fn train(&mut self, source: &mut dyn BatchSource) -> Result<TrainSummary> {
        let mut summary = TrainSummary {
            start_iteration: self.start_iters,
            ..Default::default()
        };
        tracing::info!(
            start = self.start_iters,
            num_iters = self.cfg.num_iters,
            "Start training..."
        );
        let start_time = Instant::now();

        for i in self.start_iters..self.cfg.num_iters {
            let batch = self.fetch(source, i)?;
            let losses = self.train_step(i, &batch)?;
            let step = i + 1;

            if step % self.cfg.log_step == 0 {
                tracing::info!(
                    "Elapsed [{}], Iteration [{}/{}], {}",
                    format_elapsed(start_time.elapsed()),
                    step,
                    self.cfg.num_iters,
                    losses.format_line()
                );
                if let Some(metrics) = self.metrics.as_mut() {
                    metrics.record(&losses)?;
                }
                summary.logged.push(losses.clone());
            }

            if step % self.cfg.model_save_step == 0 {
                save_checkpoint(&self.dirs.model_save_dir, step, &self.nets)?;
                summary.checkpoints.push(step);
            }

            if step % self.cfg.sample_step == 0
                && i >= self.cfg.pretrain_iters
                && let Some(evaluator) = self.evaluator.as_mut()
            {
                evaluator.run(step, &self.nets, &self.ctx)?;
            }

            self.apply_learning_rates(step);
            summary.iterations_run += 1;
            summary.last = Some(losses);
        }
        self.start_iters = self.cfg.num_iters;
        Ok(summary)
    }

    fn fetch(&self, source: &mut dyn BatchSource, iteration: usize) -> Result<PairBatch> {
        let batch = match source.next_batch()? {
            Some(batch) => batch,
            None => {
                tracing::debug!(iteration, "epoch exhausted, restarting loader");
                source.restart()?;
                source
                    .next_batch()?
                    .ok_or_else(|| Error::Dataset("batch source is empty after restart".into()))?
            }
        };
        PairBatch::from_host(&batch, &self.ctx)
    }

    /// One discriminator update and, on `n_critic` boundaries, one generator
    /// + style encoder update. `i` is the zero-based iteration index.
    pub fn train_step(&mut self, i: usize, batch: &PairBatch) -> Result<IterationLosses> {
        let mut log = IterationLosses::new(i);
        self.discriminator_step(i, batch, &mut log)?;
        if (i + 1) % self.cfg.n_critic == 0 {
            self.generator_step(i, batch, &mut log)?;
        }
        Ok(log)
    }

    fn discriminator_step(&mut self, i: usize, batch: &PairBatch, log: &mut IterationLosses) -> Result<()> {
        let nets = &self.nets;
        let s_src = nets.style_encoder.forward(&batch.src, &batch.src_labels)?.detach();
        let s_trg = nets.style_encoder.forward(&batch.trg, &batch.trg_labels)?.detach();
        let fake = nets.generator.forward(&batch.src, &s_src, &s_trg)?.detach();

        let d_out_fake = nets.discriminator.forward(&fake, &batch.src_labels, &batch.trg_labels)?;
        let d_out_real = nets.discriminator.forward(&batch.src, &batch.trg_labels, &batch.src_labels)?;
        let d_loss_real = losses::least_squares(&d_out_real, 1.0)?;
        let d_loss_fake = losses::least_squares(&d_out_fake, 0.0)?;
        let d_loss = ((&d_loss_real + &d_loss_fake)? * self.cfg.lambda_adv)?;

        log.push("D/loss_real", losses::scalar("D/loss_real", &d_loss_real, i)?);
        log.push("D/loss_fake", losses::scalar("D/loss_fake", &d_loss_fake, i)?);
        log.push("D/loss", losses::scalar("D/loss", &d_loss, i)?);

        self.d_optimizer.backward_step(&d_loss)?;
        Ok(())
    }

    fn generator_step(&mut self, i: usize, batch: &PairBatch, log: &mut IterationLosses) -> Result<()> {
        let nets = &self.nets;
        let cfg = &self.cfg;

        let (s_src, s_trg, cls_loss) = if cfg.spk_cls {
            let (s_trg, logits_trg) = nets
                .style_encoder
                .forward_with_logits(&batch.trg, &batch.trg_labels)?;
            let (s_src, logits_src) = nets
                .style_encoder
                .forward_with_logits(&batch.src, &batch.src_labels)?;
            let cls = (losses::classification(&logits_trg, &batch.trg_labels)?
                + losses::classification(&logits_src, &batch.src_labels)?)?;
            (s_src, s_trg, Some(cls))
        } else {
            (
                nets.style_encoder.forward(&batch.src, &batch.src_labels)?,
                nets.style_encoder.forward(&batch.trg, &batch.trg_labels)?,
                None,
            )
        };

        let fake = nets.generator.forward(&batch.src, &s_src, &s_trg)?;
        let g_out = nets.discriminator.forward(&fake, &batch.src_labels, &batch.trg_labels)?;
        let g_loss_fake = losses::least_squares(&g_out, 1.0)?;

        let reconst = nets.generator.forward(&fake, &s_trg, &s_src)?;
        let g_loss_rec = losses::l1(&batch.src, &reconst)?;

        let identity = nets.generator.forward(&batch.src, &s_src, &s_src)?;
        let g_loss_id = losses::l1(&batch.src, &identity)?;

        let fake_style = nets.style_encoder.forward(&fake, &batch.trg_labels)?;
        let g_loss_stid = losses::l1(&fake_style, &s_trg)?;

        // identity mapping only guides early training
        let lambda_id = if i > cfg.drop_id_step { 0.0 } else { cfg.lambda_id };

        let mut g_loss = (&g_loss_fake * cfg.lambda_adv)?;
        g_loss = (g_loss + (&g_loss_rec * cfg.lambda_rec)?)?;
        g_loss = (g_loss + (&g_loss_id * lambda_id)?)?;
        g_loss = (g_loss + (&g_loss_stid * cfg.lambda_spid)?)?;
        if let Some(cls) = &cls_loss {
            g_loss = (g_loss + (cls * cfg.lambda_cls)?)?;
        }

        log.push("G/loss_fake", losses::scalar("G/loss_fake", &g_loss_fake, i)?);
        log.push("G/loss_rec", losses::scalar("G/loss_rec", &g_loss_rec, i)?);
        log.push("G/loss_id", losses::scalar("G/loss_id", &g_loss_id, i)?);
        log.push("G/loss_stid", losses::scalar("G/loss_stid", &g_loss_stid, i)?);
        if let Some(cls) = &cls_loss {
            log.push("G/spk_cls", losses::scalar("G/spk_cls", cls, i)?);
        }
        losses::scalar("G/loss", &g_loss, i)?;
        log.id_weight = Some(lambda_id);

        self.g_optimizer.backward_step(&g_loss)?;
        Ok(())
    }

    fn apply_learning_rates(&mut self, completed: usize) {
        let g_lr = self.g_schedule.rate(completed);
        let d_lr = self.d_schedule.rate(completed);
        if g_lr != self.g_optimizer.learning_rate() || d_lr != self.d_optimizer.learning_rate() {
            self.g_optimizer.set_learning_rate(g_lr);
            self.d_optimizer.set_learning_rate(d_lr);
            tracing::info!(g_lr, d_lr, iteration = completed, "Decayed learning rates");
        }
    }
}

/// `H:MM:SS`, like a truncated `timedelta`.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
