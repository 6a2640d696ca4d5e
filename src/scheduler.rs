//! Learning-rate schedules for the two optimizers.
//!
//! Rates are a closed-form function of the number of completed iterations,
//! so a resumed run lands on exactly the rate an uninterrupted run would have.

use crate::config::TrainConfig;

/// Learning rate after `completed` iterations.
pub trait LrSchedule: Send {
    fn rate(&self, completed: usize) -> f64;
}

/// Fixed learning rate.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub f64);

impl LrSchedule for Constant {
    fn rate(&self, _completed: usize) -> f64 {
        self.0
    }
}

/// Constant until the last `decay_iters` iterations, then linear to zero.
///
/// The rate only changes on multiples of `update_step`, mirroring a loop
/// that subtracts `base * update_step / decay_iters` every `update_step`
/// iterations inside the decay window.
#[derive(Debug, Clone, Copy)]
pub struct LinearDecay {
    pub base: f64,
    pub num_iters: usize,
    pub decay_iters: usize,
    pub update_step: usize,
}

impl LrSchedule for LinearDecay {
    fn rate(&self, completed: usize) -> f64 {
        let decay_start = self.num_iters.saturating_sub(self.decay_iters);
        let step = self.update_step.max(1);
        let boundary = completed / step * step;
        if boundary <= decay_start || self.decay_iters == 0 {
            return self.base;
        }
        let elapsed = (boundary - decay_start) as f64;
        (self.base * (1.0 - elapsed / self.decay_iters as f64)).max(0.0)
    }
}

/// Schedule for a base rate under `cfg`.
pub fn schedule_for(cfg: &TrainConfig, base: f64) -> Box<dyn LrSchedule> {
    if cfg.lr_decay {
        Box::new(LinearDecay {
            base,
            num_iters: cfg.num_iters,
            decay_iters: cfg.num_iters_decay,
            update_step: cfg.lr_update_step,
        })
    } else {
        Box::new(Constant(base))
    }
}
