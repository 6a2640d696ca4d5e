//! Training orchestration: losses, optimizer steps, checkpoints, metrics
//! and audio samples.

pub mod checkpoint;
pub mod losses;
pub mod metrics;
pub mod sample;
pub mod solver;

pub use checkpoint::{complete_iterations, latest_iteration, load_checkpoint, save_checkpoint};
pub use losses::IterationLosses;
pub use metrics::{JsonlMetrics, MetricsSink};
pub use sample::Evaluator;
pub use solver::{PairBatch, Solver, TrainSummary};
