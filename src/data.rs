//! Training data: speaker list, normalization statistics, pair sampling
//! and batch loaders.

mod dataset;
mod eval;
mod loader;
mod speakers;
mod stats;

pub use dataset::{HostBatch, PairDataset, Utterance};
pub use eval::{EvalSet, EvalUtterance};
pub use loader::{BatchSource, Prefetcher, SequentialLoader, make_loader};
pub use speakers::SpeakerList;
pub use stats::SpeakerStats;
