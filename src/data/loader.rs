//! Batch sources for the training loop.
//!
//! Both loaders deliver the same sequence of batches for a given seed:
//! batch `n` is always `PairDataset::batch(seed, n, batch_size)`. The
//! prefetcher only changes where the work happens.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::data::{HostBatch, PairDataset};
use crate::{Error, Result};

/// Epoch-structured stream of host batches.
pub trait BatchSource {
    /// Next batch of the current epoch, or `None` once the epoch is exhausted.
    fn next_batch(&mut self) -> Result<Option<HostBatch>>;

    /// Start a new epoch.
    fn restart(&mut self) -> Result<()>;
}

/// Position bookkeeping shared by both loaders.
#[derive(Debug, Clone, Copy)]
struct EpochCursor {
    next_sequence: u64,
    position: usize,
    epoch_len: usize,
}

impl EpochCursor {
    fn new(start_sequence: u64, epoch_len: usize) -> Self {
        let position = if epoch_len == 0 {
            0
        } else {
            (start_sequence % epoch_len as u64) as usize
        };
        Self {
            next_sequence: start_sequence,
            position,
            epoch_len,
        }
    }

    fn advance(&mut self) -> Option<u64> {
        if self.position >= self.epoch_len {
            return None;
        }
        self.position += 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(sequence)
    }

    fn restart(&mut self) {
        self.position = 0;
    }
}

/// Builds each batch on the calling thread.
pub struct SequentialLoader {
    dataset: Arc<PairDataset>,
    seed: u64,
    batch_size: usize,
    cursor: EpochCursor,
}

impl SequentialLoader {
    /// `start_sequence` is the index of the first batch to deliver, so a
    /// resumed run can continue the stream where it stopped.
    pub fn new(dataset: Arc<PairDataset>, batch_size: usize, seed: u64, start_sequence: u64) -> Self {
        let epoch_len = dataset.batches_per_epoch(batch_size);
        Self {
            dataset,
            seed,
            batch_size,
            cursor: EpochCursor::new(start_sequence, epoch_len),
        }
    }
}

impl BatchSource for SequentialLoader {
    fn next_batch(&mut self) -> Result<Option<HostBatch>> {
        Ok(self
            .cursor
            .advance()
            .map(|seq| self.dataset.batch(self.seed, seq, self.batch_size)))
    }

    fn restart(&mut self) -> Result<()> {
        self.cursor.restart();
        Ok(())
    }
}

/// Worker pool that builds batches ahead of the training loop.
///
/// Workers claim sequence numbers from a shared counter and push finished
/// batches into a bounded channel; the consumer reorders them so delivery
/// order does not depend on thread scheduling.
pub struct Prefetcher {
    rx: Option<mpsc::Receiver<(u64, HostBatch)>>,
    pending: BTreeMap<u64, HostBatch>,
    cursor: EpochCursor,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn new(
        dataset: Arc<PairDataset>,
        batch_size: usize,
        seed: u64,
        start_sequence: u64,
        num_workers: usize,
        capacity: usize,
    ) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::Config("prefetcher needs at least one worker".into()));
        }
        let epoch_len = dataset.batches_per_epoch(batch_size);
        let (tx, rx) = mpsc::channel::<(u64, HostBatch)>(capacity.max(1));
        let counter = Arc::new(AtomicU64::new(start_sequence));
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        for worker in 0..num_workers {
            let dataset = Arc::clone(&dataset);
            let counter = Arc::clone(&counter);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("prefetch-{worker}"))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let seq = counter.fetch_add(1, Ordering::Relaxed);
                        let batch = dataset.batch(seed, seq, batch_size);
                        if tx.blocking_send((seq, batch)).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }
        tracing::debug!(num_workers, capacity, epoch_len, "prefetcher started");

        Ok(Self {
            rx: Some(rx),
            pending: BTreeMap::new(),
            cursor: EpochCursor::new(start_sequence, epoch_len),
            stop,
            workers,
        })
    }
}

impl BatchSource for Prefetcher {
    fn next_batch(&mut self) -> Result<Option<HostBatch>> {
        let Some(seq) = self.cursor.advance() else {
            return Ok(None);
        };
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| Error::Dataset("prefetcher already shut down".into()))?;
        loop {
            if let Some(batch) = self.pending.remove(&seq) {
                return Ok(Some(batch));
            }
            match rx.blocking_recv() {
                Some((n, batch)) => {
                    self.pending.insert(n, batch);
                }
                None => return Err(Error::Dataset("prefetch workers exited".into())),
            }
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.cursor.restart();
        Ok(())
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Closing the receiver wakes workers blocked on a full channel.
        drop(self.rx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Loader matching `num_workers`: in-thread for 0, a prefetcher otherwise.
pub fn make_loader(
    dataset: Arc<PairDataset>,
    batch_size: usize,
    seed: u64,
    start_sequence: u64,
    num_workers: usize,
    capacity: usize,
) -> Result<Box<dyn BatchSource>> {
    if dataset.batches_per_epoch(batch_size) == 0 {
        return Err(Error::Dataset(format!(
            "{} utterances cannot fill a batch of {batch_size}",
            dataset.len()
        )));
    }
    if num_workers == 0 {
        Ok(Box::new(SequentialLoader::new(
            dataset,
            batch_size,
            seed,
            start_sequence,
        )))
    } else {
        Ok(Box::new(Prefetcher::new(
            dataset,
            batch_size,
            seed,
            start_sequence,
            num_workers,
            capacity,
        )?))
    }
}
