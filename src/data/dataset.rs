//! Source/target pair sampling over the normalized MCEP cache.
//!
//! Layout on disk: `<train_dir>/<speaker>/<utt>.npy`, each a `[T, D]` array
//! of per-speaker normalized MCEPs (f32 or f64). In memory every utterance is
//! stored channel-major, `[D, T]`, which is what the networks consume.

use std::path::Path;

use candle_core::{DType, Tensor};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::data::SpeakerList;
use crate::{Error, Result};

/// One utterance of normalized features, `[num_mcep, num_frames]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub name: String,
    pub num_frames: usize,
    pub features: Vec<f32>,
}

impl Utterance {
    pub fn new(name: impl Into<String>, num_mcep: usize, features: Vec<f32>) -> Result<Self> {
        if num_mcep == 0 || features.len() % num_mcep != 0 {
            return Err(Error::dims("utterance features", num_mcep, features.len()));
        }
        Ok(Self {
            name: name.into(),
            num_frames: features.len() / num_mcep,
            features,
        })
    }

    /// Read a cached `[T, D]` `.npy` file and transpose it to `[D, T]`.
    pub fn read_npy(path: impl AsRef<Path>, num_mcep: usize) -> Result<Self> {
        let path = path.as_ref();
        let array = Tensor::read_npy(path)?.to_dtype(DType::F32)?;
        let dims = array.dims().to_vec();
        if dims.len() != 2 || dims[1] != num_mcep {
            return Err(Error::Dataset(format!(
                "{}: expected [T, {num_mcep}] features, found {dims:?}",
                path.display()
            )));
        }
        let features = array.t()?.contiguous()?.flatten_all()?.to_vec1::<f32>()?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(name, num_mcep, features)
    }

    /// Copy frames `[start, start + len)` into `out`, channel-major.
    fn crop_into(&self, num_mcep: usize, start: usize, len: usize, out: &mut Vec<f32>) {
        for d in 0..num_mcep {
            let row = d * self.num_frames;
            out.extend_from_slice(&self.features[row + start..row + start + len]);
        }
    }
}

/// Host-side training batch, built off the training thread.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub batch_size: usize,
    pub num_mcep: usize,
    pub length: usize,
    /// `[B, D, L]` row-major.
    pub src: Vec<f32>,
    pub src_labels: Vec<u32>,
    /// `[B, D, L]` row-major.
    pub trg: Vec<f32>,
    pub trg_labels: Vec<u32>,
}

/// All usable utterances, grouped by speaker label.
#[derive(Debug)]
pub struct PairDataset {
    speakers: SpeakerList,
    by_speaker: Vec<Vec<Utterance>>,
    /// `(speaker, utterance)` for every usable utterance, in load order.
    index: Vec<(usize, usize)>,
    num_mcep: usize,
    min_length: usize,
}

impl PairDataset {
    /// Load `<train_dir>/<speaker>/*.npy` for every listed speaker.
    ///
    /// Utterances shorter than `min_length` frames are skipped.
    pub fn load(
        train_dir: impl AsRef<Path>,
        speakers: &SpeakerList,
        num_mcep: usize,
        min_length: usize,
    ) -> Result<Self> {
        let train_dir = train_dir.as_ref();
        let mut by_speaker = Vec::with_capacity(speakers.len());
        for name in speakers.names() {
            let dir = train_dir.join(name);
            if !dir.is_dir() {
                tracing::warn!(speaker = %name, dir = %dir.display(), "no feature directory for speaker");
                by_speaker.push(Vec::new());
                continue;
            }
            let mut paths: Vec<_> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "npy"))
                .collect();
            paths.sort();

            let mut utterances = Vec::with_capacity(paths.len());
            let mut skipped = 0usize;
            for path in paths {
                let utt = Utterance::read_npy(&path, num_mcep)?;
                if utt.num_frames < min_length {
                    skipped += 1;
                    continue;
                }
                utterances.push(utt);
            }
            tracing::debug!(speaker = %name, kept = utterances.len(), skipped, "loaded features");
            by_speaker.push(utterances);
        }
        Self::from_utterances(speakers.clone(), by_speaker, num_mcep, min_length)
    }

    /// Build from in-memory utterances, one list per speaker label.
    pub fn from_utterances(
        speakers: SpeakerList,
        by_speaker: Vec<Vec<Utterance>>,
        num_mcep: usize,
        min_length: usize,
    ) -> Result<Self> {
        if by_speaker.len() != speakers.len() {
            return Err(Error::dims("utterance groups", speakers.len(), by_speaker.len()));
        }
        let mut index = Vec::new();
        for (spk, utts) in by_speaker.iter().enumerate() {
            for (u, utt) in utts.iter().enumerate() {
                if utt.features.len() != num_mcep * utt.num_frames {
                    return Err(Error::dims(
                        "utterance features",
                        num_mcep * utt.num_frames,
                        utt.features.len(),
                    ));
                }
                if utt.num_frames < min_length {
                    return Err(Error::Dataset(format!(
                        "utterance {} has {} frames, fewer than min_length {min_length}",
                        utt.name, utt.num_frames
                    )));
                }
                index.push((spk, u));
            }
        }
        if index.is_empty() {
            return Err(Error::Dataset(format!(
                "no utterances with at least {min_length} frames"
            )));
        }
        tracing::info!(
            speakers = speakers.len(),
            utterances = index.len(),
            "training set ready"
        );
        Ok(Self {
            speakers,
            by_speaker,
            index,
            num_mcep,
            min_length,
        })
    }

    /// Number of usable utterances.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn speakers(&self) -> &SpeakerList {
        &self.speakers
    }

    pub fn num_mcep(&self) -> usize {
        self.num_mcep
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Batches per epoch (incomplete trailing batch dropped).
    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len() / batch_size
        }
    }

    /// Batch number `sequence` of the stream seeded by `seed`.
    ///
    /// A pure function of its arguments, so any worker can build any batch.
    pub fn batch(&self, seed: u64, sequence: u64, batch_size: usize) -> HostBatch {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(sequence);
        self.sample_batch(&mut rng, batch_size)
    }

    /// Draw `batch_size` (source, target) pairs cropped to `min_length`.
    ///
    /// Sources are uniform over utterances; targets come from a uniformly
    /// chosen other speaker that has data, or the source speaker when no
    /// other speaker does.
    pub fn sample_batch<R: Rng>(&self, rng: &mut R, batch_size: usize) -> HostBatch {
        let len = self.min_length;
        let per_item = self.num_mcep * len;
        let mut batch = HostBatch {
            batch_size,
            num_mcep: self.num_mcep,
            length: len,
            src: Vec::with_capacity(batch_size * per_item),
            src_labels: Vec::with_capacity(batch_size),
            trg: Vec::with_capacity(batch_size * per_item),
            trg_labels: Vec::with_capacity(batch_size),
        };

        let candidates: Vec<usize> = (0..self.by_speaker.len())
            .filter(|&s| !self.by_speaker[s].is_empty())
            .collect();

        for _ in 0..batch_size {
            let (src_spk, src_utt) = self.index[rng.random_range(0..self.index.len())];
            let others: Vec<usize> = candidates.iter().copied().filter(|&s| s != src_spk).collect();
            let trg_spk = if others.is_empty() {
                src_spk
            } else {
                others[rng.random_range(0..others.len())]
            };
            let trg_utt = rng.random_range(0..self.by_speaker[trg_spk].len());

            self.push_crop(rng, src_spk, src_utt, &mut batch.src);
            self.push_crop(rng, trg_spk, trg_utt, &mut batch.trg);
            batch.src_labels.push(src_spk as u32);
            batch.trg_labels.push(trg_spk as u32);
        }
        batch
    }

    fn push_crop<R: Rng>(&self, rng: &mut R, spk: usize, utt: usize, out: &mut Vec<f32>) {
        let utterance = &self.by_speaker[spk][utt];
        let start = rng.random_range(0..=utterance.num_frames - self.min_length);
        utterance.crop_into(self.num_mcep, start, self.min_length, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(name: &str, num_mcep: usize, frames: usize, offset: f32) -> Utterance {
        let features = (0..num_mcep * frames).map(|i| offset + i as f32).collect();
        Utterance::new(name, num_mcep, features).unwrap()
    }

    fn dataset(num_speakers: usize) -> PairDataset {
        let names = (0..num_speakers).map(|i| format!("spk{i}")).collect();
        let speakers = SpeakerList::new(names).unwrap();
        let by_speaker = (0..num_speakers)
            .map(|s| {
                vec![
                    ramp("a", 3, 10, 1000.0 * s as f32),
                    ramp("b", 3, 12, 1000.0 * s as f32 + 500.0),
                ]
            })
            .collect();
        PairDataset::from_utterances(speakers, by_speaker, 3, 8).unwrap()
    }

    #[test]
    fn test_batch_shapes() {
        let ds = dataset(3);
        let batch = ds.batch(7, 0, 4);
        assert_eq!(batch.src.len(), 4 * 3 * 8);
        assert_eq!(batch.trg.len(), 4 * 3 * 8);
        assert_eq!(batch.src_labels.len(), 4);
        assert_eq!(ds.batches_per_epoch(4), 1);
    }

    #[test]
    fn test_source_and_target_differ() {
        let ds = dataset(4);
        for seq in 0..20 {
            let batch = ds.batch(1, seq, 4);
            for (s, t) in batch.src_labels.iter().zip(&batch.trg_labels) {
                assert_ne!(s, t);
            }
        }
    }

    #[test]
    fn test_single_speaker_pairs_with_itself() {
        let ds = dataset(1);
        let batch = ds.batch(1, 0, 2);
        assert_eq!(batch.src_labels, batch.trg_labels);
    }

    #[test]
    fn test_batches_are_reproducible() {
        let ds = dataset(3);
        assert_eq!(ds.batch(42, 5, 3), ds.batch(42, 5, 3));
        assert_ne!(ds.batch(42, 5, 3), ds.batch(42, 6, 3));
    }

    #[test]
    fn test_crops_are_contiguous_rows() {
        let ds = dataset(2);
        let batch = ds.batch(3, 0, 1);
        // each channel row of a crop is a run of consecutive ramp values
        for row in batch.src.chunks(8) {
            for w in row.windows(2) {
                assert_eq!(w[1] - w[0], 1.0);
            }
        }
    }

    #[test]
    fn test_short_utterance_rejected() {
        let speakers = SpeakerList::new(vec!["a".into()]).unwrap();
        let result = PairDataset::from_utterances(speakers, vec![vec![ramp("x", 3, 4, 0.0)]], 3, 8);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_npy_cache() {
        let dir = tempfile::tempdir().unwrap();
        let device = candle_core::Device::Cpu;
        for (spk, frames) in [("s1", 20usize), ("s2", 6)] {
            let spk_dir = dir.path().join(spk);
            std::fs::create_dir_all(&spk_dir).unwrap();
            let t = Tensor::arange(0f32, (frames * 3) as f32, &device)
                .unwrap()
                .reshape((frames, 3))
                .unwrap();
            t.write_npy(spk_dir.join("utt1.npy")).unwrap();
        }
        let speakers = SpeakerList::new(vec!["s1".into(), "s2".into()]).unwrap();
        let ds = PairDataset::load(dir.path(), &speakers, 3, 8).unwrap();
        // s2's utterance is shorter than min_length
        assert_eq!(ds.len(), 1);
        let utt = &ds.by_speaker[0][0];
        assert_eq!(utt.num_frames, 20);
        // transposed to [D, T]: first row is every third value
        assert_eq!(&utt.features[..3], &[0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_wrong_mcep_dim_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let spk_dir = dir.path().join("s1");
        std::fs::create_dir_all(&spk_dir).unwrap();
        Tensor::zeros((10, 5), DType::F32, &candle_core::Device::Cpu)
            .unwrap()
            .write_npy(spk_dir.join("u.npy"))
            .unwrap();
        let speakers = SpeakerList::new(vec!["s1".into()]).unwrap();
        assert!(PairDataset::load(dir.path(), &speakers, 3, 4).is_err());
    }
}
