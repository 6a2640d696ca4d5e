//! Audio I/O and spectral helpers for evaluation.

mod mel;
mod wav;

pub use mel::{MelConfig, MelSpectrogram, log_mel_distortion};
pub(crate) use mel::hann_window;
pub use wav::{peak_normalize, read_wav, write_wav_pcm16};
