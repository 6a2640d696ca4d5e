//! Error types for stargan-vc-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/autodiff error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tensor shape does not match what a network expects.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// A loss evaluated to NaN or infinity. Training cannot continue.
    #[error("non-finite {name} = {value} at iteration {iteration}")]
    NonFinite {
        name: &'static str,
        value: f32,
        iteration: usize,
    },

    /// Missing, incomplete or architecture-incompatible checkpoint.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Feature cache / speaker list problem.
    #[error("dataset: {0}")]
    Dataset(String),

    /// Audio processing error (WAV I/O, padding).
    #[error("audio: {0}")]
    Audio(String),

    /// WORLD analysis/synthesis backend failure.
    #[error("vocoder: {0}")]
    Vocoder(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn dims(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::DimensionMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
