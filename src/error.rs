//! Error types for cycle-VAE training.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CycleVaeError {
    #[error("shape mismatch for {tensor}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("malformed sample {location}: {reason}")]
    MalformedSample { location: String, reason: String },

    #[error("sample source has {len} samples, fewer than one batch of {batch_size}")]
    SourceTooSmall { len: usize, batch_size: usize },

    #[error("checkpoint missing tensor {0}")]
    CheckpointMissing(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CycleVaeError {
    pub fn shape(tensor: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        CycleVaeError::ShapeMismatch {
            tensor,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        CycleVaeError::MalformedSample {
            location: location.into(),
            reason: reason.into(),
        }
    }
}
