//! Error types for beamwise

use thiserror::Error;

/// Result type alias using beamwise's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for beamwise operations.
///
/// Almost every variant is a configuration or capacity problem detected
/// before a step starts. A step that passes validation runs to completion.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error(
        "Vocab size {vocab_size} exceeds {capacity} entries addressable by {n_vocab_parts} parts"
    )]
    VocabTooLarge {
        vocab_size: usize,
        n_vocab_parts: usize,
        capacity: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Workspace too small: {0}")]
    WorkspaceTooSmall(String),

    #[error("Batch slot {slot} out of range (max batch size {max_batch_size})")]
    SlotOutOfRange { slot: usize, max_batch_size: usize },

    #[error(
        "Batch slot {slot} has no room left: sequence length reached {max_seq_len}"
    )]
    SequenceFull { slot: usize, max_seq_len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
