use thiserror::Error;

/// All failures surfaced by the model.
///
/// Construction problems are reported as [`Error::Configuration`]; every
/// other variant is raised by the forward call that hit it. Nothing is
/// retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid hyperparameters, e.g. `d_model` not divisible by `num_heads`.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A token id does not index into the embedding table.
    #[error("token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: i64, vocab_size: i64 },

    /// Input sequence is longer than the positional table.
    #[error("sequence length {len} exceeds maximum {max}")]
    SequenceTooLong { len: i64, max: i64 },

    /// A tensor does not have the expected shape.
    #[error("shape mismatch: expected {expected}, got {got:?}")]
    ShapeMismatch { expected: String, got: Vec<i64> },

    /// The mask cannot be broadcast to the attention score shape.
    #[error("mask of shape {mask:?} cannot broadcast to attention scores {scores:?}")]
    MaskShapeMismatch { mask: Vec<i64>, scores: Vec<i64> },

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// True for the index-out-of-range class (bad token id or sequence too long).
    pub fn is_index_out_of_range(&self) -> bool {
        matches!(self, Error::TokenOutOfRange { .. } | Error::SequenceTooLong { .. })
    }

    /// True for the shape-mismatch class.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, Error::ShapeMismatch { .. } | Error::MaskShapeMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
