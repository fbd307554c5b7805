use thiserror::Error;

use crate::core::Transience;

/// Admin-surface error for local store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("unknown area {0:?}")]
    UnknownArea(String),

    #[error("set with empty key_vals")]
    EmptyKeyVals,

    #[error("invalid record for key {key:?}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("area loop did not reply within the read timeout")]
    Timeout,

    #[error("store is stopped")]
    Stopped,
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Timeout => Transience::Retryable,
            StoreError::UnknownArea(_)
            | StoreError::EmptyKeyVals
            | StoreError::InvalidRecord { .. }
            | StoreError::Stopped => Transience::Permanent,
        }
    }
}
