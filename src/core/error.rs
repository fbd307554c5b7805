use thiserror::Error;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Debug, Error)]
pub enum InvalidId {
    #[error("invalid node id {raw:?}: {reason}")]
    Node { raw: String, reason: String },
    #[error("invalid area id {raw:?}: {reason}")]
    Area { raw: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("invalid record for key {key:?}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}
