//! Error taxonomy shared by every resharding component.
//!
//! Components (copier, players, verifier) report failures as job/task state;
//! the coordinator surfaces them through `ReshardError` so callers can tell a
//! premature migration apart from a data mismatch or a flaky tablet.

use thiserror::Error;

/// Coarse error class with a stable process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    ConsistencyMismatch,
    Transient,
    Corruption,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Precondition => 2,
            ErrorKind::ConsistencyMismatch => 3,
            ErrorKind::Transient => 4,
            ErrorKind::Corruption => 5,
            ErrorKind::Other => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReshardError {
    /// An ordering rule or topology invariant would be violated. Nothing was changed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Destination data does not match its sources.
    #[error("consistency mismatch on shard {shard}: {details}")]
    ConsistencyMismatch { shard: String, details: String },

    /// Tablet or topology temporarily unavailable; safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A change or row that cannot be routed or applied.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReshardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReshardError::Precondition(_) => ErrorKind::Precondition,
            ReshardError::ConsistencyMismatch { .. } => ErrorKind::ConsistencyMismatch,
            ReshardError::Transient(_) => ErrorKind::Transient,
            ReshardError::Corruption(_) => ErrorKind::Corruption,
            ReshardError::NotFound(_)
            | ReshardError::InvalidArgument(_)
            | ReshardError::Storage(_)
            | ReshardError::Codec(_)
            | ReshardError::Io(_) => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T, E = ReshardError> = std::result::Result<T, E>;

/// Shorthand for `Err(ReshardError::Precondition(format!(..)))`.
#[macro_export]
macro_rules! precondition {
    ($($arg:tt)*) => {
        return Err($crate::error::ReshardError::Precondition(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failure_classes() {
        let codes = [
            ReshardError::Precondition("x".into()).kind().exit_code(),
            ReshardError::ConsistencyMismatch {
                shard: "80-c0".into(),
                details: "x".into(),
            }
            .kind()
            .exit_code(),
            ReshardError::Transient("x".into()).kind().exit_code(),
            ReshardError::Corruption("x".into()).kind().exit_code(),
            ReshardError::NotFound("x".into()).kind().exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 1]);
        assert!(ReshardError::Transient("down".into()).is_retryable());
        assert!(!ReshardError::Corruption("bad".into()).is_retryable());
    }
}
