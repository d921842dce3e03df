use crate::block::Uid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid block uid {uid} (graph holds {len} blocks)")]
    InvalidUid { uid: Uid, len: usize },

    #[error("Dangling {relation} reference from block {from} to uid {to}")]
    DanglingReference {
        from: Uid,
        to: Uid,
        relation: &'static str,
    },

    #[error("Range {offset}+{length} exceeds block size {size}")]
    InvalidRange { offset: u64, length: u64, size: u64 },

    #[error("Content unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt structure: {0}")]
    Corrupt(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Plugin panicked: {0}")]
    PluginPanic(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
