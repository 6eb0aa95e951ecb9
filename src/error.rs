//! Error types for minikv.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KvError>;

/// All errors the engine can surface.
#[derive(Debug, Error)]
pub enum KvError {
    /// Underlying I/O failure (sockets, log file, snapshot file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed RESP input that cannot be recovered from.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Append-only log failure (init, rewrite, replay).
    #[error("append log error: {0}")]
    Aof(String),

    /// Snapshot file failed an integrity check during load.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for conditions that do not fit the variants above.
    #[error("{0}")]
    Other(String),
}

impl KvError {
    /// True when the error came from the I/O layer.
    pub fn is_io(&self) -> bool {
        matches!(self, KvError::Io(_))
    }
}
