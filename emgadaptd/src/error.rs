//! Session error taxonomy.
//!
//! `StreamUnavailable` and `HandshakeTimeout` are fatal at startup.
//! `ContextTimeout` and `Training` are absorbed by the adaptation loop.

use std::io;
use std::time::Duration;

use emgadapt::classifier::TrainingError;
use emgadapt::memory::MemoryError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("no READY from the consumer within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no context message within {0:?}")]
    ContextTimeout(Duration),

    #[error("training failed: {0}")]
    Training(#[from] TrainingError),

    /// Malformed batch or memory snapshot (includes `ShapeMismatch`).
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SessionError {
    /// Whether this error ends the session (vs. being recovered in place).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::ContextTimeout(_) | SessionError::Training(_) | SessionError::Memory(_)
        )
    }
}
