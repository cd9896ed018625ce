//! Error types for registry and session operations.

use thiserror::Error;

/// All errors that can originate from the session registry.
#[derive(Debug, Error)]
pub enum CoreError {
    /// PTY allocation or child-process spawn failed.
    #[error("failed to start PTY: {0}")]
    PtySpawn(String),

    /// No session with that name exists (or it is already shutting down).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session with that name already exists.
    #[error("session already exists: {0}")]
    NameTaken(String),

    /// Session name is empty, too long, or contains control characters.
    #[error("invalid session name")]
    InvalidName,

    /// The client's outbound queue is full or its connection is gone.
    #[error("client cannot accept messages")]
    ClientUnavailable,

    /// Underlying I/O failure (PTY read, write, resize).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CoreError>;
