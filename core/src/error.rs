//! Engine error types

use thiserror::Error;

/// Errors surfaced by the supervisor engine itself. Per-command
/// failures are not errors at this level; they become `{error, Reason}`
/// replies on the wire.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spawn failed: {0}")]
    Spawn(#[from] crate::spawn::SpawnError),
}

/// Engine-specific result type.
pub type Result<T> = std::result::Result<T, CoreError>;
