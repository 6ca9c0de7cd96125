//! Transport error types

use thiserror::Error;

/// Errors raised on the control channel.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("term codec error: {0}")]
    Term(#[from] schema::TermError),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

/// Transport-specific result type.
pub type Result<T> = std::result::Result<T, IpcError>;
