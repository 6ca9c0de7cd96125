//! Control-channel transport
//!
//! This crate owns the byte-level transport between the warden daemon
//! and its controlling peer: a codec for 2-byte big-endian
//! length-prefixed term frames, and helpers that take ownership of the
//! inherited descriptors the peer talks through.

pub mod codec;
mod error;

pub use codec::{PortCodec, MAX_FRAME_SIZE};
pub use error::{IpcError, Result};

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use tokio::net::unix::pipe;

/// Descriptor pair used by default: stdin for requests, stdout for
/// replies and events.
pub const STDIO_FDS: (RawFd, RawFd) = (0, 1);

/// Descriptor pair selected by the `-n` startup flag, leaving stdio
/// free for the child processes to inherit.
pub const ALT_FDS: (RawFd, RawFd) = (3, 4);

/// Take ownership of the control descriptors and wrap them in
/// non-blocking pipe halves.
///
/// Call once at startup. The returned halves own the descriptors and
/// close them on drop; the descriptors must be pipes (they are when a
/// peer runtime spawned us as a port process).
pub fn control_channel(use_alt_fds: bool) -> Result<(pipe::Receiver, pipe::Sender)> {
    let (read_fd, write_fd) = if use_alt_fds { ALT_FDS } else { STDIO_FDS };
    // SAFETY: startup is the only owner of these inherited descriptors;
    // nothing else in the process reads or writes them once the channel
    // is built.
    let (read_fd, write_fd) =
        unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) };
    let rx = pipe::Receiver::from_owned_fd(read_fd)?;
    let tx = pipe::Sender::from_owned_fd(write_fd)?;
    Ok((rx, tx))
}
