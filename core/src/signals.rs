//! Termination signals.
//!
//! SIGINT, SIGTERM and SIGHUP all mean the same thing to the
//! supervisor: stop accepting commands and drain the children. SIGCHLD
//! is consumed by the runtime's process reaper and surfaces through
//! the per-child exit watchers instead; SIGPIPE stays ignored, so a
//! dead peer is observed as a write error on the control channel.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Merged stream of the termination signals.
#[derive(Debug)]
pub struct TermSignals {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
}

impl TermSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Complete when any termination signal arrives; returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
        }
    }
}
