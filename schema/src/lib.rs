//! Schema definitions for the warden control protocol
//!
//! This crate contains the shared data model spoken on the control
//! channel between the supervising peer and the warden daemon: the
//! typed term representation, the request/reply envelope, and the
//! spawn-option set with its validation rules. Everything here is pure
//! logic; the transport framing lives in the `ipc` crate and the
//! process machinery in `warden-core`.

pub mod options;
pub mod request;
pub mod term;

pub use options::{OptionError, Redirect, SpawnOptions, DEFAULT_KILL_TIMEOUT};
pub use request::{Event, Reason, Reply, Request, RequestError, StreamKind, TransId};
pub use term::{Term, TermError};
