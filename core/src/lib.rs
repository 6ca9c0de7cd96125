//! Supervisor engine for the warden port daemon
//!
//! This crate implements the child lifecycle machinery behind the
//! control protocol: spawning, stdin feeding, output forwarding,
//! signal-based and kill-command-based shutdown with escalation, exit
//! reaping, and the final drain when the supervisor itself goes down.
//!
//! ## Architecture
//!
//! A single [`Supervisor`] task owns the child table and multiplexes
//! the control channel, an event channel and termination signals with
//! `tokio::select!`. Per-child stream pumps and exit watchers run as
//! satellite tasks that only ever talk back through the event channel,
//! so all table mutation happens on the supervisor task.

pub mod error;
pub mod signals;
pub mod spawn;
pub mod streams;
pub mod supervisor;
pub mod table;

pub use error::{CoreError, Result};
pub use spawn::{SpawnEngine, SpawnError, SpawnedChild};
pub use supervisor::{exit_code, ChildEvent, Supervisor, SupervisorConfig};
pub use table::{ChildRecord, ChildTable};
