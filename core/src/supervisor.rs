//! The supervisor event loop.
//!
//! A single task owns the child table and multiplexes four inputs with
//! `tokio::select!`: the framed control channel, the event channel fed
//! by the per-child satellite tasks, the termination signals, and the
//! earliest pending escalation deadline. Commands are handled strictly
//! in arrival order; child events that are already queued are drained
//! before the next command thanks to the biased branch ordering.
//!
//! ## Lifecycle
//!
//! ```text
//! Alive ── stop/kill_cmd ──> KillCmdInFlight ─┐
//!   │                                         ├─ deadline ──> Sigkilled
//!   └───── stop/SIGTERM ───> Sigtermed ───────┘
//! ```
//!
//! Exit notifications for a child are emitted only after its captured
//! output has been fully drained, and the status is normalized to 0
//! when the peer itself requested the termination.

use crate::error::Result;
use crate::signals::TermSignals;
use crate::spawn::{SpawnEngine, SpawnError, SpawnedChild};
use crate::streams;
use crate::table::{ChildRecord, ChildTable};
use futures::{SinkExt, StreamExt};
use ipc::{IpcError, PortCodec};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use schema::{
    request, Event as WireEvent, Reason, Reply, Request, SpawnOptions, StreamKind, Term, TransId,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// Idle wake-up period when no deadline is pending.
const IDLE_TICK: Duration = Duration::from_secs(5);

/// Soft horizon for the teardown drain before everything left gets
/// SIGKILLed outright.
const DRAIN_HORIZON: Duration = Duration::from_secs(6);

/// Poll granularity of the teardown drain loop.
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Process exit codes of the supervisor loop.
pub mod exit_code {
    /// Clean shutdown (peer EOF or an explicit `shutdown` request).
    pub const OK: i32 = 0;
    /// Stopped by SIGINT/SIGTERM/SIGHUP or a dead control channel.
    pub const SIGNALED: i32 = 1;
    /// `/dev/null` could not be opened at startup.
    pub const DEV_NULL: i32 = 10;
    /// Unrecoverable event-loop I/O failure.
    pub const LOOP_IO: i32 = 11;
    /// Protocol parse failure on the control channel.
    pub const PROTOCOL: i32 = 12;
    /// Base for control-channel read errors; the errno is added.
    pub const READ_ERROR_BASE: i32 = 90;
}

/// Tuning knobs for a supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Started as root: `kill` is then refused for untracked pids.
    pub superuser: bool,
    /// Hard self-kill timer armed when teardown begins, in seconds.
    pub alarm_max_time: u32,
    /// SIGTERM the whole process group when teardown begins. On for
    /// the standalone daemon, off when embedded in another process
    /// (the embedder shares the group).
    pub group_term_on_teardown: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            superuser: false,
            alarm_max_time: 12,
            group_term_on_teardown: false,
        }
    }
}

/// Events the satellite tasks report back to the loop.
#[derive(Debug)]
pub enum ChildEvent {
    /// Bytes read from a captured output stream.
    Output {
        pid: i32,
        stream: StreamKind,
        data: Vec<u8>,
    },
    /// A captured output stream reached EOF or failed.
    StreamClosed { pid: i32, stream: StreamKind },
    /// Raw wait status of an exited pid. `ECHILD` as the status word
    /// means the pid was reaped before it could be waited on.
    Exited { pid: i32, status: i32 },
}

enum Flow {
    Continue,
    Stop(i32),
}

/// The supervisor: child table, transient kill-helper map, spawn
/// engine and the control channel, all owned by one task.
pub struct Supervisor<R, W> {
    reader: FramedRead<R, PortCodec>,
    writer: FramedWrite<W, PortCodec>,
    table: ChildTable,
    /// helper pid -> target pid, so helper exits stay invisible.
    transients: HashMap<i32, i32>,
    events_tx: UnboundedSender<ChildEvent>,
    events_rx: UnboundedReceiver<ChildEvent>,
    engine: SpawnEngine,
    config: SupervisorConfig,
    /// Cleared when a control-channel write fails; all further output
    /// is suppressed but children are still drained.
    pipe_valid: bool,
}

impl<R, W> Supervisor<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a supervisor over the given channel halves. Opens the
    /// shared `/dev/null`; failure is a startup abort.
    pub fn new(reader: R, writer: W, config: SupervisorConfig) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            reader: FramedRead::new(reader, PortCodec),
            writer: FramedWrite::new(writer, PortCodec),
            table: ChildTable::default(),
            transients: HashMap::new(),
            events_tx,
            events_rx,
            engine: SpawnEngine::new()?,
            config,
            pipe_valid: true,
        })
    }

    /// Run until shutdown, then drain every child. Returns the process
    /// exit code.
    pub async fn run(mut self) -> i32 {
        let mut signals = match TermSignals::new() {
            Ok(signals) => signals,
            Err(e) => {
                error!(error = %e, "cannot install signal handlers");
                return exit_code::LOOP_IO;
            }
        };
        let code = self.serve(&mut signals).await;
        self.finalize(code).await
    }

    async fn serve(&mut self, signals: &mut TermSignals) -> i32 {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;

                name = signals.recv() => {
                    info!(signal = name, "termination signal received");
                    return exit_code::SIGNALED;
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                frame = self.reader.next() => match frame {
                    None => {
                        debug!("control channel closed by peer");
                        return exit_code::OK;
                    }
                    Some(Ok(term)) => {
                        if let Flow::Stop(code) = self.handle_frame(term).await {
                            return code;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "control channel read failed");
                        return read_error_code(&e);
                    }
                },

                _ = tokio::time::sleep_until(wake) => {
                    self.sweep().await;
                }
            }

            if !self.pipe_valid {
                return exit_code::SIGNALED;
            }
        }
    }

    /// Earliest escalation deadline, or the idle tick.
    fn next_wake(&self) -> Instant {
        let mut wake = Instant::now() + IDLE_TICK;
        for rec in self.table.iter() {
            if rec.sigkill {
                continue;
            }
            if let Some(deadline) = rec.deadline {
                wake = wake.min(deadline);
            }
        }
        wake
    }

    async fn handle_frame(&mut self, term: Term) -> Flow {
        let Some((trans_id, body)) = request::split_envelope(&term) else {
            error!("unparseable request envelope");
            return Flow::Stop(exit_code::PROTOCOL);
        };
        match request::parse_body(body) {
            Ok(req) => self.dispatch(trans_id, req).await,
            Err(err) => {
                debug!(trans_id, error = %err, "rejecting request");
                self.send_reply(trans_id, err.into_reply()).await;
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, trans_id: TransId, req: Request) -> Flow {
        match req {
            Request::Shutdown => {
                info!("shutdown requested by peer");
                return Flow::Stop(exit_code::OK);
            }
            Request::Manage { pid, options } => {
                self.table.insert(ChildRecord::managed(pid, &options));
                debug!(pid, "now managing external pid");
                self.send_reply(trans_id, Reply::OkPid(pid)).await;
            }
            Request::Run { cmd, options } | Request::Shell { cmd, options } => {
                self.run_child(trans_id, cmd, options).await;
            }
            Request::Stop { pid } => {
                self.stop_request(trans_id, pid).await;
            }
            Request::Kill { pid, signal } => {
                self.kill_request(trans_id, pid, signal).await;
            }
            Request::List => {
                let pids = self.table.pids();
                self.send_reply(trans_id, Reply::Pids(pids)).await;
            }
            Request::SendStdin { pid, data } => {
                self.feed_stdin(pid, data);
            }
        }
        Flow::Continue
    }

    async fn run_child(&mut self, trans_id: TransId, cmd: String, options: SpawnOptions) {
        match self.engine.spawn(&cmd, &options) {
            Ok(spawned) => {
                let pid = spawned.pid;
                let record = self.adopt(cmd, &options, spawned);
                self.table.insert(record);
                self.send_reply(trans_id, Reply::OkPid(pid)).await;
            }
            Err(e) => {
                warn!(cmd = %cmd, error = %e, "spawn failed");
                let reason = Reason::Text(format!("Couldn't start pid: {e}"));
                self.send_reply(trans_id, Reply::Error(reason)).await;
            }
        }
    }

    /// Wire the satellite tasks for a fresh child and build its record.
    fn adopt(&mut self, cmd: String, options: &SpawnOptions, spawned: SpawnedChild) -> ChildRecord {
        let SpawnedChild { pid, child, stdin, stdout, stderr } = spawned;

        let mut open_streams = 0;
        if let Some(out) = stdout {
            open_streams += 1;
            tokio::spawn(streams::pump_output(pid, StreamKind::Stdout, out, self.events_tx.clone()));
        }
        if let Some(err) = stderr {
            open_streams += 1;
            tokio::spawn(streams::pump_output(pid, StreamKind::Stderr, err, self.events_tx.clone()));
        }
        let stdin = stdin.map(|sink| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(streams::pump_stdin(pid, sink, rx));
            tx
        });
        tokio::spawn(streams::watch_exit(pid, child, self.events_tx.clone()));

        ChildRecord {
            cmd,
            pid,
            kill_cmd: options.kill_cmd.clone(),
            kill_cmd_pid: None,
            deadline: None,
            sigterm: false,
            sigkill: false,
            kill_timeout: options.kill_timeout,
            managed: false,
            stdin,
            open_streams,
            pending_status: None,
        }
    }

    async fn stop_request(&mut self, trans_id: TransId, pid: i32) {
        if !self.table.contains(pid) || !process_alive(pid) {
            let reason = Reason::Text("pid not alive".to_string());
            self.send_reply(trans_id, Reply::Error(reason)).await;
            return;
        }
        self.stop_child(pid, Some(trans_id), Instant::now()).await;
    }

    async fn kill_request(&mut self, trans_id: TransId, pid: i32, signal: i32) {
        if self.config.superuser && !self.table.contains(pid) {
            let reason =
                Reason::Text("Cannot kill a pid not managed by this application".to_string());
            self.send_reply(trans_id, Reply::Error(reason)).await;
            return;
        }
        let reply = match raw_kill(pid, signal) {
            Ok(()) => Reply::Ok,
            Err(errno) => errno_reply(errno, signal),
        };
        self.send_reply(trans_id, reply).await;
    }

    fn feed_stdin(&mut self, pid: i32, data: Vec<u8>) {
        match self.table.get(pid).and_then(|rec| rec.stdin.as_ref()) {
            Some(queue) => {
                if queue.send(data).is_err() {
                    debug!(pid, "stdin already closed, dropping data");
                }
            }
            None => debug!(pid, "stdin data for unknown or unpiped pid dropped"),
        }
    }

    /// Drive the per-child shutdown machine one step.
    async fn stop_child(&mut self, pid: i32, trans_id: Option<TransId>, now: Instant) {
        let Some(rec) = self.table.get(pid) else { return };
        let sigkill = rec.sigkill;
        let helper = rec.kill_cmd_pid;
        let kill_cmd = rec.kill_cmd.clone();
        let kill_timeout = rec.kill_timeout;
        let deadline = rec.deadline;

        if sigkill {
            // Terminal state; repeated stops are simply acknowledged.
            if let Some(t) = trans_id {
                self.send_reply(t, Reply::Ok).await;
            }
            return;
        }

        // A deadline means the first termination action already fired,
        // via the kill command or SIGTERM. The helper may be long gone
        // by now; escalate instead of restarting the attempt.
        if let Some(d) = deadline {
            if now >= d {
                debug!(pid, "grace period expired, sending SIGKILL");
                let _ = send_signal(pid, Signal::SIGKILL);
                if let Some(helper_pid) = helper {
                    let _ = send_signal(helper_pid, Signal::SIGKILL);
                }
                if let Some(rec) = self.table.get_mut(pid) {
                    rec.sigkill = true;
                    rec.deadline = Some(now);
                }
            }
            if let Some(t) = trans_id {
                self.send_reply(t, Reply::Ok).await;
            }
            return;
        }

        // First termination attempt for this child.
        let mut notify = trans_id;
        if let Some(cmd) = kill_cmd {
            match self.start_kill_helper(&cmd) {
                Ok(helper_pid) => {
                    debug!(pid, helper_pid, "kill command started");
                    self.transients.insert(helper_pid, pid);
                    if let Some(rec) = self.table.get_mut(pid) {
                        rec.kill_cmd_pid = Some(helper_pid);
                        rec.deadline = Some(now + kill_timeout);
                    }
                    if let Some(t) = notify {
                        self.send_reply(t, Reply::Ok).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(pid, error = %e, "kill command failed, falling back to SIGTERM");
                    if let Some(t) = notify.take() {
                        let reason = Reason::Text("bad kill command - using SIGTERM".to_string());
                        self.send_reply(t, Reply::Error(reason)).await;
                    }
                }
            }
        }

        match send_signal(pid, Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, timeout_ms = kill_timeout.as_millis() as u64, "sent SIGTERM");
                if let Some(rec) = self.table.get_mut(pid) {
                    rec.sigterm = true;
                    rec.deadline = Some(now + kill_timeout);
                }
                if let Some(t) = notify {
                    self.send_reply(t, Reply::Ok).await;
                }
            }
            Err(errno) => {
                let reply = errno_reply(errno, libc::SIGTERM);
                if send_signal(pid, Signal::SIGKILL).is_ok() {
                    debug!(pid, "SIGTERM undeliverable, sent SIGKILL");
                    if let Some(rec) = self.table.get_mut(pid) {
                        rec.sigterm = true;
                        rec.sigkill = true;
                        rec.deadline = Some(now);
                    }
                } else {
                    // Neither signal went through; drop the record
                    // rather than retrying forever.
                    warn!(pid, "cannot signal child at all, abandoning it");
                    self.table.remove(pid);
                }
                if let Some(t) = notify {
                    self.send_reply(t, reply).await;
                }
            }
        }
    }

    /// Run a custom kill command through the spawn engine with default
    /// options and watch its exit like any other child.
    fn start_kill_helper(&mut self, cmd: &str) -> std::result::Result<i32, SpawnError> {
        let spawned = self.engine.spawn(cmd, &SpawnOptions::default())?;
        let pid = spawned.pid;
        tokio::spawn(streams::watch_exit(pid, spawned.child, self.events_tx.clone()));
        Ok(pid)
    }

    async fn handle_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Output { pid, stream, data } => {
                self.send_event(WireEvent::Output { pid, stream, data }).await;
            }
            ChildEvent::StreamClosed { pid, stream } => {
                let ready = match self.table.get_mut(pid) {
                    Some(rec) => {
                        rec.open_streams = rec.open_streams.saturating_sub(1);
                        debug!(pid, stream = stream.name(), open = rec.open_streams, "stream closed");
                        rec.open_streams == 0 && rec.pending_status.is_some()
                    }
                    None => false,
                };
                if ready {
                    self.reap(pid).await;
                }
            }
            ChildEvent::Exited { pid, status } => {
                if let Some(target) = self.transients.remove(&pid) {
                    debug!(helper = pid, target, status, "kill command finished");
                    if let Some(rec) = self.table.get_mut(target) {
                        rec.kill_cmd_pid = None;
                    }
                    return;
                }
                match self.table.get_mut(pid) {
                    Some(rec) => {
                        rec.pending_status = Some(status);
                        if rec.open_streams == 0 {
                            self.reap(pid).await;
                        }
                    }
                    None => debug!(pid, status, "exit for untracked pid ignored"),
                }
            }
        }
    }

    /// Erase the record and emit the exit notification. Runs only
    /// after the final drain: the output pumps are done by now.
    async fn reap(&mut self, pid: i32) {
        let Some(rec) = self.table.remove(pid) else { return };
        let status = if rec.sigterm {
            // Peer-requested termination reports success regardless of
            // how the child actually died.
            0
        } else {
            rec.pending_status.unwrap_or(libc::ECHILD)
        };
        debug!(pid, status, "child exited");
        self.send_event(WireEvent::ExitStatus { pid, status }).await;
    }

    /// Deadline escalation plus the liveness probe for managed pids.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let overdue: Vec<i32> = self
            .table
            .iter()
            .filter(|rec| !rec.sigkill && rec.deadline.is_some_and(|d| now >= d))
            .map(|rec| rec.pid)
            .collect();
        for pid in overdue {
            self.stop_child(pid, None, now).await;
        }
        self.probe_managed().await;
    }

    /// Managed pids have no exit watcher; poll them with signal 0 and
    /// surface a vanished one as an exit with the ECHILD sentinel.
    async fn probe_managed(&mut self) {
        let vanished: Vec<i32> = self
            .table
            .iter()
            .filter(|rec| rec.managed && !process_alive(rec.pid))
            .map(|rec| rec.pid)
            .collect();
        for pid in vanished {
            self.handle_event(ChildEvent::Exited { pid, status: libc::ECHILD }).await;
        }
    }

    /// Drain every remaining child, then return the exit code. Bounded
    /// by the soft horizon and, as a last resort, the OS alarm.
    async fn finalize(mut self, code: i32) -> i32 {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
        }
        if self.table.is_empty() && self.transients.is_empty() {
            return code;
        }

        info!(children = self.table.len(), "draining children before exit");
        nix::unistd::alarm::set(self.config.alarm_max_time);
        if self.config.group_term_on_teardown {
            // Children share our process group; one TERM reaches all.
            let _ = kill(Pid::from_raw(0), Signal::SIGTERM);
        }

        let horizon = Instant::now() + DRAIN_HORIZON;
        let mut forced = false;
        while !self.table.is_empty() {
            let now = Instant::now();
            self.probe_managed().await;
            for pid in self.table.pids() {
                self.stop_child(pid, None, now).await;
            }
            for helper in self.transients.keys().copied().collect::<Vec<_>>() {
                let _ = send_signal(helper, Signal::SIGKILL);
            }
            self.transients.clear();

            if !forced && Instant::now() >= horizon {
                warn!(children = self.table.len(), "drain horizon passed, SIGKILLing the rest");
                for pid in self.table.pids() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                    if let Some(rec) = self.table.get_mut(pid) {
                        rec.sigkill = true;
                    }
                }
                forced = true;
            }

            match tokio::time::timeout(DRAIN_POLL, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event).await;
                    while let Ok(event) = self.events_rx.try_recv() {
                        self.handle_event(event).await;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }

        nix::unistd::alarm::cancel();
        debug!(code, "all children drained");
        code
    }

    async fn send_reply(&mut self, trans_id: TransId, reply: Reply) {
        self.send_term(reply.to_term(trans_id)).await;
    }

    async fn send_event(&mut self, event: WireEvent) {
        self.send_term(event.to_term()).await;
    }

    async fn send_term(&mut self, term: Term) {
        if !self.pipe_valid {
            return;
        }
        if let Err(e) = self.writer.send(term).await {
            warn!(error = %e, "control channel write failed, suppressing further output");
            self.pipe_valid = false;
        }
    }
}

/// Probe liveness without delivering a signal. EPERM still means the
/// process exists.
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn send_signal(pid: i32, sig: Signal) -> std::result::Result<(), Errno> {
    if pid <= 0 {
        // Group- and broadcast-signalling is reserved for teardown.
        return Err(Errno::ESRCH);
    }
    kill(Pid::from_raw(pid), sig)
}

/// Deliver an arbitrary signal number for the `kill` request.
fn raw_kill(pid: i32, signal: i32) -> std::result::Result<(), Errno> {
    if pid <= 0 {
        return Err(Errno::ESRCH);
    }
    let sig = if signal == 0 {
        None
    } else {
        Some(Signal::try_from(signal).map_err(|_| Errno::EINVAL)?)
    };
    kill(Pid::from_raw(pid), sig)
}

/// Map a kill errno onto the wire vocabulary.
fn errno_reply(errno: Errno, signal: i32) -> Reply {
    let reason = match errno {
        Errno::EINVAL => Reason::Text(format!("Invalid signal: {signal}")),
        Errno::ESRCH => Reason::Atom("esrch".to_string()),
        Errno::EPERM => Reason::Atom("eperm".to_string()),
        other => Reason::Atom(other.desc().to_string()),
    };
    Reply::Error(reason)
}

fn read_error_code(err: &IpcError) -> i32 {
    match err {
        IpcError::Io(e) => match e.raw_os_error() {
            Some(errno) => exit_code::READ_ERROR_BASE + errno,
            None => exit_code::LOOP_IO,
        },
        _ => exit_code::PROTOCOL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_reply_vocabulary() {
        assert_eq!(
            errno_reply(Errno::EINVAL, 12345),
            Reply::Error(Reason::Text("Invalid signal: 12345".to_string()))
        );
        assert_eq!(errno_reply(Errno::ESRCH, 9), Reply::Error(Reason::Atom("esrch".into())));
        assert_eq!(errno_reply(Errno::EPERM, 9), Reply::Error(Reason::Atom("eperm".into())));
    }

    #[test]
    fn test_read_error_codes() {
        let io = IpcError::Io(std::io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(read_error_code(&io), exit_code::READ_ERROR_BASE + libc::EIO);

        let parse = IpcError::Term(schema::TermError::BadVersion);
        assert_eq!(read_error_code(&parse), exit_code::PROTOCOL);
    }

    #[test]
    fn test_raw_kill_rejects_group_targets() {
        assert_eq!(raw_kill(0, 15), Err(Errno::ESRCH));
        assert_eq!(raw_kill(-1, 9), Err(Errno::ESRCH));
    }

    #[test]
    fn test_raw_kill_rejects_bad_signal_numbers() {
        assert_eq!(raw_kill(std::process::id() as i32, 12345), Err(Errno::EINVAL));
    }

    #[test]
    fn test_process_alive_on_self_and_nonsense() {
        assert!(process_alive(std::process::id() as i32));
        // Largest valid pid is far below this on Linux.
        assert!(!process_alive(0x3ffffff));
    }
}
