//! Satellite I/O tasks for one child.
//!
//! Each captured pipe end is owned by exactly one task here: output
//! pumps read stdout/stderr, the stdin writer drains the queued input,
//! and the exit watcher waits on the process handle. They report to
//! the supervisor loop over the event channel and never touch the
//! child table themselves.

use crate::supervisor::ChildEvent;
use schema::StreamKind;
use std::os::unix::process::ExitStatusExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Per-read cap on forwarded output; chunks on the wire never exceed
/// this size.
pub const READ_CHUNK: usize = 4096;

/// Forward a captured output stream to the supervisor until EOF or a
/// read error, then report the stream closed.
pub async fn pump_output<R>(
    pid: i32,
    stream: StreamKind,
    mut source: R,
    events: UnboundedSender<ChildEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                if events.send(ChildEvent::Output { pid, stream, data }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(pid, stream = stream.name(), error = %e, "output read failed");
                break;
            }
        }
    }
    let _ = events.send(ChildEvent::StreamClosed { pid, stream });
}

/// Drain the stdin queue into the child, in order, each chunk exactly
/// once. The first write error drops whatever is still queued; the
/// pipe closes when this task returns and the sink is dropped.
pub async fn pump_stdin<W>(pid: i32, mut sink: W, mut queue: UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.recv().await {
        if let Err(e) = sink.write_all(&chunk).await {
            debug!(pid, error = %e, "stdin write failed, dropping queued input");
            break;
        }
    }
    queue.close();
    let _ = sink.shutdown().await;
    debug!(pid, "stdin closed");
}

/// Wait for the child and report its raw wait status. `ECHILD` as the
/// status word means the child was reaped before it could be waited on.
pub async fn watch_exit(pid: i32, mut child: Child, events: UnboundedSender<ChildEvent>) {
    let status = match child.wait().await {
        Ok(status) => status.into_raw(),
        Err(e) => {
            debug!(pid, error = %e, "wait failed");
            libc::ECHILD
        }
    };
    let _ = events.send(ChildEvent::Exited { pid, status });
}
