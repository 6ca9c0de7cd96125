//! The spawn engine.
//!
//! Builds the redirections a request asked for, forks through
//! `tokio::process`, and configures credentials, environment, working
//! directory and priority. Children exec `$SHELL -c <cmd>`, so the
//! command text gets full shell semantics.
//!
//! Descriptor hygiene: every inherited descriptor above the stdio trio
//! is closed in the child before exec; the control channel in
//! particular must never leak into children, or a dead supervisor
//! would leave the peer's pipe half-open.

use schema::{Redirect, SpawnOptions};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Spawn failures, reported to the peer as
/// `{error, "Couldn't start pid: ..."}`.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("SHELL is not set in the environment")]
    NoShell,

    #[error("Failed to redirect {stream} to file: {source}")]
    Redirect {
        stream: &'static str,
        source: std::io::Error,
    },

    #[error("{0}")]
    Spawn(#[from] std::io::Error),

    #[error("spawned child has no pid")]
    NoPid,
}

/// The three standard slots in the child.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

impl Slot {
    fn fd(self) -> i32 {
        match self {
            Slot::Stdin => 0,
            Slot::Stdout => 1,
            Slot::Stderr => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Slot::Stdin => "stdin",
            Slot::Stdout => "stdout",
            Slot::Stderr => "stderr",
        }
    }
}

/// What the child must do between fork and exec, beyond what the
/// standard spawn machinery already covers.
#[derive(Debug, Clone, Copy)]
enum PostFork {
    /// Close a standard slot.
    Close(i32),
    /// Alias one standard slot onto another (cross-redirection).
    Dup { from: i32, to: i32 },
}

/// Engine state shared by every spawn: the read/write `/dev/null`
/// handle and the descriptor limit for the child-side close sweep.
#[derive(Debug)]
pub struct SpawnEngine {
    dev_null: File,
    max_fds: i32,
}

/// A freshly spawned child with its captured pipe ends taken out.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: i32,
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl SpawnEngine {
    /// Open the shared `/dev/null` and size the close sweep. Failure
    /// here is a startup abort for the daemon.
    pub fn new() -> std::io::Result<Self> {
        let dev_null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
        // SAFETY: sysconf with a constant name argument.
        let raw = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max_fds = i32::try_from(raw).unwrap_or(1024).clamp(1024, 65536);
        Ok(Self { dev_null, max_fds })
    }

    /// Spawn `$SHELL -c cmd` with the requested options applied.
    pub fn spawn(&self, cmd: &str, options: &SpawnOptions) -> Result<SpawnedChild, SpawnError> {
        let shell = std::env::var("SHELL").map_err(|_| SpawnError::NoShell)?;

        let mut command = Command::new(shell);
        command.arg("-c").arg(cmd);
        command.kill_on_drop(false);

        if let Some(dir) = &options.cd {
            command.current_dir(dir);
        }
        if !options.env.is_empty() {
            command.env_clear();
            command.envs(merged_env(&options.env));
        }
        if let Some(gid) = options.group {
            command.gid(gid);
        }
        if let Some(uid) = options.user {
            command.uid(uid);
        }

        let mut post = Vec::new();
        command.stdin(self.prepare(&options.stdin, Slot::Stdin, &mut post)?);
        command.stdout(self.prepare(&options.stdout, Slot::Stdout, &mut post)?);
        command.stderr(self.prepare(&options.stderr, Slot::Stderr, &mut post)?);

        let max_fds = self.max_fds;
        // SAFETY: the closure runs between fork and exec and performs
        // only async-signal-safe libc calls.
        unsafe {
            command.pre_exec(move || {
                for step in &post {
                    match *step {
                        PostFork::Close(fd) => {
                            libc::close(fd);
                        }
                        PostFork::Dup { from, to } => {
                            if libc::dup2(from, to) < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                        }
                    }
                }
                // Drop every inherited descriptor above the stdio trio,
                // the control channel included.
                for fd in 3..max_fds {
                    libc::close(fd);
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(SpawnError::NoPid)? as i32;
        debug!(pid, cmd, "child started");

        if let Some(nice) = options.nice {
            // SAFETY: setpriority on the pid we just created.
            let rc =
                unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, nice) };
            if rc < 0 {
                warn!(
                    pid,
                    nice,
                    error = %std::io::Error::last_os_error(),
                    "cannot set child priority"
                );
            }
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(SpawnedChild { pid, child, stdin, stdout, stderr })
    }

    fn prepare(
        &self,
        redirect: &Redirect,
        slot: Slot,
        post: &mut Vec<PostFork>,
    ) -> Result<Stdio, SpawnError> {
        Ok(match redirect {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Capture => Stdio::piped(),
            Redirect::Null => Stdio::from(self.dev_null.try_clone().map_err(SpawnError::Spawn)?),
            Redirect::Close => {
                post.push(PostFork::Close(slot.fd()));
                Stdio::null()
            }
            Redirect::File { path, append } => {
                let file = open_redirect_file(path, *append)
                    .map_err(|source| SpawnError::Redirect { stream: slot.name(), source })?;
                Stdio::from(file)
            }
            // Cross-redirections happen after the other slots are in
            // place, so the alias picks up the final target.
            Redirect::ToStderr => {
                post.push(PostFork::Dup { from: 2, to: slot.fd() });
                Stdio::inherit()
            }
            Redirect::ToStdout => {
                post.push(PostFork::Dup { from: 1, to: slot.fd() });
                Stdio::inherit()
            }
        })
    }
}

fn merged_env(extra: &[(String, String)]) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in extra {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn open_redirect_file(path: &str, append: bool) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).mode(0o644);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::Redirect;
    use tokio::io::AsyncReadExt;

    fn ensure_shell() {
        if std::env::var("SHELL").is_err() {
            std::env::set_var("SHELL", "/bin/sh");
        }
    }

    fn capture_options() -> SpawnOptions {
        SpawnOptions {
            stdout: Redirect::Capture,
            stderr: Redirect::Capture,
            ..SpawnOptions::default()
        }
    }

    async fn read_all(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
        let mut out = Vec::new();
        pipe.expect("pipe").read_to_end(&mut out).await.expect("read");
        out
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let mut spawned = engine.spawn("echo hi", &capture_options()).unwrap();
        assert!(spawned.pid > 0);

        let out = read_all(spawned.stdout.take()).await;
        assert_eq!(out, b"hi\n");
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_env_merge_overrides_parent() {
        ensure_shell();
        std::env::set_var("WARDEN_SPAWN_TEST", "parent");
        let engine = SpawnEngine::new().unwrap();
        let options = SpawnOptions {
            env: vec![("WARDEN_SPAWN_TEST".into(), "child".into())],
            ..capture_options()
        };
        let mut spawned = engine.spawn("echo $WARDEN_SPAWN_TEST", &options).unwrap();
        let out = read_all(spawned.stdout.take()).await;
        assert_eq!(out, b"child\n");
        spawned.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_working_directory_applies() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let options = SpawnOptions { cd: Some("/".into()), ..capture_options() };
        let mut spawned = engine.spawn("pwd", &options).unwrap();
        let out = read_all(spawned.stdout.take()).await;
        assert_eq!(out, b"/\n");
        spawned.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_working_directory_fails_spawn() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let options = SpawnOptions {
            cd: Some("/no/such/directory/warden".into()),
            ..SpawnOptions::default()
        };
        assert!(engine.spawn("true", &options).is_err());
    }

    #[tokio::test]
    async fn test_file_redirection_truncate_and_append() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let path_str = path.to_str().unwrap().to_string();

        let options = SpawnOptions {
            stdout: Redirect::File { path: path_str.clone(), append: false },
            ..SpawnOptions::default()
        };
        let mut spawned = engine.spawn("echo one", &options).unwrap();
        spawned.child.wait().await.unwrap();

        let options = SpawnOptions {
            stdout: Redirect::File { path: path_str, append: true },
            ..SpawnOptions::default()
        };
        let mut spawned = engine.spawn("echo two", &options).unwrap();
        spawned.child.wait().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_unwritable_redirect_file_is_reported() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let options = SpawnOptions {
            stdout: Redirect::File { path: "/no/such/dir/out.log".into(), append: false },
            ..SpawnOptions::default()
        };
        match engine.spawn("true", &options) {
            Err(SpawnError::Redirect { stream: "stdout", .. }) => {}
            other => panic!("expected redirect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stderr_aliases_onto_stdout() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let options = SpawnOptions {
            stdout: Redirect::Capture,
            stderr: Redirect::ToStdout,
            ..SpawnOptions::default()
        };
        let mut spawned = engine.spawn("echo oops 1>&2", &options).unwrap();
        let out = read_all(spawned.stdout.take()).await;
        assert_eq!(out, b"oops\n");
        spawned.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_is_reported_raw() {
        ensure_shell();
        let engine = SpawnEngine::new().unwrap();
        let mut spawned = engine.spawn("exit 3", &SpawnOptions::default()).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
