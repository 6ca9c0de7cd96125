//! Privilege-drop bootstrap for superuser starts.
//!
//! The daemon refuses to keep running as root: started with euid 0 it
//! switches its effective uid to `--user` while keeping the saved uid
//! at root and retaining the capabilities needed to renice children,
//! signal them, and run them under other accounts. Each failure here
//! aborts startup with its own exit code, so the invoking peer can
//! tell misconfigurations apart.

use nix::unistd::{geteuid, getuid, User};
use thiserror::Error;
use tracing::debug;

/// Failures that abort startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("when running as root, --user must be provided")]
    RootNeedsUser,

    #[error("failed to keep capabilities across the user switch: {0}")]
    KeepCaps(std::io::Error),

    #[error("failed to switch effective user: {0}")]
    SetUid(std::io::Error),

    #[error("still running with root privileges after the user switch")]
    StillRoot,

    #[error("failed to apply the retained capability set: {0}")]
    CapApply(String),
}

impl BootstrapError {
    /// Distinct small exit codes, stable for the invoking peer.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::UserNotFound(_) => 3,
            BootstrapError::RootNeedsUser => 4,
            BootstrapError::KeepCaps(_) => 5,
            BootstrapError::SetUid(_) => 6,
            BootstrapError::StillRoot => 7,
            BootstrapError::CapApply(_) => 9,
        }
    }
}

/// Drop root privileges if the process has them. Returns whether it
/// started as root; superuser mode restricts `kill` to tracked pids.
///
/// The `--user` name is resolved unconditionally so a typo fails fast
/// even for non-root starts, where it is otherwise ignored.
pub fn drop_privileges(user: Option<&str>) -> Result<bool, BootstrapError> {
    let uid = user.map(resolve_user).transpose()?;

    if !getuid().is_root() {
        return Ok(false);
    }

    let uid = uid.filter(|uid| *uid != 0).ok_or(BootstrapError::RootNeedsUser)?;
    keep_caps()?;
    switch_user(uid)?;
    if geteuid().is_root() {
        return Err(BootstrapError::StillRoot);
    }
    retain_caps()?;
    debug!(uid, "dropped root privileges");
    Ok(true)
}

fn resolve_user(name: &str) -> Result<u32, BootstrapError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(BootstrapError::UserNotFound(name.to_string())),
    }
}

#[cfg(target_os = "linux")]
fn keep_caps() -> Result<(), BootstrapError> {
    // SAFETY: prctl with integral arguments only.
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1 as libc::c_ulong) };
    if rc < 0 {
        return Err(BootstrapError::KeepCaps(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn keep_caps() -> Result<(), BootstrapError> {
    Ok(())
}

fn switch_user(uid: u32) -> Result<(), BootstrapError> {
    // Real uid stays, effective uid drops, saved uid stays at root so
    // CAP_SETUID can still put children under other accounts.
    let saved = geteuid().as_raw();
    // SAFETY: setresuid with -1 leaves the real uid untouched.
    let rc = unsafe { libc::setresuid(libc::uid_t::MAX, uid, saved) };
    if rc < 0 {
        return Err(BootstrapError::SetUid(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn retain_caps() -> Result<(), BootstrapError> {
    use caps::{CapSet, Capability};

    let wanted: caps::CapsHashSet =
        [Capability::CAP_SETUID, Capability::CAP_KILL, Capability::CAP_SYS_NICE]
            .into_iter()
            .collect();
    for set in [CapSet::Permitted, CapSet::Effective, CapSet::Inheritable] {
        caps::set(None, set, &wanted).map_err(|e| BootstrapError::CapApply(e.to_string()))?;
    }
    debug!("retained CAP_SETUID, CAP_KILL and CAP_SYS_NICE");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn retain_caps() -> Result<(), BootstrapError> {
    debug!("capability retention is not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_user_exits_3() {
        let err = drop_privileges(Some("no_such_user_0x7f")).unwrap_err();
        assert!(matches!(err, BootstrapError::UserNotFound(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            BootstrapError::UserNotFound("x".into()).exit_code(),
            BootstrapError::RootNeedsUser.exit_code(),
            BootstrapError::KeepCaps(std::io::Error::other("x")).exit_code(),
            BootstrapError::SetUid(std::io::Error::other("x")).exit_code(),
            BootstrapError::StillRoot.exit_code(),
            BootstrapError::CapApply("x".into()).exit_code(),
        ];
        let mut sorted = errors.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), errors.len());
    }
}
