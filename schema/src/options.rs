//! Spawn options: parsing, validation and defaults.
//!
//! Options arrive as a list of atoms and 2-tuples attached to `run`,
//! `shell` and `manage` requests. Parsing, per-option decoding and the
//! cross-option validation rules (duplicate keys, stream topology,
//! nice range) are kept separate so each rule can be tested in
//! isolation. User and group names are resolved to ids here, at parse
//! time, so a bad name is rejected before anything is forked.

use crate::term::Term;
use std::time::Duration;
use thiserror::Error;

/// Default grace period between the first termination attempt and the
/// SIGKILL escalation.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where one of the child's standard streams is wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Leave the descriptor as inherited from the supervisor.
    Inherit,
    /// Close the descriptor in the child.
    Close,
    /// Wire the descriptor to `/dev/null`.
    Null,
    /// Pipe the stream to or from the controlling peer.
    Capture,
    /// Redirect to a file, truncating or appending.
    File { path: String, append: bool },
    /// Alias the stream onto the child's stdout (valid for stderr).
    ToStdout,
    /// Alias the stream onto the child's stderr (valid for stdout).
    ToStderr,
}

/// Parsed and validated options for `run`/`shell`/`manage`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnOptions {
    /// Working directory for the child.
    pub cd: Option<String>,
    /// Environment entries merged over the parent environment.
    pub env: Vec<(String, String)>,
    /// Custom polite-shutdown command.
    pub kill_cmd: Option<String>,
    /// Grace before SIGKILL escalation.
    pub kill_timeout: Duration,
    /// Uid to assume in the child.
    pub user: Option<u32>,
    /// Gid to assume in the child.
    pub group: Option<u32>,
    /// Priority to set after the fork.
    pub nice: Option<i32>,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cd: None,
            env: Vec::new(),
            kill_cmd: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            user: None,
            group: None,
            nice: None,
            stdin: Redirect::Null,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }
}

/// Rejections raised while parsing an option list. The display texts
/// are part of the wire contract: they travel back to the peer inside
/// `{error, Reason}` replies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option list expected")]
    NotAList,
    #[error("badarg: cmd option must be {{Cmd, Opt}} or atom")]
    BadShape,
    #[error("bad option: {0}")]
    UnknownOption(String),
    #[error("duplicate {0} option specified")]
    Duplicate(&'static str),
    #[error("{0} bad option value")]
    BadValue(&'static str),
    #[error("invalid value of kill_timeout")]
    BadKillTimeout,
    #[error("nice option must be an integer between -20 and 20")]
    NiceRange,
    #[error("env list expected")]
    EnvNotAList,
    #[error("invalid env argument #{0}")]
    BadEnvEntry(usize),
    #[error("Invalid user {0}")]
    InvalidUser(String),
    #[error("group invalid group name: {0}")]
    InvalidGroup(String),
    #[error("atom, string or {{append, Name}} tuple required for option {0}")]
    BadDevice(&'static str),
    #[error("invalid stdin redirection option")]
    BadStdinTarget,
    #[error("self-reference of {0}")]
    SelfReference(&'static str),
    #[error("circular reference of stdout and stderr")]
    CircularReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKey {
    Stdin,
    Stdout,
    Stderr,
    Cd,
    Env,
    Kill,
    KillTimeout,
    Nice,
    User,
    Group,
}

impl OptionKey {
    const ALL: [(&'static str, OptionKey); 10] = [
        ("stdin", OptionKey::Stdin),
        ("stdout", OptionKey::Stdout),
        ("stderr", OptionKey::Stderr),
        ("cd", OptionKey::Cd),
        ("env", OptionKey::Env),
        ("kill", OptionKey::Kill),
        ("kill_timeout", OptionKey::KillTimeout),
        ("nice", OptionKey::Nice),
        ("user", OptionKey::User),
        ("group", OptionKey::Group),
    ];

    fn from_atom(name: &str) -> Option<OptionKey> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }

    fn name(self) -> &'static str {
        Self::ALL.iter().find(|(_, k)| *k == self).map(|(n, _)| *n).unwrap_or("?")
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl SpawnOptions {
    /// Parse and validate an option list term.
    pub fn parse(term: &Term) -> Result<SpawnOptions, OptionError> {
        let items = term.as_list().ok_or(OptionError::NotAList)?;
        let mut opts = SpawnOptions::default();
        let mut seen = [false; OptionKey::ALL.len()];

        for item in items {
            let (key, value) = classify(item)?;
            if seen[key.index()] {
                return Err(OptionError::Duplicate(key.name()));
            }
            seen[key.index()] = true;
            opts.apply(key, value)?;
        }

        opts.validate()?;
        Ok(opts)
    }

    fn apply(&mut self, key: OptionKey, value: Option<&Term>) -> Result<(), OptionError> {
        match key {
            OptionKey::Cd => {
                let dir = required_str(key, value)?;
                self.cd = Some(dir);
            }
            OptionKey::Kill => {
                let cmd = required_str(key, value)?;
                self.kill_cmd = Some(cmd);
            }
            OptionKey::KillTimeout => {
                let secs = value
                    .and_then(Term::as_int)
                    .filter(|s| *s >= 0)
                    .ok_or(OptionError::BadKillTimeout)?;
                self.kill_timeout = Duration::from_secs(secs as u64);
            }
            OptionKey::Nice => {
                let nice = value
                    .and_then(Term::as_int)
                    .filter(|n| (-20..=20).contains(n))
                    .ok_or(OptionError::NiceRange)?;
                self.nice = Some(nice as i32);
            }
            OptionKey::User => {
                let name = required_str(key, value)?;
                self.user = Some(resolve_user(&name)?);
            }
            OptionKey::Group => {
                let value = value.ok_or(OptionError::BadValue(key.name()))?;
                self.group = Some(resolve_group(value)?);
            }
            OptionKey::Env => {
                let entries = value
                    .and_then(Term::as_list)
                    .ok_or(OptionError::EnvNotAList)?;
                for (i, entry) in entries.iter().enumerate() {
                    self.env.push(parse_env_entry(i, entry)?);
                }
            }
            OptionKey::Stdin | OptionKey::Stdout | OptionKey::Stderr => {
                let redirect = match value {
                    // Bare atom form: forward the stream to the peer.
                    None => Redirect::Capture,
                    Some(device) => parse_device(key, device)?,
                };
                match key {
                    OptionKey::Stdin => self.stdin = redirect,
                    OptionKey::Stdout => self.stdout = redirect,
                    OptionKey::Stderr => self.stderr = redirect,
                    _ => unreachable!(),
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), OptionError> {
        match self.stdin {
            Redirect::ToStdout | Redirect::ToStderr => return Err(OptionError::BadStdinTarget),
            _ => {}
        }
        if self.stdout == Redirect::ToStdout {
            return Err(OptionError::SelfReference("stdout"));
        }
        if self.stderr == Redirect::ToStderr {
            return Err(OptionError::SelfReference("stderr"));
        }
        if self.stdout == Redirect::ToStderr && self.stderr == Redirect::ToStdout {
            return Err(OptionError::CircularReference);
        }
        Ok(())
    }
}

fn classify(item: &Term) -> Result<(OptionKey, Option<&Term>), OptionError> {
    match item {
        Term::Atom(name) => {
            let key = OptionKey::from_atom(name)
                .ok_or_else(|| OptionError::UnknownOption(name.clone()))?;
            match key {
                OptionKey::Stdin | OptionKey::Stdout | OptionKey::Stderr => Ok((key, None)),
                other => Err(OptionError::BadValue(other.name())),
            }
        }
        Term::Tuple(items) if items.len() == 2 => {
            let name = items[0].as_atom().ok_or(OptionError::BadShape)?;
            let key = OptionKey::from_atom(name)
                .ok_or_else(|| OptionError::UnknownOption(name.to_string()))?;
            Ok((key, Some(&items[1])))
        }
        _ => Err(OptionError::BadShape),
    }
}

fn required_str(key: OptionKey, value: Option<&Term>) -> Result<String, OptionError> {
    value
        .and_then(Term::as_str)
        .ok_or(OptionError::BadValue(key.name()))
}

fn parse_env_entry(index: usize, entry: &Term) -> Result<(String, String), OptionError> {
    if let Some(pair) = entry.as_tuple() {
        if pair.len() == 2 {
            if let (Some(k), Some(v)) = (pair[0].as_str(), pair[1].as_str()) {
                return Ok((k, v));
            }
        }
        return Err(OptionError::BadEnvEntry(index));
    }
    let text = entry.as_str().ok_or(OptionError::BadEnvEntry(index))?;
    match text.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(OptionError::BadEnvEntry(index)),
    }
}

fn parse_device(key: OptionKey, device: &Term) -> Result<Redirect, OptionError> {
    let stream = key.name();
    match device {
        Term::Atom(name) => match name.as_str() {
            "null" => Ok(Redirect::Null),
            "close" => Ok(Redirect::Close),
            "stdout" => Ok(Redirect::ToStdout),
            "stderr" => Ok(Redirect::ToStderr),
            _ => Err(OptionError::BadDevice(stream)),
        },
        Term::Tuple(items) if items.len() == 2 => {
            let is_append = items[0].as_atom() == Some("append");
            let path = items[1].as_str();
            match (is_append, path) {
                (true, Some(path)) => Ok(Redirect::File { path, append: true }),
                _ => Err(OptionError::BadDevice(stream)),
            }
        }
        other => match other.as_str() {
            Some(path) if !path.is_empty() => Ok(Redirect::File { path, append: false }),
            _ => Err(OptionError::BadDevice(stream)),
        },
    }
}

fn resolve_user(name: &str) -> Result<u32, OptionError> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(OptionError::InvalidUser(name.to_string())),
    }
}

fn resolve_group(value: &Term) -> Result<u32, OptionError> {
    if let Some(gid) = value.as_int() {
        return u32::try_from(gid).map_err(|_| OptionError::BadValue("group"));
    }
    let name = value.as_str().ok_or(OptionError::BadValue("group"))?;
    match nix::unistd::Group::from_name(&name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(OptionError::InvalidGroup(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(name: &str, value: Term) -> Term {
        Term::Tuple(vec![Term::atom(name), value])
    }

    fn parse(items: Vec<Term>) -> Result<SpawnOptions, OptionError> {
        SpawnOptions::parse(&Term::List(items))
    }

    #[test]
    fn test_defaults() {
        let opts = parse(Vec::new()).unwrap();
        assert_eq!(opts.stdin, Redirect::Null);
        assert_eq!(opts.stdout, Redirect::Inherit);
        assert_eq!(opts.stderr, Redirect::Inherit);
        assert_eq!(opts.kill_timeout, DEFAULT_KILL_TIMEOUT);
        assert!(opts.cd.is_none() && opts.kill_cmd.is_none() && opts.nice.is_none());
    }

    #[test]
    fn test_bare_stream_atoms_mean_capture() {
        let opts = parse(vec![Term::atom("stdin"), Term::atom("stdout"), Term::atom("stderr")]).unwrap();
        assert_eq!(opts.stdin, Redirect::Capture);
        assert_eq!(opts.stdout, Redirect::Capture);
        assert_eq!(opts.stderr, Redirect::Capture);
    }

    #[test]
    fn test_duplicate_option_rejected() {
        let err = parse(vec![Term::atom("stdout"), opt("stdout", Term::atom("null"))]).unwrap_err();
        assert_eq!(err, OptionError::Duplicate("stdout"));
        assert_eq!(err.to_string(), "duplicate stdout option specified");
    }

    #[test]
    fn test_nice_boundaries() {
        assert!(parse(vec![opt("nice", Term::Int(-20))]).is_ok());
        assert!(parse(vec![opt("nice", Term::Int(20))]).is_ok());
        assert_eq!(parse(vec![opt("nice", Term::Int(-21))]).unwrap_err(), OptionError::NiceRange);
        assert_eq!(parse(vec![opt("nice", Term::Int(21))]).unwrap_err(), OptionError::NiceRange);
    }

    #[test]
    fn test_env_entries() {
        let opts = parse(vec![opt(
            "env",
            Term::List(vec![
                Term::Str("A=1".into()),
                Term::Tuple(vec![Term::Str("B".into()), Term::Str("2".into())]),
            ]),
        )])
        .unwrap();
        assert_eq!(opts.env, vec![("A".into(), "1".into()), ("B".into(), "2".into())]);
    }

    #[test]
    fn test_env_entry_without_equals_rejected() {
        let err = parse(vec![opt("env", Term::List(vec![Term::Str("NOEQ".into())]))]).unwrap_err();
        assert_eq!(err, OptionError::BadEnvEntry(0));
        assert_eq!(err.to_string(), "invalid env argument #0");
    }

    #[test]
    fn test_stream_devices() {
        let opts = parse(vec![
            opt("stdin", Term::atom("close")),
            opt("stdout", Term::Str("/tmp/out.log".into())),
            opt("stderr", Term::Tuple(vec![Term::atom("append"), Term::Str("/tmp/err.log".into())])),
        ])
        .unwrap();
        assert_eq!(opts.stdin, Redirect::Close);
        assert_eq!(opts.stdout, Redirect::File { path: "/tmp/out.log".into(), append: false });
        assert_eq!(opts.stderr, Redirect::File { path: "/tmp/err.log".into(), append: true });
    }

    #[test]
    fn test_stdin_cannot_target_other_streams() {
        assert_eq!(
            parse(vec![opt("stdin", Term::atom("stdout"))]).unwrap_err(),
            OptionError::BadStdinTarget
        );
        assert_eq!(
            parse(vec![opt("stdin", Term::atom("stderr"))]).unwrap_err(),
            OptionError::BadStdinTarget
        );
    }

    #[test]
    fn test_self_reference_rejected() {
        let err = parse(vec![opt("stdout", Term::atom("stdout"))]).unwrap_err();
        assert_eq!(err.to_string(), "self-reference of stdout");
        let err = parse(vec![opt("stderr", Term::atom("stderr"))]).unwrap_err();
        assert_eq!(err.to_string(), "self-reference of stderr");
    }

    #[test]
    fn test_circular_reference_rejected() {
        let err = parse(vec![
            opt("stdout", Term::atom("stderr")),
            opt("stderr", Term::atom("stdout")),
        ])
        .unwrap_err();
        assert_eq!(err, OptionError::CircularReference);
    }

    #[test]
    fn test_single_cross_reference_allowed() {
        let opts = parse(vec![opt("stderr", Term::atom("stdout"))]).unwrap();
        assert_eq!(opts.stderr, Redirect::ToStdout);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = parse(vec![opt("frobnicate", Term::Int(1))]).unwrap_err();
        assert_eq!(err, OptionError::UnknownOption("frobnicate".into()));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let err = parse(vec![opt("user", Term::Str("no_such_user_0x7f".into()))]).unwrap_err();
        assert!(matches!(err, OptionError::InvalidUser(_)));
    }

    #[test]
    fn test_numeric_group_accepted() {
        let opts = parse(vec![opt("group", Term::Int(0))]).unwrap();
        assert_eq!(opts.group, Some(0));
    }

    #[test]
    fn test_kill_and_cd_and_timeout() {
        let opts = parse(vec![
            opt("cd", Term::Str("/tmp".into())),
            opt("kill", Term::Str("kill -USR1 $PID".into())),
            opt("kill_timeout", Term::Int(30)),
        ])
        .unwrap();
        assert_eq!(opts.cd.as_deref(), Some("/tmp"));
        assert_eq!(opts.kill_cmd.as_deref(), Some("kill -USR1 $PID"));
        assert_eq!(opts.kill_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_option_list_required() {
        assert_eq!(
            SpawnOptions::parse(&Term::Int(1)).unwrap_err(),
            OptionError::NotAList
        );
    }
}
