//! The request envelope and the reply/event vocabulary.
//!
//! Every request is `{TransId, Body}` where `Body` is a tuple whose
//! first element names the command. Replies echo the transaction id;
//! unsolicited events (child output, exit notifications) use id 0.

use crate::options::{OptionError, SpawnOptions};
use crate::term::Term;
use thiserror::Error;

/// Transaction id echoed on every reply.
pub type TransId = i64;

/// Transaction id used for unsolicited events.
pub const EVENT_TRANS_ID: TransId = 0;

/// Output stream kinds forwarded to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// The atom used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One decoded request from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Track an externally started pid.
    Manage { pid: i32, options: SpawnOptions },
    /// Spawn a shell command.
    Run { cmd: String, options: SpawnOptions },
    /// Semantic alias of `run`.
    Shell { cmd: String, options: SpawnOptions },
    /// Begin polite termination of a tracked pid.
    Stop { pid: i32 },
    /// Deliver an arbitrary signal.
    Kill { pid: i32, signal: i32 },
    /// List tracked pids.
    List,
    /// Enqueue bytes on a child's stdin. No reply.
    SendStdin { pid: i32, data: Vec<u8> },
    /// Tear the supervisor down. No reply.
    Shutdown,
}

/// Why a body could not be turned into a [`Request`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    /// The command atom is not one we know; reply with a string.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    /// Body shape or argument type is wrong; reply with the atom.
    #[error("badarg")]
    BadArg,
    /// Descriptive rejection, replied as a string.
    #[error("{0}")]
    Text(String),
}

impl RequestError {
    /// The `{error, Reason}` reply this failure maps to.
    pub fn into_reply(self) -> Reply {
        match self {
            RequestError::UnknownCommand(name) => {
                Reply::Error(Reason::Text(format!("Unknown command: {name}")))
            }
            RequestError::BadArg => Reply::Error(Reason::Atom("badarg".to_string())),
            RequestError::Text(text) => Reply::Error(Reason::Text(text)),
        }
    }
}

/// Split the `{TransId, Body}` envelope. Failure here means the
/// session cannot continue: there is no transaction id to reply to.
pub fn split_envelope(term: &Term) -> Option<(TransId, &[Term])> {
    let items = term.as_tuple()?;
    if items.len() != 2 {
        return None;
    }
    let trans_id = items[0].as_int()?;
    let body = items[1].as_tuple()?;
    Some((trans_id, body))
}

/// Parse a request body into a [`Request`].
pub fn parse_body(body: &[Term]) -> Result<Request, RequestError> {
    let command = body.first().and_then(Term::as_atom).ok_or(RequestError::BadArg)?;
    match command {
        "manage" => {
            if body.len() != 3 {
                return Err(RequestError::BadArg);
            }
            let pid = parse_pid(&body[1])?;
            let options = SpawnOptions::parse(&body[2]).map_err(|_| RequestError::BadArg)?;
            Ok(Request::Manage { pid, options })
        }
        "run" | "shell" => {
            if body.len() != 3 {
                return Err(RequestError::BadArg);
            }
            let cmd = body[1]
                .as_str()
                .ok_or_else(|| RequestError::Text("badarg: command string expected".to_string()))?;
            let options = SpawnOptions::parse(&body[2]).map_err(option_text)?;
            if command == "run" {
                Ok(Request::Run { cmd, options })
            } else {
                Ok(Request::Shell { cmd, options })
            }
        }
        "stop" => {
            if body.len() != 2 {
                return Err(RequestError::BadArg);
            }
            Ok(Request::Stop { pid: parse_pid(&body[1])? })
        }
        "kill" => {
            if body.len() != 3 {
                return Err(RequestError::BadArg);
            }
            let pid = parse_pid(&body[1])?;
            let signal = body[2]
                .as_int()
                .and_then(|s| i32::try_from(s).ok())
                .ok_or(RequestError::BadArg)?;
            Ok(Request::Kill { pid, signal })
        }
        "list" => {
            if body.len() != 1 {
                return Err(RequestError::BadArg);
            }
            Ok(Request::List)
        }
        "stdin" => {
            if body.len() != 3 {
                return Err(RequestError::BadArg);
            }
            let pid = parse_pid(&body[1])?;
            let data = body[2].as_bytes().ok_or(RequestError::BadArg)?;
            Ok(Request::SendStdin { pid, data })
        }
        "shutdown" => {
            if body.len() != 1 {
                return Err(RequestError::BadArg);
            }
            Ok(Request::Shutdown)
        }
        other => Err(RequestError::UnknownCommand(other.to_string())),
    }
}

fn parse_pid(term: &Term) -> Result<i32, RequestError> {
    term.as_int()
        .and_then(|v| i32::try_from(v).ok())
        .filter(|pid| *pid > 0)
        .ok_or(RequestError::BadArg)
}

fn option_text(err: OptionError) -> RequestError {
    RequestError::Text(err.to_string())
}

/// Error reasons: atoms for the well-known conditions, strings for
/// human-oriented detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Atom(String),
    Text(String),
}

/// Reply bodies carrying the echoed transaction id.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Bare `ok`.
    Ok,
    /// `{ok, OsPid}` for accepted spawns and manage requests.
    OkPid(i32),
    /// `{ok, [OsPid]}` for `list`.
    Pids(Vec<i32>),
    /// `{error, Reason}`.
    Error(Reason),
}

impl Reply {
    /// Build the wire term `{TransId, ReplyBody}`.
    pub fn to_term(&self, trans_id: TransId) -> Term {
        let body = match self {
            Reply::Ok => Term::atom("ok"),
            Reply::OkPid(pid) => Term::Tuple(vec![Term::atom("ok"), Term::Int(i64::from(*pid))]),
            Reply::Pids(pids) => Term::Tuple(vec![
                Term::atom("ok"),
                Term::List(pids.iter().map(|p| Term::Int(i64::from(*p))).collect()),
            ]),
            Reply::Error(reason) => {
                let reason = match reason {
                    Reason::Atom(a) => Term::Atom(a.clone()),
                    Reason::Text(t) => Term::Str(t.clone()),
                };
                Term::Tuple(vec![Term::atom("error"), reason])
            }
        };
        Term::Tuple(vec![Term::Int(trans_id), body])
    }
}

/// Unsolicited events pushed to the peer with transaction id 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Raw wait status of an exited child; 0 when termination was
    /// requested by the peer.
    ExitStatus { pid: i32, status: i32 },
    /// Output passthrough from a captured stream.
    Output { pid: i32, stream: StreamKind, data: Vec<u8> },
}

impl Event {
    /// Build the wire term `{0, EventBody}`.
    pub fn to_term(&self) -> Term {
        let body = match self {
            Event::ExitStatus { pid, status } => Term::Tuple(vec![
                Term::atom("exit_status"),
                Term::Int(i64::from(*pid)),
                Term::Int(i64::from(*status)),
            ]),
            Event::Output { pid, stream, data } => Term::Tuple(vec![
                Term::atom(stream.name()),
                Term::Int(i64::from(*pid)),
                Term::Bin(data.clone()),
            ]),
        };
        Term::Tuple(vec![Term::Int(EVENT_TRANS_ID), body])
    }
}
