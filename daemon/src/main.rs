//! The warden daemon binary.
//!
//! A controlling peer starts this process with a pipe pair on stdio
//! (or descriptors 3/4 under `-n`), then drives it with framed
//! commands: spawn, manage, feed stdin, signal, stop, list, shutdown.
//! Everything the daemon prints for humans goes to stderr; stdout
//! belongs to the control channel.

mod bootstrap;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use warden_core::{exit_code, Supervisor, SupervisorConfig};

/// Exit code when the control channel cannot be built.
const EXIT_NO_CHANNEL: i32 = 2;

/// Port daemon for spawning and controlling OS processes on behalf of
/// a supervising peer.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Args {
    /// Use marshaling descriptors 3 and 4 instead of stdin/stdout.
    #[arg(short = 'n')]
    alt_fds: bool,

    /// Seconds to live after teardown begins before the hard self-kill.
    #[arg(long, value_name = "N", default_value_t = 12)]
    alarm: u32,

    /// Diagnostics level on stderr (1 = debug, 2 and up = trace).
    #[arg(long, value_name = "LEVEL", num_args = 0..=1, default_missing_value = "1")]
    debug: Option<u8>,

    /// When started as root, switch to this user.
    #[arg(long, value_name = "USER")]
    user: Option<String>,
}

fn init_logging(debug: Option<u8>) {
    let filter = match debug {
        Some(level) if level >= 2 => EnvFilter::new("trace"),
        Some(_) => EnvFilter::new("debug"),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let superuser = match bootstrap::drop_privileges(args.user.as_deref()) {
        Ok(superuser) => superuser,
        Err(e) => {
            eprintln!("warden: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let (reader, writer) = match ipc::control_channel(args.alt_fds) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("warden: cannot open control channel: {e}");
            std::process::exit(EXIT_NO_CHANNEL);
        }
    };

    let config = SupervisorConfig {
        superuser,
        alarm_max_time: args.alarm,
        group_term_on_teardown: true,
    };
    let supervisor = match Supervisor::new(reader, writer, config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("warden: {e}");
            std::process::exit(exit_code::DEV_NULL);
        }
    };

    info!(superuser, alt_fds = args.alt_fds, "warden started");
    let code = supervisor.run().await;
    debug!(code, "exiting");
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::try_parse_from(["warden"]).unwrap();
        assert!(!args.alt_fds);
        assert_eq!(args.alarm, 12);
        assert_eq!(args.debug, None);
        assert_eq!(args.user, None);
    }

    #[test]
    fn test_full_flag_set() {
        let args =
            Args::try_parse_from(["warden", "-n", "--alarm", "30", "--debug", "2", "--user", "nobody"])
                .unwrap();
        assert!(args.alt_fds);
        assert_eq!(args.alarm, 30);
        assert_eq!(args.debug, Some(2));
        assert_eq!(args.user.as_deref(), Some("nobody"));
    }

    #[test]
    fn test_debug_level_defaults_to_one() {
        let args = Args::try_parse_from(["warden", "--debug"]).unwrap();
        assert_eq!(args.debug, Some(1));
    }

    #[test]
    fn test_unknown_flag_is_a_usage_error() {
        assert!(Args::try_parse_from(["warden", "--frobnicate"]).is_err());
    }
}
