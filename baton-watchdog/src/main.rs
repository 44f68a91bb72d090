//! # Baton Process Watchdog
//!
//! Keeps helper processes from outliving their owner. Given a parent PID and
//! one or more child PIDs it polls once a second; when the parent is gone
//! while children remain, the children are killed.
//!
//! ## Usage
//! ```bash
//! baton-watchdog <parent-pid> <child-pid> [child-pid...]
//! ```
//!
//! Exits 0 once supervision ends, 1 on bad arguments or a parent that is not
//! running.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};

mod supervisor;

/// Baton process watchdog - kills child processes when their parent exits
#[derive(Parser, Debug)]
#[command(name = "baton-watchdog")]
#[command(about = "Baton process watchdog - kills child processes when their parent exits")]
#[command(version)]
struct Args {
    /// Process that owns the children
    parent_pid: u32,

    /// Processes to kill if the parent exits
    #[arg(required = true, num_args = 1..)]
    child_pids: Vec<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BATON_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    if let Err(e) = baton_common::init_logging(&args.log_level) {
        eprintln!("Failed to initialise logging: {e:#}");
    }

    info!(parent = args.parent_pid, children = ?args.child_pids, "Starting process watchdog");
    match supervisor::supervise(args.parent_pid, &args.child_pids, supervisor::POLL_INTERVAL).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Watchdog finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "Watchdog failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["baton-watchdog", "10", "11", "12"]).unwrap();
        assert_eq!(args.parent_pid, 10);
        assert_eq!(args.child_pids, vec![11, 12]);
    }

    #[test]
    fn test_children_required() {
        let err = Args::try_parse_from(["baton-watchdog", "10"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_pids_must_be_numbers() {
        assert!(Args::try_parse_from(["baton-watchdog", "parent", "11"]).is_err());
    }
}
