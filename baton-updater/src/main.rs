//! # Baton Updater Host
//!
//! Started by an application that has update steps left which can only run
//! while it is closed. The host receives the update session over a named
//! pipe, waits for the application to exit, finishes those steps and can
//! start the application again.
//!
//! ## Usage
//! ```bash
//! baton-updater <sync-name> [--show-console] [--log]
//! ```
//!
//! Exit code 0 means every step completed, 1 means the update failed or the
//! arguments were invalid.

use std::process::ExitCode;

use tracing::{error, info};

mod cli;
mod host;
mod preload;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse() {
        Ok(args) => args,
        Err(code) => return code,
    };

    if let Err(e) = baton_common::init_logging(&args.log_level) {
        eprintln!("Failed to initialise logging: {e:#}");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sync = %args.sync_name,
        "Starting updater host"
    );

    match host::run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = format!("{e:#}"), "Updater host failed");
            ExitCode::FAILURE
        }
    }
}
