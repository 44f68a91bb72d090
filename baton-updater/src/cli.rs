//! Command-line argument parsing.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

/// Baton updater host - finishes updates that need the application closed
#[derive(Parser, Debug)]
#[command(name = "baton-updater")]
#[command(about = "Baton updater host - finishes updates that need the application closed")]
#[command(version)]
pub struct Args {
    /// Synchronisation name of the application instance being updated
    pub sync_name: String,

    /// Keep the console attached and wait for Enter after a failure
    #[arg(long)]
    pub show_console: bool,

    /// Write the update log to baton-update.log next to the application
    #[arg(long)]
    pub log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BATON_LOG_LEVEL")]
    pub log_level: String,
}

/// Parse arguments. Usage errors map to exit code 1, help and version to 0.
pub fn parse() -> Result<Args, ExitCode> {
    match Args::try_parse() {
        Ok(args) => Ok(args),
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Err(ExitCode::SUCCESS),
                _ => Err(ExitCode::FAILURE),
            }
        }
    }
}
