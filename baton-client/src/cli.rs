//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Baton - check, download and apply application updates
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(about = "Baton - check, download and apply application updates")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "BATON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Also write daily-rotated log files into this folder
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Feed URL (overrides config)
    #[arg(long, conflicts_with = "feed_path")]
    pub feed_url: Option<String>,

    /// Feed on a local or shared path (overrides config)
    #[arg(long)]
    pub feed_path: Option<PathBuf>,

    /// HTTP proxy for the web feed
    #[arg(long)]
    pub proxy: Option<String>,

    /// Executable of the application being updated
    #[arg(long)]
    pub app: Option<PathBuf>,

    /// Synchronisation name shared with the updater host
    #[arg(long)]
    pub sync_name: Option<String>,

    /// Folder for downloads and the staged updater host
    #[arg(long)]
    pub temp_folder: Option<PathBuf>,

    /// Folder for backups of replaced files
    #[arg(long)]
    pub backup_folder: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the update steps that need to run
    Check,

    /// Check, prepare and apply updates
    Apply {
        /// The application is closed; replace files directly
        #[arg(long)]
        cold: bool,

        /// Delete temp and backup folders after an in-process apply
        #[arg(long)]
        clean_up: bool,

        /// Start the application again after the updater host finishes
        #[arg(long)]
        relaunch: bool,

        /// Show the updater host console
        #[arg(long)]
        show_console: bool,

        /// Have the updater host write its log next to the application
        #[arg(long)]
        host_log: bool,

        /// Arguments for the relaunched application
        #[arg(last = true)]
        relaunch_args: Vec<String>,
    },

    /// Pick up a session handed back by the updater host
    Reinstate,

    /// Kill the given processes if this command is interrupted or they
    /// outlive the timeout
    Watch {
        /// How long to wait for the processes (e.g. "30s", "5m")
        #[arg(long, default_value = "1m")]
        timeout: String,

        /// Location of baton-watchdog
        #[arg(long)]
        watchdog: Option<PathBuf>,

        /// Process IDs to watch
        #[arg(required = true)]
        pids: Vec<u32>,
    },
}
