//! # Baton Client
//!
//! Drives the update engine from the command line: checks a feed, prepares
//! and applies the steps, and hands restart-bound steps to the updater host.
//!
//! ## Usage
//! ```bash
//! baton --config baton.yaml check
//! baton --feed-url https://updates.example.com/feed.xml --app /opt/myapp/myapp apply --relaunch
//! baton reinstate
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use baton_common::LogFormat;
use baton_core::config::parse_duration;
use baton_core::launcher::HostFlags;
use baton_core::watch::{default_watchdog_path, ProcessWatch};
use baton_core::{ApplyOptions, ApplyOutcome, UpdateManager, UpdateProgress};
use clap::Parser;
use tracing::{error, info, warn};

mod cli;
mod config;

use cli::{Args, Command};
use config::{Config, DEFAULT_CONFIG_PATH};

/// Keeps the file writer flushing until the client exits
type LogGuard = Option<baton_common::WorkerGuard>;

fn init_logging(args: &Args) -> Result<LogGuard> {
    let format: LogFormat = args
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    if let Some(ref dir) = args.log_dir {
        return baton_common::init_logging_with_file(&args.log_level, format, dir, "baton.log").map(Some);
    }
    match format {
        LogFormat::Pretty => baton_common::init_logging(&args.log_level)?,
        LogFormat::Json => baton_common::init_logging_json(&args.log_level)?,
    }
    Ok(None)
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path.display(), "Configuration loaded");
                cfg.with_cli_overrides(args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path.display(), "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default().with_cli_overrides(args)
            }
        },
    };
    config.validate()?;
    Ok(config)
}

fn build_manager(config: &Config) -> Result<UpdateManager> {
    let source = config.source()?;
    let manager = match &config.app_path {
        Some(app) => UpdateManager::for_application(config.update.clone(), source, app.clone()),
        None => UpdateManager::new(config.update.clone(), source),
    }
    .context("Failed to create update manager")?;

    let progress = Arc::new(|p: UpdateProgress| {
        info!(
            task = p.task_id,
            of = p.task_count,
            percent = p.percentage,
            step = %p.task_description,
            "Progress"
        );
    });
    let manager = manager.with_progress(progress);

    // Ctrl-C cancels downloads in flight
    let abort = manager.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting update");
            abort.abort();
        }
    });

    Ok(manager)
}

async fn check(config: &Config) -> Result<()> {
    let mut manager = build_manager(config)?;
    let needed = manager.check_for_updates().await?;
    if needed == 0 {
        println!("No updates available");
        return Ok(());
    }
    println!("{} update step(s) needed:", needed);
    for step in manager.steps() {
        println!("  - {}", step.description);
    }
    Ok(())
}

async fn apply(config: &Config, options: ApplyOptions) -> Result<()> {
    let mut manager = build_manager(config)?;
    if manager.check_for_updates().await? == 0 {
        println!("No updates available");
        return Ok(());
    }

    if let Err(e) = manager.prepare_updates().await {
        manager.clean_up();
        return Err(e).context("Failed to prepare updates");
    }

    match manager.apply_updates(options).await {
        Ok(ApplyOutcome::Applied) => {
            println!("Updates applied");
            Ok(())
        }
        Ok(ApplyOutcome::HandedOff { child, lock: _lock }) => {
            println!(
                "Update handed to the updater host (pid {}); it continues once this process exits",
                child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Apply failed, rolling back");
            if let Err(rollback) = manager.rollback_updates() {
                error!(error = %rollback, "Rollback incomplete");
            }
            Err(e).context("Failed to apply updates")
        }
    }
}

async fn reinstate(config: &Config) -> Result<()> {
    let mut manager = build_manager(config)?;
    if !manager.reinstate_if_restarted().await? {
        println!("No update session waiting");
        return Ok(());
    }

    for step in manager.steps() {
        println!("  {:<40} {}", step.description, step.status);
    }
    for item in manager.log().items() {
        println!("{}", item);
    }
    manager.clean_up();
    Ok(())
}

async fn watch(pids: &[u32], timeout: &str, watchdog: Option<&Path>) -> Result<()> {
    let timeout = parse_duration(timeout).with_context(|| format!("Invalid timeout '{}'", timeout))?;
    let watchdog = match watchdog {
        Some(path) => path.to_path_buf(),
        None => default_watchdog_path().context("Failed to locate baton-watchdog")?,
    };

    let mut watch = ProcessWatch::start(&watchdog, pids).context("Failed to start watchdog")?;
    if watch.wait_timeout_then_force_exit(timeout).await {
        println!("Watched processes exited");
    } else {
        println!("Watched processes killed after {:?}", timeout);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting baton");

    match &args.command {
        Command::Check => check(&load_config(&args)?).await,
        Command::Apply {
            cold,
            clean_up,
            relaunch,
            show_console,
            host_log,
            relaunch_args,
        } => {
            let options = ApplyOptions {
                cold_run: *cold,
                clean_up_after: *clean_up,
                relaunch: *relaunch,
                relaunch_args: relaunch_args.clone(),
                host: HostFlags {
                    show_console: *show_console,
                    log: *host_log,
                },
            };
            apply(&load_config(&args)?, options).await
        }
        Command::Reinstate => reinstate(&load_config(&args)?).await,
        Command::Watch {
            timeout,
            watchdog,
            pids,
        } => watch(pids, timeout, watchdog.as_deref()).await,
    }
}
