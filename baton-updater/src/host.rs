//! Updater host run.
//!
//! ```text
//! read session ──► preload ──► wait for app exit ──► run cold steps
//!                                                        │
//!                        success: delete backups ◄───────┤
//!                        failure: roll back, notice ◄────┘
//!                                      │
//!                          relaunch app (optional) ──► dump log ──► self cleanup
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use baton_core::ipc::{self, InstanceLock};
use baton_core::launcher;
use baton_core::{AbortHandle, ExecutionStatus, SessionContext, StepContext, UpdateLog};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, instrument, warn};

use crate::cli::Args;
use crate::preload;

/// How long to wait for the application to send the session
const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Log file written next to the application with `--log`
pub const LOG_FILE_NAME: &str = "baton-update.log";

/// Run the host. Returns whether the update succeeded.
pub async fn run(args: &Args) -> Result<bool> {
    let own_exe = std::env::current_exe().context("Failed to locate host executable")?;

    let context = ipc::read_context(&args.sync_name, SESSION_READ_TIMEOUT)
        .await
        .with_context(|| format!("Failed to receive update session for {}", args.sync_name))?
        .with_context(|| format!("No update session waiting for {}", args.sync_name))?;

    let temp_folder = context.config.temp_folder.clone();
    let succeeded = finish_update(args, &own_exe, context).await;

    if let Err(e) = launcher::schedule_self_cleanup(&temp_folder) {
        warn!(dir = %temp_folder.display(), error = %e, "Temp folder left behind");
    }
    Ok(succeeded)
}

#[instrument(skip_all, fields(sync = %args.sync_name, steps = context.steps.len()))]
async fn finish_update(args: &Args, own_exe: &Path, mut context: SessionContext) -> bool {
    let log = UpdateLog::from_items(std::mem::take(&mut context.log_items));
    log.debug(format!("Updater host received {} steps", context.steps.len()));

    let _images = match (context.config.preload_dependencies, own_exe.parent()) {
        (true, Some(dir)) => preload::preload_siblings(dir, own_exe),
        _ => Vec::new(),
    };

    let app_dir = context.app_dir();
    let backup_folder = context
        .config
        .backup_folder
        .clone()
        .unwrap_or_else(|| context.config.resolve_backup_folder(&app_dir));

    let succeeded = match InstanceLock::wait_for_release(
        &args.sync_name,
        context.config.parent_exit_grace_duration(),
        context.config.parent_exit_timeout_duration(),
    )
    .await
    {
        Ok(()) => run_cold_steps(&mut context, &app_dir, &backup_folder, &log),
        Err(e) => {
            log.error("Application did not exit, nothing was changed", &e);
            false
        }
    };

    if succeeded {
        info!("Update finished");
        if let Err(e) = std::fs::remove_dir_all(&backup_folder) {
            warn!(dir = %backup_folder.display(), error = %e, "Failed to delete backup folder");
        }
    } else {
        show_failure_notice(args.show_console, &log).await;
    }

    if args.log {
        dump_log(&log, &app_dir);
    }

    if context.relaunch_application {
        relaunch(context, &args.sync_name, &log).await;
    }
    succeeded
}

/// Execute every step left for a restart, in order, stopping at the first
/// failure. On failure the steps run here are rolled back.
fn run_cold_steps(
    context: &mut SessionContext,
    app_dir: &Path,
    backup_folder: &Path,
    log: &UpdateLog,
) -> bool {
    let abort = AbortHandle::new();
    let ctx = StepContext {
        app_dir,
        temp_folder: &context.config.temp_folder,
        backup_folder,
        base_url: context.base_url.as_deref(),
        abort: &abort,
        log,
    };

    let mut executed = Vec::new();
    let mut failed = false;
    for (index, step) in context.steps.iter_mut().enumerate() {
        if !step.status.requires_restart() {
            continue;
        }
        log.debug(format!("Running '{}'", step.description));
        executed.push(index);

        match step.execute(true, &ctx) {
            Ok(ExecutionStatus::Successful) => {
                log.debug(format!("'{}' completed", step.description));
            }
            Ok(status) => {
                log.warn(format!("'{}' ended as {}", step.description, status));
                failed = true;
                break;
            }
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    if failed {
        for &index in executed.iter().rev() {
            // Errors are already in the update log
            let _ = context.steps[index].rollback(&ctx);
        }
    }
    !failed
}

async fn show_failure_notice(show_console: bool, log: &UpdateLog) {
    let errors: Vec<String> = log
        .items()
        .into_iter()
        .filter(|item| item.severity == baton_core::Severity::Error)
        .map(|item| item.to_string())
        .collect();
    error!(errors = errors.len(), "Update failed");

    if !show_console {
        return;
    }
    eprintln!("The update could not be completed:");
    for line in &errors {
        eprintln!("  {}", line);
    }
    eprintln!("Press Enter to close.");
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let _ = stdin.read_line(&mut line).await;
}

fn dump_log(log: &UpdateLog, app_dir: &Path) {
    let targets: [PathBuf; 2] = [
        app_dir.join(LOG_FILE_NAME),
        std::env::temp_dir().join(LOG_FILE_NAME),
    ];
    for path in &targets {
        match log.dump(path) {
            Ok(()) => {
                info!(path = %path.display(), "Update log written");
                return;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write update log"),
        }
    }
}

async fn relaunch(mut context: SessionContext, sync_name: &str, log: &UpdateLog) {
    let command = launcher::relaunch_command(
        &context.app_path,
        &context.relaunch_args,
        &context.working_directory,
    );
    log.debug(format!("Relaunching {}", launcher::describe(&command)));
    context.log_items = log.items();

    let timeout = context.config.pipe_connect_timeout_duration();
    match ipc::launch_and_offer(context, command, sync_name, timeout).await {
        Ok(child) => info!(pid = ?child.id(), "Application relaunched"),
        Err(failure) => {
            warn!(error = %failure.error, "Relaunch handoff failed");
        }
    }
}
