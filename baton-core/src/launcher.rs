//! Staging and starting the updater host.
//!
//! The host runs from a private copy inside the temp folder so it can replace
//! the application's own files, and deletes that folder behind itself once it
//! is done.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::UpdateConfig;
use crate::log::UpdateLog;

/// Binary name of the updater host next to the application
pub const UPDATER_BINARY: &str = "baton-updater";

/// Flags passed through to the updater host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFlags {
    pub show_console: bool,
    pub log: bool,
}

fn sibling_of_current_exe(name: &str) -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent directory"))?;
    Ok(dir.join(format!("{}{}", name, std::env::consts::EXE_SUFFIX)))
}

/// Where the updater host binary is copied from.
pub fn updater_source_path(config: &UpdateConfig) -> io::Result<PathBuf> {
    match &config.updater_path {
        Some(path) => Ok(path.clone()),
        None => sibling_of_current_exe(UPDATER_BINARY),
    }
}

/// Copy the updater host and its dependencies into the temp folder.
///
/// Returns the path of the staged host binary. Missing dependencies are
/// logged and skipped.
pub fn stage_updater(config: &UpdateConfig, app_dir: &Path, log: &UpdateLog) -> io::Result<PathBuf> {
    let source = updater_source_path(config)?;
    fs::create_dir_all(&config.temp_folder)?;

    let staged = config.temp_folder.join(&config.update_executable_name);
    fs::copy(&source, &staged)?;
    info!(from = %source.display(), to = %staged.display(), "Staged updater host");

    for dependency in &config.dependencies {
        let from = app_dir.join(dependency);
        if !from.is_file() {
            log.warn(format!("Dependency {} not found, skipping", from.display()));
            continue;
        }
        let to = config.temp_folder.join(dependency);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&from, &to)?;
        debug!(dependency = %dependency, "Staged dependency");
    }

    Ok(staged)
}

/// Build the command that starts the staged host.
///
/// With `privileged` set and an elevation command configured, the host is
/// started through it.
pub fn updater_command(
    config: &UpdateConfig,
    staged: &Path,
    working_dir: &Path,
    flags: HostFlags,
    privileged: bool,
) -> Command {
    let mut command = match config.elevation_command.split_first() {
        Some((program, args)) if privileged => {
            let mut command = Command::new(program);
            command.args(args).arg(staged);
            command
        }
        _ => Command::new(staged),
    };

    command.arg(&config.update_process_name);
    if flags.show_console {
        command.arg("--show-console");
    } else {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }
    if flags.log {
        command.arg("--log");
    }
    command.current_dir(working_dir);
    command
}

/// Command that starts the application again after a cold update.
pub fn relaunch_command(app_path: &Path, args: &[String], working_dir: &Path) -> Command {
    let mut command = Command::new(app_path);
    command.args(args).current_dir(working_dir);
    command
}

#[cfg(unix)]
fn cleanup_command(dir: &Path) -> std::process::Command {
    let quoted = dir.to_string_lossy().replace('\'', r"'\''");
    let mut command = std::process::Command::new("sh");
    command
        .arg("-c")
        .arg(format!("sleep 3; rm -rf '{}'", quoted));
    command
}

#[cfg(windows)]
fn cleanup_command(dir: &Path) -> std::process::Command {
    let mut script = OsString::from("ping 127.0.0.1 -n 4 > nul & rmdir /s /q \"");
    script.push(dir.as_os_str());
    script.push("\"");
    let mut command = std::process::Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

/// Delete `dir` from a detached shell after a short delay, so the running
/// binary inside it is gone by then.
pub fn schedule_self_cleanup(dir: &Path) -> io::Result<()> {
    let mut command = cleanup_command(dir);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.spawn() {
        Ok(child) => {
            debug!(dir = %dir.display(), pid = child.id(), "Scheduled self cleanup");
            Ok(())
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to schedule self cleanup");
            Err(e)
        }
    }
}

/// Program and arguments of a command, for logging.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts: Vec<OsString> = vec![std.get_program().to_os_string()];
    parts.extend(std.get_args().map(|a| a.to_os_string()));
    parts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(temp: &Path, updater: &Path) -> UpdateConfig {
        UpdateConfig {
            temp_folder: temp.join("stage"),
            updater_path: Some(updater.to_path_buf()),
            dependencies: vec!["lib/helper.so".to_string(), "missing.dll".to_string()],
            ..UpdateConfig::default()
        }
    }

    #[test]
    fn test_stage_updater_copies_host_and_dependencies() {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("app");
        fs::create_dir_all(app_dir.join("lib")).unwrap();
        fs::write(app_dir.join("lib/helper.so"), b"helper").unwrap();
        let updater = dir.path().join("baton-updater");
        fs::write(&updater, b"host").unwrap();

        let config = config_in(dir.path(), &updater);
        let log = UpdateLog::new();
        let staged = stage_updater(&config, &app_dir, &log).unwrap();

        assert_eq!(staged, config.temp_folder.join(&config.update_executable_name));
        assert_eq!(fs::read(&staged).unwrap(), b"host");
        assert_eq!(fs::read(config.temp_folder.join("lib/helper.so")).unwrap(), b"helper");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_stage_updater_missing_host() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), &dir.path().join("nope"));
        assert!(stage_updater(&config, dir.path(), &UpdateLog::new()).is_err());
    }

    #[test]
    fn test_updater_command_arguments() {
        let config = UpdateConfig {
            update_process_name: "MyApp".to_string(),
            elevation_command: vec!["pkexec".to_string(), "--disable-internal-agent".to_string()],
            ..UpdateConfig::default()
        };
        let staged = Path::new("/tmp/stage/host");
        let flags = HostFlags {
            show_console: true,
            log: true,
        };

        let plain = updater_command(&config, staged, Path::new("/"), flags, false);
        assert_eq!(describe(&plain), "/tmp/stage/host MyApp --show-console --log");

        let elevated = updater_command(&config, staged, Path::new("/"), HostFlags::default(), true);
        assert_eq!(
            describe(&elevated),
            "pkexec --disable-internal-agent /tmp/stage/host MyApp"
        );
    }

    #[test]
    fn test_no_elevation_command_runs_directly() {
        let config = UpdateConfig {
            elevation_command: Vec::new(),
            ..UpdateConfig::default()
        };
        let command = updater_command(&config, Path::new("host"), Path::new("/"), HostFlags::default(), true);
        assert!(describe(&command).starts_with("host "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_self_cleanup_removes_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("it's here");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("file"), b"x").unwrap();

        schedule_self_cleanup(&target).unwrap();
        for _ in 0..100 {
            if !target.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(!target.exists());
    }
}
