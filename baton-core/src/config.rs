//! Update configuration
//!
//! Settings shared by the application and the updater host. The resolved
//! configuration travels inside the session context, so the host works with
//! exactly the folders the application chose.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Update engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Folder downloads are staged in and the updater host is copied to
    #[serde(default = "default_temp_folder")]
    pub temp_folder: PathBuf,

    /// Folder for backups of replaced files. Relative paths are resolved
    /// against `temp_folder`; unset means `Backup<ticks>` next to the
    /// application.
    #[serde(default)]
    pub backup_folder: Option<PathBuf>,

    /// Synchronisation name shared by the application and the updater host.
    /// Pipe and instance lock names are derived from it.
    #[serde(default = "default_update_process_name")]
    pub update_process_name: String,

    /// File name the updater host is staged under in `temp_folder`
    #[serde(default = "default_update_executable_name")]
    pub update_executable_name: String,

    /// Location of the updater host binary to stage. Defaults to a sibling of
    /// the current executable named `baton-updater`.
    #[serde(default)]
    pub updater_path: Option<PathBuf>,

    /// Files next to the application copied along with the updater host
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// How long to wait for the peer to open the pipe (e.g. "10s", "500ms")
    #[serde(default = "default_pipe_connect_timeout")]
    pub pipe_connect_timeout: String,

    /// Pause before the host starts waiting on the instance lock
    #[serde(default = "default_parent_exit_grace")]
    pub parent_exit_grace: String,

    /// Upper bound on waiting for the application to exit
    #[serde(default = "default_parent_exit_timeout")]
    pub parent_exit_timeout: String,

    /// Command prefix used to start the host when a privileged restart is needed
    #[serde(default = "default_elevation_command")]
    pub elevation_command: Vec<String>,

    /// Whether the host validates sibling binaries before touching the session
    #[serde(default = "default_preload_dependencies")]
    pub preload_dependencies: bool,
}

fn default_temp_folder() -> PathBuf {
    std::env::temp_dir().join(uuid::Uuid::new_v4().to_string())
}

fn default_update_process_name() -> String {
    "BatonUpdateProcess".to_string()
}

fn default_update_executable_name() -> String {
    format!("baton-update-host{}", std::env::consts::EXE_SUFFIX)
}

fn default_pipe_connect_timeout() -> String {
    "10s".to_string()
}

fn default_parent_exit_grace() -> String {
    "1s".to_string()
}

fn default_parent_exit_timeout() -> String {
    "2m".to_string()
}

fn default_elevation_command() -> Vec<String> {
    if cfg!(unix) {
        vec!["pkexec".to_string()]
    } else {
        Vec::new()
    }
}

fn default_preload_dependencies() -> bool {
    true
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            temp_folder: default_temp_folder(),
            backup_folder: None,
            update_process_name: default_update_process_name(),
            update_executable_name: default_update_executable_name(),
            updater_path: None,
            dependencies: Vec::new(),
            pipe_connect_timeout: default_pipe_connect_timeout(),
            parent_exit_grace: default_parent_exit_grace(),
            parent_exit_timeout: default_parent_exit_timeout(),
            elevation_command: default_elevation_command(),
            preload_dependencies: default_preload_dependencies(),
        }
    }
}

impl UpdateConfig {
    /// Resolve the backup folder for an application living in `app_dir`.
    pub fn resolve_backup_folder(&self, app_dir: &Path) -> PathBuf {
        match &self.backup_folder {
            Some(path) => self.resolve_relative(path),
            None => {
                let ticks = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() / 100;
                app_dir.join(format!("Backup{}", ticks))
            }
        }
    }

    /// Absolute paths are kept, relative ones land under `temp_folder`.
    pub fn resolve_relative(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.temp_folder.join(path)
        }
    }

    /// Backup folder, once resolved
    pub fn backup_folder(&self) -> Option<&Path> {
        self.backup_folder.as_deref()
    }

    pub fn pipe_connect_timeout_duration(&self) -> Duration {
        parse_duration(&self.pipe_connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn parent_exit_grace_duration(&self) -> Duration {
        parse_duration(&self.parent_exit_grace).unwrap_or(Duration::from_secs(1))
    }

    pub fn parent_exit_timeout_duration(&self) -> Duration {
        parse_duration(&self.parent_exit_timeout).unwrap_or(Duration::from_secs(120))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.update_process_name.trim().is_empty() {
            return Err("Update process name cannot be empty".to_string());
        }

        if self.update_executable_name.trim().is_empty() {
            return Err("Update executable name cannot be empty".to_string());
        }

        if self.temp_folder.as_os_str().is_empty() {
            return Err("Temp folder cannot be empty".to_string());
        }

        for (name, value) in [
            ("pipe_connect_timeout", &self.pipe_connect_timeout),
            ("parent_exit_grace", &self.parent_exit_grace),
            ("parent_exit_timeout", &self.parent_exit_timeout),
        ] {
            match parse_duration(value) {
                None => {
                    return Err(format!(
                        "Invalid {} '{}'. Use format like '500ms', '10s', '2m'",
                        name, value
                    ))
                }
                Some(d) if d.is_zero() && name != "parent_exit_grace" => {
                    return Err(format!("{} must be greater than zero", name));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Parse a duration string like "500ms", "10s", "2m", "1h"
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num) = s.strip_suffix("ms") {
        return num.parse().ok().map(Duration::from_millis);
    }

    let (num, unit) = s.split_at(s.len() - 1);
    let num: u64 = num.parse().ok()?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        _ => return None,
    };

    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = UpdateConfig::default();
        assert!(config.validate().is_ok());

        config.update_process_name = "  ".to_string();
        assert!(config.validate().is_err());

        config.update_process_name = "App".to_string();
        config.pipe_connect_timeout = "0s".to_string();
        assert!(config.validate().is_err());

        config.pipe_connect_timeout = "1s".to_string();
        config.parent_exit_grace = "0s".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backup_folder_resolution() {
        let config = UpdateConfig {
            temp_folder: PathBuf::from("/tmp/baton-test"),
            backup_folder: Some(PathBuf::from("bak")),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_backup_folder(Path::new("/opt/app")),
            PathBuf::from("/tmp/baton-test/bak")
        );

        let absolute = UpdateConfig {
            backup_folder: Some(std::env::temp_dir().join("abs-backup")),
            ..Default::default()
        };
        assert_eq!(
            absolute.resolve_backup_folder(Path::new("/opt/app")),
            std::env::temp_dir().join("abs-backup")
        );

        let derived = UpdateConfig::default().resolve_backup_folder(Path::new("/opt/app"));
        assert!(derived.starts_with("/opt/app"));
        assert!(derived
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Backup"));
    }
}
