//! Replace a single file with a downloaded copy.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{backup_file, replace_file, StepContext, UpdateStep};
use crate::attributes::Attributes;
use crate::checksum::{checksums_match, sha256_file};
use crate::error::{Result, UpdateError};
use crate::permissions::has_write_permission;
use crate::source::{FetchRequest, ProgressFn, UpdateSource};
use crate::status::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileUpdateStep {
    /// Path of the file relative to the application folder
    pub local_path: Option<String>,
    /// Remote name; defaults to `local_path`
    pub update_to: Option<String>,
    /// Expected SHA-256 of the download
    pub sha256: Option<String>,
    /// Attempt the replacement while the application is running
    pub hot_swap: bool,

    temp_file: Option<PathBuf>,
    destination: Option<PathBuf>,
    backup: Option<PathBuf>,
    placed: bool,
}

impl FileUpdateStep {
    pub fn new(local_path: impl Into<String>) -> Self {
        Self {
            local_path: Some(local_path.into()),
            ..Default::default()
        }
    }

    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            update_to: attrs.string("updateTo"),
            sha256: attrs.string("sha256-checksum"),
            hot_swap: attrs.flag("hotswap").unwrap_or(false),
            ..Default::default()
        }
    }

    pub fn destination(&self) -> Option<&PathBuf> {
        self.destination.as_ref()
    }

    pub fn backup(&self) -> Option<&PathBuf> {
        self.backup.as_ref()
    }

    pub fn temp_file(&self) -> Option<&PathBuf> {
        self.temp_file.as_ref()
    }

    fn name(&self) -> String {
        self.local_path.clone().unwrap_or_default()
    }

    fn execute_error(&self, source: std::io::Error) -> UpdateError {
        UpdateError::Execute {
            step: self.name(),
            source,
        }
    }
}

#[async_trait]
impl UpdateStep for FileUpdateStep {
    fn default_description(&self) -> String {
        format!("Update {}", self.name())
    }

    fn target_path(&self) -> Option<&str> {
        self.local_path.as_deref()
    }

    async fn prepare(
        &mut self,
        source: &dyn UpdateSource,
        ctx: &StepContext<'_>,
        progress: &ProgressFn,
    ) -> Result<()> {
        let Some(local_path) = self.local_path.clone() else {
            ctx.log.warn("FileUpdateStep: localPath is empty, step is a no-op");
            return Ok(());
        };
        let remote = self.update_to.clone().unwrap_or_else(|| local_path.clone());

        self.temp_file = None;
        let wanted = ctx.temp_folder.join(uuid::Uuid::new_v4().to_string());
        ctx.log.debug(format!(
            "FileUpdateStep: downloading {} with base URL {} to {}",
            remote,
            ctx.base_url.unwrap_or("<none>"),
            wanted.display()
        ));

        let request = FetchRequest {
            url: remote,
            base_url: ctx.base_url.map(str::to_string),
            temp_path: Some(wanted),
        };
        let temp = source.fetch_file(request, progress, ctx.abort).await?;

        if let Some(expected) = self.sha256.clone() {
            let path = temp.clone();
            let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
            if !checksums_match(&expected, &actual) {
                return Err(UpdateError::ChecksumMismatch {
                    path: temp,
                    expected,
                    actual,
                });
            }
        }

        let destination = ctx.app_dir.join(&local_path);
        ctx.log.debug(format!(
            "FileUpdateStep: prepared, destination file {}",
            destination.display()
        ));
        self.temp_file = Some(temp);
        self.destination = Some(destination);
        Ok(())
    }

    fn execute(&mut self, cold_run: bool, ctx: &StepContext<'_>) -> Result<ExecutionStatus> {
        let Some(local_path) = self.local_path.clone() else {
            ctx.log.warn("FileUpdateStep: localPath is empty, step is a no-op");
            return Ok(ExecutionStatus::Successful);
        };
        let destination = self.destination.clone().ok_or_else(|| {
            UpdateError::InvalidState(format!("{} was executed before it was prepared", local_path))
        })?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| self.execute_error(e))?;
        }

        if self.backup.is_none() && destination.is_file() {
            let backup = backup_file(&destination, ctx.backup_folder, &local_path)
                .map_err(|e| self.execute_error(e))?;
            self.backup = Some(backup);
        }

        if self.hot_swap || cold_run {
            let mut attempt = true;

            if destination.exists() && !has_write_permission(&destination) {
                if cold_run {
                    ctx.log.warn(format!(
                        "No permission to modify {}, deleting it to surface the OS error",
                        destination.display()
                    ));
                    fs::remove_file(&destination).map_err(|e| self.execute_error(e))?;
                } else {
                    attempt = false;
                }
                self.hot_swap = false;
            }

            if attempt {
                let temp = self.temp_file.clone().ok_or_else(|| {
                    UpdateError::InvalidState(format!("{} has no downloaded file", local_path))
                })?;

                match replace_file(&temp, &destination) {
                    Ok(()) => {
                        self.temp_file = None;
                        self.placed = true;
                    }
                    Err(e) if cold_run => {
                        return Err(self.execute_error(e));
                    }
                    Err(e) => {
                        ctx.log.warn(format!(
                            "Hot swap of {} failed ({}), deferring to a cold run",
                            destination.display(),
                            e
                        ));
                        self.hot_swap = false;
                    }
                }
            }
        }

        if cold_run || self.hot_swap {
            return Ok(ExecutionStatus::Successful);
        }

        if destination.exists() && !has_write_permission(&destination) {
            Ok(ExecutionStatus::RequiresPrivilegedAppRestart)
        } else {
            Ok(ExecutionStatus::RequiresAppRestart)
        }
    }

    fn rollback(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        let Some(destination) = self.destination.clone() else {
            return Ok(());
        };
        let rollback_error = |source| UpdateError::Rollback {
            step: self.name(),
            source,
        };

        match &self.backup {
            Some(backup) => {
                if !backup.is_file() {
                    return Err(UpdateError::BackupMissing(backup.clone()));
                }
                if destination.exists() {
                    fs::remove_file(&destination).map_err(rollback_error)?;
                }
                fs::copy(backup, &destination).map_err(rollback_error)?;
            }
            None if self.placed && destination.is_file() => {
                // there was no original; drop the file this step created
                fs::remove_file(&destination).map_err(rollback_error)?;
            }
            None => {}
        }

        self.placed = false;
        Ok(())
    }
}
