//! Delete a file from the application folder.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{backup_file, StepContext, UpdateStep};
use crate::attributes::Attributes;
use crate::error::{Result, UpdateError};
use crate::permissions::has_write_permission;
use crate::source::{ProgressFn, UpdateSource};
use crate::status::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDeleteStep {
    /// Path of the file relative to the application folder
    pub local_path: Option<String>,

    destination: Option<PathBuf>,
    backup: Option<PathBuf>,
    deleted: bool,
}

impl FileDeleteStep {
    pub fn new(local_path: impl Into<String>) -> Self {
        Self {
            local_path: Some(local_path.into()),
            ..Default::default()
        }
    }

    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            ..Default::default()
        }
    }

    fn name(&self) -> String {
        self.local_path.clone().unwrap_or_default()
    }
}

#[async_trait]
impl UpdateStep for FileDeleteStep {
    fn default_description(&self) -> String {
        format!("Delete {}", self.name())
    }

    fn target_path(&self) -> Option<&str> {
        self.local_path.as_deref()
    }

    async fn prepare(
        &mut self,
        _source: &dyn UpdateSource,
        ctx: &StepContext<'_>,
        _progress: &ProgressFn,
    ) -> Result<()> {
        match &self.local_path {
            Some(local_path) => self.destination = Some(ctx.app_dir.join(local_path)),
            None => ctx.log.warn("FileDeleteStep: localPath is empty, step is a no-op"),
        }
        Ok(())
    }

    fn execute(&mut self, cold_run: bool, ctx: &StepContext<'_>) -> Result<ExecutionStatus> {
        let (Some(local_path), Some(destination)) = (self.local_path.clone(), self.destination.clone())
        else {
            return Ok(ExecutionStatus::Successful);
        };
        if !destination.exists() {
            ctx.log.debug(format!("{} is already gone", destination.display()));
            return Ok(ExecutionStatus::Successful);
        }

        let step = self.name();
        if self.backup.is_none() && destination.is_file() {
            let backup = backup_file(&destination, ctx.backup_folder, &local_path)
                .map_err(|source| UpdateError::Execute { step: step.clone(), source })?;
            self.backup = Some(backup);
        }

        if cold_run {
            fs::remove_file(&destination).map_err(|source| UpdateError::Execute { step, source })?;
            self.deleted = true;
            return Ok(ExecutionStatus::Successful);
        }

        if has_write_permission(&destination) {
            Ok(ExecutionStatus::RequiresAppRestart)
        } else {
            Ok(ExecutionStatus::RequiresPrivilegedAppRestart)
        }
    }

    fn rollback(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        let (Some(destination), true) = (self.destination.clone(), self.deleted) else {
            return Ok(());
        };
        let backup = self
            .backup
            .clone()
            .ok_or_else(|| UpdateError::BackupMissing(destination.clone()))?;
        if !backup.is_file() {
            return Err(UpdateError::BackupMissing(backup));
        }

        fs::copy(&backup, &destination).map_err(|source| UpdateError::Rollback {
            step: self.name(),
            source,
        })?;
        self.deleted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use crate::log::UpdateLog;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn test_delete_backs_up_and_restores() {
        let app = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let backup = temp.path().join("backup");
        let (abort, log) = (AbortHandle::new(), UpdateLog::new());
        let ctx = StepContext {
            app_dir: app.path(),
            temp_folder: temp.path(),
            backup_folder: &backup,
            base_url: None,
            abort: &abort,
            log: &log,
        };
        let target = app.path().join("old.so");
        std::fs::write(&target, b"legacy").unwrap();

        let mut step = FileDeleteStep::new("old.so");
        step.prepare(&MemorySource::new(""), &ctx, &|_| {}).await.unwrap();

        assert_eq!(step.execute(false, &ctx).unwrap(), ExecutionStatus::RequiresAppRestart);
        assert!(target.exists());
        assert!(backup.join("old.so").exists());

        assert_eq!(step.execute(true, &ctx).unwrap(), ExecutionStatus::Successful);
        assert!(!target.exists());

        step.rollback(&ctx).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"legacy");
    }

    #[tokio::test]
    async fn test_missing_target_is_successful() {
        let app = tempfile::tempdir().unwrap();
        let (abort, log) = (AbortHandle::new(), UpdateLog::new());
        let ctx = StepContext {
            app_dir: app.path(),
            temp_folder: app.path(),
            backup_folder: app.path(),
            base_url: None,
            abort: &abort,
            log: &log,
        };

        let mut step = FileDeleteStep::new("never-existed");
        step.prepare(&MemorySource::new(""), &ctx, &|_| {}).await.unwrap();
        assert_eq!(step.execute(false, &ctx).unwrap(), ExecutionStatus::Successful);
    }
}
