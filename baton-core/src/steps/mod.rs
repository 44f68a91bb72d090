//! # Update Step Engine
//!
//! Each step runs through Prepare, Execute and, if a later step fails,
//! Rollback. [`Step`] wraps a concrete step with its description, condition
//! tree and execution status; the concrete behaviour lives behind the
//! [`UpdateStep`] trait.
//!
//! ## Status transitions
//!
//! ```text
//! Pending ──prepare──► Prepared ──execute──► Successful
//!    │                                  ├──► Failed
//!    └──► FailedToPrepare               ├──► RequiresAppRestart
//!                                       └──► RequiresPrivilegedAppRestart
//! ```

mod file_delete;
mod file_update;

pub use file_delete::FileDeleteStep;
pub use file_update::FileUpdateStep;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::abort::AbortHandle;
use crate::conditions::{Condition, ConditionScope};
use crate::error::{Result, UpdateError};
use crate::log::UpdateLog;
use crate::source::{ProgressFn, UpdateSource};
use crate::status::ExecutionStatus;

/// Everything a step needs from the session that owns it
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub app_dir: &'a Path,
    pub temp_folder: &'a Path,
    pub backup_folder: &'a Path,
    pub base_url: Option<&'a str>,
    pub abort: &'a AbortHandle,
    pub log: &'a UpdateLog,
}

/// Three-phase contract implemented by every step kind
#[async_trait]
pub trait UpdateStep: Send + Sync {
    /// Description used when the feed provides none
    fn default_description(&self) -> String;

    /// Path relative to the application folder this step targets
    fn target_path(&self) -> Option<&str>;

    /// Download and validate without touching the live target.
    async fn prepare(
        &mut self,
        source: &dyn UpdateSource,
        ctx: &StepContext<'_>,
        progress: &ProgressFn,
    ) -> Result<()>;

    /// Apply the step. A cold run happens while the application is not running.
    fn execute(&mut self, cold_run: bool, ctx: &StepContext<'_>) -> Result<ExecutionStatus>;

    /// Restore the target from its backup.
    fn rollback(&mut self, ctx: &StepContext<'_>) -> Result<()>;
}

/// Concrete step kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    FileUpdate(FileUpdateStep),
    FileDelete(FileDeleteStep),
}

impl StepKind {
    fn inner(&self) -> &dyn UpdateStep {
        match self {
            StepKind::FileUpdate(s) => s,
            StepKind::FileDelete(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn UpdateStep {
        match self {
            StepKind::FileUpdate(s) => s,
            StepKind::FileDelete(s) => s,
        }
    }
}

/// One unit of update work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub conditions: Option<Condition>,
    pub status: ExecutionStatus,
    pub kind: StepKind,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            description: kind.inner().default_description(),
            conditions: None,
            status: ExecutionStatus::Pending,
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_conditions(mut self, conditions: Option<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn target_path(&self) -> Option<&str> {
        self.kind.inner().target_path()
    }

    /// Evaluate the condition tree; no tree means the step always runs.
    pub fn is_needed(&self, app_dir: &Path) -> bool {
        match &self.conditions {
            Some(condition) => condition.is_met(&ConditionScope::new(app_dir, self.target_path())),
            None => true,
        }
    }

    #[instrument(skip_all, fields(step = %self.description))]
    pub async fn prepare(
        &mut self,
        source: &dyn UpdateSource,
        ctx: &StepContext<'_>,
        progress: &ProgressFn,
    ) -> Result<()> {
        match self.kind.inner_mut().prepare(source, ctx, progress).await {
            Ok(()) => {
                self.status = ExecutionStatus::Prepared;
                Ok(())
            }
            Err(e) => {
                self.status = ExecutionStatus::FailedToPrepare;
                ctx.log.error(format!("Failed to prepare '{}'", self.description), &e);
                Err(UpdateError::Prepare {
                    step: self.description.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Execute and record the resulting status. Errors mark the step `Failed`.
    #[instrument(skip(self, ctx), fields(step = %self.description))]
    pub fn execute(&mut self, cold_run: bool, ctx: &StepContext<'_>) -> Result<ExecutionStatus> {
        match self.kind.inner_mut().execute(cold_run, ctx) {
            Ok(status) => {
                self.status = status;
                info!(status = %status, "Step executed");
                Ok(status)
            }
            Err(e) => {
                self.status = ExecutionStatus::Failed;
                ctx.log.error(format!("Step '{}' failed", self.description), &e);
                Err(e)
            }
        }
    }

    #[instrument(skip(self, ctx), fields(step = %self.description))]
    pub fn rollback(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let result = self.kind.inner_mut().rollback(ctx);
        match &result {
            Ok(()) => ctx.log.debug(format!("Rolled back '{}'", self.description)),
            Err(e) => ctx.log.error(format!("Rollback of '{}' failed", self.description), e),
        }
        result
    }
}

/// Copy `target` into the backup folder, preserving its relative path.
pub(crate) fn backup_file(target: &Path, backup_folder: &Path, relative: &str) -> io::Result<PathBuf> {
    let backup = backup_folder.join(relative);
    if let Some(parent) = backup.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(target, &backup)?;
    Ok(backup)
}

/// Replace `dest` with `src` by delete-then-move, never overwriting in place.
///
/// Falls back to a copy into a sibling temp file plus rename when `src`
/// lives on another file system.
pub(crate) fn replace_file(src: &Path, dest: &Path) -> io::Result<()> {
    let permissions = fs::metadata(dest).ok().map(|m| m.permissions());

    if dest.exists() {
        fs::remove_file(dest)?;
    }

    if fs::rename(src, dest).is_err() {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = dest.with_file_name(format!(".{}.baton-tmp", file_name));
        fs::copy(src, &staged)?;
        fs::rename(&staged, dest)?;
        let _ = fs::remove_file(src);
    }

    if let Some(mut permissions) = permissions {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        if let Err(e) = fs::set_permissions(dest, permissions) {
            warn!(dest = %dest.display(), error = %e, "Failed to carry over file permissions");
        }
    }

    Ok(())
}
