//! # Update Manager
//!
//! Orchestrates one update attempt over the whole step list.
//!
//! ## Phases
//!
//! ```text
//! NotChecked ──check_for_updates──► Checked ──prepare_updates──► Prepared
//!                                                                   │
//!                                                             apply_updates
//!                                         ┌─────────────────────────┼─────────────────────┐
//!                                         ▼                         ▼                     ▼
//!                                AppliedSuccessfully          HandedOff          RollbackRequired
//!                                                       (updater host owns          (a step failed)
//!                                                        the session now)
//! ```
//!
//! Each phase is only valid from the state before it. A manager is created
//! per attempt and discarded after apply or [`UpdateManager::clean_up`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Child;
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortHandle;
use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::feed::{FeedReader, XmlFeedReader};
use crate::ipc::{self, InstanceLock};
use crate::launcher::{self, HostFlags};
use crate::log::UpdateLog;
use crate::permissions::{has_folder_write_permission, has_write_permission};
use crate::session::{SessionContext, SESSION_FORMAT_VERSION};
use crate::source::UpdateSource;
use crate::status::{DownloadProgress, ExecutionStatus, ProcessState, UpdateProgress};
use crate::steps::{Step, StepContext};

/// Receives overall progress of prepare and apply
pub type ProgressCallback = Arc<dyn Fn(UpdateProgress) + Send + Sync>;

/// How to apply the prepared steps
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// The application is not running against the targets
    pub cold_run: bool,
    /// Delete temp and backup folders after an in-process apply
    pub clean_up_after: bool,
    /// Start the application again once the updater host is done
    pub relaunch: bool,
    /// Arguments for the relaunched application
    pub relaunch_args: Vec<String>,
    pub host: HostFlags,
}

/// Result of [`UpdateManager::apply_updates`]
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Every step completed in this process
    Applied,
    /// The session went to the updater host. The application should exit
    /// while `lock` is still held.
    HandedOff { child: Child, lock: InstanceLock },
}

/// Drives Check → Prepare → Apply for one update attempt
pub struct UpdateManager {
    config: UpdateConfig,
    app_path: PathBuf,
    app_dir: PathBuf,
    backup_folder: PathBuf,
    state: ProcessState,
    steps: Vec<Step>,
    base_url: Option<String>,
    failed_index: Option<usize>,
    source: Arc<dyn UpdateSource>,
    reader: Box<dyn FeedReader>,
    log: UpdateLog,
    abort: AbortHandle,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("app_path", &self.app_path)
            .field("state", &self.state)
            .field("steps", &self.steps.len())
            .field("backup_folder", &self.backup_folder)
            .finish()
    }
}

impl UpdateManager {
    /// Manager for the currently running executable.
    pub fn new(config: UpdateConfig, source: Arc<dyn UpdateSource>) -> Result<Self> {
        let app_path = std::env::current_exe()?;
        Self::for_application(config, source, app_path)
    }

    /// Manager for the application at `app_path`.
    pub fn for_application(
        config: UpdateConfig,
        source: Arc<dyn UpdateSource>,
        app_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate().map_err(UpdateError::Configuration)?;

        let app_path = app_path.into();
        let app_dir = app_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| UpdateError::Configuration(format!("{} has no parent folder", app_path.display())))?;
        let backup_folder = config.resolve_backup_folder(&app_dir);

        Ok(Self {
            config,
            app_path,
            app_dir,
            backup_folder,
            state: ProcessState::NotChecked,
            steps: Vec::new(),
            base_url: None,
            failed_index: None,
            source,
            reader: Box::new(XmlFeedReader::default()),
            log: UpdateLog::new(),
            abort: AbortHandle::new(),
            progress: None,
        })
    }

    /// Use a different feed reader.
    pub fn with_reader(mut self, reader: Box<dyn FeedReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn updates_available(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn backup_folder(&self) -> &Path {
        &self.backup_folder
    }

    pub fn log(&self) -> &UpdateLog {
        &self.log
    }

    /// Handle that cancels downloads in progress
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Change the backup folder. Only allowed before preparing.
    pub fn set_backup_folder(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !matches!(self.state, ProcessState::NotChecked | ProcessState::Checked) {
            return Err(UpdateError::InvalidState(format!(
                "backup folder cannot change in state {:?}",
                self.state
            )));
        }
        self.backup_folder = self.config.resolve_relative(path.as_ref());
        Ok(())
    }

    fn require(&self, expected: ProcessState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(UpdateError::InvalidState(format!(
                "{} requires state {:?}, current state is {:?}",
                operation, expected, self.state
            )));
        }
        Ok(())
    }

    fn report(&self, task_id: usize, description: &str, download: Option<DownloadProgress>) {
        if let Some(progress) = &self.progress {
            progress(UpdateProgress::new(
                task_id,
                self.steps.len(),
                description.to_string(),
                download,
            ));
        }
    }

    /// Fetch and read the feed, keeping only the steps whose conditions are met.
    ///
    /// Returns the number of steps that need to run.
    #[instrument(skip(self))]
    pub async fn check_for_updates(&mut self) -> Result<usize> {
        self.require(ProcessState::NotChecked, "check_for_updates")?;
        self.abort.reset();

        let text = self.source.fetch_feed().await?;
        if self.abort.is_aborted() {
            return Err(UpdateError::Aborted);
        }

        let feed = self.reader.read(&text)?;
        if let Some(base_url) = feed.base_url {
            debug!(base_url = %base_url, "Feed overrides base URL");
            self.base_url = Some(base_url);
        }

        let total = feed.steps.len();
        let app_dir = &self.app_dir;
        self.steps = feed
            .steps
            .into_iter()
            .filter(|step| step.is_needed(app_dir))
            .collect();

        self.log.debug(format!(
            "Feed lists {} tasks, {} need to run",
            total,
            self.steps.len()
        ));
        info!(total, needed = self.steps.len(), "Checked for updates");
        self.state = ProcessState::Checked;
        Ok(self.steps.len())
    }

    /// Prepare every step. The first failure aborts the phase.
    #[instrument(skip(self), fields(steps = self.steps.len()))]
    pub async fn prepare_updates(&mut self) -> Result<()> {
        self.require(ProcessState::Checked, "prepare_updates")?;
        self.abort.reset();
        fs::create_dir_all(&self.config.temp_folder)?;

        let count = self.steps.len();
        for index in 0..count {
            if self.abort.is_aborted() {
                self.failed_index = Some(index);
                return Err(UpdateError::Aborted);
            }

            let description = self.steps[index].description.clone();
            self.report(index + 1, &description, None);

            let callback = self.progress.clone();
            let report = move |download: DownloadProgress| {
                if let Some(callback) = &callback {
                    callback(UpdateProgress::new(
                        index + 1,
                        count,
                        description.clone(),
                        Some(download),
                    ));
                }
            };

            let ctx = StepContext {
                app_dir: &self.app_dir,
                temp_folder: &self.config.temp_folder,
                backup_folder: &self.backup_folder,
                base_url: self.base_url.as_deref(),
                abort: &self.abort,
                log: &self.log,
            };
            if let Err(e) = self.steps[index]
                .prepare(self.source.as_ref(), &ctx, &report)
                .await
            {
                self.failed_index = Some(index);
                return Err(e);
            }
        }

        info!("All steps prepared");
        self.state = ProcessState::Prepared;
        Ok(())
    }

    /// Make sure backups can be written, falling back to the system temp folder.
    /// Start from an empty backup folder. Leftovers from an earlier,
    /// interrupted run are removed first.
    fn ensure_backup_folder(&mut self) -> Result<()> {
        if self.backup_folder.exists() {
            match fs::remove_dir_all(&self.backup_folder) {
                Ok(()) => self
                    .log
                    .debug(format!("Removed stale backup folder {}", self.backup_folder.display())),
                Err(e) => warn!(dir = %self.backup_folder.display(), error = %e, "Failed to clear backup folder"),
            }
        }

        if fs::create_dir_all(&self.backup_folder).is_ok()
            && has_folder_write_permission(&self.backup_folder)
        {
            return Ok(());
        }

        let fallback = std::env::temp_dir().join(format!("Backup{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&fallback).map_err(|e| {
            UpdateError::Configuration(format!(
                "no writable backup folder ({} or {}): {}",
                self.backup_folder.display(),
                fallback.display(),
                e
            ))
        })?;
        self.log.warn(format!(
            "Backup folder {} is not writable, using {}",
            self.backup_folder.display(),
            fallback.display()
        ));
        self.backup_folder = fallback;
        Ok(())
    }

    /// Execute every prepared step in feed order.
    ///
    /// Stops at the first failure, leaving the manager in `RollbackRequired`.
    /// Steps that need a restart are finished by the updater host, which gets
    /// the whole session handed over.
    #[instrument(skip(self, options), fields(cold_run = options.cold_run))]
    pub async fn apply_updates(&mut self, options: ApplyOptions) -> Result<ApplyOutcome> {
        self.require(ProcessState::Prepared, "apply_updates")?;
        self.ensure_backup_folder()?;
        self.state = ProcessState::RollbackRequired;

        let mut restart = false;
        let mut privileged = false;
        for index in 0..self.steps.len() {
            let description = self.steps[index].description.clone();
            self.report(index + 1, &description, None);

            let ctx = StepContext {
                app_dir: &self.app_dir,
                temp_folder: &self.config.temp_folder,
                backup_folder: &self.backup_folder,
                base_url: self.base_url.as_deref(),
                abort: &self.abort,
                log: &self.log,
            };
            match self.steps[index].execute(options.cold_run, &ctx) {
                Ok(ExecutionStatus::Successful) => {}
                Ok(ExecutionStatus::RequiresAppRestart) => restart = true,
                Ok(ExecutionStatus::RequiresPrivilegedAppRestart) => {
                    restart = true;
                    privileged = true;
                }
                Ok(status) => {
                    self.failed_index = Some(index);
                    return Err(UpdateError::StepFailed {
                        step: description,
                        status: status.to_string(),
                    });
                }
                Err(e) => {
                    self.failed_index = Some(index);
                    return Err(e);
                }
            }
        }

        if !restart {
            info!("All steps applied in process");
            self.state = ProcessState::AppliedSuccessfully;
            if options.clean_up_after {
                self.clean_up();
            }
            return Ok(ApplyOutcome::Applied);
        }

        self.hand_off(options, privileged).await
    }

    async fn hand_off(&mut self, options: ApplyOptions, privileged: bool) -> Result<ApplyOutcome> {
        let staged = launcher::stage_updater(&self.config, &self.app_dir, &self.log)?;
        let privileged = privileged || !has_write_permission(&self.app_dir);
        let sync_name = self.config.update_process_name.clone();
        let lock = InstanceLock::acquire(&sync_name)?;

        let command = launcher::updater_command(
            &self.config,
            &staged,
            &self.config.temp_folder,
            options.host,
            privileged,
        );
        self.log.debug(format!("Starting updater host: {}", launcher::describe(&command)));

        let mut config = self.config.clone();
        config.backup_folder = Some(self.backup_folder.clone());
        let context = SessionContext {
            format_version: SESSION_FORMAT_VERSION,
            config,
            steps: std::mem::take(&mut self.steps),
            app_path: self.app_path.clone(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| self.app_dir.clone()),
            relaunch_application: options.relaunch,
            relaunch_args: options.relaunch_args,
            base_url: self.base_url.clone(),
            log_items: self.log.items(),
        };

        let timeout = self.config.pipe_connect_timeout_duration();
        match ipc::launch_and_send(context, command, &sync_name, timeout).await {
            Ok(child) => {
                info!(pid = ?child.id(), privileged, "Update session handed to updater host");
                self.state = ProcessState::HandedOff;
                Ok(ApplyOutcome::HandedOff { child, lock })
            }
            Err(failure) => {
                self.steps = failure.context.steps;
                self.log.error("Failed to hand the update to the updater host", &failure.error);
                Err(UpdateError::Ipc(failure.error))
            }
        }
    }

    /// Roll back, newest first, every step up to the failed one that got as
    /// far as prepare. Returns the first rollback error, after trying all.
    #[instrument(skip(self))]
    pub fn rollback_updates(&mut self) -> Result<()> {
        if self.state == ProcessState::HandedOff {
            return Err(UpdateError::InvalidState(
                "session belongs to the updater host".to_string(),
            ));
        }

        let last = match self.failed_index {
            Some(index) => index,
            None if self.steps.is_empty() => return Ok(()),
            None => self.steps.len() - 1,
        };

        let ctx = StepContext {
            app_dir: &self.app_dir,
            temp_folder: &self.config.temp_folder,
            backup_folder: &self.backup_folder,
            base_url: self.base_url.as_deref(),
            abort: &self.abort,
            log: &self.log,
        };

        let mut first_error = None;
        for step in self.steps.iter_mut().take(last + 1).rev() {
            if step.status == ExecutionStatus::Pending {
                continue;
            }
            if let Err(e) = step.rollback(&ctx) {
                warn!(step = %step.description, error = %e, "Rollback failed");
                first_error.get_or_insert(e);
            }
        }

        self.failed_index = None;
        self.state = ProcessState::NotChecked;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pick up a session the updater host handed back after relaunching us.
    ///
    /// Returns false when no session is waiting.
    #[instrument(skip(self))]
    pub async fn reinstate_if_restarted(&mut self) -> Result<bool> {
        self.require(ProcessState::NotChecked, "reinstate_if_restarted")?;

        let timeout = self.config.pipe_connect_timeout_duration();
        let Some(context) = ipc::read_context(&self.config.update_process_name, timeout).await? else {
            return Ok(false);
        };

        self.backup_folder = context
            .config
            .backup_folder
            .clone()
            .unwrap_or_else(|| context.config.resolve_backup_folder(&self.app_dir));
        self.config = context.config;
        self.steps = context.steps;
        self.base_url = context.base_url;
        self.log.prepend(context.log_items);
        self.state = ProcessState::AfterRestart;

        info!(steps = self.steps.len(), "Reinstated update session after restart");
        Ok(true)
    }

    /// Drop the session and delete its temp and backup folders.
    ///
    /// After a handoff the folders belong to the updater host and are left
    /// alone.
    pub fn clean_up(&mut self) {
        self.abort.abort();
        self.steps.clear();

        if self.state != ProcessState::HandedOff {
            for dir in [&self.config.temp_folder, &self.backup_folder] {
                if let Err(e) = fs::remove_dir_all(dir) {
                    debug!(dir = %dir.display(), error = %e, "Clean-up skipped folder");
                }
            }
        }

        self.failed_index = None;
        self.base_url = None;
        self.state = ProcessState::NotChecked;
        self.abort.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, feed: &str) -> UpdateManager {
        let config = UpdateConfig {
            temp_folder: dir.path().join("temp"),
            ..UpdateConfig::default()
        };
        let source = Arc::new(MemorySource::new(feed));
        UpdateManager::for_application(config, source, dir.path().join("app/app")).unwrap()
    }

    const EMPTY_FEED: &str = "<Feed><Tasks/></Feed>";

    #[tokio::test]
    async fn test_phase_order_enforced() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, EMPTY_FEED);

        assert!(matches!(
            manager.prepare_updates().await,
            Err(UpdateError::InvalidState(_))
        ));
        assert!(matches!(
            manager.apply_updates(ApplyOptions::default()).await,
            Err(UpdateError::InvalidState(_))
        ));

        assert_eq!(manager.check_for_updates().await.unwrap(), 0);
        assert!(matches!(
            manager.check_for_updates().await,
            Err(UpdateError::InvalidState(_))
        ));
        manager.prepare_updates().await.unwrap();
        assert_eq!(manager.state(), ProcessState::Prepared);
    }

    #[tokio::test]
    async fn test_backup_folder_locked_after_checked() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, EMPTY_FEED);

        manager.set_backup_folder("relative-backup").unwrap();
        assert_eq!(manager.backup_folder(), dir.path().join("temp/relative-backup"));

        manager.check_for_updates().await.unwrap();
        manager.set_backup_folder("/abs/backup").unwrap();
        assert_eq!(manager.backup_folder(), Path::new("/abs/backup"));

        manager.prepare_updates().await.unwrap();
        assert!(manager.set_backup_folder("other").is_err());
    }

    #[tokio::test]
    async fn test_feed_base_url_override() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, r#"<Feed BaseUrl="https://mirror/"><Tasks/></Feed>"#);
        manager.check_for_updates().await.unwrap();
        assert_eq!(manager.base_url.as_deref(), Some("https://mirror/"));
    }

    #[tokio::test]
    async fn test_abort_during_prepare() {
        let dir = TempDir::new().unwrap();
        let feed = r#"<Feed><Tasks><FileUpdateTask localPath="a.txt"/></Tasks></Feed>"#;
        let mut manager = manager(&dir, feed);
        manager.check_for_updates().await.unwrap();

        // Each phase starts with a cleared flag, so raise it from the progress callback
        let abort = manager.abort_handle();
        let progress: ProgressCallback = Arc::new(move |_| abort.abort());
        manager.progress = Some(progress);

        assert!(matches!(
            manager.prepare_updates().await,
            Err(UpdateError::Prepare { .. })
        ));
        assert_eq!(manager.state(), ProcessState::Checked);
    }

    #[tokio::test]
    async fn test_clean_up_removes_folders() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, EMPTY_FEED);
        manager.check_for_updates().await.unwrap();
        manager.prepare_updates().await.unwrap();
        assert!(manager.config().temp_folder.exists());

        manager.clean_up();
        assert!(!manager.config().temp_folder.exists());
        assert_eq!(manager.state(), ProcessState::NotChecked);
        assert!(!manager.abort_handle().is_aborted());
    }

    #[tokio::test]
    async fn test_apply_clears_stale_backup_folder() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir, EMPTY_FEED);
        let backup = dir.path().join("backup");
        fs::create_dir_all(backup.join("lib")).unwrap();
        fs::write(backup.join("lib/leftover.so"), b"old").unwrap();
        manager.set_backup_folder(&backup).unwrap();

        manager.check_for_updates().await.unwrap();
        manager.prepare_updates().await.unwrap();
        assert!(matches!(
            manager.apply_updates(ApplyOptions::default()).await.unwrap(),
            ApplyOutcome::Applied
        ));

        assert_eq!(manager.backup_folder(), backup.as_path());
        assert!(!backup.join("lib").exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = UpdateConfig {
            update_process_name: String::new(),
            ..UpdateConfig::default()
        };
        let source = Arc::new(MemorySource::new(EMPTY_FEED));
        assert!(matches!(
            UpdateManager::for_application(config, source, "/opt/app/app"),
            Err(UpdateError::Configuration(_))
        ));
    }
}
