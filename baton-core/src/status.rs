//! Update status tracking
//!
//! Provides the per-step execution status, the manager's process state and
//! the progress payloads reported to callers.

use serde::{Deserialize, Serialize};

/// Execution status of a single update step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionStatus {
    /// Constructed from the feed, not yet prepared
    #[default]
    Pending,

    /// Downloaded and validated, ready to execute
    Prepared,

    /// Applied
    Successful,

    /// Execution failed
    Failed,

    /// Prepare failed
    FailedToPrepare,

    /// Must be finished by the updater host after the application exits
    RequiresAppRestart,

    /// Same as `RequiresAppRestart`, but the host needs elevated privileges
    RequiresPrivilegedAppRestart,
}

impl ExecutionStatus {
    /// Check if this status is final for the current process
    pub fn is_final(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Prepared)
    }

    /// Check if this status represents an error
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::FailedToPrepare)
    }

    /// Check if the step has to be completed by a cold run
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::RequiresAppRestart | ExecutionStatus::RequiresPrivilegedAppRestart
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Prepared => "prepared",
            ExecutionStatus::Successful => "successful",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::FailedToPrepare => "failed to prepare",
            ExecutionStatus::RequiresAppRestart => "requires app restart",
            ExecutionStatus::RequiresPrivilegedAppRestart => "requires privileged app restart",
        };
        f.write_str(s)
    }
}

/// State of the update process owned by an `UpdateManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProcessState {
    #[default]
    NotChecked,
    Checked,
    Prepared,
    /// Reinstated from a session handed back by the updater host
    AfterRestart,
    AppliedSuccessfully,
    RollbackRequired,
    /// The session has been transferred to the updater host
    HandedOff,
}

/// Progress of a single file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// Zero when the server did not announce a length
    pub total_bytes: u64,
    /// Percentage complete (0-100)
    pub percentage: u8,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        let percentage = if total > 0 {
            ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8
        } else {
            0
        };

        Self {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percentage,
        }
    }
}

/// Overall progress reported by the update manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateProgress {
    /// 1-based index of the step being processed
    pub task_id: usize,
    pub task_count: usize,
    pub task_description: String,
    pub download: Option<DownloadProgress>,
    /// Overall percentage across all steps (0-100)
    pub percentage: u8,
}

impl UpdateProgress {
    /// Scale a step-local percentage into the overall range of the session.
    pub fn new(
        task_id: usize,
        task_count: usize,
        task_description: String,
        download: Option<DownloadProgress>,
    ) -> Self {
        let local = download.as_ref().map(|d| d.percentage).unwrap_or(0) as f64;
        let percentage = if task_count > 0 {
            let per_task = 100.0 / task_count as f64;
            (local * per_task / 100.0 + (task_id.saturating_sub(1)) as f64 * per_task).round() as u8
        } else {
            0
        };

        Self {
            task_id,
            task_count,
            task_description,
            download,
            percentage: percentage.min(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(!ExecutionStatus::Pending.is_final());
        assert!(!ExecutionStatus::Prepared.is_final());
        assert!(ExecutionStatus::Successful.is_final());
        assert!(ExecutionStatus::FailedToPrepare.is_error());
        assert!(ExecutionStatus::Failed.is_error());
        assert!(!ExecutionStatus::RequiresAppRestart.is_error());
        assert!(ExecutionStatus::RequiresPrivilegedAppRestart.requires_restart());
        assert!(!ExecutionStatus::Successful.requires_restart());
    }

    #[test]
    fn test_progress_scaling() {
        let half = DownloadProgress::new(50, 100);
        assert_eq!(half.percentage, 50);

        // second of two steps, half way through its download
        let p = UpdateProgress::new(2, 2, "bin/app".into(), Some(half));
        assert_eq!(p.percentage, 75);

        let done = UpdateProgress::new(3, 3, "x".into(), Some(DownloadProgress::new(10, 10)));
        assert_eq!(done.percentage, 100);
    }

    #[test]
    fn test_download_progress_unknown_length() {
        assert_eq!(DownloadProgress::new(1234, 0).percentage, 0);
    }
}
