//! Single-instance lock shared by the application and the updater host.
//!
//! The application holds an exclusive lock on `<temp_dir>/<sync>Mutex.lock`
//! until it exits. The host waits for the lock to become free before touching
//! any files. The OS drops the lock when its holder dies, so a crashed
//! application looks the same as one that exited normally.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use super::sanitize;
use crate::error::IpcError;

const RELEASE_POLL: Duration = Duration::from_millis(100);

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn lock_path(sync_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}Mutex.lock", sanitize(sync_name)))
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Take the lock without waiting.
    pub fn acquire(sync_name: &str) -> Result<Self, IpcError> {
        let path = Self::lock_path(sync_name);
        let file = Self::open(&path)?;
        if !FileExt::try_lock_exclusive(&file)? {
            return Err(IpcError::Locked(path.display().to_string()));
        }
        debug!(path = %path.display(), "Instance lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait `grace`, then poll until no process holds the lock.
    #[instrument]
    pub async fn wait_for_release(
        sync_name: &str,
        grace: Duration,
        timeout: Duration,
    ) -> Result<(), IpcError> {
        sleep(grace).await;

        let path = Self::lock_path(sync_name);
        let deadline = Instant::now() + timeout;
        loop {
            let file = Self::open(&path)?;
            if FileExt::try_lock_exclusive(&file)? {
                let _ = FileExt::unlock(&file);
                info!(path = %path.display(), "Instance lock released by previous holder");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IpcError::LockTimeout {
                    name: path.display().to_string(),
                    timeout,
                });
            }
            sleep(RELEASE_POLL).await;
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique() -> String {
        format!("lock-test-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_free_lock_is_released_immediately() {
        let sync = unique();
        InstanceLock::wait_for_release(&sync, Duration::ZERO, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let sync = unique();
        let _held = InstanceLock::acquire(&sync).unwrap();

        let result =
            InstanceLock::wait_for_release(&sync, Duration::ZERO, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(IpcError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let sync = unique();
        let held = InstanceLock::acquire(&sync).unwrap();
        assert!(matches!(InstanceLock::acquire(&sync), Err(IpcError::Locked(_))));

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move {
                InstanceLock::wait_for_release(&sync, Duration::ZERO, Duration::from_secs(5)).await
            })
        };
        sleep(Duration::from_millis(200)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
    }
}
