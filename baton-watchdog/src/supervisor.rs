//! Poll loop that ties child processes to their parent.

use std::time::Duration;

use anyhow::{bail, Result};
use baton_core::process::{ProcessIdentity, ProcessTable};
use tracing::{debug, info, warn};

/// Poll interval used by the binary
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every child exited on its own
    ChildrenExited,
    /// The parent went away and these children were killed
    ParentExited { killed: Vec<u32> },
}

/// Watch `children` until they all exit or `parent` does.
///
/// Every process is pinned to its start time up front, so a reused PID is
/// never mistaken for a watched one. Children already gone are dropped;
/// with none left this returns at once. Otherwise the parent must be
/// running to begin with.
pub async fn supervise(parent: u32, children: &[u32], interval: Duration) -> Result<Outcome> {
    let mut table = ProcessTable::new();

    let children: Vec<ProcessIdentity> = children.iter().filter_map(|&pid| table.identify(pid)).collect();
    if children.is_empty() {
        info!("No watched process is running");
        return Ok(Outcome::ChildrenExited);
    }

    let Some(parent) = table.identify(parent) else {
        bail!("parent process {} is not running", parent);
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let alive: Vec<ProcessIdentity> = children
            .iter()
            .copied()
            .filter(|child| table.is_same_alive(child))
            .collect();
        if alive.is_empty() {
            info!("All watched processes exited");
            return Ok(Outcome::ChildrenExited);
        }

        if !table.is_same_alive(&parent) {
            let remaining: Vec<u32> = alive.iter().map(|c| c.pid).collect();
            info!(parent = parent.pid, ?remaining, "Parent exited, killing remaining processes");
            let mut killed = Vec::new();
            for child in alive {
                if table.kill(&child) {
                    killed.push(child.pid);
                } else {
                    warn!(pid = child.pid, "Failed to kill process");
                }
            }
            return Ok(Outcome::ParentExited { killed });
        }

        debug!(parent = parent.pid, alive = alive.len(), "Still watching");
    }
}
