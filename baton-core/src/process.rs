//! Process liveness checks and termination.
//!
//! A bare PID can be reused once its process exits, so watched processes
//! are tracked as a [`ProcessIdentity`]: the PID plus the start time seen
//! when it was first looked up. A PID whose start time changed is treated
//! as gone.

use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, System};

/// A process pinned to the start time it had when first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Seconds since the epoch, as reported by the OS
    pub start_time: u64,
}

/// Snapshot-based process table refreshed per query
#[derive(Default)]
pub struct ProcessTable {
    system: System,
}

fn is_running(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh(&mut self, pid: u32) -> Option<&Process> {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid)
    }

    /// A zombie or dead process counts as exited.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        self.refresh(pid).map(is_running).unwrap_or(false)
    }

    /// Pin a running process to its start time. `None` if it is not running.
    pub fn identify(&mut self, pid: u32) -> Option<ProcessIdentity> {
        self.refresh(pid)
            .filter(|p| is_running(p))
            .map(|p| ProcessIdentity {
                pid,
                start_time: p.start_time(),
            })
    }

    /// Running and still the same process that was identified.
    pub fn is_same_alive(&mut self, identity: &ProcessIdentity) -> bool {
        self.refresh(identity.pid)
            .map(|p| is_running(p) && p.start_time() == identity.start_time)
            .unwrap_or(false)
    }

    /// Send the OS kill signal, but only to the identified process.
    /// Returns false if it is gone, was replaced, or the signal failed.
    pub fn kill(&mut self, identity: &ProcessIdentity) -> bool {
        match self.refresh(identity.pid) {
            Some(p) if p.start_time() == identity.start_time => p.kill(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let mut table = ProcessTable::new();
        assert!(table.is_alive(std::process::id()));

        let me = table.identify(std::process::id()).unwrap();
        assert!(table.is_same_alive(&me));
    }

    #[test]
    fn test_reused_pid_is_not_the_same_process() {
        let mut table = ProcessTable::new();
        let me = table.identify(std::process::id()).unwrap();
        let stale = ProcessIdentity {
            start_time: me.start_time.wrapping_sub(1),
            ..me
        };

        assert!(!table.is_same_alive(&stale));
        assert!(!table.kill(&stale));
        assert!(table.is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_and_reap() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut table = ProcessTable::new();
        let identity = table.identify(child.id()).unwrap();

        assert!(table.kill(&identity));
        child.wait().unwrap();
        assert!(!table.is_alive(child.id()));
        assert!(table.identify(child.id()).is_none());
    }
}
