//! Parent liveness and debugger detection for the worker loop.

use std::fs;

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::{Pid, getppid};

use crate::error::{Result, ScwError};

/// Answers whether the manager process that launched this worker still exists.
pub trait ParentProbe {
    fn parent_alive(&self) -> bool;
}

/// Probe backed by the real process table.
#[derive(Debug, Clone, Copy)]
pub struct ProcessParentProbe {
    pid: Pid,
    /// Whether `pid` was our direct parent at startup; re-parenting then means it died.
    was_direct_parent: bool,
}

impl ProcessParentProbe {
    /// Fails for ids `kill` would read as a process group (`0` or above `i32::MAX`).
    pub fn new(parent_pid: u32) -> Result<Self> {
        let raw = i32::try_from(parent_pid)
            .ok()
            .filter(|&raw| raw > 0)
            .ok_or_else(|| ScwError::Worker(format!("invalid parent process id {}", parent_pid)))?;
        let pid = Pid::from_raw(raw);
        Ok(Self {
            pid,
            was_direct_parent: getppid() == pid,
        })
    }
}

impl ParentProbe for ProcessParentProbe {
    fn parent_alive(&self) -> bool {
        if signal::kill(self.pid, None) == Err(Errno::ESRCH) {
            return false;
        }
        if matches!(process_state(self.pid), Some('Z' | 'X')) {
            return false;
        }
        !(self.was_direct_parent && getppid() != self.pid)
    }
}

/// Scheduler state letter from `/proc/<pid>/stat`.
fn process_state(pid: Pid) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parens; the state follows the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Whether a debugger is tracing this process.
pub fn debugger_attached() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| tracer_pid(&status))
        .is_some_and(|pid| pid != 0)
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
