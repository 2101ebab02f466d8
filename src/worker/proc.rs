//! Process handle for worker subprocesses.

use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{Result, ScwError};

/// Handle to a spawned worker. Reaps the child when it exits and remembers why.
pub struct WorkerProcess {
    pid: Pid,
    exit: Option<TerminationReason>,
}

impl WorkerProcess {
    /// Take over a spawned child. The worker talks through its mailbox, so no
    /// pipes are kept.
    pub fn from_child(child: std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            exit: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Why the worker exited, if it has. Never blocks.
    pub fn poll_exit(&mut self) -> Option<TerminationReason> {
        if self.exit.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => match analyze_wait_status(status) {
                    TerminationReason::StillAlive => {}
                    reason => self.exit = Some(reason),
                },
                Err(_) => self.exit = Some(TerminationReason::Unknown),
            }
        }
        self.exit
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// Block until the worker exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.exit {
            return Ok(reason);
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| ScwError::Worker(format!("waitpid failed: {}", e)))?;
        let reason = analyze_wait_status(status);
        self.exit = Some(reason);
        Ok(reason)
    }

    /// Send SIGTERM to the worker.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| ScwError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL and reap the worker.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.exit {
            return Ok(reason);
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| ScwError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if let Some(reason) = self.exit {
            return Ok(reason);
        }
        let _ = self.terminate();
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(reason) = self.poll_exit() {
                return Ok(reason);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.kill()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));
            if self.poll_exit().is_some() {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
