//! Launching worker subprocesses.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use super::proc::WorkerProcess;
use crate::error::{Result, ScwError};

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    /// Binary that understands the `worker` subcommand.
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub parent_pid: u32,
    /// Identifies the manager thread that owns this worker.
    pub thread_token: String,
}

impl WorkerLaunch {
    /// Launch description for a worker of the current process.
    pub fn for_current_process(
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        thread_token: impl Into<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            parent_pid: std::process::id(),
            thread_token: thread_token.into(),
        }
    }

    /// `scw worker <working-dir> <parent-pid> <thread-token>`
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("worker")
            .arg(&self.working_dir)
            .arg(self.parent_pid.to_string())
            .arg(&self.thread_token);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit()); // Worker panics before logging starts still show up
        cmd
    }
}

/// The running executable, which doubles as the worker binary.
pub fn current_executable() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| ScwError::Spawn(format!("Failed to get current executable: {}", e)))
}

/// Spawn a worker subprocess.
pub fn spawn_worker(launch: &WorkerLaunch) -> Result<WorkerProcess> {
    let child = launch.command().spawn().map_err(|e| {
        ScwError::Spawn(format!("{}: {}", launch.executable.display(), e))
    })?;
    debug!(
        pid = child.id(),
        dir = %launch.working_dir.display(),
        token = %launch.thread_token,
        "spawned worker"
    );
    Ok(WorkerProcess::from_child(child))
}
