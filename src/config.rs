//! Manager and worker configuration.
//!
//! Values come from code defaults, then environment overrides, then CLI flags.
//!
//! # Environment Variables
//!
//! - `SCW_WORKERS` - Number of compiling threads (and worker processes)
//! - `SCW_UNUSED_THREADS` - Hardware threads to leave free when sizing automatically
//! - `SCW_MULTITHREADED` - `0`/`false` disables worker processes
//! - `SCW_THREADED_THRESHOLD` - Smallest batch sent to worker processes
//! - `SCW_STALL_TIMEOUT_MS` - How long a thread waits for worker output
//! - `SCW_WORKING_DIR` - Root of the worker working directories
//! - `SCW_WORKER_EXE` - Binary launched as the worker
//! - `SCW_WORKER_IDLE_TIMEOUT_MS` - Worker idle shutdown delay

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::paths;

/// Configuration of a [`CompilingThreadManager`](crate::worker::CompilingThreadManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Explicit thread count; `None` sizes from the hardware.
    pub worker_count: Option<usize>,
    /// Hardware threads left free when sizing automatically.
    pub unused_threads: usize,
    pub allow_multithreaded: bool,
    /// Batches smaller than this compile in-process.
    pub threaded_compile_threshold: usize,
    /// How long a thread waits for its worker's output before declaring a stall.
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
    pub working_root: PathBuf,
    /// Worker binary; `None` means the running executable.
    pub worker_executable: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            unused_threads: 1,
            allow_multithreaded: true,
            threaded_compile_threshold: 4,
            stall_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            working_root: paths::default_working_root(),
            worker_executable: None,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threaded_compile_threshold = threshold;
        self
    }

    pub fn with_multithreaded(mut self, enabled: bool) -> Self {
        self.allow_multithreaded = enabled;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_working_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.working_root = root.into();
        self
    }

    pub fn with_worker_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_executable = Some(exe.into());
        self
    }

    /// Apply `SCW_*` environment overrides. Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(count) = env_parse::<usize>("SCW_WORKERS") {
            self.worker_count = Some(count);
        }
        if let Some(unused) = env_parse::<usize>("SCW_UNUSED_THREADS") {
            self.unused_threads = unused;
        }
        if let Ok(value) = std::env::var("SCW_MULTITHREADED") {
            match parse_bool(&value) {
                Some(enabled) => self.allow_multithreaded = enabled,
                None => warn!(value = %value, "ignoring invalid SCW_MULTITHREADED"),
            }
        }
        if let Some(threshold) = env_parse::<usize>("SCW_THREADED_THRESHOLD") {
            self.threaded_compile_threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>("SCW_STALL_TIMEOUT_MS") {
            self.stall_timeout = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("SCW_WORKING_DIR")
            && !dir.is_empty()
        {
            self.working_root = paths::expand_tilde(dir);
        }
        if let Ok(exe) = std::env::var("SCW_WORKER_EXE")
            && !exe.is_empty()
        {
            self.worker_executable = Some(paths::expand_tilde(exe));
        }
        self
    }

    /// Number of compiling threads this configuration runs.
    pub fn thread_count(&self) -> usize {
        match self.worker_count {
            Some(count) => count.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .saturating_sub(self.unused_threads)
                .max(1),
        }
    }

    /// Whether batches can go to worker processes at all.
    pub fn uses_workers(&self) -> bool {
        self.allow_multithreaded && self.thread_count() > 1
    }
}

/// Worker-side timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimings {
    pub poll_interval: Duration,
    /// Exit after this long without a job.
    pub idle_timeout: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(20),
        }
    }
}

impl WorkerTimings {
    /// Apply `SCW_WORKER_IDLE_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("SCW_WORKER_IDLE_TIMEOUT_MS") {
            self.idle_timeout = Duration::from_millis(ms);
        }
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %value, "ignoring invalid environment override");
            None
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
