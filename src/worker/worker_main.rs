//! The `scw worker` process: poll the mailbox, compile, reply, repeat.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::crash::{CrashReporter, FaultReport, LogCrashReporter};
use super::liveness::{ParentProbe, ProcessParentProbe, debugger_attached};
use super::mailbox::Mailbox;
use super::protocol::{decode_job, encode_result, encode_worker_error};
use crate::backend::AdapterSet;
use crate::config::WorkerTimings;
use crate::logging;

/// Command-line arguments of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub working_dir: PathBuf,
    pub parent_pid: u32,
    pub thread_token: String,
}

/// Why the worker loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    ParentGone,
    IdleTimeout,
    /// Diagnostic text also written as the `WorkerError` record.
    Fault(String),
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParentGone | Self::IdleTimeout => 0,
            Self::Fault(_) => 1,
        }
    }
}

/// Worker state machine, independent of the real process table for testing.
pub struct WorkerLoop<P: ParentProbe> {
    mailbox: Mailbox,
    adapters: AdapterSet,
    probe: P,
    reporter: Box<dyn CrashReporter>,
    timings: WorkerTimings,
    last_activity: Instant,
    jobs_processed: u64,
}

impl<P: ParentProbe> WorkerLoop<P> {
    /// Backend adapters stage their scratch files in the mailbox directory.
    pub fn new(mailbox: Mailbox, probe: P, timings: WorkerTimings) -> Self {
        let adapters = AdapterSet::new(mailbox.dir());
        Self {
            mailbox,
            adapters,
            probe,
            reporter: Box::new(LogCrashReporter),
            timings,
            last_activity: Instant::now(),
            jobs_processed: 0,
        }
    }

    pub fn with_reporter(mut self, reporter: impl CrashReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed
    }

    /// Run until the parent goes away, the idle timeout passes, or a fault.
    pub fn run(&mut self) -> WorkerExit {
        info!(
            dir = %self.mailbox.dir().display(),
            idle_timeout_ms = self.timings.idle_timeout.as_millis() as u64,
            "worker started"
        );
        loop {
            if let Some(exit) = self.step() {
                info!(
                    jobs = self.jobs_processed,
                    code = exit.code(),
                    reason = ?exit,
                    "worker stopping"
                );
                return exit;
            }
        }
    }

    /// One iteration: process a pending input, or check the exit conditions and sleep.
    pub fn step(&mut self) -> Option<WorkerExit> {
        match self.mailbox.read_input() {
            Ok(Some(record)) => self.process(&record).err(),
            Ok(None) => {
                if let Some(exit) = self.check_exit_conditions() {
                    return Some(exit);
                }
                thread::sleep(self.timings.poll_interval);
                None
            }
            Err(e) => Some(self.fault(None, format!("failed to read input: {}", e))),
        }
    }

    fn process(&mut self, record: &[u8]) -> Result<(), WorkerExit> {
        let job = decode_job(record)
            .map_err(|e| self.fault(None, format!("protocol error: {}", e)))?;
        let label = job.label();
        self.mailbox
            .remove_input()
            .map_err(|e| self.fault(Some(&label), format!("failed to consume input: {}", e)))?;

        let started = Instant::now();
        let result = self
            .adapters
            .compile(&job)
            .map_err(|fault| self.fault(Some(&label), fault.to_string()))?;
        let record = encode_result(&result)
            .map_err(|e| self.fault(Some(&label), format!("protocol error: {}", e)))?;
        self.mailbox
            .write_output(&record)
            .map_err(|e| self.fault(Some(&label), format!("failed to write output: {}", e)))?;

        self.jobs_processed += 1;
        self.last_activity = Instant::now();
        info!(
            job = %label,
            backend = %job.backend,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job complete"
        );
        Ok(())
    }

    fn check_exit_conditions(&self) -> Option<WorkerExit> {
        if debugger_attached() {
            return None;
        }
        if !self.probe.parent_alive() {
            if self.mailbox.input_pending() {
                return Some(self.fault(None, "parent exited with an input pending".to_string()));
            }
            info!("parent process is gone");
            return Some(WorkerExit::ParentGone);
        }
        let idle = self.last_activity.elapsed();
        if idle >= self.timings.idle_timeout && !self.mailbox.input_pending() {
            debug!(idle_ms = idle.as_millis() as u64, "idle timeout");
            return Some(WorkerExit::IdleTimeout);
        }
        None
    }

    /// Report, leave a best-effort `WorkerError` record, and give the exit.
    fn fault(&self, job: Option<&str>, message: String) -> WorkerExit {
        self.reporter.report(&FaultReport {
            job: job.map(str::to_string),
            message: message.clone(),
        });
        let text = match job {
            Some(job) => format!("CriticalError: {} (compiling {})", message, job),
            None => format!("CriticalError: {}", message),
        };
        match encode_worker_error(&text) {
            Ok(record) => {
                if let Err(e) = self.mailbox.write_output(&record) {
                    error!(error = %e, "could not write error record");
                }
            }
            Err(e) => error!(error = %e, "could not encode error record"),
        }
        WorkerExit::Fault(text)
    }
}

/// Entry point of `scw worker`. Never returns.
pub fn run_worker_main(args: WorkerArgs) -> ! {
    let probe = match ProcessParentProbe::new(args.parent_pid) {
        Ok(probe) => probe,
        Err(e) => {
            eprintln!("scw worker: {}", e);
            std::process::exit(1);
        }
    };
    let mailbox = match Mailbox::create(&args.working_dir) {
        Ok(mailbox) => mailbox,
        Err(e) => {
            eprintln!(
                "scw worker: cannot open {}: {}",
                args.working_dir.display(),
                e
            );
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init_worker(&mailbox.log_path()) {
        eprintln!("scw worker: cannot open log: {}", e);
    }
    logging::install_panic_hook();

    let timings = WorkerTimings::default().with_env_overrides();
    if timings.idle_timeout < Duration::from_millis(100) {
        warn!(
            idle_timeout_ms = timings.idle_timeout.as_millis() as u64,
            "very short idle timeout"
        );
    }
    info!(
        parent_pid = args.parent_pid,
        token = %args.thread_token,
        pid = std::process::id(),
        "worker launched"
    );

    let mut worker = WorkerLoop::new(mailbox, probe, timings);
    let code = worker.run().code();
    // Tear down backend adapters before exiting.
    drop(worker);
    std::process::exit(code)
}
