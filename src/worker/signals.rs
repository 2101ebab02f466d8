//! Classification of worker exits and failed jobs.

use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use super::protocol::ProtocolError;

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Exited with a status code. 0 is a clean shutdown (parent gone or idle).
    Exited(i32),
    /// Crashed: SIGSEGV, SIGBUS, SIGILL, SIGFPE or SIGABRT.
    Crashed(Signal),
    /// SIGKILL, from the manager or the OOM killer.
    Killed,
    /// Any other signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed(_)) || matches!(self, Self::Exited(code) if *code != 0)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("terminated by {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Map a `WaitStatus` to a termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGABRT => {
                TerminationReason::Crashed(signal)
            }
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// How a job failed on its worker.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// No output within the stall window.
    Stalled(Duration),
    /// The worker exited without writing output.
    Died(TerminationReason),
    /// The worker wrote a `WorkerError` record.
    Reported(String),
    /// The output record did not decode.
    Corrupt(ProtocolError),
    /// The mailbox could not be written or read.
    Transport(String),
}

/// A retryable failure of one job on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    /// Which job was in flight.
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Stalled(waited) => {
                write!(f, "worker produced no output within {}ms", waited.as_millis())?
            }
            FailureKind::Died(reason) => write!(f, "worker {} without output", reason)?,
            FailureKind::Reported(message) => write!(f, "worker reported: {}", message)?,
            FailureKind::Corrupt(err) => write!(f, "unreadable worker output: {}", err)?,
            FailureKind::Transport(message) => write!(f, "mailbox error: {}", message)?,
        }
        if let Some(ctx) = &self.context {
            write!(f, " while compiling {}", ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGABRT, true)),
            TerminationReason::Crashed(Signal::SIGABRT)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_clean_exit_and_crash() {
        assert!(TerminationReason::Exited(0).is_clean_exit());
        assert!(!TerminationReason::Exited(0).is_crash());
        assert!(TerminationReason::Exited(1).is_crash());
        assert!(TerminationReason::Crashed(Signal::SIGSEGV).is_crash());
        assert!(!TerminationReason::Killed.is_clean_exit());
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(FailureKind::Died(TerminationReason::Crashed(
            Signal::SIGABRT,
        )))
        .with_context("BasePass.usf:Main");
        let display = failure.to_string();
        assert!(display.contains("SIGABRT"));
        assert!(display.contains("BasePass.usf:Main"));

        let stalled = WorkerFailure::new(FailureKind::Stalled(Duration::from_millis(250)));
        assert_eq!(stalled.to_string(), "worker produced no output within 250ms");
    }
}
