//! Crash capture for worker faults.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

/// What the worker knew when it faulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    /// Job in flight, if any.
    pub job: Option<String>,
    pub message: String,
}

/// Receives fault reports before the worker writes its error record and exits.
pub trait CrashReporter: Send {
    fn report(&self, report: &FaultReport);
}

/// Default reporter: an error event in the worker log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrashReporter;

impl CrashReporter for LogCrashReporter {
    fn report(&self, report: &FaultReport) {
        error!(
            job = report.job.as_deref().unwrap_or("<none>"),
            message = %report.message,
            "worker fault"
        );
    }
}

/// Reporter that keeps every report, for inspection.
#[derive(Debug, Default, Clone)]
pub struct CollectingCrashReporter {
    reports: Arc<Mutex<Vec<FaultReport>>>,
}

impl CollectingCrashReporter {
    pub fn reports(&self) -> Vec<FaultReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CrashReporter for CollectingCrashReporter {
    fn report(&self, report: &FaultReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter_shares_reports_between_clones() {
        let reporter = CollectingCrashReporter::default();
        let handle = reporter.clone();
        reporter.report(&FaultReport {
            job: Some("A.usf:Main".to_string()),
            message: "compile faulted: boom".to_string(),
        });
        assert_eq!(handle.reports().len(), 1);
        assert_eq!(handle.reports()[0].job.as_deref(), Some("A.usf:Main"));
    }

    #[test]
    fn test_log_reporter_does_not_panic_without_subscriber() {
        LogCrashReporter.report(&FaultReport {
            job: None,
            message: "x".to_string(),
        });
    }
}
