//! Out-of-process compile workers.
//!
//! ```text
//! CompilingThreadManager (parent)             scw worker (child, one per thread)
//! ┌──────────────────────────────┐            ┌─────────────────────────────┐
//! │ scw-compile-N thread         │            │ WorkerLoop                  │
//! │   encode_job ──► WorkerInput.bin ───────► │   decode_job                │
//! │                              │            │   AdapterSet::compile       │
//! │   decode_output ◄── WorkerOutput.bin ◄─── │   encode_result             │
//! │   stall / exit / fault check │            │   parent + idle checks      │
//! └──────────────────────────────┘            └─────────────────────────────┘
//!            <root>/<parent-pid>/<thread-id>/ is the shared mailbox
//! ```
//!
//! A faulting worker is killed and replaced and its job retried once; the
//! parent never shares memory with a worker.

pub mod crash;
pub mod liveness;
pub mod mailbox;
pub mod manager;
pub mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod worker_main;

pub use crash::{CollectingCrashReporter, CrashReporter, FaultReport, LogCrashReporter};
pub use liveness::{ParentProbe, ProcessParentProbe};
pub use mailbox::Mailbox;
pub use manager::{CompilingThreadManager, JobId, JobResult, StatsSnapshot};
pub use proc::WorkerProcess;
pub use protocol::{ProtocolError, WorkerOutput};
pub use signals::{FailureKind, TerminationReason, WorkerFailure};
pub use spawn::{WorkerLaunch, spawn_worker};
pub use worker_main::{WorkerArgs, WorkerExit, WorkerLoop, run_worker_main};
