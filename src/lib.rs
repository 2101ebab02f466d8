//! scw - out-of-process shader compile workers.
//!
//! A [`worker::CompilingThreadManager`] compiles batches of
//! [`job::CompileJob`]s. Large batches go to `scw worker` subprocesses, one per
//! compiling thread, so a crashing or hanging shader compiler takes down a
//! worker instead of the caller. Small batches, debug dumps, and machines
//! with a single thread compile in-process through the same backend adapters.

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod paths;
pub mod result;
pub mod version;
pub mod worker;

pub use config::ManagerConfig;
pub use error::{Result, ScwError};
pub use job::{BackendKind, CompileJob, ShaderStage};
pub use result::CompileResult;
pub use worker::{CompilingThreadManager, JobResult};
