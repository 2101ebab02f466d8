//! Compiling thread manager.
//!
//! Jobs are queued with [`CompilingThreadManager::submit`] and compiled as one
//! batch by [`CompilingThreadManager::finish_compiling`]. Each compiling thread
//! owns one worker process and one mailbox; a worker that stalls, dies, reports
//! a fault, or writes garbage is replaced and the job retried once.

use std::fs;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use super::mailbox::Mailbox;
use super::proc::WorkerProcess;
use super::protocol::{WorkerOutput, decode_output, encode_job};
use super::signals::{FailureKind, WorkerFailure};
use super::spawn::{WorkerLaunch, current_executable, spawn_worker};
use crate::backend::AdapterSet;
use crate::config::ManagerConfig;
use crate::error::{Result, ScwError};
use crate::job::CompileJob;
use crate::paths;
use crate::result::CompileResult;

/// Identifies a submitted job within one manager.
pub type JobId = u64;

/// Attempts per job on worker processes: the first try plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// How long `shutdown` waits for a worker to honor SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// A finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub id: JobId,
    pub job: CompileJob,
    pub result: CompileResult,
    /// Worker attempts spent on the job; 1 for in-process compiles.
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct ManagerStats {
    jobs_compiled: AtomicU64,
    worker_spawns: AtomicU64,
    retries: AtomicU64,
    permanent_faults: AtomicU64,
}

impl ManagerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub jobs_compiled: u64,
    pub worker_spawns: u64,
    pub retries: u64,
    /// Jobs that failed on both attempts.
    pub permanent_faults: u64,
}

/// State owned by one compiling thread across batches.
struct ThreadSlot {
    id: usize,
    mailbox: Mailbox,
    worker: Option<WorkerProcess>,
    /// Set once spawning failed; the thread compiles in-process for the rest of the batch.
    spawn_failed: bool,
    fallback: Option<AdapterSet>,
}

impl ThreadSlot {
    fn new(id: usize, mailbox: Mailbox) -> Self {
        Self {
            id,
            mailbox,
            worker: None,
            spawn_failed: false,
            fallback: None,
        }
    }
}

/// Why one attempt did not produce a result.
enum AttemptError {
    /// No worker could be started.
    SpawnFailed,
    Failed(WorkerFailure),
}

type Attempt = std::result::Result<CompileResult, AttemptError>;

impl From<FailureKind> for AttemptError {
    fn from(kind: FailureKind) -> Self {
        Self::Failed(WorkerFailure::new(kind))
    }
}

/// Farms compile jobs out to worker processes.
pub struct CompilingThreadManager {
    config: ManagerConfig,
    /// Worker binary, if one could be determined.
    executable: Option<PathBuf>,
    process_dir: PathBuf,
    queue: Mutex<Vec<(JobId, CompileJob)>>,
    next_id: AtomicU64,
    slots: Vec<Mutex<ThreadSlot>>,
    local: Mutex<AdapterSet>,
    batch_lock: Mutex<()>,
    stats: ManagerStats,
}

impl CompilingThreadManager {
    /// Create the manager and its working directories.
    ///
    /// Fails with [`ScwError::WorkingDirectory`] when a directory cannot be created.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let pid = std::process::id();
        let process_dir = paths::process_directory(&config.working_root, pid);
        let local_dir = paths::local_directory(&config.working_root, pid);
        create_dir(&local_dir)?;

        let slot_count = if config.uses_workers() {
            config.thread_count()
        } else {
            0
        };
        let slots = (0..slot_count)
            .map(|id| {
                let dir = paths::working_directory(&config.working_root, pid, id);
                Mailbox::create(&dir)
                    .map(|mailbox| Mutex::new(ThreadSlot::new(id, mailbox)))
                    .map_err(|source| ScwError::WorkingDirectory { path: dir, source })
            })
            .collect::<Result<Vec<_>>>()?;

        let executable = match &config.worker_executable {
            Some(exe) => Some(exe.clone()),
            None if slot_count > 0 => match current_executable() {
                Ok(exe) => Some(exe),
                Err(e) => {
                    warn!(error = %e, "no worker executable; compiling in-process");
                    None
                }
            },
            None => None,
        };

        info!(
            threads = slot_count,
            threshold = config.threaded_compile_threshold,
            dir = %process_dir.display(),
            "compiling thread manager ready"
        );

        Ok(Self {
            executable,
            process_dir,
            queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            slots,
            local: Mutex::new(AdapterSet::new(local_dir)),
            batch_lock: Mutex::new(()),
            stats: ManagerStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of compiling threads (and worker processes) available to a batch.
    pub fn thread_count(&self) -> usize {
        self.slots.len()
    }

    /// Queue a job for the next [`finish_compiling`](Self::finish_compiling).
    pub fn submit(&self, job: CompileJob) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, job = %job.label(), "job queued");
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, job));
        id
    }

    /// Jobs waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Submit every job, then finish the batch.
    pub fn compile_batch(
        &self,
        jobs: impl IntoIterator<Item = CompileJob>,
    ) -> Result<Vec<JobResult>> {
        for job in jobs {
            self.submit(job);
        }
        self.finish_compiling()
    }

    /// Compile every queued job and block until all have results.
    ///
    /// Results are sorted by [`JobId`]. Per-job failures are results, not errors.
    pub fn finish_compiling(&self) -> Result<Vec<JobResult>> {
        let _batch = self
            .batch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let batch = mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let in_process = self.in_process_reason(&batch);
        let mut results = match in_process {
            Some(reason) => {
                debug!(jobs = batch.len(), reason, "compiling in-process");
                self.compile_in_process(batch)
            }
            None => {
                self.ensure_directories()?;
                self.compile_on_workers(batch)
            }
        };
        results.sort_by_key(|r| r.id);

        info!(
            jobs = results.len(),
            failed = results.iter().filter(|r| !r.result.success).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(results)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_compiled: self.stats.jobs_compiled.load(Ordering::Relaxed),
            worker_spawns: self.stats.worker_spawns.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            permanent_faults: self.stats.permanent_faults.load(Ordering::Relaxed),
        }
    }

    /// Stop every live worker and remove this process's working directories.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut worker) = slot.worker.take() {
                match worker.stop(SHUTDOWN_GRACE) {
                    Ok(reason) => {
                        debug!(worker_id = slot.id, pid = %worker.pid(), %reason, "worker stopped")
                    }
                    Err(e) => warn!(worker_id = slot.id, error = %e, "failed to stop worker"),
                }
            }
        }
        match fs::remove_dir_all(&self.process_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(
                dir = %self.process_dir.display(),
                error = %e,
                "could not remove working directory"
            ),
        }
    }

    fn in_process_reason(&self, batch: &[(JobId, CompileJob)]) -> Option<&'static str> {
        if !self.config.allow_multithreaded {
            Some("multithreaded compiling disabled")
        } else if self.slots.len() <= 1 {
            Some("single compiling thread")
        } else if batch.len() < self.config.threaded_compile_threshold {
            Some("batch below threshold")
        } else if batch.iter().any(|(_, job)| job.wants_debug_dump()) {
            Some("debug dump requested")
        } else {
            None
        }
    }

    /// Recreate the working directories if something removed them.
    fn ensure_directories(&self) -> Result<()> {
        for slot in &self.slots {
            let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            create_dir(slot.mailbox.dir())?;
        }
        Ok(())
    }

    fn compile_in_process(&self, batch: Vec<(JobId, CompileJob)>) -> Vec<JobResult> {
        let mut adapters = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        batch
            .into_iter()
            .map(|(id, job)| {
                let result = self.compile_local(&mut adapters, &job);
                JobResult {
                    id,
                    job,
                    result,
                    attempts: 1,
                }
            })
            .collect()
    }

    fn compile_local(&self, adapters: &mut AdapterSet, job: &CompileJob) -> CompileResult {
        ManagerStats::bump(&self.stats.jobs_compiled);
        adapters.compile(job).unwrap_or_else(|fault| {
            warn!(job = %job.label(), error = %fault, "in-process compile faulted");
            ManagerStats::bump(&self.stats.permanent_faults);
            CompileResult::internal_error(job.backend, fault.to_string())
        })
    }

    fn compile_on_workers(&self, batch: Vec<(JobId, CompileJob)>) -> Vec<JobResult> {
        let next = AtomicUsize::new(0);
        let (tx, rx) = crossbeam_channel::unbounded();
        let threads = self.slots.len().min(batch.len());

        thread::scope(|scope| {
            for (index, slot) in self.slots[..threads].iter().enumerate() {
                let tx = tx.clone();
                let next = &next;
                let batch = &batch;
                let name = format!("scw-compile-{}", index);
                let spawned = thread::Builder::new().name(name).spawn_scoped(scope, move || {
                    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    slot.spawn_failed = false;
                    while let Some((id, job)) = batch.get(next.fetch_add(1, Ordering::Relaxed)) {
                        let (result, attempts) = self.run_job(&mut slot, job);
                        let delivered = tx.send(JobResult {
                            id: *id,
                            job: job.clone(),
                            result,
                            attempts,
                        });
                        if delivered.is_err() {
                            break;
                        }
                    }
                });
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to start compiling thread");
                }
            }
        });
        drop(tx);

        let mut results: Vec<JobResult> = rx.into_iter().collect();
        if results.len() < batch.len() {
            // No thread picked these up; compile them here.
            let done: std::collections::HashSet<JobId> = results.iter().map(|r| r.id).collect();
            let missing = batch
                .into_iter()
                .filter(|(id, _)| !done.contains(id))
                .collect();
            results.extend(self.compile_in_process(missing));
        }
        results
    }

    /// Run one job on the slot's worker, retrying once on a worker failure.
    fn run_job(&self, slot: &mut ThreadSlot, job: &CompileJob) -> (CompileResult, u32) {
        let label = job.label();
        let _span = info_span!("job", worker_id = slot.id, job = %label).entered();

        if slot.spawn_failed {
            return (self.compile_fallback(slot, job), 1);
        }
        let record = match encode_job(job) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "job cannot be sent to a worker");
                ManagerStats::bump(&self.stats.jobs_compiled);
                ManagerStats::bump(&self.stats.permanent_faults);
                return (CompileResult::internal_error(job.backend, e.to_string()), 1);
            }
        };

        let mut attempt = 1;
        loop {
            match self.attempt(slot, &record) {
                Ok(result) => {
                    ManagerStats::bump(&self.stats.jobs_compiled);
                    return (result, attempt);
                }
                Err(AttemptError::SpawnFailed) => {
                    return (self.compile_fallback(slot, job), attempt);
                }
                Err(AttemptError::Failed(failure)) => {
                    let failure = failure.with_context(label.clone());
                    warn!(attempt, error = %failure, "worker failed");
                    self.recycle(slot);
                    if attempt >= MAX_ATTEMPTS {
                        ManagerStats::bump(&self.stats.jobs_compiled);
                        ManagerStats::bump(&self.stats.permanent_faults);
                        return (
                            CompileResult::internal_error(job.backend, failure.to_string()),
                            attempt,
                        );
                    }
                    ManagerStats::bump(&self.stats.retries);
                    attempt += 1;
                }
            }
        }
    }

    /// Post `record` and wait for the reply.
    fn attempt(&self, slot: &mut ThreadSlot, record: &[u8]) -> Attempt {
        self.ensure_worker(slot)?;
        slot.mailbox
            .post_input(record)
            .map_err(|e| FailureKind::Transport(e.to_string()))?;

        let mut started = Instant::now();
        let mut respawned_idle = false;
        loop {
            if let Some(reply) = take_reply(&slot.mailbox)? {
                return reply;
            }

            let exit = slot.worker.as_mut().and_then(WorkerProcess::poll_exit);
            if let Some(reason) = exit {
                // The worker may have replied just before exiting.
                if let Some(reply) = take_reply(&slot.mailbox)? {
                    return reply;
                }
                if reason.is_clean_exit() && slot.mailbox.input_pending() && !respawned_idle {
                    // It idled out before picking up the job; not the job's fault.
                    debug!(%reason, "worker exited before taking the job; respawning");
                    respawned_idle = true;
                    slot.worker = None;
                    self.ensure_worker(slot)?;
                    started = Instant::now();
                    continue;
                }
                return Err(FailureKind::Died(reason).into());
            }

            if started.elapsed() >= self.config.stall_timeout {
                return Err(FailureKind::Stalled(self.config.stall_timeout).into());
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Make sure the slot has a running worker.
    fn ensure_worker(&self, slot: &mut ThreadSlot) -> std::result::Result<(), AttemptError> {
        if let Some(worker) = slot.worker.as_mut() {
            match worker.poll_exit() {
                None => return Ok(()),
                Some(reason) => {
                    debug!(worker_id = slot.id, pid = %worker.pid(), %reason, "worker exited");
                    slot.worker = None;
                }
            }
        }

        let Some(executable) = &self.executable else {
            slot.spawn_failed = true;
            return Err(AttemptError::SpawnFailed);
        };
        let launch = WorkerLaunch::for_current_process(
            executable,
            slot.mailbox.dir(),
            slot.id.to_string(),
        );
        match spawn_worker(&launch) {
            Ok(worker) => {
                ManagerStats::bump(&self.stats.worker_spawns);
                info!(worker_id = slot.id, pid = %worker.pid(), "worker spawned");
                slot.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                warn!(worker_id = slot.id, error = %e, "falling back to in-process compiling");
                slot.spawn_failed = true;
                Err(AttemptError::SpawnFailed)
            }
        }
    }

    /// Kill the slot's worker and empty its mailbox.
    fn recycle(&self, slot: &mut ThreadSlot) {
        if let Some(mut worker) = slot.worker.take() {
            match worker.kill() {
                Ok(reason) => debug!(pid = %worker.pid(), %reason, "worker reaped"),
                Err(e) => warn!(pid = %worker.pid(), error = %e, "failed to kill worker"),
            }
        }
        if let Err(e) = slot.mailbox.clear() {
            warn!(dir = %slot.mailbox.dir().display(), error = %e, "failed to clear mailbox");
        }
    }

    fn compile_fallback(&self, slot: &mut ThreadSlot, job: &CompileJob) -> CompileResult {
        let scratch = slot.mailbox.dir().join(paths::LOCAL_DIR_NAME);
        let adapters = slot.fallback.get_or_insert_with(|| AdapterSet::new(scratch));
        self.compile_local(adapters, job)
    }
}

impl Drop for CompilingThreadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_dir(path: &std::path::Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| ScwError::WorkingDirectory {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and decode a delivered output record, if any.
fn take_reply(mailbox: &Mailbox) -> std::result::Result<Option<Attempt>, AttemptError> {
    let Some(bytes) = mailbox
        .take_output()
        .map_err(|e| FailureKind::Transport(e.to_string()))?
    else {
        return Ok(None);
    };
    let reply = match decode_output(&bytes) {
        Ok(WorkerOutput::Compiled(result)) => Ok(result),
        Ok(WorkerOutput::WorkerError(message)) => Err(FailureKind::Reported(message).into()),
        Err(e) => Err(FailureKind::Corrupt(e).into()),
    };
    Ok(Some(reply))
}
