//! Single-slot file mailbox shared by one manager thread and its worker.
//!
//! Each working directory holds at most one undelivered input record and one
//! undelivered output record. Records are staged in a temp file in the same
//! directory and renamed into place, so a reader never sees a partial file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Record written by the manager, consumed by the worker.
pub const INPUT_FILE: &str = "WorkerInput.bin";
/// Record written by the worker, consumed by the manager.
pub const OUTPUT_FILE: &str = "WorkerOutput.bin";
/// Advisory worker trace log.
pub const LOG_FILE: &str = "WorkerLog.txt";

/// Handle to a working directory used as a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    /// Open a mailbox, creating the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Open an existing mailbox directory without creating it.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Post a job record. A stale output from an earlier round is discarded first.
    pub fn post_input(&self, record: &[u8]) -> io::Result<()> {
        remove_if_exists(&self.output_path())?;
        self.write_atomic(INPUT_FILE, record)
    }

    pub fn input_pending(&self) -> bool {
        self.input_path().exists()
    }

    /// Read the pending input record without consuming it.
    pub fn read_input(&self) -> io::Result<Option<Vec<u8>>> {
        read_if_exists(&self.input_path())
    }

    /// Consume the input record once it has been decoded.
    pub fn remove_input(&self) -> io::Result<()> {
        remove_if_exists(&self.input_path())
    }

    pub fn write_output(&self, record: &[u8]) -> io::Result<()> {
        self.write_atomic(OUTPUT_FILE, record)
    }

    /// Read and delete the output record, if one has been delivered.
    pub fn take_output(&self) -> io::Result<Option<Vec<u8>>> {
        let record = read_if_exists(&self.output_path())?;
        if record.is_some() {
            remove_if_exists(&self.output_path())?;
        }
        Ok(record)
    }

    /// Drop both records, e.g. after killing a worker mid-job.
    pub fn clear(&self) -> io::Result<()> {
        remove_if_exists(&self.input_path())?;
        remove_if_exists(&self.output_path())
    }

    fn write_atomic(&self, name: &str, record: &[u8]) -> io::Result<()> {
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        staged.write_all(record)?;
        staged.flush()?;
        staged
            .persist(self.dir.join(name))
            .map_err(|e| e.error)?;
        Ok(())
    }
}

fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
