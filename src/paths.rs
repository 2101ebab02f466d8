//! Working directory layout.
//!
//! ```text
//! <root>/<parent-pid>/<thread-id>/WorkerInput.bin
//!                                 WorkerOutput.bin
//!                                 WorkerLog.txt
//! <root>/<parent-pid>/local/      scratch space for in-process compiles
//! ```

use std::path::{Path, PathBuf};

/// Name of the scratch directory used when compiling in-process.
pub const LOCAL_DIR_NAME: &str = "local";

/// Default root for worker working directories.
///
/// - Linux: `~/.cache/scw/WorkingDirectory`
/// - macOS: `~/Library/Caches/scw/WorkingDirectory`
pub fn default_working_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("scw"))
        .unwrap_or_else(|| std::env::temp_dir().join("scw"))
        .join("WorkingDirectory")
}

/// Directory shared by all workers of one manager process.
pub fn process_directory(root: &Path, parent_pid: u32) -> PathBuf {
    root.join(parent_pid.to_string())
}

/// Mailbox directory for one manager thread.
pub fn working_directory(root: &Path, parent_pid: u32, thread_id: usize) -> PathBuf {
    process_directory(root, parent_pid).join(thread_id.to_string())
}

/// Scratch directory for in-process compiles.
pub fn local_directory(root: &Path, parent_pid: u32) -> PathBuf {
    process_directory(root, parent_pid).join(LOCAL_DIR_NAME)
}

/// Expands a leading `~` in a path to the user's home directory.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
