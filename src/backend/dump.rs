//! Debug dumps of a compile job for reproducing it by hand.
//!
//! A dump directory receives the job's source, its embedded includes, the
//! preprocessed text, a command line that replays the compile with the
//! standalone compiler, and the disassembly when the compile succeeded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::job::{CompileFlags, CompileJob};
use crate::result::CompileResult;

/// Base name shared by all files of one job's dump, e.g. `BasePass_Main`.
pub fn dump_stem(job: &CompileJob) -> String {
    let source = Path::new(&job.source_filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Shader".to_string());
    format!("{}_{}", source, job.entry)
}

/// fxc invocation equivalent to the job.
pub fn fxc_command_line(job: &CompileJob) -> String {
    let stem = dump_stem(job);
    let mut command = format!("fxc {stem}.usf /E {} /T {}", job.entry, job.profile);
    for m in &job.macros {
        command.push_str(&format!(" /D {}={}", m.name, m.value));
    }
    let switches = [
        (CompileFlags::DEBUG, "/Zi"),
        (CompileFlags::SKIP_VALIDATION, "/Vd"),
        (CompileFlags::SKIP_OPTIMIZATION, "/Od"),
        (CompileFlags::AVOID_FLOW_CONTROL, "/Gfa"),
        (CompileFlags::PREFER_FLOW_CONTROL, "/Gfp"),
        (CompileFlags::USE_LEGACY_D3DX9_31_DLL, "/LD"),
    ];
    for (flag, switch) in switches {
        if job.flags.contains(flag) {
            command.push(' ');
            command.push_str(switch);
        }
    }
    command.push_str(&format!(" /Fc {stem}.asm"));
    command
}

/// Keep dump files inside the dump directory whatever the include names say.
fn contained_name(name: &str) -> Option<&str> {
    Path::new(name).file_name().and_then(|n| n.to_str())
}

/// Write the dump for `job` into `dir`. Returns the written paths.
pub fn write_dump(
    dir: &Path,
    job: &CompileJob,
    preprocessed: Option<&str>,
    command_line: &str,
    result: &CompileResult,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let stem = dump_stem(job);
    let mut written = Vec::new();

    let mut put = |name: &str, contents: &str| -> io::Result<()> {
        let path = dir.join(name);
        fs::write(&path, contents)?;
        written.push(path);
        Ok(())
    };

    put(&format!("{stem}.usf"), &job.source)?;
    for include in &job.includes {
        match contained_name(&include.name) {
            Some(name) => put(name, &include.contents)?,
            None => warn!(include = %include.name, "skipping include with no file name"),
        }
    }
    if let Some(text) = preprocessed {
        put(&format!("{stem}.pre"), text)?;
    }
    put(&format!("{stem}.bat"), &format!("{command_line}\n"))?;
    if let Some(disassembly) = &result.disassembly {
        put(&format!("{stem}.asm"), disassembly)?;
    }

    debug!(dir = %dir.display(), files = written.len(), job = %job.label(), "wrote debug dump");
    Ok(written)
}

/// Best-effort dump; a failure is logged and never affects the compile result.
pub fn dump_if_requested(
    job: &CompileJob,
    preprocessed: Option<&str>,
    command_line: impl FnOnce() -> String,
    result: &CompileResult,
) {
    let Some(dir) = job.debug_dump_dir.as_deref() else {
        return;
    };
    if let Err(e) = write_dump(dir, job, preprocessed, &command_line(), result) {
        warn!(dir = %dir.display(), error = %e, "failed to write debug dump");
    }
}
