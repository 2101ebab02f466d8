//! Console (Xenon / PS3) adapter.
//!
//! Console shaders are compiled by a vendor precompiler shim: an external
//! executable located through `SCW_XENON_SHIM` / `SCW_PS3_SHIM` or on `PATH`.
//! The shim is loaded lazily and kept for the adapter's lifetime. A failed
//! load is not remembered, so a toolchain installed mid-session is picked up
//! by the next job.
//!
//! Shim contract:
//!
//! ```text
//! <shim> <source> --entry <name> --profile <profile> --flags <hex>
//!        --output <file> [--define NAME=VALUE]... [--include-dir <dir>]
//! ```
//!
//! Exit status 0 means success: bytecode is in `<file>`, the optional
//! `<file>.params` lists `name set index count` per line and stdout is the
//! disassembly. A nonzero status is a compile error with diagnostics on
//! stderr. Death by signal is a fault.

use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use super::dump;
use super::fault::CompilerFault;
use crate::job::{BackendKind, CompileJob};
use crate::result::{CompileResult, ConstantDesc, RegisterSet};

const OUTPUT_NAME: &str = "ShaderOutput.bin";

fn shim_env_var(platform: BackendKind) -> &'static str {
    match platform {
        BackendKind::Ps3 => "SCW_PS3_SHIM",
        _ => "SCW_XENON_SHIM",
    }
}

fn shim_program(platform: BackendKind) -> &'static str {
    match platform {
        BackendKind::Ps3 => "ps3-shader-shim",
        _ => "xenon-shader-shim",
    }
}

/// Lazily loaded precompiler shim for one console platform.
#[derive(Debug)]
pub struct ShimCache {
    platform: BackendKind,
    explicit: Option<PathBuf>,
    loaded: Option<PathBuf>,
}

impl ShimCache {
    pub fn new(platform: BackendKind) -> Self {
        Self {
            platform,
            explicit: None,
            loaded: None,
        }
    }

    /// Cache that only ever loads `path`.
    pub fn with_path(platform: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            explicit: Some(path.into()),
            loaded: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Load the shim if needed and return its path.
    pub fn init(&mut self) -> Result<&Path, String> {
        if self.loaded.is_none() {
            let path = self.locate()?;
            info!(platform = %self.platform, shim = %path.display(), "loaded shader precompiler");
            self.loaded = Some(path);
        }
        self.loaded
            .as_deref()
            .ok_or_else(|| "shader precompiler not loaded".to_string())
    }

    pub fn teardown(&mut self) {
        if let Some(path) = self.loaded.take() {
            debug!(
                platform = %self.platform,
                shim = %path.display(),
                "unloaded shader precompiler"
            );
        }
    }

    fn locate(&self) -> Result<PathBuf, String> {
        let configured = self
            .explicit
            .clone()
            .or_else(|| std::env::var_os(shim_env_var(self.platform)).map(PathBuf::from));
        match configured {
            Some(path) if path.is_file() => Ok(path),
            Some(path) => Err(format!("{} does not exist", path.display())),
            None => which::which(shim_program(self.platform)).map_err(|_| {
                format!(
                    "{} not found on PATH and {} is not set",
                    shim_program(self.platform),
                    shim_env_var(self.platform)
                )
            }),
        }
    }
}

pub struct ConsoleAdapter {
    platform: BackendKind,
    shims: ShimCache,
    scratch_dir: PathBuf,
}

impl ConsoleAdapter {
    pub fn new(platform: BackendKind, scratch_dir: &Path) -> Self {
        Self::with_shims(ShimCache::new(platform), scratch_dir)
    }

    pub fn with_shims(shims: ShimCache, scratch_dir: &Path) -> Self {
        let platform = shims.platform;
        Self {
            platform,
            shims,
            scratch_dir: scratch_dir.join(scratch_subdir(platform)),
        }
    }

    pub fn teardown(&mut self) {
        self.shims.teardown();
    }

    pub fn compile(&mut self, job: &CompileJob) -> Result<CompileResult, CompilerFault> {
        let shim = match self.shims.init() {
            Ok(path) => path.to_path_buf(),
            Err(reason) => {
                warn!(platform = %self.platform, %reason, "shader precompiler unavailable");
                return Ok(CompileResult::failed(
                    self.platform,
                    format!("{} shader precompiler unavailable: {reason}", self.platform),
                ));
            }
        };

        let source_path = match self.stage_files(job) {
            Ok(path) => path,
            Err(e) => {
                return Ok(CompileResult::failed(
                    self.platform,
                    format!("failed to stage shader files in {}: {e}", self.scratch_dir.display()),
                ));
            }
        };
        let output_path = self.scratch_dir.join(OUTPUT_NAME);
        if let Err(e) = clear_outputs(&output_path) {
            return Ok(CompileResult::failed(
                self.platform,
                format!("failed to clear {}: {e}", output_path.display()),
            ));
        }

        let mut command = self.command(&shim, job, &source_path, &output_path);
        let output = match command.output() {
            Ok(output) => output,
            Err(e) => {
                // The shim vanished or is not executable; locate it again next time.
                self.shims.teardown();
                return Ok(CompileResult::failed(
                    self.platform,
                    format!("failed to run {}: {e}", shim.display()),
                ));
            }
        };

        let result = self.collect(&shim, &output, &output_path)?;
        dump::dump_if_requested(job, None, || format!("{command:?}"), &result);
        Ok(result)
    }

    fn stage_files(&self, job: &CompileJob) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.scratch_dir)?;
        for include in &job.includes {
            let Some(name) = Path::new(&include.name).file_name() else {
                continue;
            };
            fs::write(self.scratch_dir.join(name), &include.contents)?;
        }
        let name = Path::new(&job.source_filename)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("Shader.usf"));
        let path = self.scratch_dir.join(name);
        fs::write(&path, &job.source)?;
        Ok(path)
    }

    fn command(&self, shim: &Path, job: &CompileJob, source: &Path, output: &Path) -> Command {
        let mut command = Command::new(shim);
        command
            .current_dir(&self.scratch_dir)
            .arg(source)
            .args(["--entry", job.entry.as_str(), "--profile", job.profile.as_str()])
            .arg("--flags")
            .arg(format!("{:#x}", job.flags))
            .arg("--output")
            .arg(output);
        for m in &job.macros {
            command.arg("--define").arg(format!("{}={}", m.name, m.value));
        }
        if let Some(dir) = &job.include_path {
            command.arg("--include-dir").arg(dir);
        }
        command
    }

    fn collect(
        &self,
        shim: &Path,
        output: &Output,
        output_path: &Path,
    ) -> Result<CompileResult, CompilerFault> {
        if let Some(signal) = output.status.signal() {
            return Err(CompilerFault {
                operation: "compile",
                message: format!("{} killed by signal {signal}", shim.display()),
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Ok(CompileResult::failed(self.platform, stderr));
        }

        let bytecode = fs::read(output_path).map_err(|e| CompilerFault {
            operation: "compile",
            message: format!("{} produced no output: {e}", shim.display()),
        })?;
        let constants = match fs::read_to_string(params_path(output_path)) {
            Ok(text) => parse_params(&text).map_err(|message| CompilerFault {
                operation: "reflect",
                message,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(CompilerFault {
                    operation: "reflect",
                    message: e.to_string(),
                });
            }
        };
        let disassembly = String::from_utf8_lossy(&output.stdout).into_owned();

        Ok(CompileResult::compiled(
            self.platform,
            bytecode,
            stderr,
            constants,
            (!disassembly.is_empty()).then_some(disassembly),
        ))
    }
}

fn params_path(output_path: &Path) -> PathBuf {
    let mut path = output_path.as_os_str().to_owned();
    path.push(".params");
    PathBuf::from(path)
}

/// Remove the bytecode and parameter files a previous shim run left in the scratch dir.
fn clear_outputs(output_path: &Path) -> io::Result<()> {
    for path in [output_path.to_path_buf(), params_path(output_path)] {
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

fn scratch_subdir(platform: BackendKind) -> &'static str {
    match platform {
        BackendKind::Ps3 => "ps3",
        _ => "xenon",
    }
}

fn parse_register_set(token: &str) -> Option<RegisterSet> {
    match token {
        "b" | "bool" => Some(RegisterSet::Bool),
        "i" | "int4" => Some(RegisterSet::Int4),
        "c" | "float4" => Some(RegisterSet::Float4),
        "s" | "sampler" => Some(RegisterSet::Sampler),
        _ => None,
    }
}

/// Parse the shim's parameter listing: `name set index count` per line.
fn parse_params(text: &str) -> Result<Vec<ConstantDesc>, String> {
    let mut constants = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let bad = || format!("malformed parameter line {}: '{line}'", number + 1);
        let &[name, set, index, count] = fields.as_slice() else {
            return Err(bad());
        };
        constants.push(ConstantDesc {
            name: name.to_string(),
            register_set: parse_register_set(set).ok_or_else(bad)?,
            register_index: index.parse().map_err(|_| bad())?,
            register_count: count.parse().map_err(|_| bad())?,
        });
    }
    Ok(constants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ShaderStage;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const FAKE_SHIM: &str = r#"#!/bin/sh
src="$1"; shift
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if grep -q SYNTAX_ERROR "$src"; then
  echo "$src(1): error: syntax error" >&2
  exit 1
fi
if grep -q CRASH "$src"; then
  kill -SEGV $$
fi
grep -q '"Common.h"' "$src" && [ ! -f Common.h ] && { echo "Common.h missing" >&2; exit 1; }
grep -q NO_OUTPUT "$src" && exit 0
printf 'XBIN' > "$out"
grep -q NO_PARAMS "$src" || printf 'Tint c 0 1\nDiffuse s 2 1\n' > "$out.params"
echo "// approximately 3 instruction slots used"
"#;

    fn install_shim(dir: &Path) -> PathBuf {
        let path = dir.join("fake-shim.sh");
        fs::write(&path, FAKE_SHIM).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn job(source: &str) -> CompileJob {
        CompileJob::new(BackendKind::Xenon, ShaderStage::Pixel, "Console.usf", source, "Main")
    }

    #[test]
    fn test_parse_params() {
        let constants = parse_params("Tint c 0 1\n\nBones float4 4 30\n").unwrap();
        assert_eq!(constants.len(), 2);
        assert_eq!(constants[1].name, "Bones");
        assert_eq!(constants[1].register_count, 30);
        assert!(parse_params("Tint q 0 1").is_err());
        assert!(parse_params("Tint c 0").is_err());
    }

    #[test]
    #[serial]
    fn test_missing_shim_is_a_compile_error_and_not_cached() {
        let tmp = tempdir().unwrap();
        let shim_path = tmp.path().join("fake-shim.sh");
        let mut adapter = ConsoleAdapter::with_shims(
            ShimCache::with_path(BackendKind::Xenon, &shim_path),
            tmp.path(),
        );

        let result = adapter.compile(&job("float4 Main() { return 1; }")).unwrap();
        assert!(!result.success);
        assert!(result.errors.contains("precompiler unavailable"));
        assert!(!adapter.shims.is_loaded());

        install_shim(tmp.path());
        let result = adapter.compile(&job("float4 Main() { return 1; }")).unwrap();
        assert!(result.success, "{}", result.errors);
        assert!(adapter.shims.is_loaded());
    }

    #[test]
    #[serial]
    fn test_shim_success_collects_metadata() {
        let tmp = tempdir().unwrap();
        let shim = install_shim(tmp.path());
        let mut adapter =
            ConsoleAdapter::with_shims(ShimCache::with_path(BackendKind::Xenon, shim), tmp.path());

        let job = job("#include \"Common.h\"\nfloat4 Main() { return 1; }")
            .with_include("Common.h", "// shared");
        let result = adapter.compile(&job).unwrap();
        assert!(result.success, "{}", result.errors);
        assert_eq!(result.backend, BackendKind::Xenon);
        assert_eq!(result.bytecode, b"XBIN");
        assert_eq!(result.constants.len(), 2);
        assert_eq!(result.constants[1].register_set, RegisterSet::Sampler);
        assert_eq!(result.instruction_count(), Some(3));
        assert!(tmp.path().join("xenon").join("Common.h").exists());
    }

    #[test]
    #[serial]
    fn test_shim_failure_is_compile_error() {
        let tmp = tempdir().unwrap();
        let shim = install_shim(tmp.path());
        let mut adapter =
            ConsoleAdapter::with_shims(ShimCache::with_path(BackendKind::Ps3, shim), tmp.path());
        let result = adapter.compile(&job("SYNTAX_ERROR")).unwrap();
        assert!(!result.success);
        assert!(result.errors.contains("syntax error"));
        assert!(result.bytecode.is_empty());
    }

    #[test]
    #[serial]
    fn test_outputs_from_previous_job_are_not_reused() {
        let tmp = tempdir().unwrap();
        let shim = install_shim(tmp.path());
        let mut adapter =
            ConsoleAdapter::with_shims(ShimCache::with_path(BackendKind::Xenon, shim), tmp.path());

        let first = adapter.compile(&job("float4 Main() { return 1; }")).unwrap();
        assert_eq!(first.constants.len(), 2);

        let second = adapter.compile(&job("// NO_PARAMS\nfloat4 Main() { return 1; }")).unwrap();
        assert!(second.success, "{}", second.errors);
        assert!(second.constants.is_empty());

        let fault = adapter.compile(&job("// NO_OUTPUT")).unwrap_err();
        assert!(fault.message.contains("produced no output"));
    }

    #[test]
    #[serial]
    fn test_shim_crash_is_a_fault() {
        let tmp = tempdir().unwrap();
        let shim = install_shim(tmp.path());
        let mut adapter =
            ConsoleAdapter::with_shims(ShimCache::with_path(BackendKind::Xenon, shim), tmp.path());
        let fault = adapter.compile(&job("CRASH")).unwrap_err();
        assert_eq!(fault.operation, "compile");
        assert!(fault.message.contains("signal"));
    }

    #[test]
    #[serial]
    fn test_teardown_unloads() {
        let tmp = tempdir().unwrap();
        let shim = install_shim(tmp.path());
        let mut cache = ShimCache::with_path(BackendKind::Xenon, &shim);
        assert_eq!(cache.init().unwrap(), shim.as_path());
        assert!(cache.is_loaded());
        cache.teardown();
        assert!(!cache.is_loaded());
    }
}
