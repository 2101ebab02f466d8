//! Backend adapters: one per compile target.
//!
//! An adapter turns a decoded [`CompileJob`] into calls on its compiler and
//! normalizes the outcome into a [`CompileResult`]. Every compiler call runs
//! inside [`fault::guard`], so a crashing compiler surfaces as a
//! [`CompilerFault`] instead of taking the caller down with it.
//!
//! ```text
//! CompileJob ──► AdapterSet ──┬─► D3D9Adapter ──► reference compiler (legacy retry)
//!                             ├─► D3D10Adapter ─► reference compiler
//!                             └─► ConsoleAdapter ► vendor shim executable
//! ```

pub mod console;
pub mod d3d10;
pub mod d3d9;
pub mod dump;
pub mod fault;
pub mod include;
pub mod reference;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

pub use console::{ConsoleAdapter, ShimCache};
pub use d3d9::D3D9Adapter;
pub use d3d10::D3D10Adapter;
pub use fault::{CompilerFault, guard};
pub use include::{IncludeEnvironment, IncludeResolver};
pub use reference::{Define, Dialect, NativeRequest, ReferenceCompiler, ShaderCompiler};

use crate::job::{BackendKind, CompileFlags, CompileJob, MacroDefinition};
use crate::result::CompileResult;

/// Native define list for `macros`, terminated with [`Define::END`].
pub fn native_defines(macros: &[MacroDefinition]) -> Vec<Define> {
    macros
        .iter()
        .map(|m| Define::new(m.name.as_str(), m.value.as_str()))
        .chain(std::iter::once(Define::END))
        .collect()
}

/// Compile `job` with `compiler`, then reflect and disassemble the bytecode.
///
/// Compile errors come back as a failed [`CompileResult`]. Only faults, and
/// metadata calls that cannot read bytecode the compiler just produced, are
/// returned as `Err`.
pub(crate) fn compile_native(
    compiler: &dyn ShaderCompiler,
    job: &CompileJob,
    flags: CompileFlags,
    defines: &[Define],
) -> Result<CompileResult, CompilerFault> {
    let includes = IncludeEnvironment::new(&job.includes, job.include_path.as_deref());
    let request = NativeRequest {
        source: &job.source,
        source_name: &job.source_filename,
        entry: &job.entry,
        profile: &job.profile,
        flags,
        defines,
    };

    let output = match guard("compile", || compiler.compile(&request, &includes))? {
        Ok(output) => output,
        Err(diagnostics) => return Ok(CompileResult::failed(job.backend, diagnostics)),
    };

    let metadata_fault = |operation: &'static str| {
        move |message: String| CompilerFault { operation, message }
    };
    let constants = guard("reflect", || compiler.reflect(&output.bytecode))?
        .map_err(metadata_fault("reflect"))?;
    let disassembly = guard("disassemble", || compiler.disassemble(&output.bytecode))?
        .map_err(metadata_fault("disassemble"))?;

    Ok(CompileResult::compiled(
        job.backend,
        output.bytecode,
        output.warnings,
        constants,
        Some(disassembly),
    ))
}

/// Write the job's debug dump, if it asked for one, using the native preprocessor.
pub(crate) fn dump_native(
    compiler: &dyn ShaderCompiler,
    job: &CompileJob,
    flags: CompileFlags,
    defines: &[Define],
    result: &CompileResult,
) {
    if !job.wants_debug_dump() {
        return;
    }
    let includes = IncludeEnvironment::new(&job.includes, job.include_path.as_deref());
    let request = NativeRequest {
        source: &job.source,
        source_name: &job.source_filename,
        entry: &job.entry,
        profile: &job.profile,
        flags,
        defines,
    };
    let preprocessed = match guard("preprocess", || compiler.preprocess(&request, &includes)) {
        Ok(Ok(text)) => Some(text),
        Ok(Err(diagnostics)) => Some(diagnostics),
        Err(_) => None,
    };
    let mut dumped = job.clone();
    dumped.flags = flags;
    dump::dump_if_requested(
        &dumped,
        preprocessed.as_deref(),
        || dump::fxc_command_line(&dumped),
        result,
    );
}

/// One backend adapter.
pub enum Adapter {
    D3D9(D3D9Adapter),
    D3D10(D3D10Adapter),
    Console(ConsoleAdapter),
}

impl Adapter {
    /// Adapter for `backend`; console adapters stage files under `scratch_dir`.
    pub fn for_backend(backend: BackendKind, scratch_dir: &Path) -> Self {
        match backend {
            BackendKind::D3D9 => Self::D3D9(D3D9Adapter::new()),
            BackendKind::D3D10 => Self::D3D10(D3D10Adapter::new()),
            BackendKind::Xenon | BackendKind::Ps3 => {
                Self::Console(ConsoleAdapter::new(backend, scratch_dir))
            }
        }
    }

    pub fn compile(&mut self, job: &CompileJob) -> Result<CompileResult, CompilerFault> {
        match self {
            Self::D3D9(adapter) => adapter.compile(job),
            Self::D3D10(adapter) => adapter.compile(job),
            Self::Console(adapter) => adapter.compile(job),
        }
    }

    fn teardown(&mut self) {
        if let Self::Console(adapter) = self {
            adapter.teardown();
        }
    }
}

/// Lazily created adapters, one per backend, alive as long as the set.
pub struct AdapterSet {
    scratch_dir: PathBuf,
    adapters: BTreeMap<BackendKind, Adapter>,
}

impl AdapterSet {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            adapters: BTreeMap::new(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Dispatch `job` to the adapter selected by its backend tag.
    #[instrument(
        level = "debug",
        skip(self, job),
        fields(backend = %job.backend, job = %job.label())
    )]
    pub fn compile(&mut self, job: &CompileJob) -> Result<CompileResult, CompilerFault> {
        let scratch_dir = &self.scratch_dir;
        let adapter = self
            .adapters
            .entry(job.backend)
            .or_insert_with(|| Adapter::for_backend(job.backend, scratch_dir));
        let result = adapter.compile(job)?;
        debug!(success = result.success, bytes = result.bytecode.len(), "compiled");
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Drop for AdapterSet {
    fn drop(&mut self) {
        for adapter in self.adapters.values_mut() {
            adapter.teardown();
        }
    }
}
