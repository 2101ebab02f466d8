//! D3D9 adapter.
//!
//! The D3D9 compiler crashes on some shaders that use attributes. A faulting
//! compile is retried once with the legacy compiler and attribute support
//! turned off; a second fault is returned to the caller.

use tracing::warn;

use super::fault::CompilerFault;
use super::reference::{Dialect, ReferenceCompiler, ShaderCompiler};
use super::{compile_native, dump_native, native_defines};
use crate::job::{CompileFlags, CompileJob};
use crate::result::CompileResult;

const ATTRIBUTES_MACRO: &str = "COMPILER_SUPPORTS_ATTRIBUTES";

pub struct D3D9Adapter {
    compiler: Box<dyn ShaderCompiler>,
}

impl D3D9Adapter {
    pub fn new() -> Self {
        Self::with_compiler(Box::new(ReferenceCompiler::new(Dialect::D3D9)))
    }

    pub fn with_compiler(compiler: Box<dyn ShaderCompiler>) -> Self {
        Self { compiler }
    }

    pub fn compile(&mut self, job: &CompileJob) -> Result<CompileResult, CompilerFault> {
        let defines = native_defines(&job.macros);
        match compile_native(self.compiler.as_ref(), job, job.flags, &defines) {
            Err(fault) if fault.operation == "compile" => {
                warn!(
                    job = %job.label(),
                    %fault,
                    "compiler faulted, retrying with the legacy compiler"
                );
                let legacy = legacy_job(job);
                let defines = native_defines(&legacy.macros);
                let result =
                    compile_native(self.compiler.as_ref(), &legacy, legacy.flags, &defines)?;
                dump_native(self.compiler.as_ref(), &legacy, legacy.flags, &defines, &result);
                Ok(result)
            }
            Err(fault) => Err(fault),
            Ok(result) => {
                dump_native(self.compiler.as_ref(), job, job.flags, &defines, &result);
                Ok(result)
            }
        }
    }
}

impl Default for D3D9Adapter {
    fn default() -> Self {
        Self::new()
    }
}

/// The job as the legacy retry compiles it.
fn legacy_job(job: &CompileJob) -> CompileJob {
    let mut legacy = job.clone();
    legacy.set_macro(ATTRIBUTES_MACRO, "0");
    legacy.flags |= CompileFlags::USE_LEGACY_D3DX9_31_DLL;
    legacy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::include::IncludeResolver;
    use crate::backend::reference::{Define, NativeOutput, NativeRequest};
    use crate::job::{BackendKind, ShaderStage};
    use crate::result::ConstantDesc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Compiler that always faults and counts its calls.
    struct AlwaysFaults(Arc<AtomicUsize>);

    impl ShaderCompiler for AlwaysFaults {
        fn name(&self) -> &'static str {
            "always-faults"
        }

        fn preprocess(
            &self,
            _: &NativeRequest<'_>,
            _: &dyn IncludeResolver,
        ) -> Result<String, String> {
            Ok(String::new())
        }

        fn compile(
            &self,
            _: &NativeRequest<'_>,
            _: &dyn IncludeResolver,
        ) -> Result<NativeOutput, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("access violation");
        }

        fn reflect(&self, _: &[u8]) -> Result<Vec<ConstantDesc>, String> {
            Ok(Vec::new())
        }

        fn disassemble(&self, _: &[u8]) -> Result<String, String> {
            Ok(String::new())
        }
    }

    fn attributes_job() -> CompileJob {
        CompileJob::new(
            BackendKind::D3D9,
            ShaderStage::Pixel,
            "Attr.usf",
            "#pragma scw_fault(attributes)\nfloat4 Main() : COLOR0 { return 1; }\n",
            "Main",
        )
        .with_standard_definitions()
    }

    #[test]
    fn test_legacy_job_rewrites_attribute_macro_and_flags() {
        let job = attributes_job();
        assert_eq!(job.macro_value(ATTRIBUTES_MACRO), Some("1"));
        let legacy = legacy_job(&job);
        assert_eq!(legacy.macro_value(ATTRIBUTES_MACRO), Some("0"));
        assert!(legacy.flags.contains(CompileFlags::USE_LEGACY_D3DX9_31_DLL));
        assert_eq!(legacy.macros.len(), job.macros.len());
    }

    #[test]
    fn test_fault_recovered_by_legacy_retry() {
        let mut adapter = D3D9Adapter::new();
        let result = adapter.compile(&attributes_job()).unwrap();
        assert!(result.success, "{}", result.errors);
        let disassembly = result.disassembly.unwrap();
        assert!(disassembly.contains("legacy compiler"));
    }

    #[test]
    fn test_second_fault_propagates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut adapter = D3D9Adapter::with_compiler(Box::new(AlwaysFaults(calls.clone())));
        let fault = adapter.compile(&attributes_job()).unwrap_err();
        assert_eq!(fault.operation, "compile");
        assert_eq!(fault.message, "access violation");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_compile_errors_are_not_retried() {
        let mut adapter = D3D9Adapter::new();
        let job = CompileJob::new(
            BackendKind::D3D9,
            ShaderStage::Pixel,
            "Bad.usf",
            "float4 Main() : COLOR0 { float4 c = ; return c; }",
            "Main",
        );
        let result = adapter.compile(&job).unwrap();
        assert!(!result.success);
        assert!(!result.errors.contains("legacy"));
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn test_define_list_passes_through() {
        let defines = native_defines(&attributes_job().macros);
        assert!(defines.last().is_some_and(Define::is_end));
    }
}
