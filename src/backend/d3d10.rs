//! D3D10 adapter. Faults propagate on the first occurrence.

use super::fault::CompilerFault;
use super::reference::{Dialect, ReferenceCompiler, ShaderCompiler};
use super::{compile_native, dump_native, native_defines};
use crate::job::CompileJob;
use crate::result::CompileResult;

pub struct D3D10Adapter {
    compiler: Box<dyn ShaderCompiler>,
}

impl D3D10Adapter {
    pub fn new() -> Self {
        Self::with_compiler(Box::new(ReferenceCompiler::new(Dialect::D3D10)))
    }

    pub fn with_compiler(compiler: Box<dyn ShaderCompiler>) -> Self {
        Self { compiler }
    }

    pub fn compile(&mut self, job: &CompileJob) -> Result<CompileResult, CompilerFault> {
        let defines = native_defines(&job.macros);
        let result = compile_native(self.compiler.as_ref(), job, job.flags, &defines)?;
        dump_native(self.compiler.as_ref(), job, job.flags, &defines, &result);
        Ok(result)
    }
}

impl Default for D3D10Adapter {
    fn default() -> Self {
        Self::new()
    }
}
