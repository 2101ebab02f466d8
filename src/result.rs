//! Compile results and the metadata derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::BackendKind;

/// Prefix of the error text for jobs whose worker faulted twice.
pub const INTERNAL_ERROR_MARKER: &str = "internal compiler error";

/// Error text used when a compile failed without emitting any diagnostics.
pub const FAILED_WITHOUT_DIAGNOSTICS: &str = "Compile Failed without warnings!";

/// Warning suppressed from displayed diagnostics:
/// "loop only executes for 1 iteration(s), forcing loop to unroll".
const SUPPRESSED_WARNING: &str = "X3557";

/// Register file a shader constant is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterSet {
    Bool,
    Int4,
    Float4,
    Sampler,
}

impl RegisterSet {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::Int4 => 1,
            Self::Float4 => 2,
            Self::Sampler => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Bool),
            1 => Some(Self::Int4),
            2 => Some(Self::Float4),
            3 => Some(Self::Sampler),
            _ => None,
        }
    }

    /// Register prefix used in disassembly listings.
    pub fn prefix(self) -> char {
        match self {
            Self::Bool => 'b',
            Self::Int4 => 'i',
            Self::Float4 => 'c',
            Self::Sampler => 's',
        }
    }
}

/// One named entry of a compiled shader's constant table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantDesc {
    pub name: String,
    pub register_set: RegisterSet,
    pub register_index: u32,
    pub register_count: u32,
}

/// Where the engine binds a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterAllocation {
    pub buffer_index: u16,
    pub base_index: u16,
    pub size: u16,
    pub sampler_index: u16,
}

/// Parameter name to allocation, built from a constant table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterMap {
    allocations: BTreeMap<String, ParameterAllocation>,
}

impl ParameterMap {
    pub fn add(&mut self, name: impl Into<String>, allocation: ParameterAllocation) {
        self.allocations.insert(name.into(), allocation);
    }

    pub fn find(&self, name: &str) -> Option<&ParameterAllocation> {
        self.allocations.get(name)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterAllocation)> {
        self.allocations.iter()
    }
}

/// Outcome of one compile job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub backend: BackendKind,
    pub success: bool,
    pub bytecode: Vec<u8>,
    /// Errors, or warnings on success. Empty means none.
    pub errors: String,
    pub constants: Vec<ConstantDesc>,
    pub disassembly: Option<String>,
}

impl CompileResult {
    pub fn compiled(
        backend: BackendKind,
        bytecode: Vec<u8>,
        warnings: String,
        constants: Vec<ConstantDesc>,
        disassembly: Option<String>,
    ) -> Self {
        Self {
            backend,
            success: true,
            bytecode,
            errors: warnings,
            constants,
            disassembly,
        }
    }

    /// A compile error reported by the backend itself.
    pub fn failed(backend: BackendKind, errors: impl Into<String>) -> Self {
        let mut errors = errors.into();
        if errors.trim().is_empty() {
            errors = FAILED_WITHOUT_DIAGNOSTICS.to_string();
        }
        Self {
            backend,
            success: false,
            bytecode: Vec::new(),
            errors,
            constants: Vec::new(),
            disassembly: None,
        }
    }

    /// A permanent failure caused by the compile infrastructure rather than the shader.
    pub fn internal_error(backend: BackendKind, detail: impl AsRef<str>) -> Self {
        Self::failed(
            backend,
            format!("{}: {}", INTERNAL_ERROR_MARKER, detail.as_ref()),
        )
    }

    pub fn is_internal_error(&self) -> bool {
        !self.success && self.errors.starts_with(INTERNAL_ERROR_MARKER)
    }

    /// Diagnostic lines for display, minus suppressed warnings and duplicates.
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for line in self.errors.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.contains(SUPPRESSED_WARNING) {
                continue;
            }
            if !lines.iter().any(|seen| seen == line) {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Map the constant table onto engine parameter allocations.
    ///
    /// Samplers bind by register index. Everything else is a byte range into
    /// the float constant buffer, 16 bytes per register.
    pub fn parameter_map(&self) -> ParameterMap {
        let mut map = ParameterMap::default();
        for constant in &self.constants {
            let allocation = match constant.register_set {
                RegisterSet::Sampler => ParameterAllocation {
                    buffer_index: 0,
                    base_index: constant.register_index as u16,
                    size: constant.register_count as u16,
                    sampler_index: constant.register_index as u16,
                },
                _ => ParameterAllocation {
                    buffer_index: 0,
                    base_index: (constant.register_index * 16) as u16,
                    size: (constant.register_count * 16) as u16,
                    sampler_index: 0,
                },
            };
            map.add(constant.name.clone(), allocation);
        }
        map
    }

    /// Instruction slot count reported in the disassembly.
    pub fn instruction_count(&self) -> Option<u32> {
        const MARKER: &str = "// approximately ";
        let text = self.disassembly.as_deref()?;
        let start = text.find(MARKER)? + MARKER.len();
        let digits: String = text[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, set: RegisterSet, index: u32, count: u32) -> ConstantDesc {
        ConstantDesc {
            name: name.to_string(),
            register_set: set,
            register_index: index,
            register_count: count,
        }
    }

    #[test]
    fn test_failed_without_text_gets_placeholder() {
        let result = CompileResult::failed(BackendKind::D3D9, "  \n");
        assert!(!result.success);
        assert_eq!(result.errors, FAILED_WITHOUT_DIAGNOSTICS);
        assert!(result.bytecode.is_empty());
    }

    #[test]
    fn test_internal_error_marker() {
        let result = CompileResult::internal_error(BackendKind::D3D10, "worker killed by SIGABRT");
        assert!(result.is_internal_error());
        assert!(result.errors.starts_with(INTERNAL_ERROR_MARKER));
        assert!(result.errors.contains("SIGABRT"));

        let ordinary = CompileResult::failed(BackendKind::D3D10, "a.usf(3): error X3000");
        assert!(!ordinary.is_internal_error());
    }

    #[test]
    fn test_error_lines_filter_and_dedupe() {
        let result = CompileResult::failed(
            BackendKind::D3D9,
            "a.usf(4): warning X3557: loop only executes for 1 iteration(s)\n\
             a.usf(9): error X3000: syntax error\n\
             a.usf(9): error X3000: syntax error\n\
             \n\
             a.usf(12): error X3004: undeclared identifier 'foo'\n",
        );
        assert_eq!(
            result.error_lines(),
            vec![
                "a.usf(9): error X3000: syntax error".to_string(),
                "a.usf(12): error X3004: undeclared identifier 'foo'".to_string(),
            ]
        );
    }

    #[test]
    fn test_parameter_map() {
        let result = CompileResult::compiled(
            BackendKind::D3D9,
            vec![1, 2, 3],
            String::new(),
            vec![
                constant("WorldViewProj", RegisterSet::Float4, 0, 4),
                constant("Tint", RegisterSet::Float4, 4, 1),
                constant("DiffuseTexture", RegisterSet::Sampler, 2, 1),
            ],
            None,
        );

        let map = result.parameter_map();
        assert_eq!(map.len(), 3);

        let wvp = map.find("WorldViewProj").unwrap();
        assert_eq!((wvp.base_index, wvp.size), (0, 64));

        let tint = map.find("Tint").unwrap();
        assert_eq!((tint.base_index, tint.size), (64, 16));

        let tex = map.find("DiffuseTexture").unwrap();
        assert_eq!((tex.base_index, tex.size, tex.sampler_index), (2, 1, 2));
    }

    #[test]
    fn test_instruction_count() {
        let mut result =
            CompileResult::compiled(BackendKind::D3D9, vec![0], String::new(), Vec::new(), None);
        assert_eq!(result.instruction_count(), None);

        result.disassembly =
            Some("    ps_3_0\n// approximately 12 instruction slots used\n".into());
        assert_eq!(result.instruction_count(), Some(12));
    }

    #[test]
    fn test_register_set_bytes() {
        for set in [
            RegisterSet::Bool,
            RegisterSet::Int4,
            RegisterSet::Float4,
            RegisterSet::Sampler,
        ] {
            assert_eq!(RegisterSet::from_byte(set.to_byte()), Some(set));
        }
        assert_eq!(RegisterSet::from_byte(9), None);
    }
}
