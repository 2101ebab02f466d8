//! Compile job records.
//!
//! A [`CompileJob`] is built by the caller, queued on the
//! [`CompilingThreadManager`](crate::worker::CompilingThreadManager), shipped
//! to a worker over the wire codec, and handed back next to its
//! [`CompileResult`](crate::result::CompileResult).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target compiler backend. Doubles as the wire job-type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    D3D9,
    D3D10,
    Xenon,
    Ps3,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [Self::D3D9, Self::D3D10, Self::Xenon, Self::Ps3];

    /// Wire tag for this backend.
    pub fn tag(self) -> u8 {
        match self {
            Self::D3D9 => 0,
            Self::D3D10 => 1,
            Self::Xenon => 2,
            Self::Ps3 => 3,
        }
    }

    /// Map a wire tag back to a backend. Tag 4 is the worker-error record, not a backend.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::D3D9),
            1 => Some(Self::D3D10),
            2 => Some(Self::Xenon),
            3 => Some(Self::Ps3),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::D3D9 => "d3d9",
            Self::D3D10 => "d3d10",
            Self::Xenon => "xenon",
            Self::Ps3 => "ps3",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "d3d9" | "sm3" | "sm2" => Ok(Self::D3D9),
            "d3d10" | "sm4" => Ok(Self::D3D10),
            "xenon" | "xbox" | "xbox360" => Ok(Self::Xenon),
            "ps3" => Ok(Self::Ps3),
            _ => Err(format!(
                "Unknown backend: '{}'. Valid options: d3d9, d3d10, xenon, ps3",
                s
            )),
        }
    }
}

/// Pipeline stage a shader is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Geometry,
}

impl ShaderStage {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Vertex => 0,
            Self::Pixel => 1,
            Self::Geometry => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Vertex),
            1 => Some(Self::Pixel),
            2 => Some(Self::Geometry),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Pixel => "pixel",
            Self::Geometry => "geometry",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShaderStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vertex" | "vs" => Ok(Self::Vertex),
            "pixel" | "ps" | "fragment" => Ok(Self::Pixel),
            "geometry" | "gs" => Ok(Self::Geometry),
            _ => Err(format!(
                "Unknown shader stage: '{}'. Valid options: vertex, pixel, geometry",
                s
            )),
        }
    }
}

/// Default target profile for a backend and stage.
pub fn default_profile(backend: BackendKind, stage: ShaderStage) -> &'static str {
    match (backend, stage) {
        (BackendKind::D3D9 | BackendKind::Xenon, ShaderStage::Vertex) => "vs_3_0",
        (BackendKind::D3D9 | BackendKind::Xenon, ShaderStage::Pixel) => "ps_3_0",
        (BackendKind::D3D9 | BackendKind::Xenon, ShaderStage::Geometry) => "gs_3_0",
        (BackendKind::D3D10, ShaderStage::Vertex) => "vs_4_0",
        (BackendKind::D3D10, ShaderStage::Pixel) => "ps_4_0",
        (BackendKind::D3D10, ShaderStage::Geometry) => "gs_4_0",
        (BackendKind::Ps3, ShaderStage::Vertex) => "sce_vp_rsx",
        (BackendKind::Ps3, ShaderStage::Pixel) => "sce_fp_rsx",
        (BackendKind::Ps3, ShaderStage::Geometry) => "sce_gp_rsx",
    }
}

/// Opaque compile-flag bitset handed to the backend compiler.
///
/// Bit values follow the D3DX `D3DXSHADER_*` constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompileFlags(u32);

impl CompileFlags {
    pub const NONE: Self = Self(0);
    pub const DEBUG: Self = Self(1 << 0);
    pub const SKIP_VALIDATION: Self = Self(1 << 1);
    pub const SKIP_OPTIMIZATION: Self = Self(1 << 2);
    pub const AVOID_FLOW_CONTROL: Self = Self(1 << 9);
    pub const PREFER_FLOW_CONTROL: Self = Self(1 << 10);
    pub const USE_LEGACY_D3DX9_31_DLL: Self = Self(1 << 16);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Translate engine-level flags into the backend bitset.
    pub fn from_compiler_flags(flags: &[CompilerFlag]) -> Self {
        flags
            .iter()
            .fold(Self::NONE, |acc, flag| acc | flag.to_compile_flags())
    }
}

impl BitOr for CompileFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CompileFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::LowerHex for CompileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Engine-facing compile flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerFlag {
    PreferFlowControl,
    Debug,
    AvoidFlowControl,
    SkipValidation,
}

impl CompilerFlag {
    pub fn to_compile_flags(self) -> CompileFlags {
        match self {
            Self::PreferFlowControl => CompileFlags::PREFER_FLOW_CONTROL,
            Self::Debug => CompileFlags::DEBUG | CompileFlags::SKIP_OPTIMIZATION,
            Self::AvoidFlowControl => CompileFlags::AVOID_FLOW_CONTROL,
            Self::SkipValidation => CompileFlags::SKIP_VALIDATION,
        }
    }
}

impl FromStr for CompilerFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "preferflowcontrol" => Ok(Self::PreferFlowControl),
            "debug" => Ok(Self::Debug),
            "avoidflowcontrol" => Ok(Self::AvoidFlowControl),
            "skipvalidation" => Ok(Self::SkipValidation),
            _ => Err(format!(
                "Unknown compiler flag: '{}'. Valid options: prefer-flow-control, debug, avoid-flow-control, skip-validation",
                s
            )),
        }
    }
}

/// A preprocessor macro set for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDefinition {
    pub name: String,
    pub value: String,
}

impl MacroDefinition {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl FromStr for MacroDefinition {
    type Err = String;

    /// Parses `NAME=VALUE`; a bare `NAME` defines it to `1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s.split_once('=').unwrap_or((s, "1"));
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("Invalid macro definition: '{}'", s));
        }
        Ok(Self::new(name, value))
    }
}

/// An include file embedded in the job, looked up by exact name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeFile {
    pub name: String,
    pub contents: String,
}

impl IncludeFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// One shader compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub backend: BackendKind,
    pub stage: ShaderStage,
    pub source_filename: String,
    pub source: String,
    pub entry: String,
    pub profile: String,
    pub flags: CompileFlags,
    pub macros: Vec<MacroDefinition>,
    pub includes: Vec<IncludeFile>,
    pub include_path: Option<PathBuf>,
    pub debug_dump_dir: Option<PathBuf>,
}

impl CompileJob {
    /// Create a job using the default profile for `backend` and `stage`.
    pub fn new(
        backend: BackendKind,
        stage: ShaderStage,
        source_filename: impl Into<String>,
        source: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            stage,
            source_filename: source_filename.into(),
            source: source.into(),
            entry: entry.into(),
            profile: default_profile(backend, stage).to_string(),
            flags: CompileFlags::NONE,
            macros: Vec::new(),
            includes: Vec::new(),
            include_path: None,
            debug_dump_dir: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_flags(mut self, flags: CompileFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set a macro, replacing an existing definition of the same name in place.
    pub fn with_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_macro(name, value);
        self
    }

    pub fn with_include(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.includes.push(IncludeFile::new(name, contents));
        self
    }

    pub fn with_include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_path = Some(path.into());
        self
    }

    pub fn with_debug_dump(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dump_dir = Some(dir.into());
        self
    }

    pub fn set_macro(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.macros.iter_mut().find(|m| m.name == name) {
            Some(existing) => existing.value = value,
            None => self.macros.push(MacroDefinition { name, value }),
        }
    }

    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }

    /// Add the engine's standard environment definitions for this backend and stage.
    ///
    /// Caller-supplied macros of the same name keep their value.
    pub fn with_standard_definitions(mut self) -> Self {
        let mut standard: Vec<(&str, &str)> = vec![
            (
                "PIXELSHADER",
                if self.stage == ShaderStage::Pixel { "1" } else { "0" },
            ),
            (
                "VERTEXSHADER",
                if self.stage == ShaderStage::Vertex { "1" } else { "0" },
            ),
        ];

        match self.backend {
            BackendKind::D3D9 => {
                standard.push(("COMPILER_HLSL", "1"));
                if self.profile.ends_with("_2_0") {
                    standard.push(("SM2_PROFILE", "1"));
                    standard.push(("SUPPORTS_FP_BLENDING", "0"));
                } else {
                    standard.push(("SM3_PROFILE", "1"));
                }
                standard.push(("COMPILER_SUPPORTS_ATTRIBUTES", "1"));
            }
            BackendKind::D3D10 => {
                standard.push(("COMPILER_HLSL", "1"));
                standard.push(("SM4_PROFILE", "1"));
            }
            BackendKind::Xenon => standard.push(("XBOX", "1")),
            BackendKind::Ps3 => standard.push(("PS3", "1")),
        }

        for (name, value) in standard {
            if self.macro_value(name).is_none() {
                self.macros.push(MacroDefinition::new(name, value));
            }
        }
        self
    }

    /// Debug dumps are written next to the compiler, so they force in-process compilation.
    pub fn wants_debug_dump(&self) -> bool {
        self.debug_dump_dir.is_some()
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.source_filename, self.entry)
    }
}
