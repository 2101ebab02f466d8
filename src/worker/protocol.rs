//! Wire codec for worker mailbox records.
//!
//! Every record starts with a one-byte job-type tag and a one-byte format
//! version. All integers are little-endian. Strings and blobs carry a u32
//! length prefix, and a zero length means "absent", so optional fields are
//! never skipped and the field order stays fixed. Repeated groups carry a u32
//! count followed by that many name/value string pairs.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::{BackendKind, CompileFlags, CompileJob, IncludeFile, MacroDefinition, ShaderStage};
use crate::result::{CompileResult, ConstantDesc, RegisterSet};

/// Format version written and accepted by this build.
pub const WIRE_VERSION: u8 = 1;

/// Tag of the record a worker writes when it dies on a fault.
pub const WORKER_ERROR_TAG: u8 = 4;

/// Decode or encode failure. Always fatal to the record, never a panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("record truncated reading {field}: needed {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("unknown job type tag {0}")]
    UnknownJobType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("{field} is too large to encode ({len} bytes)")]
    TooLarge { field: &'static str, len: usize },
}

/// A decoded output record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutput {
    Compiled(CompileResult),
    /// The worker hit a fatal fault and is exiting.
    WorkerError(String),
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new(tag: u8) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.push(tag);
        buf.push(WIRE_VERSION);
        Self { buf }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn len(&mut self, field: &'static str, len: usize) -> Result<(), ProtocolError> {
        let len = u32::try_from(len).map_err(|_| ProtocolError::TooLarge { field, len })?;
        self.u32(len);
        Ok(())
    }

    fn blob(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.len(field, bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn str(&mut self, field: &'static str, value: &str) -> Result<(), ProtocolError> {
        self.blob(field, value.as_bytes())
    }

    fn opt_str(&mut self, field: &'static str, value: Option<&str>) -> Result<(), ProtocolError> {
        self.str(field, value.unwrap_or_default())
    }

    fn pairs<'a>(
        &mut self,
        field: &'static str,
        pairs: impl ExactSizeIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), ProtocolError> {
        self.len(field, pairs.len())?;
        for (name, value) in pairs {
            self.str(field, name)?;
            self.str(field, value)?;
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Read the header, rejecting any version other than ours. Returns the tag.
    fn open(bytes: &'a [u8]) -> Result<(Self, u8), ProtocolError> {
        let mut reader = Self { bytes, pos: 0 };
        let tag = reader.u8("job type")?;
        let version = reader.u8("version")?;
        if version != WIRE_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: WIRE_VERSION,
                found: version,
            });
        }
        Ok((reader, tag))
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.bytes.len() - self.pos;
        if needed > available {
            return Err(ProtocolError::Truncated {
                field,
                needed,
                available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(field, 1)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let raw = self.take(field, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn blob(&mut self, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32(field)? as usize;
        self.take(field, len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.blob(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, ProtocolError> {
        let value = self.string(field)?;
        Ok((!value.is_empty()).then_some(value))
    }

    fn pairs(&mut self, field: &'static str) -> Result<Vec<(String, String)>, ProtocolError> {
        let count = self.u32(field)? as usize;
        // Each pair needs at least two length prefixes.
        let available = self.bytes.len() - self.pos;
        if count.saturating_mul(8) > available {
            return Err(ProtocolError::Truncated {
                field,
                needed: count.saturating_mul(8),
                available,
            });
        }
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.string(field)?;
            let value = self.string(field)?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    fn finish(self) -> Result<(), ProtocolError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }
}

fn backend_for_tag(tag: u8) -> Result<BackendKind, ProtocolError> {
    BackendKind::from_tag(tag).ok_or(ProtocolError::UnknownJobType(tag))
}

/// Encode a job into an input record.
pub fn encode_job(job: &CompileJob) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new(job.backend.tag());
    w.str("source filename", &job.source_filename)?;
    w.str("source", &job.source)?;
    w.str("entry", &job.entry)?;
    w.str("profile", &job.profile)?;
    w.u8(job.stage.to_byte());
    w.u32(job.flags.bits());
    let include_path = job.include_path.as_ref().map(|p| p.to_string_lossy());
    w.opt_str("include path", include_path.as_deref())?;
    w.pairs(
        "includes",
        job.includes
            .iter()
            .map(|i| (i.name.as_str(), i.contents.as_str())),
    )?;
    w.pairs(
        "macros",
        job.macros.iter().map(|m| (m.name.as_str(), m.value.as_str())),
    )?;
    let dump_dir = job.debug_dump_dir.as_ref().map(|p| p.to_string_lossy());
    w.opt_str("debug dump dir", dump_dir.as_deref())?;
    Ok(w.finish())
}

/// Decode an input record.
pub fn decode_job(bytes: &[u8]) -> Result<CompileJob, ProtocolError> {
    let (mut r, tag) = WireReader::open(bytes)?;
    let backend = backend_for_tag(tag)?;

    let source_filename = r.string("source filename")?;
    let source = r.string("source")?;
    let entry = r.string("entry")?;
    let profile = r.string("profile")?;
    let stage_byte = r.u8("stage")?;
    let stage = ShaderStage::from_byte(stage_byte).ok_or(ProtocolError::InvalidValue {
        field: "stage",
        value: stage_byte.into(),
    })?;
    let flags = CompileFlags::from_bits(r.u32("flags")?);
    let include_path = r.opt_string("include path")?.map(PathBuf::from);
    let includes = r
        .pairs("includes")?
        .into_iter()
        .map(|(name, contents)| IncludeFile { name, contents })
        .collect();
    let macros = r
        .pairs("macros")?
        .into_iter()
        .map(|(name, value)| MacroDefinition { name, value })
        .collect();
    let debug_dump_dir = r.opt_string("debug dump dir")?.map(PathBuf::from);
    r.finish()?;

    Ok(CompileJob {
        backend,
        stage,
        source_filename,
        source,
        entry,
        profile,
        flags,
        macros,
        includes,
        include_path,
        debug_dump_dir,
    })
}

fn encode_constants(constants: &[ConstantDesc]) -> Result<Vec<u8>, ProtocolError> {
    if constants.is_empty() {
        return Ok(Vec::new());
    }
    let mut table = Vec::with_capacity(constants.len() * 32);
    let count = u32::try_from(constants.len()).map_err(|_| ProtocolError::TooLarge {
        field: "constant table",
        len: constants.len(),
    })?;
    table.extend_from_slice(&count.to_le_bytes());
    for constant in constants {
        let name = constant.name.as_bytes();
        let len = u32::try_from(name.len()).map_err(|_| ProtocolError::TooLarge {
            field: "constant name",
            len: name.len(),
        })?;
        table.extend_from_slice(&len.to_le_bytes());
        table.extend_from_slice(name);
        table.push(constant.register_set.to_byte());
        table.extend_from_slice(&constant.register_index.to_le_bytes());
        table.extend_from_slice(&constant.register_count.to_le_bytes());
    }
    Ok(table)
}

fn decode_constants(blob: &[u8]) -> Result<Vec<ConstantDesc>, ProtocolError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = WireReader {
        bytes: blob,
        pos: 0,
    };
    let count = r.u32("constant table")? as usize;
    let mut constants = Vec::with_capacity(count.min(blob.len() / 13));
    for _ in 0..count {
        let name = r.string("constant name")?;
        let set = r.u8("register set")?;
        let register_set = RegisterSet::from_byte(set).ok_or(ProtocolError::InvalidValue {
            field: "register set",
            value: set.into(),
        })?;
        constants.push(ConstantDesc {
            name,
            register_set,
            register_index: r.u32("register index")?,
            register_count: r.u32("register count")?,
        });
    }
    r.finish()?;
    Ok(constants)
}

/// Encode a compile result into an output record.
pub fn encode_result(result: &CompileResult) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new(result.backend.tag());
    w.u8(u8::from(result.success));
    w.blob("bytecode", &result.bytecode)?;
    w.str("errors", &result.errors)?;
    w.blob("constant table", &encode_constants(&result.constants)?)?;
    w.opt_str("disassembly", result.disassembly.as_deref())?;
    Ok(w.finish())
}

/// Encode the record a faulting worker leaves behind.
pub fn encode_worker_error(message: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new(WORKER_ERROR_TAG);
    w.str("worker error", message)?;
    Ok(w.finish())
}

/// Decode an output record: either a compile result or a worker error.
pub fn decode_output(bytes: &[u8]) -> Result<WorkerOutput, ProtocolError> {
    let (mut r, tag) = WireReader::open(bytes)?;
    if tag == WORKER_ERROR_TAG {
        let message = r.string("worker error")?;
        r.finish()?;
        return Ok(WorkerOutput::WorkerError(message));
    }

    let backend = backend_for_tag(tag)?;
    let success = match r.u8("success")? {
        0 => false,
        1 => true,
        other => {
            return Err(ProtocolError::InvalidValue {
                field: "success",
                value: other.into(),
            });
        }
    };
    let bytecode = r.blob("bytecode")?.to_vec();
    let errors = r.string("errors")?;
    let constants = decode_constants(r.blob("constant table")?)?;
    let disassembly = r.opt_string("disassembly")?;
    r.finish()?;

    Ok(WorkerOutput::Compiled(CompileResult {
        backend,
        success,
        bytecode,
        errors,
        constants,
        disassembly,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> CompileJob {
        CompileJob::new(
            BackendKind::D3D9,
            ShaderStage::Pixel,
            "BasePassPixelShader.usf",
            "float4 Main() : COLOR0 { return 1; }",
            "Main",
        )
        .with_flags(CompileFlags::PREFER_FLOW_CONTROL)
        .with_macro("SM3_PROFILE", "1")
        .with_include("Common.usf", "float4 Tint;")
        .with_include_path("/shaders")
    }

    #[test]
    fn test_job_round_trip() {
        let job = sample_job();
        let bytes = encode_job(&job).unwrap();
        assert_eq!(bytes[0], BackendKind::D3D9.tag());
        assert_eq!(bytes[1], WIRE_VERSION);
        assert_eq!(decode_job(&bytes).unwrap(), job);
    }

    #[test]
    fn test_job_round_trip_without_optional_fields() {
        let job = CompileJob::new(BackendKind::Ps3, ShaderStage::Vertex, "a.usf", "", "Main");
        let decoded = decode_job(&encode_job(&job).unwrap()).unwrap();
        assert_eq!(decoded, job);
        assert!(decoded.include_path.is_none());
        assert!(decoded.debug_dump_dir.is_none());
        assert!(decoded.macros.is_empty());
    }

    #[test]
    fn test_job_round_trip_many_pairs_and_large_source() {
        let mut job = sample_job().with_debug_dump("/tmp/dump");
        for i in 0..64 {
            job = job
                .with_macro(format!("MACRO_{i}"), i.to_string())
                .with_include(format!("Inc{i}.usf"), "// nothing".repeat(i));
        }
        job.source = "x".repeat(1_500_000);
        let decoded = decode_job(&encode_job(&job).unwrap()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = encode_job(&sample_job()).unwrap();
        bytes[1] = WIRE_VERSION + 1;
        assert_eq!(
            decode_job(&bytes),
            Err(ProtocolError::VersionMismatch {
                expected: WIRE_VERSION,
                found: WIRE_VERSION + 1,
            })
        );

        let mut output = encode_worker_error("boom").unwrap();
        output[1] = 0;
        assert!(matches!(
            decode_output(&output),
            Err(ProtocolError::VersionMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let bytes = encode_job(&sample_job()).unwrap();
        for cut in [0, 1, 2, 5, bytes.len() / 2, bytes.len() - 1] {
            let err = decode_job(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, ProtocolError::Truncated { .. }),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_job(&sample_job()).unwrap();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(decode_job(&bytes), Err(ProtocolError::TrailingBytes(2)));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = encode_job(&sample_job()).unwrap();
        bytes[0] = 9;
        assert_eq!(decode_job(&bytes), Err(ProtocolError::UnknownJobType(9)));

        // A worker-error tag is not a valid job.
        bytes[0] = WORKER_ERROR_TAG;
        assert_eq!(
            decode_job(&bytes),
            Err(ProtocolError::UnknownJobType(WORKER_ERROR_TAG))
        );
    }

    #[test]
    fn test_huge_group_count_rejected_without_allocating() {
        let mut bytes = vec![BackendKind::D3D10.tag(), WIRE_VERSION];
        for _ in 0..4 {
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        bytes.push(0);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_job(&bytes),
            Err(ProtocolError::Truncated {
                field: "includes",
                ..
            })
        ));
    }

    #[test]
    fn test_result_round_trip() {
        let result = CompileResult::compiled(
            BackendKind::D3D10,
            vec![0x44, 0x58, 0x42, 0x43, 0, 1],
            "a.usf(3): warning X3206: implicit truncation".into(),
            vec![
                ConstantDesc {
                    name: "WorldViewProj".into(),
                    register_set: RegisterSet::Float4,
                    register_index: 0,
                    register_count: 4,
                },
                ConstantDesc {
                    name: "Diffuse".into(),
                    register_set: RegisterSet::Sampler,
                    register_index: 1,
                    register_count: 1,
                },
            ],
            Some("// approximately 3 instruction slots used".into()),
        );
        let bytes = encode_result(&result).unwrap();
        assert_eq!(
            decode_output(&bytes).unwrap(),
            WorkerOutput::Compiled(result)
        );
    }

    #[test]
    fn test_failed_result_round_trip() {
        let result =
            CompileResult::failed(BackendKind::Xenon, "a.usf(1): error X3000: syntax error");
        let bytes = encode_result(&result).unwrap();
        match decode_output(&bytes).unwrap() {
            WorkerOutput::Compiled(decoded) => {
                assert!(!decoded.success);
                assert!(decoded.bytecode.is_empty());
                assert!(decoded.disassembly.is_none());
                assert_eq!(decoded.errors, result.errors);
            }
            _ => panic!("Expected Compiled variant"),
        }
    }

    #[test]
    fn test_worker_error_round_trip() {
        let bytes = encode_worker_error("CriticalError: compiler fault").unwrap();
        assert_eq!(bytes[0], WORKER_ERROR_TAG);
        match decode_output(&bytes).unwrap() {
            WorkerOutput::WorkerError(message) => {
                assert_eq!(message, "CriticalError: compiler fault");
            }
            _ => panic!("Expected WorkerError variant"),
        }
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = vec![WORKER_ERROR_TAG, WIRE_VERSION];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(
            decode_output(&bytes),
            Err(ProtocolError::InvalidUtf8("worker error"))
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn backend() -> impl Strategy<Value = BackendKind> {
            prop::sample::select(BackendKind::ALL.to_vec())
        }

        fn stage() -> impl Strategy<Value = ShaderStage> {
            prop::sample::select(vec![
                ShaderStage::Vertex,
                ShaderStage::Pixel,
                ShaderStage::Geometry,
            ])
        }

        fn pairs() -> impl Strategy<Value = Vec<(String, String)>> {
            prop::collection::vec(("[A-Z_][A-Z0-9_]{0,12}", ".{0,24}"), 0..6)
        }

        prop_compose! {
            fn job()(
                backend in backend(),
                stage in stage(),
                filename in "[A-Za-z0-9]{1,12}\\.usf",
                source in ".{0,200}",
                entry in "[A-Za-z_][A-Za-z0-9_]{0,12}",
                profile in "[a-z_0-9]{0,10}",
                flags in any::<u32>(),
                macros in pairs(),
                includes in pairs(),
                include_path in prop::option::of("/[a-z]{1,8}(/[a-z]{1,8}){0,2}"),
                dump in prop::option::of("/[a-z]{1,8}"),
            ) -> CompileJob {
                CompileJob {
                    backend,
                    stage,
                    source_filename: filename,
                    source,
                    entry,
                    profile,
                    flags: CompileFlags::from_bits(flags),
                    macros: macros.into_iter().map(|(n, v)| MacroDefinition::new(n, v)).collect(),
                    includes: includes.into_iter().map(|(n, c)| IncludeFile::new(n, c)).collect(),
                    include_path: include_path.map(PathBuf::from),
                    debug_dump_dir: dump.map(PathBuf::from),
                }
            }
        }

        proptest! {
            #[test]
            fn prop_job_round_trip(job in job()) {
                let bytes = encode_job(&job).unwrap();
                prop_assert_eq!(decode_job(&bytes).unwrap(), job);
            }

            #[test]
            fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode_job(&bytes);
                let _ = decode_output(&bytes);
            }
        }
    }
}
