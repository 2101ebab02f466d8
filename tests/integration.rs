//! Integration tests for the scw binary and its worker processes.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

use scw::job::{BackendKind, CompileJob, ShaderStage};
use scw::worker::mailbox::Mailbox;
use scw::worker::protocol::{WorkerOutput, decode_output, encode_job};
use scw::{CompilingThreadManager, ManagerConfig};

const TINT: &str = "float4 Tint;\nfloat4 Main() : COLOR0 { return Tint; }\n";

const LIT: &str = "\
float4x4 WorldViewProj;
float3 LightDir;
float4 Main(float4 pos : POSITION) : POSITION {
    float4 p = mul(pos, WorldViewProj);
    p.xyz += LightDir;
    return p;
}
";

const BROKEN: &str = "float4 Main() : COLOR0 { float x = ; return x; }\n";

fn scw() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("scw").unwrap()
}

fn write_shader(dir: &Path, name: &str, source: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path.display().to_string()
}

/// Manager running real `scw worker` processes on every batch.
fn threaded_manager(root: &TempDir, stall: Duration) -> CompilingThreadManager {
    CompilingThreadManager::new(
        ManagerConfig::new()
            .with_working_root(root.path())
            .with_worker_count(2)
            .with_threshold(1)
            .with_stall_timeout(stall)
            .with_worker_executable(env!("CARGO_BIN_EXE_scw")),
    )
    .unwrap()
}

fn pixel(name: &str, source: &str) -> CompileJob {
    CompileJob::new(BackendKind::D3D9, ShaderStage::Pixel, name, source, "Main")
        .with_standard_definitions()
}

#[test]
fn test_help() {
    scw()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_version() {
    scw()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_completions() {
    scw()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scw"));
}

#[test]
fn test_compile_in_process_json() {
    let tmp = tempdir().unwrap();
    let file = write_shader(tmp.path(), "Tint.usf", TINT);

    let output = scw()
        .env("SCW_WORKING_DIR", tmp.path().join("wd"))
        .args(["compile", &file, "--in-process", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let record = &value["results"][0];
    assert_eq!(record["file"], "Tint.usf");
    assert_eq!(record["success"], true);
    assert!(record["bytecode_size"].as_u64().unwrap() > 0);
    assert_eq!(record["constants"][0]["name"], "Tint");
    assert_eq!(value["stats"]["worker_spawns"], 0);
}

#[test]
fn test_compile_syntax_error_exits_nonzero() {
    let tmp = tempdir().unwrap();
    let file = write_shader(tmp.path(), "Broken.usf", BROKEN);

    let output = scw()
        .env("SCW_WORKING_DIR", tmp.path().join("wd"))
        .args(["compile", &file, "--in-process", "--format", "json"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let record = &value["results"][0];
    assert_eq!(record["success"], false);
    assert_eq!(record["bytecode_size"], 0);
    assert_eq!(record["internal_error"], false);
    let diagnostics = record["diagnostics"].as_array().unwrap();
    assert!(diagnostics[0].as_str().unwrap().contains("Broken.usf(1): error X3000"));
}

#[test]
fn test_compile_missing_file() {
    scw()
        .args(["compile", "/nonexistent/Missing.usf"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("Missing.usf"));
}

#[test]
fn test_compile_through_workers_plain_output() {
    let tmp = tempdir().unwrap();
    let out = tmp.path().join("out");
    let files: Vec<String> = ["A.usf", "B.usf", "C.usf"]
        .iter()
        .map(|name| write_shader(tmp.path(), name, TINT))
        .collect();

    scw()
        .env("SCW_WORKING_DIR", tmp.path().join("wd"))
        .args(["--no-color", "compile", "-j", "2", "--threshold", "1", "-o"])
        .arg(&out)
        .args(&files)
        .timeout(Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("ok   A.usf:Main d3d9 ps_3_0"))
        .stdout(predicate::str::contains("3 compiled, 0 failed"))
        .stdout(predicate::str::contains("workers spawned"));

    assert!(out.join("A_Main.bin").exists());
    assert!(out.join("C_Main.asm").exists());
}

#[test]
fn test_mixed_backends_through_workers() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_secs(60));

    let jobs = vec![
        pixel("A.usf", TINT),
        CompileJob::new(BackendKind::D3D10, ShaderStage::Vertex, "Lit.usf", LIT, "Main")
            .with_standard_definitions(),
        pixel("C.usf", TINT),
    ];
    let results = manager.compile_batch(jobs).unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[1].result.backend, BackendKind::D3D10);
    for r in &results {
        assert!(r.result.success, "{}: {}", r.job.label(), r.result.errors);
        assert_eq!(r.result.backend, r.job.backend);
        assert_eq!(r.attempts, 1);
    }
    let stats = manager.stats();
    assert!(stats.worker_spawns >= 1);
    assert_eq!(stats.retries, 0);
}

#[test]
fn test_syntax_error_through_workers_is_not_retried() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_secs(60));

    let results = manager
        .compile_batch(vec![pixel("Broken.usf", BROKEN), pixel("A.usf", TINT)])
        .unwrap();

    let broken = &results[0];
    assert!(!broken.result.success);
    assert!(!broken.result.errors.is_empty());
    assert!(broken.result.bytecode.is_empty());
    assert!(!broken.result.is_internal_error());
    assert_eq!(broken.attempts, 1);
    assert!(results[1].result.success);
    assert_eq!(manager.stats().retries, 0);
}

#[test]
fn test_crashing_worker_yields_one_internal_error() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_secs(60));
    let crashing = format!("#pragma scw_fault(abort)\n{}", TINT);

    let results = manager
        .compile_batch(vec![
            pixel("A.usf", TINT),
            pixel("Crash.usf", &crashing),
            pixel("C.usf", TINT),
        ])
        .unwrap();

    assert_eq!(results.len(), 3);
    let crashed = &results[1];
    assert_eq!(crashed.job.source_filename, "Crash.usf");
    assert!(crashed.result.is_internal_error());
    assert_eq!(crashed.attempts, 2);
    assert!(results[0].result.success);
    assert!(results[2].result.success);

    let stats = manager.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.permanent_faults, 1);
}

#[test]
fn test_panicking_compiler_is_reported_by_worker() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_secs(60));
    let panicking = format!("#pragma scw_fault(panic)\n{}", TINT);

    let results = manager.compile_batch(vec![pixel("Panic.usf", &panicking)]).unwrap();

    let result = &results[0].result;
    assert!(result.is_internal_error());
    assert!(result.errors.contains("CriticalError"));
    assert_eq!(results[0].attempts, 2);
}

#[test]
fn test_attribute_fault_recovers_with_legacy_compiler() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_secs(60));
    let source = format!("#pragma scw_fault(attributes)\n{}", TINT);

    let results = manager.compile_batch(vec![pixel("Attr.usf", &source)]).unwrap();

    let result = &results[0].result;
    assert!(result.success, "{}", result.errors);
    assert_eq!(results[0].attempts, 1);
    assert!(result.disassembly.as_deref().unwrap().contains("legacy compiler"));
}

#[test]
fn test_single_worker_fault_recovers_on_retry() {
    let root = tempdir().unwrap();
    let bin = tempdir().unwrap();
    let marker = bin.path().join("crashed-once");
    let script = bin.path().join("flaky-worker.sh");
    let body = format!(
        "#!/bin/sh\nif [ ! -f '{}' ]; then touch '{}'; exit 3; fi\nexec '{}' \"$@\"\n",
        marker.display(),
        marker.display(),
        env!("CARGO_BIN_EXE_scw"),
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let manager = CompilingThreadManager::new(
        ManagerConfig::new()
            .with_working_root(root.path())
            .with_worker_count(2)
            .with_threshold(1)
            .with_stall_timeout(Duration::from_secs(60))
            .with_worker_executable(script.clone()),
    )
    .unwrap();

    let results = manager.compile_batch(vec![pixel("A.usf", TINT)]).unwrap();

    let result = &results[0];
    assert!(result.result.success, "{}", result.result.errors);
    assert_eq!(result.attempts, 2);
    assert!(marker.exists());
    let stats = manager.stats();
    assert_eq!(stats.worker_spawns, 2);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.permanent_faults, 0);
}

#[test]
fn test_hanging_worker_is_restarted_after_stall() {
    let root = tempdir().unwrap();
    let manager = threaded_manager(&root, Duration::from_millis(300));
    let hanging = format!("#pragma scw_fault(hang)\n{}", TINT);

    let started = Instant::now();
    let results = manager.compile_batch(vec![pixel("Hang.usf", &hanging)]).unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    let result = &results[0].result;
    assert!(result.is_internal_error());
    assert!(result.errors.contains("no output within 300ms"));
    assert_eq!(manager.stats().worker_spawns, 2);
}

#[test]
fn test_worker_compiles_posted_job_then_idles_out() {
    let tmp = tempdir().unwrap();
    let mailbox = Mailbox::create(tmp.path().join("0")).unwrap();
    mailbox.post_input(&encode_job(&pixel("A.usf", TINT)).unwrap()).unwrap();

    scw()
        .env_remove("RUST_LOG")
        .env_remove("SCW_LOG")
        .env_remove("SCW_LOG_LEVEL")
        .env("SCW_WORKER_IDLE_TIMEOUT_MS", "300")
        .arg("worker")
        .arg(mailbox.dir())
        .arg(std::process::id().to_string())
        .arg("0")
        .timeout(Duration::from_secs(30))
        .assert()
        .code(0);

    assert!(!mailbox.input_pending());
    let output = mailbox.take_output().unwrap().expect("worker wrote output");
    match decode_output(&output).unwrap() {
        WorkerOutput::Compiled(result) => assert!(result.success),
        other => panic!("unexpected output: {:?}", other),
    }
    let log = fs::read_to_string(mailbox.log_path()).unwrap();
    assert!(log.contains("job complete"));
}

#[test]
fn test_worker_exits_when_parent_is_gone() {
    let tmp = tempdir().unwrap();
    let mut gone = std::process::Command::new("true").spawn().unwrap();
    let gone_pid = gone.id();
    gone.wait().unwrap();

    let started = Instant::now();
    scw()
        .env("SCW_WORKER_IDLE_TIMEOUT_MS", "60000")
        .arg("worker")
        .arg(tmp.path())
        .arg(gone_pid.to_string())
        .arg("0")
        .timeout(Duration::from_secs(30))
        .assert()
        .code(0);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn test_worker_rejects_process_group_parent_id() {
    let tmp = tempdir().unwrap();
    scw()
        .arg("worker")
        .arg(tmp.path())
        .arg("0")
        .arg("0")
        .timeout(Duration::from_secs(30))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid parent process id 0"));
}

#[test]
fn test_worker_rejects_corrupt_input() {
    let tmp = tempdir().unwrap();
    let mailbox = Mailbox::create(tmp.path()).unwrap();
    mailbox.post_input(&[0xff, 0x01, 0x02]).unwrap();

    scw()
        .arg("worker")
        .arg(mailbox.dir())
        .arg(std::process::id().to_string())
        .arg("0")
        .timeout(Duration::from_secs(30))
        .assert()
        .code(1);

    let output = mailbox.take_output().unwrap().unwrap();
    assert!(matches!(
        decode_output(&output).unwrap(),
        WorkerOutput::WorkerError(text) if text.starts_with("CriticalError")
    ));
}
