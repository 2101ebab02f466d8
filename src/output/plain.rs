//! Plain text output for compile results.

use scw::worker::{JobResult, StatsSnapshot};

use crate::theme::Themed;

/// One status line for a job, followed by its indented diagnostics.
pub fn format_result(r: &JobResult) -> String {
    let label = r.job.label().shader_label();
    let target = format!("{} {}", r.job.backend, r.job.profile).muted();
    let mut out = if r.result.success {
        let mut detail = format!("{} bytes", r.result.bytecode.len());
        if let Some(slots) = r.result.instruction_count() {
            detail.push_str(&format!(", {} instruction slots", slots));
        }
        format!("{} {} {} {}", "ok  ".success(), label, target, detail.muted())
    } else {
        format!("{} {} {}", "FAIL".failure(), label, target)
    };
    if r.attempts > 1 {
        out.push_str(&format!(" {}", format!("(attempts: {})", r.attempts).warning()));
    }
    for line in r.result.error_lines() {
        out.push_str("\n    ");
        if r.result.success {
            out.push_str(&line.warning());
        } else {
            out.push_str(&line);
        }
    }
    out
}

pub fn format_summary(results: &[JobResult], stats: &StatsSnapshot) -> String {
    let failed = results.iter().filter(|r| !r.result.success).count();
    let mut summary = format!("{} compiled, {} failed", results.len() - failed, failed);
    if stats.worker_spawns > 0 {
        summary.push_str(&format!(
            " ({} workers spawned, {} retries)",
            stats.worker_spawns, stats.retries
        ));
    }
    summary
}

/// Print batch results as plain text.
pub fn print_plain(results: &[JobResult], stats: &StatsSnapshot) {
    for r in results {
        println!("{}", format_result(r));
    }
    println!("{}", format_summary(results, stats));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme;
    use scw::job::{BackendKind, CompileJob, ShaderStage};
    use scw::result::CompileResult;
    use serial_test::serial;

    fn job_result(result: CompileResult, attempts: u32) -> JobResult {
        JobResult {
            id: 0,
            job: CompileJob::new(BackendKind::D3D10, ShaderStage::Pixel, "A.usf", "", "Main"),
            result,
            attempts,
        }
    }

    #[test]
    #[serial]
    fn test_format_success() {
        theme::disable_colors();
        let result = CompileResult::compiled(
            BackendKind::D3D10,
            vec![0; 48],
            String::new(),
            Vec::new(),
            Some("// approximately 3 instruction slots used\n".to_string()),
        );
        let line = format_result(&job_result(result, 1));
        assert_eq!(line, "ok   A.usf:Main d3d10 ps_4_0 48 bytes, 3 instruction slots");
    }

    #[test]
    #[serial]
    fn test_format_internal_error_shows_attempts() {
        theme::disable_colors();
        let result = CompileResult::internal_error(
            BackendKind::D3D10,
            "worker killed (SIGKILL) without output",
        );
        let text = format_result(&job_result(result, 2));
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("FAIL A.usf:Main d3d10 ps_4_0 (attempts: 2)"));
        assert!(lines.next().unwrap().starts_with("    internal compiler error"));
    }

    #[test]
    fn test_format_summary() {
        let ok = job_result(
            CompileResult::compiled(BackendKind::D3D10, vec![1], String::new(), Vec::new(), None),
            1,
        );
        let failed = job_result(CompileResult::failed(BackendKind::D3D10, "error"), 1);
        let stats = StatsSnapshot {
            worker_spawns: 2,
            retries: 1,
            ..StatsSnapshot::default()
        };
        assert_eq!(
            format_summary(&[ok, failed], &stats),
            "1 compiled, 1 failed (2 workers spawned, 1 retries)"
        );
    }
}
