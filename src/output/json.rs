//! JSON output for compile results.

use serde::Serialize;

use scw::result::ConstantDesc;
use scw::worker::{JobResult, StatsSnapshot};

#[derive(Debug, Serialize)]
pub struct JobRecord<'a> {
    pub id: u64,
    pub file: &'a str,
    pub entry: &'a str,
    pub backend: &'static str,
    pub profile: &'a str,
    pub success: bool,
    pub internal_error: bool,
    pub attempts: u32,
    pub bytecode_size: usize,
    pub instruction_count: Option<u32>,
    /// Errors on failure, warnings on success.
    pub diagnostics: Vec<String>,
    pub constants: &'a [ConstantDesc],
}

impl<'a> From<&'a JobResult> for JobRecord<'a> {
    fn from(r: &'a JobResult) -> Self {
        Self {
            id: r.id,
            file: &r.job.source_filename,
            entry: &r.job.entry,
            backend: r.job.backend.name(),
            profile: &r.job.profile,
            success: r.result.success,
            internal_error: r.result.is_internal_error(),
            attempts: r.attempts,
            bytecode_size: r.result.bytecode.len(),
            instruction_count: r.result.instruction_count(),
            diagnostics: r.result.error_lines(),
            constants: &r.result.constants,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchReport<'a> {
    pub results: Vec<JobRecord<'a>>,
    pub stats: &'a StatsSnapshot,
}

pub fn render_json(results: &[JobResult], stats: &StatsSnapshot) -> serde_json::Result<String> {
    let report = BatchReport {
        results: results.iter().map(JobRecord::from).collect(),
        stats,
    };
    serde_json::to_string_pretty(&report)
}

/// Print batch results as JSON.
pub fn print_json(results: &[JobResult], stats: &StatsSnapshot) {
    let json = render_json(results, stats).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}
