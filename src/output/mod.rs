//! Output formatting for compile results.

pub mod json;
pub mod plain;

use scw::worker::{JobResult, StatsSnapshot};

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One line per job, diagnostics indented below.
    #[default]
    Plain,
    /// A single JSON document.
    Json,
}

/// Format and print batch results.
pub fn print_results(results: &[JobResult], stats: &StatsSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Plain => plain::print_plain(results, stats),
        OutputFormat::Json => json::print_json(results, stats),
    }
}
