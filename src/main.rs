//! scw - shader compile workers

mod cli;
mod output;
mod theme;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::debug;

use cli::{Cli, Commands, CompileArgs};
use scw::backend::dump;
use scw::config::ManagerConfig;
use scw::logging::{self, LogConfig};
use scw::worker::{CompilingThreadManager, JobResult, run_worker_main};

/// Parses arguments, runs the selected command, and exits 1 on error or on a failed compile.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Compile(args) => cmd_compile(&cli, args),
        Commands::Worker(args) => run_worker_main(args.into()),
        Commands::Completions(args) => {
            args.generate();
            Ok(true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::new().with_level(cli.log_level());
    if cli.verbose > 0 || cli.quiet {
        // Explicit verbosity beats SCW_LOG / RUST_LOG.
        config = config.with_filter(cli.log_level().to_string().to_lowercase());
    }
    config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init_with_file(config);
}

/// Compile every file as one batch. Returns whether all jobs succeeded.
fn cmd_compile(cli: &Cli, args: &CompileArgs) -> Result<bool> {
    init_logging(cli);

    let jobs = args.build_jobs()?;
    let config = args.apply_to(ManagerConfig::default().with_env_overrides());
    debug!(jobs = jobs.len(), ?config, "starting batch");

    let manager =
        CompilingThreadManager::new(config).context("failed to set up compile workers")?;
    let results = manager.compile_batch(jobs)?;

    if let Some(dir) = &args.output_dir {
        write_outputs(dir, &results)?;
    }
    if !cli.quiet {
        output::print_results(&results, &manager.stats(), args.format.into());
    }
    manager.shutdown();

    Ok(results.iter().all(|r| r.result.success))
}

/// Write `<stem>_<entry>.bin` bytecode and `.asm` disassembly for each successful job.
fn write_outputs(dir: &Path, results: &[JobResult]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    for r in results.iter().filter(|r| r.result.success) {
        let stem = dump::dump_stem(&r.job);
        let bytecode = dir.join(format!("{}.bin", stem));
        fs::write(&bytecode, &r.result.bytecode)
            .with_context(|| format!("failed to write {}", bytecode.display()))?;
        if let Some(disassembly) = &r.result.disassembly {
            let listing = dir.join(format!("{}.asm", stem));
            fs::write(&listing, disassembly)
                .with_context(|| format!("failed to write {}", listing.display()))?;
        }
    }
    Ok(())
}
