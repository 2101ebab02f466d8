//! Command-line interface definitions using clap.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing::Level;

use crate::output::OutputFormat;
use scw::config::ManagerConfig;
use scw::job::{BackendKind, CompileFlags, CompileJob, CompilerFlag, MacroDefinition, ShaderStage};
use scw::logging::LogFormat;
use scw::worker::WorkerArgs;

/// Compile shaders in crash-isolated worker processes.
#[derive(Parser, Debug)]
#[command(name = "scw")]
#[command(author, version, long_version = scw::version::long_version(), about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log format: pretty, compact, json.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile shader files.
    Compile(CompileArgs),

    /// Run a compile worker (launched by scw itself).
    #[command(hide = true)]
    Worker(WorkerCommandArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "scw",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments of the hidden worker command.
#[derive(Parser, Debug)]
pub struct WorkerCommandArgs {
    /// Working directory holding the mailbox files.
    pub working_dir: PathBuf,
    /// Process id of the launching manager.
    pub parent_pid: u32,
    /// Manager thread that owns this worker.
    pub thread_token: String,
}

impl From<&WorkerCommandArgs> for WorkerArgs {
    fn from(args: &WorkerCommandArgs) -> Self {
        WorkerArgs {
            working_dir: args.working_dir.clone(),
            parent_pid: args.parent_pid,
            thread_token: args.thread_token.clone(),
        }
    }
}

/// Arguments for the compile command.
#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Shader source files; each becomes one job.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Target backend: d3d9, d3d10, xenon, ps3.
    #[arg(short, long, default_value = "d3d9")]
    pub backend: BackendKind,

    /// Shader stage: vertex, pixel, geometry.
    #[arg(short, long, default_value = "pixel")]
    pub stage: ShaderStage,

    /// Entry point function.
    #[arg(short, long, default_value = "Main")]
    pub entry: String,

    /// Target profile (defaults per backend and stage, e.g. ps_3_0).
    #[arg(long)]
    pub profile: Option<String>,

    /// Define a macro.
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE")]
    pub defines: Vec<MacroDefinition>,

    /// Directory searched for includes not embedded with --include.
    #[arg(short = 'I', long = "include-dir", value_name = "DIR")]
    pub include_dir: Option<PathBuf>,

    /// Embed a file as an include under NAME.
    #[arg(long = "include", value_name = "NAME=PATH", value_parser = parse_include)]
    pub includes: Vec<(String, PathBuf)>,

    /// Engine compiler flag: prefer-flow-control, debug, avoid-flow-control, skip-validation.
    #[arg(long = "flag", value_name = "FLAG")]
    pub flags: Vec<CompilerFlag>,

    /// Do not add the standard environment definitions (PIXELSHADER, SM3_PROFILE, ...).
    #[arg(long)]
    pub no_standard_defines: bool,

    /// Write bytecode and disassembly for successful jobs here.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Write debug dumps here (forces in-process compiling).
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// Number of compiling threads and worker processes.
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Smallest batch sent to worker processes.
    #[arg(long)]
    pub threshold: Option<usize>,

    /// How long to wait for a worker before restarting it (e.g. 60s, 500ms).
    #[arg(long, value_parser = parse_duration)]
    pub stall_timeout: Option<Duration>,

    /// Compile everything in this process.
    #[arg(long)]
    pub in_process: bool,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Plain)]
    pub format: OutputFormatArg,
}

impl CompileArgs {
    /// Build one job per source file.
    pub fn build_jobs(&self) -> Result<Vec<CompileJob>> {
        let mut embedded = Vec::with_capacity(self.includes.len());
        for (name, path) in &self.includes {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read include {}", path.display()))?;
            embedded.push((name.clone(), contents));
        }
        let flags = CompileFlags::from_compiler_flags(&self.flags);

        self.files
            .iter()
            .map(|path| {
                let source = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let mut job = CompileJob::new(
                    self.backend,
                    self.stage,
                    source_name(path),
                    source,
                    &self.entry,
                )
                .with_flags(flags);
                if let Some(profile) = &self.profile {
                    job = job.with_profile(profile);
                }
                for define in &self.defines {
                    job.set_macro(&define.name, &define.value);
                }
                if !self.no_standard_defines {
                    job = job.with_standard_definitions();
                }
                for (name, contents) in &embedded {
                    job = job.with_include(name, contents);
                }
                if let Some(dir) = self.include_dir.clone().or_else(|| parent_dir(path)) {
                    job = job.with_include_path(dir);
                }
                if let Some(dir) = &self.dump_dir {
                    job = job.with_debug_dump(dir);
                }
                Ok(job)
            })
            .collect()
    }

    /// Apply command-line overrides on top of `config`.
    pub fn apply_to(&self, mut config: ManagerConfig) -> ManagerConfig {
        if let Some(workers) = self.workers {
            config = config.with_worker_count(workers);
        }
        if let Some(threshold) = self.threshold {
            config = config.with_threshold(threshold);
        }
        if let Some(timeout) = self.stall_timeout {
            config = config.with_stall_timeout(timeout);
        }
        if self.in_process {
            config = config.with_multithreaded(false);
        }
        config
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn parent_dir(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn parse_include(s: &str) -> Result<(String, PathBuf)> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => bail!("expected NAME=PATH, got '{}'", s),
    }
}

/// Parses `250ms`, `30s`, `2m`, or a bare number of seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration '{}'", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => bail!("invalid duration unit '{}' (use ms, s or m)", unit),
    }
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormatArg {
    /// One line per job.
    #[default]
    Plain,
    /// JSON document.
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Plain => OutputFormat::Plain,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and results.
    Normal,
    /// -v: worker lifecycle and batch summaries.
    Info,
    /// -vv: per-job detail.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    pub fn log_level(&self) -> Level {
        match self.verbosity() {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_compile_command() {
        let cli = Cli::try_parse_from([
            "scw", "compile", "A.usf", "B.usf", "--backend", "d3d10", "-D", "FOO=2", "-D", "BAR",
            "--include", "Common.usf=/tmp/Common.usf", "--flag", "debug", "-j", "3",
            "--stall-timeout", "500ms", "--format", "json",
        ])
        .unwrap();
        let Commands::Compile(args) = cli.command else {
            panic!("expected compile");
        };
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.backend, BackendKind::D3D10);
        assert_eq!(args.defines[1], MacroDefinition::new("BAR", "1"));
        assert_eq!(args.includes[0].0, "Common.usf");
        assert_eq!(args.flags, vec![CompilerFlag::Debug]);
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.stall_timeout, Some(Duration::from_millis(500)));
        assert!(matches!(args.format, OutputFormatArg::Json));
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::try_parse_from(["scw", "worker", "/tmp/wd/42/0", "42", "0"]).unwrap();
        let Commands::Worker(args) = &cli.command else {
            panic!("expected worker");
        };
        let worker = WorkerArgs::from(args);
        assert_eq!(worker.parent_pid, 42);
        assert_eq!(worker.working_dir, PathBuf::from("/tmp/wd/42/0"));
    }

    #[test]
    fn test_verbosity_levels() {
        let cli = Cli::try_parse_from(["scw", "-vv", "completions", "bash"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Debug);
        assert_eq!(cli.log_level(), Level::DEBUG);
        let cli = Cli::try_parse_from(["scw", "-q", "completions", "bash"]).unwrap();
        assert_eq!(cli.log_level(), Level::ERROR);
        assert!(Cli::try_parse_from(["scw", "-q", "-v", "completions", "bash"]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5h").is_err());
    }

    #[test]
    fn test_parse_include() {
        assert_eq!(
            parse_include("Common.usf=inc/Common.usf").unwrap(),
            ("Common.usf".to_string(), PathBuf::from("inc/Common.usf"))
        );
        assert!(parse_include("Common.usf").is_err());
    }

    #[test]
    fn test_build_jobs() {
        let tmp = tempdir().unwrap();
        let shader = tmp.path().join("Tint.usf");
        let include = tmp.path().join("Common.usf");
        fs::write(
            &shader,
            "#include \"Common.usf\"\nfloat4 Main() : COLOR0 { return 1; }\n",
        )
        .unwrap();
        fs::write(&include, "// common\n").unwrap();
        let cli = Cli::try_parse_from([
            "scw".to_string(),
            "compile".to_string(),
            shader.display().to_string(),
            "-D".to_string(),
            "SM3_PROFILE=0".to_string(),
            "--include".to_string(),
            format!("Common.usf={}", include.display()),
            "--flag".to_string(),
            "prefer-flow-control".to_string(),
        ])
        .unwrap();
        let Commands::Compile(args) = cli.command else {
            panic!("expected compile");
        };
        let jobs = args.build_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.source_filename, "Tint.usf");
        assert_eq!(job.profile, "ps_3_0");
        assert_eq!(job.macro_value("SM3_PROFILE"), Some("0"));
        assert_eq!(job.macro_value("PIXELSHADER"), Some("1"));
        assert_eq!(job.includes[0].contents, "// common\n");
        assert_eq!(job.include_path.as_deref(), Some(tmp.path()));
        assert!(job.flags.contains(CompileFlags::PREFER_FLOW_CONTROL));
    }

    #[test]
    fn test_build_jobs_missing_file() {
        let cli = Cli::try_parse_from(["scw", "compile", "/nonexistent/A.usf"]).unwrap();
        let Commands::Compile(args) = cli.command else {
            panic!("expected compile");
        };
        let err = args.build_jobs().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/A.usf"));
    }

    #[test]
    fn test_apply_to_config() {
        let cli = Cli::try_parse_from([
            "scw",
            "compile",
            "A.usf",
            "-j",
            "4",
            "--threshold",
            "1",
            "--in-process",
        ])
        .unwrap();
        let Commands::Compile(args) = cli.command else {
            panic!("expected compile");
        };
        let config = args.apply_to(ManagerConfig::default());
        assert_eq!(config.worker_count, Some(4));
        assert_eq!(config.threaded_compile_threshold, 1);
        assert!(!config.allow_multithreaded);
    }
}
