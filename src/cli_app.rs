//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use zfs_bootmenu_harness::catalog;
use zfs_bootmenu_harness::core::config::Config;
use zfs_bootmenu_harness::logger::RunLog;
use zfs_bootmenu_harness::orchestrate::signals::CancelSignal;
use zfs_bootmenu_harness::orchestrate::{
    CaseReport, Harness, PhaseSelection, RunOptions, RunSummary, Verdict,
};

/// Golden-file harness for the ZFS boot menu generator.
#[derive(Debug, Parser)]
#[command(
    name = "zbh",
    author,
    version,
    about = "ZFS boot menu harness - golden-file tests for the boot menu generator",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity (print run settings before starting).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (failures and summary only, generator output suppressed).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the selected cases through both generator phases.
    Run(RunArgs),
    /// List discovered cases.
    List(ListArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum PhaseArg {
    #[default]
    All,
    Bootlist,
    Metamenu,
}

impl From<PhaseArg> for PhaseSelection {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::All => Self::All,
            PhaseArg::Bootlist => Self::Bootlist,
            PhaseArg::Metamenu => Self::Metamenu,
        }
    }
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct RunArgs {
    /// Execute dangerous tests which rename real system binaries (requires root).
    #[arg(long)]
    dangerous: bool,
    /// Rewrite golden references with the normalized generator output.
    #[arg(long)]
    update: bool,
    /// Only run cases whose `<mode>/<case>` contains this substring.
    #[arg(long = "run", value_name = "FILTER")]
    filter: Option<String>,
    /// Phase groups to run.
    #[arg(long, value_enum, default_value_t = PhaseArg::All)]
    phase: PhaseArg,
    /// Fixtures root (`<mode>/<case>/` tree).
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Generator binary to exercise.
    #[arg(long, value_name = "PATH")]
    generator: Option<PathBuf>,
    /// Directory holding one subdirectory per mock tool.
    #[arg(long, value_name = "DIR")]
    mocks: Option<PathBuf>,
    /// Maximum concurrent cases per phase.
    #[arg(long, value_name = "N")]
    parallelism: Option<usize>,
    /// Keep sandboxes on disk for inspection.
    #[arg(long)]
    keep_sandboxes: bool,
    /// JSONL run log path.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ListArgs {
    /// Only list cases whose `<mode>/<case>` contains this substring.
    #[arg(long = "run", value_name = "FILTER")]
    filter: Option<String>,
    /// Fixtures root (`<mode>/<case>/` tree).
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// At least one case failed.
    #[error("{0}")]
    CasesFailed(String),
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure outside any case.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::CasesFailed(_) => 1,
            Self::User(_) | Self::Runtime(_) | Self::Json(_) | Self::Io(_) => 2,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_cases(cli, args),
        Command::List(args) => run_list(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Config::load(cli.config.as_deref()).map_err(|e| CliError::Runtime(e.to_string()))
}

/// Flags override file and environment configuration.
fn apply_run_args(config: &mut Config, args: &RunArgs) {
    config.run.dangerous |= args.dangerous;
    config.run.update |= args.update;
    config.run.keep_sandboxes |= args.keep_sandboxes;
    if let Some(fixtures) = &args.fixtures {
        config.fixtures.root.clone_from(fixtures);
    }
    if let Some(generator) = &args.generator {
        config.generator.binary.clone_from(generator);
    }
    if let Some(mocks) = &args.mocks {
        config.mocks.dir.clone_from(mocks);
    }
    if let Some(parallelism) = args.parallelism {
        config.run.parallelism = parallelism;
    }
    if let Some(log) = &args.log {
        config.paths.jsonl_log.clone_from(log);
    }
}

fn run_cases(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    apply_run_args(&mut config, args);
    config
        .validate()
        .map_err(|e| CliError::User(e.to_string()))?;

    let log_path = config.paths.jsonl_log.clone();
    let log = std::sync::Arc::new(RunLog::open(&log_path));
    let cancel = CancelSignal::install();
    if cli.verbose {
        let hash = config.stable_hash().unwrap_or_else(|_| "-".to_string());
        eprintln!(
            "zbh: fixtures {} generator {} config {hash} log {}",
            config.fixtures.root.display(),
            config.generator.binary.display(),
            log_path.display()
        );
    }
    let harness = Harness::new(config, std::sync::Arc::clone(&log))
        .map_err(|e| CliError::Runtime(e.to_string()))?
        .with_cancel_flag(cancel.flag());

    let options = RunOptions {
        filter: args.filter.clone(),
        phases: args.phase.into(),
        forward_output: forwards_generator_output(cli),
    };
    let summary = harness
        .run(&options)
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    let log_state = log.state();
    if log_state != "normal" {
        eprintln!(
            "zbh: run log {} was unusable; events went to {log_state}",
            log_path.display()
        );
    }

    match output_mode(cli) {
        OutputMode::Human => print_summary(&summary, cli.quiet),
        OutputMode::Json => {
            let payload = json!({
                "command": "run",
                "args": args,
                "summary": summary,
            });
            write_json_line(&payload)?;
        }
    }

    if summary.cancelled {
        return Err(CliError::Runtime("run cancelled by signal".to_string()));
    }
    if !summary.is_success() {
        return Err(CliError::CasesFailed(format!(
            "{} of {} case(s) failed",
            summary.failed,
            summary.total()
        )));
    }
    Ok(())
}

/// Generator output is echoed unless the user asked for quiet.
const fn forwards_generator_output(cli: &Cli) -> bool {
    !cli.quiet
}

fn print_summary(summary: &RunSummary, quiet: bool) {
    for report in &summary.reports {
        if quiet && !report.verdict.is_failure() {
            continue;
        }
        print_report(report);
    }
    let line = format!(
        "{} passed, {} failed, {} skipped, {} updated",
        summary.passed, summary.failed, summary.skipped, summary.updated
    );
    if summary.is_success() {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line.red().bold());
    }
}

fn print_report(report: &CaseReport) {
    let label = match &report.verdict {
        Verdict::Passed => report.verdict.label().green(),
        Verdict::Failed(_) => report.verdict.label().red().bold(),
        Verdict::Skipped(_) => report.verdict.label().yellow(),
        Verdict::Updated(_) => report.verdict.label().cyan(),
    };
    let timing = format!("({} ms)", report.duration_ms).dimmed();
    println!("{label:<7} {} {timing}", report.display_name());
    match &report.verdict {
        Verdict::Passed => {}
        Verdict::Skipped(reason) => println!("        {reason}"),
        Verdict::Updated(path) => println!("        wrote {}", path.display()),
        Verdict::Failed(details) => {
            for line in details.lines() {
                println!("        {line}");
            }
        }
    }
}

fn run_list(cli: &Cli, args: &ListArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let root = args.fixtures.as_ref().unwrap_or(&config.fixtures.root);
    let cases = catalog::discover(root).map_err(|e| CliError::Runtime(e.to_string()))?;
    let cases = catalog::select(cases, args.filter.as_deref());

    match output_mode(cli) {
        OutputMode::Human => {
            for (key, case) in &cases {
                println!("{key}  {}", case.full_name.dimmed());
            }
            if !cli.quiet {
                println!("{} case(s) under {}", cases.len(), root.display());
            }
        }
        OutputMode::Json => {
            let list: Vec<_> = cases.values().collect();
            let payload = json!({
                "command": "list",
                "root": root.to_string_lossy(),
                "cases": serde_json::to_value(list)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = config
                        .to_toml()
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => {
            let config = load_config(cli)?;
            let hash = config
                .stable_hash()
                .map_err(|e| CliError::Runtime(e.to_string()))?;
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("Configuration is valid.");
                    println!("  Source: {}", config.paths.config_file.display());
                    println!("  Hash: {hash}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("ZBH_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
