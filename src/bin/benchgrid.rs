//! benchgrid: build, clean, measure and summarize a benchmark grid.
//!
//! ```text
//! benchgrid build                               # make every configured cell
//! benchgrid measure --suite instr-count         # instrumented + baseline runs
//! benchgrid measure --suite opcode-histogram --overwrite
//! benchgrid report --suite opcode-histogram --top 5
//! ```
//!
//! Runtime options can also come from `BENCHGRID_*` environment variables;
//! flags win over the environment.

use anyhow::{bail, Context, Result};
use benchgrid::config::parse_timeout_secs;
use benchgrid::logging::{init_logging, Verbosity};
use benchgrid::summary::{summarize, DEFAULT_TOP_N};
use benchgrid::{
    Action, Grid, GridConfig, HarnessConfig, JsonReporter, MatrixRunner, MeasurementKind,
    ProcessRunner, Reporter, ResultStore, ToolKind,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "benchgrid",
    about = "Sweep a benchmark x backend grid under binary instrumentation tools"
)]
struct Cli {
    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Quiet mode (minimal output, only errors)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Benchmark tree root (contains src/<benchmark>-<backend>/)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Grid document (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build every configured cell (or the cells of one suite)
    Build(SelectArgs),
    /// Run `make clean` in every configured cell (or the cells of one suite)
    Clean(SelectArgs),
    /// Measure a suite's cells and store one record per cell
    Measure(MeasureArgs),
    /// Summarize stored records of a suite
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct SelectArgs {
    /// Restrict to the cells of this suite
    #[arg(long)]
    suite: Option<MeasurementKind>,
}

#[derive(Debug, Args)]
struct MeasureArgs {
    /// Suite to measure
    #[arg(long)]
    suite: MeasurementKind,

    // ========================================================================
    // Execution Options
    // ========================================================================
    /// Echo child stdout/stderr while capturing
    #[arg(long)]
    echo: bool,

    /// Re-measure cells that already have stored results
    #[arg(long)]
    overwrite: bool,

    /// Kill a child process after this many seconds
    #[arg(long, value_parser = parse_timeout_secs)]
    timeout_secs: Option<Duration>,

    /// Override a tool's shared object, e.g. `nvbit-instr-count=/opt/instr_count.so`
    #[arg(long = "tool", value_parser = parse_tool_override)]
    tools: Vec<(ToolKind, PathBuf)>,

    // ========================================================================
    // Output Control
    // ========================================================================
    /// Output directory for the JSON run summary
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Suite to summarize
    #[arg(long)]
    suite: MeasurementKind,

    /// Opcodes listed per backend in histogram summaries
    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    top: usize,
}

fn parse_tool_override(s: &str) -> std::result::Result<(ToolKind, PathBuf), String> {
    let (kind, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <tool>=<path>, got '{s}'"))?;
    let kind = kind.parse::<ToolKind>().map_err(|e| e.to_string())?;
    if path.is_empty() {
        return Err(format!("empty path for tool '{kind}'"));
    }
    Ok((kind, PathBuf::from(path)))
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);
    init_logging(verbosity);

    let mut config = HarnessConfig::from_env();
    if let Some(root) = &cli.root {
        config = config.root(root);
    }
    if let Some(path) = &cli.config {
        config = config.config_path(path);
    }

    let grid_config = GridConfig::load(&config.config_path)
        .with_context(|| format!("Failed to load grid config {}", config.config_path.display()))?;

    match cli.cmd {
        Commands::Build(args) => run_build(Action::Build, args, &config, &grid_config, verbosity),
        Commands::Clean(args) => run_build(Action::Clean, args, &config, &grid_config, verbosity),
        Commands::Measure(args) => run_measure(args, config, &grid_config, verbosity),
        Commands::Report(args) => run_report(args, &config, &grid_config),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn select_grid(suite: Option<MeasurementKind>, grid_config: &GridConfig) -> Result<Grid> {
    match suite {
        Some(kind) => Ok(Grid::for_suite(grid_config, kind)?),
        None => Ok(Grid::all(grid_config)),
    }
}

fn matrix_runner<'a>(
    config: &'a HarnessConfig,
    grid_config: &'a GridConfig,
    launcher: &'a ProcessRunner,
    verbosity: Verbosity,
) -> MatrixRunner<'a, ProcessRunner> {
    let mut runner = MatrixRunner::new(config, grid_config, launcher);
    if !verbosity.is_normal() {
        let json: Box<dyn Reporter> = Box::new(JsonReporter::new(config.output_dir.clone()));
        runner.reporters(vec![json]);
    }
    runner
}

fn run_build(
    action: Action,
    args: SelectArgs,
    config: &HarnessConfig,
    grid_config: &GridConfig,
    verbosity: Verbosity,
) -> Result<()> {
    let grid = select_grid(args.suite, grid_config)?;
    let launcher = ProcessRunner::new().with_timeout(config.timeout);
    let runner = matrix_runner(config, grid_config, &launcher, verbosity);

    runner
        .run_matrix(action, &grid)
        .with_context(|| format!("{action} aborted"))?;

    if verbosity.is_normal() {
        eprintln!("\n✅ {} of {} cell(s) finished", action, grid.len());
    }
    Ok(())
}

fn run_measure(
    args: MeasureArgs,
    mut config: HarnessConfig,
    grid_config: &GridConfig,
    verbosity: Verbosity,
) -> Result<()> {
    if args.echo {
        config = config.echo(true);
    }
    if args.overwrite {
        config = config.overwrite(true);
    }
    if let Some(timeout) = args.timeout_secs {
        config = config.timeout(timeout);
    }
    if let Some(dir) = args.output_dir {
        config = config.output_dir(dir);
    }
    for (tool, path) in args.tools {
        config = config.tool_path(tool, path);
    }

    let grid = Grid::for_suite(grid_config, args.suite)?;
    let launcher = ProcessRunner::new().with_timeout(config.timeout);
    let runner = matrix_runner(&config, grid_config, &launcher, verbosity);

    let report = runner.run_matrix(Action::Measure(args.suite), &grid)?;

    if report.has_failures() {
        if verbosity.is_normal() {
            eprintln!(
                "\n❌ {} of {} cell(s) failed",
                report.failed(),
                report.cells.len()
            );
        }
        std::process::exit(1);
    }

    if verbosity.is_normal() {
        eprintln!(
            "\n✅ {} stored, {} skipped",
            report.stored(),
            report.skipped()
        );
    }
    Ok(())
}

fn run_report(args: ReportArgs, config: &HarnessConfig, grid_config: &GridConfig) -> Result<()> {
    let grid = Grid::for_suite(grid_config, args.suite)?;
    let store = ResultStore::new(&config.root);
    let records = store
        .load_all(grid.cells(), args.suite)
        .context("Failed to load stored results")?;

    if records.is_empty() {
        bail!(
            "No stored {} results under {}; run `benchgrid measure --suite {}` first",
            args.suite,
            config.root.display(),
            args.suite
        );
    }

    println!("{}", summarize(args.suite, &records, args.top));
    Ok(())
}
