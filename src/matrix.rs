//! The grid sweep: build, clean or measure every cell in order.
//!
//! Build and clean are strict: the first failing cell aborts the run, since
//! later measurements would be taken against an inconsistent tree. Measuring
//! is best effort: a failing cell is recorded and the sweep moves on.

use crate::config::{GridConfig, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::extract::ToolKind;
use crate::grid::{Cell, Grid};
use crate::measure::{command_pair, DifferentialMeasurer, MeasureFailure, Phase};
use crate::process::{Command, Launcher};
use crate::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::result::{unix_millis, MeasurementKind};
use crate::store::ResultStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};

/// What to do with each cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Build,
    Clean,
    Measure(MeasurementKind),
}

impl Action {
    /// File-name friendly identifier, e.g. `measure-instr-count`.
    pub fn slug(&self) -> String {
        match self {
            Action::Build => "build".to_string(),
            Action::Clean => "clean".to_string(),
            Action::Measure(kind) => format!("measure-{kind}"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Build => f.write_str("build"),
            Action::Clean => f.write_str("clean"),
            Action::Measure(kind) => write!(f, "measure {kind}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// A stored result exists and overwriting is off.
    CacheHit,
    /// The suite names a pairing the benchmark does not declare.
    Unconfigured,
}

/// Final state of one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CellOutcome {
    Built,
    Cleaned,
    Stored { overhead: Option<f64> },
    Skipped { reason: SkipReason },
    Failed { phase: Phase, message: String },
}

impl CellOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CellOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellReport {
    pub cell: Cell,
    #[serde(flatten)]
    pub outcome: CellOutcome,
    pub elapsed_secs: f64,
}

/// Outcome of a whole sweep.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixReport {
    pub action: String,
    pub started_at: String,
    pub cells: Vec<CellReport>,
    pub total_secs: f64,
}

impl MatrixReport {
    fn count(&self, pred: impl Fn(&CellOutcome) -> bool) -> usize {
        self.cells.iter().filter(|c| pred(&c.outcome)).count()
    }

    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, CellOutcome::Stored { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CellOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(CellOutcome::is_failure)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

/// Walks a grid sequentially, one child process at a time.
pub struct MatrixRunner<'a, L: Launcher> {
    config: &'a HarnessConfig,
    grid_config: &'a GridConfig,
    launcher: &'a L,
    store: ResultStore,
    reporters: Vec<Box<dyn Reporter>>,
}

impl<'a, L: Launcher> MatrixRunner<'a, L> {
    /// Create a runner with the default console and JSON reporters.
    pub fn new(config: &'a HarnessConfig, grid_config: &'a GridConfig, launcher: &'a L) -> Self {
        let reporters: Vec<Box<dyn Reporter>> = vec![
            Box::new(ConsoleReporter::new()),
            Box::new(JsonReporter::new(config.output_dir.clone())),
        ];
        Self {
            config,
            grid_config,
            launcher,
            store: ResultStore::new(&config.root),
            reporters,
        }
    }

    /// Replace reporters with a custom set.
    pub fn reporters(&mut self, reporters: Vec<Box<dyn Reporter>>) -> &mut Self {
        self.reporters = reporters;
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Apply `action` to every cell of `grid` in order.
    ///
    /// Returns `Err` only for failures that abort the sweep: a failed build or
    /// clean, an executable that cannot be launched, or a suite whose tools
    /// cannot be resolved.
    pub fn run_matrix(&self, action: Action, grid: &Grid) -> Result<MatrixReport> {
        let started = Instant::now();
        let mut report = MatrixReport {
            action: action.slug(),
            started_at: unix_millis(),
            cells: Vec::with_capacity(grid.len() + grid.unconfigured().len()),
            total_secs: 0.0,
        };

        // Resolve tools before any process runs so a config gap fails fast.
        let tools = match action {
            Action::Measure(kind) => self.resolve_tools(kind, grid)?,
            Action::Build | Action::Clean => BTreeMap::new(),
        };

        for r in &self.reporters {
            r.matrix_start(&action, grid);
        }

        for (cell, configured) in grid.sweep() {
            if !configured {
                info!("Skipping {cell}: backend not configured for this benchmark");
                let skipped = CellReport {
                    cell: cell.clone(),
                    outcome: CellOutcome::Skipped {
                        reason: SkipReason::Unconfigured,
                    },
                    elapsed_secs: 0.0,
                };
                for r in &self.reporters {
                    r.cell_end(&skipped);
                }
                report.cells.push(skipped);
                continue;
            }

            for r in &self.reporters {
                r.cell_start(cell);
            }
            let cell_start = Instant::now();

            let result = match action {
                Action::Build | Action::Clean => self.build_cell(action, cell),
                Action::Measure(kind) => {
                    self.measure_cell(kind, tools.get(&cell.backend).copied(), cell)
                }
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(failure) => {
                    let aborted = CellReport {
                        cell: cell.clone(),
                        outcome: CellOutcome::Failed {
                            phase: failure.phase,
                            message: failure.error.to_string(),
                        },
                        elapsed_secs: cell_start.elapsed().as_secs_f64(),
                    };
                    for r in &self.reporters {
                        r.cell_end(&aborted);
                    }
                    return Err(failure.error);
                }
            };

            let cell_report = CellReport {
                cell: cell.clone(),
                outcome,
                elapsed_secs: cell_start.elapsed().as_secs_f64(),
            };
            for r in &self.reporters {
                r.cell_end(&cell_report);
            }
            report.cells.push(cell_report);
        }

        report.total_secs = started.elapsed().as_secs_f64();
        for r in &self.reporters {
            r.matrix_end(&report);
        }
        Ok(report)
    }

    fn resolve_tools(&self, kind: MeasurementKind, grid: &Grid) -> Result<BTreeMap<String, ToolKind>> {
        let mut tools = BTreeMap::new();
        for cell in grid.cells() {
            if !tools.contains_key(&cell.backend) {
                let tool = self.grid_config.tool_for(kind, &cell.backend)?;
                tools.insert(cell.backend.clone(), tool);
            }
        }
        Ok(tools)
    }

    fn build_cell(&self, action: Action, cell: &Cell) -> CellResult {
        let build_failure = |e: HarnessError| MeasureFailure::new(Phase::Build, e);
        let (command, outcome) = match action {
            Action::Clean => (
                self.grid_config
                    .clean_command(cell, &self.config.root)
                    .map_err(build_failure)?,
                CellOutcome::Cleaned,
            ),
            _ => (
                self.grid_config
                    .build_command(cell, &self.config.root)
                    .map_err(build_failure)?,
                CellOutcome::Built,
            ),
        };

        info!("{}ing {cell}", capitalize(&action.to_string()));
        let capture = self
            .launcher
            .launch(&command, self.config.echo)
            .map_err(build_failure)?;
        if !capture.success() {
            error!(
                "{} of {cell} failed:\n{}\n{}",
                action,
                capture.stdout.trim_end(),
                capture.stderr.trim_end()
            );
            return Err(build_failure(HarnessError::ProcessExit {
                cell: cell.to_string(),
                command: command.display(),
                exit_code: capture.exit_code,
            }));
        }
        Ok(outcome)
    }

    /// Measure one cell. Only an unlaunchable executable is returned as `Err`;
    /// every other failure becomes a `Failed` outcome.
    fn measure_cell(&self, kind: MeasurementKind, tool: Option<ToolKind>, cell: &Cell) -> CellResult {
        if !self.config.overwrite && self.store.exists(cell, kind) {
            info!("Skipping {cell} as existing results were found.");
            return Ok(CellOutcome::Skipped {
                reason: SkipReason::CacheHit,
            });
        }

        let (tool, instrumented, baseline) = match self.prepare(kind, tool, cell) {
            Ok(prepared) => prepared,
            Err(e) => return Ok(failed(cell, Phase::Prepare, &e)),
        };

        let measurer = DifferentialMeasurer::new(self.launcher, self.config.echo);
        let record = match measurer.measure(cell, kind, tool, &instrumented, &baseline) {
            Ok(record) => record,
            Err(failure) if matches!(failure.error, HarnessError::ProcessLaunch { .. }) => {
                return Err(failure)
            }
            Err(failure) => return Ok(failed(cell, failure.phase, &failure.error)),
        };

        if let Err(e) = self.store.save(cell, kind, &record) {
            return Ok(failed(cell, Phase::Store, &e));
        }
        info!("Stored {kind} results for {cell}: {:?}", record.fields());
        Ok(CellOutcome::Stored {
            overhead: record.overhead(),
        })
    }

    fn prepare(
        &self,
        kind: MeasurementKind,
        tool: Option<ToolKind>,
        cell: &Cell,
    ) -> Result<(ToolKind, Command, Command)> {
        let tool = match tool {
            Some(tool) => tool,
            None => self.grid_config.tool_for(kind, &cell.backend)?,
        };
        let run = self.grid_config.run_command(cell, &self.config.root)?;
        let profile = self.grid_config.profile(tool, &self.config.tool_paths);
        let (instrumented, baseline) = command_pair(&run, tool, &profile)?;
        Ok((tool, instrumented, baseline))
    }
}

type CellResult = std::result::Result<CellOutcome, MeasureFailure>;

fn failed(cell: &Cell, phase: Phase, error: &HarnessError) -> CellOutcome {
    warn!("{cell}: {phase} failed: {error}");
    CellOutcome::Failed {
        phase,
        message: error.to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::MetricValue;
    use crate::measure::tests::ScriptedLauncher;

    const GRID: &str = r#"
benchmarks:
  adam:
    backends:
      cuda: { run_command: ["./main", "3"] }
      hip: { run_command: ["./main", "3"] }
  nn:
    backends:
      cuda: { run_command: ["./main"] }
suites:
  instr-count:
    benchmarks: [adam, nn]
    backends: [cuda, hip]
    tools: { cuda: nvbit-instr-count }
    default_tool: luthier-instr-count
"#;

    const NVBIT_OK: &str = "Total app instructions: 42.\nTotal kernel time: 7.\n";
    const BASELINE_OK: &str = "Total kernel time: 2.\n";

    fn setup() -> (tempfile::TempDir, HarnessConfig, GridConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::new().root(dir.path());
        let grid = GridConfig::from_yaml(GRID).unwrap();
        (dir, config, grid)
    }

    #[test]
    fn should_measure_every_cell_and_skip_unconfigured() {
        let (_dir, config, grid_config) = setup();
        let launcher = ScriptedLauncher::default();
        launcher
            .reply(0, NVBIT_OK, "")
            .reply(0, BASELINE_OK, "")
            .reply(0, "", "Total number of instructions counted: 9\nTotal kernel time: 4\n")
            .reply(0, "", "Total kernel time: 4\n")
            .reply(0, NVBIT_OK, "")
            .reply(0, BASELINE_OK, "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::for_suite(&grid_config, MeasurementKind::InstrCount).unwrap();
        let report = runner
            .run_matrix(Action::Measure(MeasurementKind::InstrCount), &grid)
            .unwrap();

        assert_eq!(report.stored(), 3);
        assert_eq!(report.skipped(), 1);
        assert!(!report.has_failures());
        assert_eq!(launcher.launches(), 6);
        let order: Vec<String> = report.cells.iter().map(|c| c.cell.to_string()).collect();
        assert_eq!(order, vec!["adam-cuda", "adam-hip", "nn-cuda", "nn-hip"]);
        assert_eq!(
            report.cells[3].outcome,
            CellOutcome::Skipped {
                reason: SkipReason::Unconfigured
            }
        );

        let hip = runner
            .store()
            .load(&Cell::new("adam", "hip"), MeasurementKind::InstrCount)
            .unwrap();
        assert_eq!(hip.tool, ToolKind::LuthierInstrCount);
        assert_eq!(hip.metrics["instruction_count"], MetricValue::Int(9));
    }

    #[test]
    fn should_continue_measuring_after_a_failed_cell() {
        let (_dir, config, grid_config) = setup();
        let launcher = ScriptedLauncher::default();
        launcher
            .reply(1, "", "crash\n")
            .reply(0, "", "Total number of instructions counted: 9\nTotal kernel time: 4\n")
            .reply(0, "", "Total kernel time: 4\n")
            .reply(0, NVBIT_OK, "")
            .reply(0, BASELINE_OK, "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::for_suite(&grid_config, MeasurementKind::InstrCount).unwrap();
        let report = runner
            .run_matrix(Action::Measure(MeasurementKind::InstrCount), &grid)
            .unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.stored(), 2);
        let failed = report.cells.iter().find(|c| c.outcome.is_failure()).unwrap();
        assert_eq!(failed.cell, Cell::new("adam", "cuda"));
        assert!(matches!(
            failed.outcome,
            CellOutcome::Failed { phase: Phase::InstrumentedRun, .. }
        ));
        assert!(!runner
            .store()
            .exists(&Cell::new("adam", "cuda"), MeasurementKind::InstrCount));
    }

    #[test]
    fn should_run_one_pair_per_cell_when_cached() {
        let (_dir, config, grid_config) = setup();
        let launcher = ScriptedLauncher::default();
        launcher.reply(0, NVBIT_OK, "").reply(0, BASELINE_OK, "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::from_cells(vec![Cell::new("nn", "cuda")]);
        let action = Action::Measure(MeasurementKind::InstrCount);

        let first = runner.run_matrix(action, &grid).unwrap();
        let second = runner.run_matrix(action, &grid).unwrap();

        assert_eq!(first.stored(), 1);
        assert_eq!(second.skipped(), 1);
        assert_eq!(launcher.launches(), 2);
    }

    #[test]
    fn should_rerun_and_overwrite_when_caching_disabled() {
        let (_dir, config, grid_config) = setup();
        let config = config.overwrite(true);
        let launcher = ScriptedLauncher::default();
        launcher
            .reply(0, NVBIT_OK, "")
            .reply(0, BASELINE_OK, "")
            .reply(0, "Total app instructions: 50.\nTotal kernel time: 7.\n", "")
            .reply(0, BASELINE_OK, "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let cell = Cell::new("nn", "cuda");
        let grid = Grid::from_cells(vec![cell.clone()]);
        let action = Action::Measure(MeasurementKind::InstrCount);

        runner.run_matrix(action, &grid).unwrap();
        let second = runner.run_matrix(action, &grid).unwrap();

        assert_eq!(second.stored(), 1);
        assert_eq!(launcher.launches(), 4);
        let record = runner.store().load(&cell, MeasurementKind::InstrCount).unwrap();
        assert_eq!(record.metrics["instruction_count"], MetricValue::Int(50));
    }

    #[test]
    fn should_abort_build_on_first_failure() {
        let (_dir, config, grid_config) = setup();
        let launcher = ScriptedLauncher::default();
        launcher.reply(0, "", "").reply(2, "", "make: *** error\n").reply(0, "", "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::all(&grid_config);
        let err = runner.run_matrix(Action::Build, &grid).unwrap_err();

        assert!(matches!(
            err,
            HarnessError::ProcessExit { exit_code: Some(2), .. }
        ));
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.launched.borrow()[0].program, "make");
    }

    #[test]
    fn should_abort_measure_when_executable_cannot_launch() {
        let (_dir, config, grid_config) = setup();
        // No scripted replies: every launch fails as if the binary were missing.
        let launcher = ScriptedLauncher::default();

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::for_suite(&grid_config, MeasurementKind::InstrCount).unwrap();
        let err = runner
            .run_matrix(Action::Measure(MeasurementKind::InstrCount), &grid)
            .unwrap_err();

        assert!(matches!(err, HarnessError::ProcessLaunch { .. }));
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn should_clean_every_cell() {
        let (_dir, config, grid_config) = setup();
        let launcher = ScriptedLauncher::default();
        launcher.reply(0, "", "").reply(0, "", "").reply(0, "", "");

        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let report = runner
            .run_matrix(Action::Clean, &Grid::all(&grid_config))
            .unwrap();

        assert_eq!(report.cells.len(), 3);
        assert!(report
            .cells
            .iter()
            .all(|c| c.outcome == CellOutcome::Cleaned));
        assert!(launcher
            .launched
            .borrow()
            .iter()
            .all(|c| c.args == vec!["clean"]));
    }

    #[test]
    fn should_fail_fast_when_suite_has_no_tool_for_backend() {
        let yaml = r#"
benchmarks:
  nn:
    backends:
      sycl: { run_command: ["./main"] }
suites:
  instr-count:
    benchmarks: [nn]
    backends: [sycl]
    tools: { cuda: nvbit-instr-count }
"#;
        let (_dir, config, _) = setup();
        let grid_config = GridConfig::from_yaml(yaml).unwrap();
        let launcher = ScriptedLauncher::default();
        let mut runner = MatrixRunner::new(&config, &grid_config, &launcher);
        runner.reporters(vec![]);
        let grid = Grid::for_suite(&grid_config, MeasurementKind::InstrCount).unwrap();

        let err = runner
            .run_matrix(Action::Measure(MeasurementKind::InstrCount), &grid)
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnknownTool { .. }));
        assert_eq!(launcher.launches(), 0);
    }

    #[test]
    fn should_capitalize_action_verbs() {
        assert_eq!(capitalize("build"), "Build");
        assert_eq!(Action::Measure(MeasurementKind::OpcodeHistogram).slug(), "measure-opcode-histogram");
    }
}
