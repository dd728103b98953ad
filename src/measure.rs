//! Differential measurement of one cell.
//!
//! A cell is run twice with the same tool preloaded: first with
//! instrumentation active, then with the tool's pass-through toggle set. The
//! second run keeps the process shape identical, so the runtime difference is
//! the instrumentation overhead. The runs never overlap; both need the same
//! device and the baseline only runs once the instrumented pass succeeded.

use crate::config::ToolProfile;
use crate::error::{HarnessError, Result};
use crate::extract::{self, ToolKind, KERNEL_TIME};
use crate::grid::Cell;
use crate::process::{Command, Launcher};
use crate::result::{unix_millis, MeasurementKind, MeasurementRecord};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Lines of stderr kept in run-failure errors.
const STDERR_TAIL_LINES: usize = 10;

/// Where a cell's action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// The cell's build or clean command.
    Build,
    /// Resolving commands and tool settings for the cell.
    Prepare,
    InstrumentedRun,
    InstrumentedExtract,
    BaselineRun,
    BaselineExtract,
    /// Writing the record to the result store.
    Store,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Build => "build",
            Phase::Prepare => "prepare",
            Phase::InstrumentedRun => "instrumented run",
            Phase::InstrumentedExtract => "instrumented extraction",
            Phase::BaselineRun => "baseline run",
            Phase::BaselineExtract => "baseline extraction",
            Phase::Store => "store",
        };
        f.write_str(s)
    }
}

/// A failed cell action and the phase it failed in.
#[derive(Debug)]
pub struct MeasureFailure {
    pub phase: Phase,
    pub error: HarnessError,
}

impl MeasureFailure {
    pub fn new(phase: Phase, error: HarnessError) -> Self {
        Self { phase, error }
    }
}

impl fmt::Display for MeasureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

impl std::error::Error for MeasureFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Derive the instrumented and baseline commands from a cell's run command.
pub fn command_pair(run: &Command, tool: ToolKind, profile: &ToolProfile) -> Result<(Command, Command)> {
    let instrumented = run.clone().envs(&profile.instrumented_env(tool)?);
    let baseline = run.clone().envs(&profile.baseline_env(tool)?);
    Ok((instrumented, baseline))
}

/// Runs the instrumented/baseline protocol through a [`Launcher`].
pub struct DifferentialMeasurer<'a, L: Launcher> {
    launcher: &'a L,
    echo: bool,
}

impl<'a, L: Launcher> DifferentialMeasurer<'a, L> {
    pub fn new(launcher: &'a L, echo: bool) -> Self {
        Self { launcher, echo }
    }

    /// Measure `cell` and combine both passes into one record.
    pub fn measure(
        &self,
        cell: &Cell,
        kind: MeasurementKind,
        tool: ToolKind,
        instrumented: &Command,
        baseline: &Command,
    ) -> std::result::Result<MeasurementRecord, MeasureFailure> {
        info!(
            "Running the {} tool on {} with command {}",
            tool,
            cell,
            instrumented.display()
        );
        let run = self
            .launcher
            .launch(instrumented, self.echo)
            .map_err(|e| MeasureFailure::new(Phase::InstrumentedRun, e))?;
        if !run.success() {
            return Err(MeasureFailure::new(
                Phase::InstrumentedRun,
                HarnessError::InstrumentationRun {
                    cell: cell.to_string(),
                    exit_code: run.exit_code,
                    stderr_tail: run.stderr_tail(STDERR_TAIL_LINES),
                },
            ));
        }

        let mut metrics = extract::extract(tool, &run.stdout, &run.stderr)
            .map_err(|e| MeasureFailure::new(Phase::InstrumentedExtract, e))?;
        let instrumented_runtime = metrics.remove(KERNEL_TIME).ok_or_else(|| {
            MeasureFailure::new(
                Phase::InstrumentedExtract,
                HarnessError::MetricNotFound {
                    metric: KERNEL_TIME.to_string(),
                    stream: tool.stream(),
                },
            )
        })?;
        debug!("{cell}: instrumented metrics {metrics:?}");

        info!("Running pass-through baseline of {cell}");
        let base = self
            .launcher
            .launch(baseline, self.echo)
            .map_err(|e| MeasureFailure::new(Phase::BaselineRun, e))?;
        if !base.success() {
            return Err(MeasureFailure::new(
                Phase::BaselineRun,
                HarnessError::BaselineRun {
                    cell: cell.to_string(),
                    exit_code: base.exit_code,
                    stderr_tail: base.stderr_tail(STDERR_TAIL_LINES),
                },
            ));
        }
        let baseline_runtime = extract::extract_runtime(tool, &base.stdout, &base.stderr)
            .map_err(|e| MeasureFailure::new(Phase::BaselineExtract, e))?;

        Ok(MeasurementRecord {
            cell: cell.clone(),
            kind,
            tool,
            metrics,
            instrumented_runtime,
            baseline_runtime,
            instrumented_wall: run.elapsed,
            baseline_wall: base.elapsed,
            recorded_at: unix_millis(),
        })
    }
}
