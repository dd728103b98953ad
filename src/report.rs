//! Pluggable reporters for sweep progress.

use crate::grid::{Cell, Grid};
use crate::matrix::{Action, CellOutcome, CellReport, MatrixReport, SkipReason};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Trait for sweep reporters.
pub trait Reporter: Send + Sync {
    /// Called before the first cell runs.
    fn matrix_start(&self, _action: &Action, _grid: &Grid) {}

    /// Called when a cell starts.
    fn cell_start(&self, _cell: &Cell) {}

    /// Called when a cell reaches its final state.
    fn cell_end(&self, _report: &CellReport) {}

    /// Called when the sweep completes.
    fn matrix_end(&self, _report: &MatrixReport) {}
}

/// Console reporter that prints progress to stderr, with the full error
/// under each failed cell.
#[derive(Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }

    fn format_duration(d: Duration) -> String {
        if d.as_secs() > 0 {
            format!("{:.2}s", d.as_secs_f64())
        } else if d.as_millis() > 0 {
            format!("{:.2}ms", d.as_secs_f64() * 1000.0)
        } else {
            format!("{:.2}µs", d.as_secs_f64() * 1_000_000.0)
        }
    }

    fn format_outcome(outcome: &CellOutcome) -> String {
        match outcome {
            CellOutcome::Built => "built".to_string(),
            CellOutcome::Cleaned => "cleaned".to_string(),
            CellOutcome::Stored { overhead: Some(x) } => format!("stored ({x:.2}x overhead)"),
            CellOutcome::Stored { overhead: None } => "stored".to_string(),
            CellOutcome::Skipped {
                reason: SkipReason::CacheHit,
            } => "skipped (cached)".to_string(),
            CellOutcome::Skipped {
                reason: SkipReason::Unconfigured,
            } => "skipped (not configured)".to_string(),
            CellOutcome::Failed { phase, .. } => format!("FAILED in {phase}"),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn matrix_start(&self, action: &Action, grid: &Grid) {
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        eprintln!("  Matrix: {}", action);
        eprintln!(
            "  Cells: {}, not configured: {}",
            grid.len(),
            grid.unconfigured().len()
        );
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    fn cell_start(&self, cell: &Cell) {
        eprint!("  {} ... ", cell);
        std::io::stderr().flush().ok();
    }

    fn cell_end(&self, report: &CellReport) {
        if matches!(
            report.outcome,
            CellOutcome::Skipped {
                reason: SkipReason::Unconfigured
            }
        ) {
            // No cell_start for these.
            eprint!("  {} ... ", report.cell);
        }
        let elapsed = Self::format_duration(Duration::from_secs_f64(report.elapsed_secs));
        eprintln!("{} [{}]", Self::format_outcome(&report.outcome), elapsed);

        if let CellOutcome::Failed { message, .. } = &report.outcome {
            for line in message.lines() {
                eprintln!("      {line}");
            }
        }
    }

    fn matrix_end(&self, report: &MatrixReport) {
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        eprintln!(
            "  Completed {} cells in {:.2}s: {} stored, {} skipped, {} failed",
            report.cells.len(),
            report.total_secs,
            report.stored(),
            report.skipped(),
            report.failed()
        );
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

/// JSON reporter that writes the sweep outcome to `<output_dir>/matrix-<action>.json`.
pub struct JsonReporter {
    output_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl Reporter for JsonReporter {
    fn matrix_end(&self, report: &MatrixReport) {
        if let Err(e) = write_json_report(&self.output_dir, report) {
            warn!("failed to write JSON matrix report: {}", e);
        }
    }
}

fn write_json_report(output_dir: &Path, report: &MatrixReport) -> std::io::Result<()> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join(format!("matrix-{}.json", report.action));
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;

    std::fs::write(&path, json)?;
    info!("Matrix report written to: {}", path.display());

    Ok(())
}

/// Combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn matrix_start(&self, action: &Action, grid: &Grid) {
        for r in &self.reporters {
            r.matrix_start(action, grid);
        }
    }

    fn cell_start(&self, cell: &Cell) {
        for r in &self.reporters {
            r.cell_start(cell);
        }
    }

    fn cell_end(&self, report: &CellReport) {
        for r in &self.reporters {
            r.cell_end(report);
        }
    }

    fn matrix_end(&self, report: &MatrixReport) {
        for r in &self.reporters {
            r.matrix_end(report);
        }
    }
}
