//! # benchgrid
//!
//! A harness for sweeping a grid of (benchmark, backend) cells through build,
//! clean and instrumented-measurement actions.
//!
//! Each measured cell runs twice under the same preloaded instrumentation
//! tool: once instrumented and once with the tool's pass-through toggle. The
//! structural metrics come from the instrumented run's logs; the pair of
//! kernel times gives the instrumentation overhead. Records are cached per
//! cell so an interrupted sweep can be resumed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use benchgrid::{Action, Grid, GridConfig, HarnessConfig, MatrixRunner, MeasurementKind, ProcessRunner};
//!
//! let config = HarnessConfig::from_env();
//! let grid_config = GridConfig::load(&config.config_path)?;
//! let grid = Grid::for_suite(&grid_config, MeasurementKind::InstrCount)?;
//!
//! let launcher = ProcessRunner::new().with_timeout(config.timeout);
//! let runner = MatrixRunner::new(&config, &grid_config, &launcher);
//! let report = runner.run_matrix(Action::Measure(MeasurementKind::InstrCount), &grid)?;
//! println!("{} stored, {} failed", report.stored(), report.failed());
//! # Ok::<(), benchgrid::HarnessError>(())
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod grid;
pub mod logging;
pub mod matrix;
pub mod measure;
pub mod process;
pub mod report;
pub mod result;
pub mod store;
pub mod summary;

pub use config::{GridConfig, HarnessConfig, ToolProfile};
pub use error::{HarnessError, Result};
pub use extract::{extract, MetricMap, MetricValue, ToolKind};
pub use grid::{Cell, Grid};
pub use matrix::{Action, CellOutcome, CellReport, MatrixReport, MatrixRunner, SkipReason};
pub use measure::{DifferentialMeasurer, MeasureFailure, Phase};
pub use process::{CaptureResult, Command, Launcher, ProcessRunner, StreamKind};
pub use report::{ConsoleReporter, JsonReporter, MultiReporter, Reporter};
pub use result::{MeasurementKind, MeasurementRecord};
pub use store::ResultStore;
