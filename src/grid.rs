//! Grid cells and the ordered grids the matrix runner walks.

use crate::config::GridConfig;
use crate::error::Result;
use crate::result::MeasurementKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One (benchmark, backend) point of the grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub benchmark: String,
    pub backend: String,
}

impl Cell {
    pub fn new(benchmark: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            backend: backend.into(),
        }
    }

    /// `<root>/src/<benchmark>-<backend>`: build directory, run directory and result location.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join("src").join(self.to_string())
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.benchmark, self.backend)
    }
}

/// Position of a requested pairing in one of the two lists.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Configured(usize),
    Unconfigured(usize),
}

/// An ordered sequence of cells, plus the requested pairings that are not configured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    cells: Vec<Cell>,
    unconfigured: Vec<Cell>,
    order: Vec<Slot>,
}

impl Grid {
    pub fn from_cells(cells: Vec<Cell>) -> Self {
        let order = (0..cells.len()).map(Slot::Configured).collect();
        Self {
            cells,
            unconfigured: Vec::new(),
            order,
        }
    }

    /// Every configured cell, benchmark by benchmark.
    pub fn all(config: &GridConfig) -> Self {
        let cells = config
            .benchmarks
            .iter()
            .flat_map(|(bench, spec)| spec.backends.keys().map(move |b| Cell::new(bench, b)))
            .collect();
        Self::from_cells(cells)
    }

    /// The suite's benchmarks crossed with its backends, in declaration order.
    ///
    /// Pairings the benchmark does not declare are set aside instead of failing.
    pub fn for_suite(config: &GridConfig, kind: MeasurementKind) -> Result<Self> {
        let suite = config.suite(kind)?;
        let mut grid = Self::default();

        for bench in &suite.benchmarks {
            for backend in &suite.backends {
                let cell = Cell::new(bench, backend);
                if config.backend(&cell).is_some() {
                    grid.order.push(Slot::Configured(grid.cells.len()));
                    grid.cells.push(cell);
                } else {
                    grid.order.push(Slot::Unconfigured(grid.unconfigured.len()));
                    grid.unconfigured.push(cell);
                }
            }
        }
        Ok(grid)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn unconfigured(&self) -> &[Cell] {
        &self.unconfigured
    }

    /// Every requested pairing in request order, flagged `true` when configured.
    pub fn sweep(&self) -> impl Iterator<Item = (&Cell, bool)> + '_ {
        self.order.iter().map(|slot| match *slot {
            Slot::Configured(i) => (&self.cells[i], true),
            Slot::Unconfigured(i) => (&self.unconfigured[i], false),
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = r#"
benchmarks:
  adam:
    backends:
      hip: { run_command: ["./main"] }
      omp: { run_command: ["./main"] }
  zoom:
    backends:
      hip: { run_command: ["./main"] }
suites:
  opcode-histogram:
    benchmarks: [zoom, adam]
    backends: [omp, hip]
    default_tool: luthier-opcode-histogram
"#;

    #[test]
    fn should_format_cell_directory() {
        let cell = Cell::new("b+tree", "sycl");
        assert_eq!(cell.to_string(), "b+tree-sycl");
        assert_eq!(
            cell.dir(Path::new("/hec")),
            PathBuf::from("/hec/src/b+tree-sycl")
        );
    }

    #[test]
    fn should_keep_suite_order_and_set_aside_unconfigured_pairs() {
        let config = GridConfig::from_yaml(GRID).unwrap();
        let grid = Grid::for_suite(&config, MeasurementKind::OpcodeHistogram).unwrap();

        assert_eq!(
            grid.cells(),
            &[
                Cell::new("zoom", "hip"),
                Cell::new("adam", "omp"),
                Cell::new("adam", "hip"),
            ]
        );
        assert_eq!(grid.unconfigured(), &[Cell::new("zoom", "omp")]);
    }

    #[test]
    fn should_sweep_unconfigured_pairs_in_request_order() {
        let config = GridConfig::from_yaml(GRID).unwrap();
        let grid = Grid::for_suite(&config, MeasurementKind::OpcodeHistogram).unwrap();

        let sweep: Vec<(String, bool)> = grid
            .sweep()
            .map(|(cell, configured)| (cell.to_string(), configured))
            .collect();
        assert_eq!(
            sweep,
            vec![
                ("zoom-omp".to_string(), false),
                ("zoom-hip".to_string(), true),
                ("adam-omp".to_string(), true),
                ("adam-hip".to_string(), true),
            ]
        );
    }

    #[test]
    fn should_list_all_configured_cells() {
        let config = GridConfig::from_yaml(GRID).unwrap();
        let grid = Grid::all(&config);
        assert_eq!(grid.len(), 3);
        assert!(grid.unconfigured().is_empty());
    }

    #[test]
    fn should_fail_for_missing_suite() {
        let config = GridConfig::from_yaml(GRID).unwrap();
        assert!(Grid::for_suite(&config, MeasurementKind::InstrCount).is_err());
    }
}
