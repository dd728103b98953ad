//! Per-cell result files.
//!
//! Each record lives next to the benchmark's build artifacts in
//! `<root>/src/<benchmark>-<backend>/<kind file name>`, so cached results move
//! with the benchmark tree.

use crate::error::{HarnessError, Result};
use crate::grid::Cell;
use crate::result::{MeasurementKind, MeasurementRecord};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of the record for `(cell, kind)`.
    pub fn path(&self, cell: &Cell, kind: MeasurementKind) -> PathBuf {
        cell.dir(&self.root).join(kind.file_name())
    }

    pub fn exists(&self, cell: &Cell, kind: MeasurementKind) -> bool {
        self.path(cell, kind).is_file()
    }

    pub fn load(&self, cell: &Cell, kind: MeasurementKind) -> Result<MeasurementRecord> {
        let path = self.path(cell, kind);
        let content = std::fs::read_to_string(&path).map_err(|source| HarnessError::Store {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| HarnessError::Serialize { path, source })
    }

    /// Write `record`, replacing any previous one in full.
    ///
    /// The file is written beside the target and renamed over it, so a reader
    /// never sees a half-written record.
    pub fn save(&self, cell: &Cell, kind: MeasurementKind, record: &MeasurementRecord) -> Result<()> {
        let path = self.path(cell, kind);
        let dir = cell.dir(&self.root);
        let store_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| HarnessError::Store { path, source }
        };

        std::fs::create_dir_all(&dir).map_err(store_err(&dir))?;

        let json = serde_json::to_string_pretty(record).map_err(|source| HarnessError::Serialize {
            path: path.clone(),
            source,
        })?;
        let tmp = dir.join(format!(".{}.tmp", kind.file_name()));
        std::fs::write(&tmp, json).map_err(store_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(store_err(&path))?;

        debug!("Results written to: {}", path.display());
        Ok(())
    }

    /// Every stored record for `cells`, in order. Cells without a record are skipped.
    pub fn load_all(&self, cells: &[Cell], kind: MeasurementKind) -> Result<Vec<MeasurementRecord>> {
        cells
            .iter()
            .filter(|cell| self.exists(cell, kind))
            .map(|cell| self.load(cell, kind))
            .collect()
    }
}
