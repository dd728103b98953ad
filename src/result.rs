//! Measurement result types.

use crate::error::HarnessError;
use crate::extract::{MetricMap, MetricValue, ToolKind};
use crate::grid::Cell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The measurement suites a cell can be swept under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementKind {
    InstrCount,
    LdsBankConflict,
    OpcodeHistogram,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 3] = [
        MeasurementKind::InstrCount,
        MeasurementKind::LdsBankConflict,
        MeasurementKind::OpcodeHistogram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::InstrCount => "instr-count",
            MeasurementKind::LdsBankConflict => "lds-bank-conflict",
            MeasurementKind::OpcodeHistogram => "opcode-histogram",
        }
    }

    /// Fixed name of the result file inside a cell directory.
    pub fn file_name(self) -> &'static str {
        match self {
            MeasurementKind::InstrCount => "instrcount-results.json",
            MeasurementKind::LdsBankConflict => "lds-bank-conflict-results.json",
            MeasurementKind::OpcodeHistogram => "opcode-histogram-results.json",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeasurementKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| HarnessError::Config(format!("unknown measurement suite '{s}'")))
    }
}

/// Result of one differential measurement of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub cell: Cell,
    pub kind: MeasurementKind,
    pub tool: ToolKind,
    /// Structural metrics from the instrumented pass (counts or opcode histogram).
    pub metrics: MetricMap,
    /// Kernel time reported by the instrumented pass.
    pub instrumented_runtime: MetricValue,
    /// Kernel time reported by the pass-through pass.
    pub baseline_runtime: MetricValue,
    /// Wall-clock duration of the instrumented process.
    #[serde(rename = "instrumented_wall_ns", with = "duration_serde")]
    pub instrumented_wall: Duration,
    /// Wall-clock duration of the baseline process.
    #[serde(rename = "baseline_wall_ns", with = "duration_serde")]
    pub baseline_wall: Duration,
    /// Unix timestamp in milliseconds.
    pub recorded_at: String,
}

impl MeasurementRecord {
    /// Flatten into named fields: both runtimes plus every structural metric.
    pub fn fields(&self) -> MetricMap {
        let mut fields = self.metrics.clone();
        fields.insert("instrumented_runtime".to_string(), self.instrumented_runtime);
        fields.insert("baseline_runtime".to_string(), self.baseline_runtime);
        fields
    }

    /// Instrumented over baseline kernel time.
    ///
    /// - `> 1.0` means instrumentation slowed the kernels down
    /// - `None` if the baseline time is zero
    pub fn overhead(&self) -> Option<f64> {
        let baseline = self.baseline_runtime.as_f64();
        if baseline == 0.0 {
            return None;
        }
        Some(self.instrumented_runtime.as_f64() / baseline)
    }

    /// Same ratio over process wall time, including tool load and teardown.
    pub fn wall_overhead(&self) -> Option<f64> {
        let baseline = self.baseline_wall.as_secs_f64();
        if baseline == 0.0 {
            return None;
        }
        Some(self.instrumented_wall.as_secs_f64() / baseline)
    }
}

/// Unix timestamp in milliseconds, used for `recorded_at`.
pub(crate) fn unix_millis() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_millis())
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_nanos().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}
