//! Metric extraction from instrumentation tool output.
//!
//! Tools print their results as labeled lines mixed into the benchmark's own
//! log text. A label can show up several times (warm-up iterations, retried
//! launches), so lines are scanned from the end of the stream backwards and
//! the last occurrence of each label is the one that counts.

use crate::error::{HarnessError, Result};
use crate::process::StreamKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metric name of the per-run kernel time every tool reports.
pub const KERNEL_TIME: &str = "kernel_time";
pub const INSTRUCTION_COUNT: &str = "instruction_count";
pub const LDS_INSTRUCTION_COUNT: &str = "lds_instruction_count";
pub const BANK_CONFLICT_COUNT: &str = "bank_conflict_count";

/// A numeric metric value. Integers are preferred when the text allows it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    /// Parse the text following an anchor label, e.g. `" 42."` or `"7.25"`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.strip_suffix('.').unwrap_or(text).trim();
        if let Ok(i) = text.parse::<i64>() {
            return Some(MetricValue::Int(i));
        }
        match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Some(MetricValue::Float(f)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(i) => i as f64,
            MetricValue::Float(f) => f,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(i) => write!(f, "{i}"),
            MetricValue::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

/// Metric name to value.
pub type MetricMap = BTreeMap<String, MetricValue>;

/// The instrumentation tools whose report formats are understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    NvbitInstrCount,
    LuthierInstrCount,
    LuthierLdsBankConflict,
    LuthierOpcodeHistogram,
}

/// A labeled line carrying one metric.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    metric: &'static str,
    label: &'static str,
}

const KERNEL_TIME_ANCHOR: Anchor = Anchor {
    metric: KERNEL_TIME,
    label: "Total kernel time:",
};

#[derive(Debug, Clone, Copy)]
enum Report {
    Anchored(&'static [Anchor]),
    /// `key = value` lines strictly between a start and an end marker.
    Histogram {
        start: &'static str,
        end: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
struct ToolFormat {
    stream: StreamKind,
    report: Report,
    runtime: Anchor,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::NvbitInstrCount,
        ToolKind::LuthierInstrCount,
        ToolKind::LuthierLdsBankConflict,
        ToolKind::LuthierOpcodeHistogram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::NvbitInstrCount => "nvbit-instr-count",
            ToolKind::LuthierInstrCount => "luthier-instr-count",
            ToolKind::LuthierLdsBankConflict => "luthier-lds-bank-conflict",
            ToolKind::LuthierOpcodeHistogram => "luthier-opcode-histogram",
        }
    }

    /// The stream this tool writes its report to.
    pub fn stream(self) -> StreamKind {
        self.format().stream
    }

    fn format(self) -> ToolFormat {
        match self {
            ToolKind::NvbitInstrCount => ToolFormat {
                stream: StreamKind::Stdout,
                report: Report::Anchored(&[Anchor {
                    metric: INSTRUCTION_COUNT,
                    label: "Total app instructions:",
                }]),
                runtime: KERNEL_TIME_ANCHOR,
            },
            ToolKind::LuthierInstrCount => ToolFormat {
                stream: StreamKind::Stderr,
                report: Report::Anchored(&[Anchor {
                    metric: INSTRUCTION_COUNT,
                    label: "Total number of instructions counted:",
                }]),
                runtime: KERNEL_TIME_ANCHOR,
            },
            ToolKind::LuthierLdsBankConflict => ToolFormat {
                stream: StreamKind::Stderr,
                report: Report::Anchored(&[
                    Anchor {
                        metric: LDS_INSTRUCTION_COUNT,
                        label: "Total number of LDS instructions:",
                    },
                    Anchor {
                        metric: BANK_CONFLICT_COUNT,
                        label: "Total number of bank conflicts detected:",
                    },
                ]),
                runtime: KERNEL_TIME_ANCHOR,
            },
            ToolKind::LuthierOpcodeHistogram => ToolFormat {
                stream: StreamKind::Stderr,
                report: Report::Histogram {
                    start: "Instruction Opcode Results:",
                    end: "Total number of instructions counted:",
                },
                runtime: KERNEL_TIME_ANCHOR,
            },
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        ToolKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| HarnessError::Config(format!("unknown tool kind '{s}'")))
    }
}

/// Extract every metric `kind` reports, including its kernel time.
///
/// Fails with [`HarnessError::MetricNotFound`] if any anchor is missing; a
/// partial map is never returned.
pub fn extract(kind: ToolKind, stdout: &str, stderr: &str) -> Result<MetricMap> {
    let format = kind.format();
    let text = select(format.stream, stdout, stderr);

    let mut metrics = match format.report {
        Report::Anchored(anchors) => scan_anchors(text, anchors, format.stream)?,
        Report::Histogram { start, end } => scan_histogram(text, start, end, format.stream)?,
    };
    let runtime = scan_anchors(text, &[format.runtime], format.stream)?;
    metrics.extend(runtime);
    Ok(metrics)
}

/// Extract only the kernel time, as reported by a pass-through run.
pub fn extract_runtime(kind: ToolKind, stdout: &str, stderr: &str) -> Result<MetricValue> {
    let format = kind.format();
    let text = select(format.stream, stdout, stderr);
    let mut found = scan_anchors(text, &[format.runtime], format.stream)?;
    found
        .remove(format.runtime.metric)
        .ok_or_else(|| HarnessError::MetricNotFound {
            metric: format.runtime.metric.to_string(),
            stream: format.stream,
        })
}

fn select<'a>(stream: StreamKind, stdout: &'a str, stderr: &'a str) -> &'a str {
    match stream {
        StreamKind::Stdout => stdout,
        StreamKind::Stderr => stderr,
    }
}

fn scan_anchors(text: &str, anchors: &[Anchor], stream: StreamKind) -> Result<MetricMap> {
    let mut found = MetricMap::new();

    for line in text.lines().rev() {
        if found.len() == anchors.len() {
            break;
        }
        for anchor in anchors {
            if found.contains_key(anchor.metric) {
                continue;
            }
            if let Some(pos) = line.find(anchor.label) {
                let raw = &line[pos + anchor.label.len()..];
                let value = MetricValue::parse(raw).ok_or_else(|| HarnessError::MalformedMetric {
                    metric: anchor.metric.to_string(),
                    line: line.to_string(),
                })?;
                found.insert(anchor.metric.to_string(), value);
                break;
            }
        }
    }

    if let Some(missing) = anchors.iter().find(|a| !found.contains_key(a.metric)) {
        return Err(HarnessError::MetricNotFound {
            metric: missing.metric.to_string(),
            stream,
        });
    }
    Ok(found)
}

fn scan_histogram(text: &str, start: &str, end: &str, stream: StreamKind) -> Result<MetricMap> {
    let lines: Vec<&str> = text.lines().collect();

    let end_idx = lines
        .iter()
        .rposition(|l| l.contains(end))
        .ok_or_else(|| HarnessError::MetricNotFound {
            metric: end.to_string(),
            stream,
        })?;
    // The block belongs to the last end marker, so look for its start above it.
    let start_idx = lines[..end_idx]
        .iter()
        .rposition(|l| l.contains(start))
        .ok_or_else(|| HarnessError::MetricNotFound {
            metric: start.to_string(),
            stream,
        })?;

    let mut histogram = MetricMap::new();
    for line in &lines[start_idx + 1..end_idx] {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line
            .split_once('=')
            .and_then(|(k, v)| Some((k.trim(), MetricValue::parse(v)?)))
            .filter(|(k, _)| !k.is_empty());
        let Some((opcode, count)) = parsed else {
            return Err(HarnessError::MalformedMetric {
                metric: "opcode histogram".to_string(),
                line: line.to_string(),
            });
        };
        histogram.insert(opcode.to_string(), count);
    }
    Ok(histogram)
}
