//! Text summaries over stored measurement records.
//!
//! Everything here is pure: records in, formatted text out. Groups keep the
//! order in which their first record appears.

use crate::extract::{MetricValue, BANK_CONFLICT_COUNT, INSTRUCTION_COUNT, LDS_INSTRUCTION_COUNT};
use crate::result::{MeasurementKind, MeasurementRecord};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Default number of opcodes listed per backend.
pub const DEFAULT_TOP_N: usize = 5;

/// `log10(value)` for positive values.
pub fn order_of_magnitude(value: f64) -> Option<f64> {
    (value > 0.0).then(|| value.log10())
}

fn with_magnitude(value: &MetricValue) -> String {
    match order_of_magnitude(value.as_f64()) {
        Some(exp) => format!("{value} (~= 10^{exp:.2})"),
        None => value.to_string(),
    }
}

/// Stable grouping by key, preserving first-seen order.
fn group_by<'a, K: PartialEq>(
    records: &'a [MeasurementRecord],
    key: impl Fn(&MeasurementRecord) -> K,
) -> Vec<(K, Vec<&'a MeasurementRecord>)> {
    let mut groups: Vec<(K, Vec<&MeasurementRecord>)> = Vec::new();
    for record in records {
        let k = key(record);
        match groups.iter_mut().find(|(g, _)| *g == k) {
            Some((_, members)) => members.push(record),
            None => groups.push((k, vec![record])),
        }
    }
    groups
}

/// Instruction counts per benchmark and backend.
pub fn instr_count_summary(records: &[MeasurementRecord]) -> String {
    let mut out = String::from("Instruction Counts:\n");
    for (benchmark, members) in group_by(records, |r| r.cell.benchmark.clone()) {
        let _ = writeln!(out, "- {benchmark}:");
        for record in members {
            let count = match record.metrics.get(INSTRUCTION_COUNT) {
                Some(v) => with_magnitude(v),
                None => "n/a".to_string(),
            };
            let _ = writeln!(out, "\t-{}: {count}", record.cell.backend);
        }
    }
    out
}

/// LDS instruction and bank-conflict counts per cell.
pub fn lds_summary(records: &[MeasurementRecord]) -> String {
    let mut out = String::from("LDS Access Stats:\n");
    for record in records {
        let _ = writeln!(
            out,
            "- {}, {}:",
            record.cell.benchmark, record.cell.backend
        );
        for stat in [LDS_INSTRUCTION_COUNT, BANK_CONFLICT_COUNT] {
            if let Some(value) = record.metrics.get(stat) {
                let _ = writeln!(out, "\t-{stat}: {}", with_magnitude(value));
            }
        }
    }
    out
}

/// Summed opcode histogram per backend, sorted by count then name.
///
/// Counts are widened to `i128` so sums of many large per-cell counts
/// cannot overflow.
pub fn opcode_totals(records: &[&MeasurementRecord]) -> Vec<(String, i128)> {
    let mut totals: BTreeMap<&str, i128> = BTreeMap::new();
    for record in records {
        for (opcode, value) in &record.metrics {
            let count = match value {
                MetricValue::Int(i) => i128::from(*i),
                MetricValue::Float(f) => *f as i128,
            };
            let total = totals.entry(opcode.as_str()).or_default();
            *total = total.saturating_add(count);
        }
    }
    let mut sorted: Vec<(String, i128)> = totals
        .into_iter()
        .map(|(op, count)| (op.to_string(), count))
        .collect();
    // BTreeMap order breaks ties by name; the sort is stable.
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted
}

/// The `top_n` most executed opcodes per backend, as a share of all instructions.
pub fn opcode_summary(records: &[MeasurementRecord], top_n: usize) -> String {
    let mut out = format!("Top {top_n} instructions executed in:\n");
    for (backend, members) in group_by(records, |r| r.cell.backend.clone()) {
        let _ = writeln!(out, "- {backend}:");
        let totals = opcode_totals(&members);
        let total = totals
            .iter()
            .fold(0i128, |acc, (_, c)| acc.saturating_add(*c));
        if total == 0 {
            let _ = writeln!(out, "\t(no instructions counted)");
            continue;
        }
        for (opcode, count) in totals.iter().take(top_n) {
            let share = *count as f64 / total as f64 * 100.0;
            let _ = writeln!(out, "\t{opcode} : {share:.2}%");
        }
    }
    out
}

/// Instrumented over baseline runtime per cell.
pub fn overhead_summary(records: &[MeasurementRecord]) -> String {
    let mut out = String::from("Instrumentation Overhead:\n");
    for record in records {
        let kernel = match record.overhead() {
            Some(x) => format!("{x:.2}x"),
            None => "n/a".to_string(),
        };
        let wall = match record.wall_overhead() {
            Some(x) => format!("{x:.2}x"),
            None => "n/a".to_string(),
        };
        let _ = writeln!(
            out,
            "- {}: {kernel} (kernel {} vs {}), wall {wall}",
            record.cell, record.instrumented_runtime, record.baseline_runtime
        );
    }
    out
}

/// The summary matching `kind`, followed by the overhead table.
pub fn summarize(kind: MeasurementKind, records: &[MeasurementRecord], top_n: usize) -> String {
    let body = match kind {
        MeasurementKind::InstrCount => instr_count_summary(records),
        MeasurementKind::LdsBankConflict => lds_summary(records),
        MeasurementKind::OpcodeHistogram => opcode_summary(records, top_n),
    };
    format!("{body}\n{}", overhead_summary(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{MetricMap, ToolKind};
    use crate::grid::Cell;
    use crate::result::tests::sample_record;

    fn record(bench: &str, backend: &str, metrics: &[(&str, MetricValue)]) -> MeasurementRecord {
        let mut r = sample_record(Cell::new(bench, backend));
        r.metrics = metrics
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<MetricMap>();
        r
    }

    #[test]
    fn should_show_log10_for_positive_values_only() {
        assert!((order_of_magnitude(1000.0).unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(order_of_magnitude(0.0), None);
        assert_eq!(with_magnitude(&MetricValue::Int(100)), "100 (~= 10^2.00)");
        assert_eq!(with_magnitude(&MetricValue::Int(0)), "0");
    }

    #[test]
    fn should_group_instruction_counts_by_benchmark() {
        let records = vec![
            record("nn", "cuda", &[(INSTRUCTION_COUNT, MetricValue::Int(1000))]),
            record("adam", "hip", &[(INSTRUCTION_COUNT, MetricValue::Int(10))]),
            record("nn", "hip", &[(INSTRUCTION_COUNT, MetricValue::Int(100))]),
        ];
        let text = instr_count_summary(&records);
        assert_eq!(
            text,
            "Instruction Counts:\n\
             - nn:\n\
             \t-cuda: 1000 (~= 10^3.00)\n\
             \t-hip: 100 (~= 10^2.00)\n\
             - adam:\n\
             \t-hip: 10 (~= 10^1.00)\n"
        );
    }

    #[test]
    fn should_omit_log10_for_zero_bank_conflicts() {
        let records = vec![record(
            "ace",
            "hip",
            &[
                (LDS_INSTRUCTION_COUNT, MetricValue::Int(10)),
                (BANK_CONFLICT_COUNT, MetricValue::Int(0)),
            ],
        )];
        let text = lds_summary(&records);
        assert!(text.contains("\t-lds_instruction_count: 10 (~= 10^1.00)\n"));
        assert!(text.contains("\t-bank_conflict_count: 0\n"));
    }

    #[test]
    fn should_rank_top_opcodes_by_share_of_backend_total() {
        let mut a = record(
            "nn",
            "hip",
            &[
                ("v_add_f32", MetricValue::Int(50)),
                ("s_load", MetricValue::Int(20)),
                ("v_mul_f32", MetricValue::Int(10)),
            ],
        );
        a.tool = ToolKind::LuthierOpcodeHistogram;
        let b = record(
            "adam",
            "hip",
            &[
                ("s_load", MetricValue::Int(10)),
                ("ds_read", MetricValue::Int(10)),
            ],
        );

        let text = opcode_summary(&[a, b], 2);
        assert_eq!(
            text,
            "Top 2 instructions executed in:\n\
             - hip:\n\
             \tv_add_f32 : 50.00%\n\
             \ts_load : 30.00%\n"
        );
    }

    #[test]
    fn should_break_opcode_ties_by_name() {
        let r = record(
            "nn",
            "hip",
            &[("b", MetricValue::Int(5)), ("a", MetricValue::Int(5))],
        );
        let totals = opcode_totals(&[&r]);
        assert_eq!(totals[0].0, "a");
        assert_eq!(totals[1].0, "b");
    }

    #[test]
    fn should_total_counts_near_i64_max_without_overflow() {
        let a = record(
            "adam",
            "hip",
            &[
                ("v_add", MetricValue::Int(i64::MAX)),
                ("s_mov", MetricValue::Int(i64::MAX)),
            ],
        );
        let b = record("nn", "hip", &[("v_add", MetricValue::Int(i64::MAX))]);

        let totals = opcode_totals(&[&a, &b]);
        assert_eq!(totals[0], ("v_add".to_string(), 2 * i128::from(i64::MAX)));
        assert_eq!(totals[1], ("s_mov".to_string(), i128::from(i64::MAX)));

        let text = opcode_summary(&[a, b], DEFAULT_TOP_N);
        assert!(text.contains("\tv_add : 66.67%"));
        assert!(text.contains("\ts_mov : 33.33%"));
    }

    #[test]
    fn should_report_overhead_per_cell() {
        let mut zero = sample_record(Cell::new("nn", "hip"));
        zero.baseline_runtime = MetricValue::Int(0);
        let text = overhead_summary(&[sample_record(Cell::new("nn", "cuda")), zero]);
        assert!(text.contains("- nn-cuda: 2.50x (kernel 12.5 vs 5), wall 3.00x"));
        assert!(text.contains("- nn-hip: n/a"));
    }

    #[test]
    fn should_note_empty_histograms() {
        let text = opcode_summary(&[record("nn", "sycl", &[])], DEFAULT_TOP_N);
        assert!(text.contains("(no instructions counted)"));
    }
}
