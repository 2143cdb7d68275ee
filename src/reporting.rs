//! Report types returned to the harness and their text rendering.

use serde::Serialize;

use std::fmt::Write as _;
use std::time::Duration;

use crate::{
    FailureKind, MeasurementWindow, ProfError, ProfileMode, SampleTotals, TableDesc, TableKind,
    Trigger,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotEntry {
    pub rank: usize,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    pub count: u64,
    pub percentage: f64,
}

/// A hardware counter total scaled to events per benchmark operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedCounter {
    pub event: String,
    pub total: u64,
    pub per_op: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerReport {
    pub mode: ProfileMode,
    pub table: TableKind,
    pub window: MeasurementWindow,
    pub in_window: u64,
    pub out_of_window: u64,
    pub entries: Vec<HotEntry>,
    pub totals: SampleTotals,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<NormalizedCounter>,
}

impl ProfilerReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scales PMC totals by `total / span_ms / (operations / measured_ms)`.
    ///
    /// Leaves `counters` empty when the table has no counters, no operation count is known,
    /// or either duration is zero.
    pub fn normalize_counters(
        &mut self,
        desc: &TableDesc,
        operations: Option<u64>,
        measured: Duration,
    ) {
        self.counters.clear();
        let Some(operations) = operations.filter(|ops| *ops > 0) else {
            return;
        };
        let measured_ms = measured.as_nanos() as f64 / 1e6;
        let span_ms = self.totals.span_ns() as f64 / 1e6;
        if measured_ms <= 0.0 || span_ms <= 0.0 {
            return;
        }
        let throughput = operations as f64 / measured_ms;

        let mut totals = desc
            .counters
            .iter()
            .enumerate()
            .map(|(idx, event)| {
                (
                    event.clone(),
                    self.totals.pmc.get(idx).copied().unwrap_or(0),
                )
            })
            .collect::<Vec<_>>();
        if let Trigger::Pmi { event, .. } = &desc.trigger {
            totals.push((event.clone(), self.totals.weight));
        }
        self.counters = totals
            .into_iter()
            .map(|(event, total)| NormalizedCounter {
                event,
                total,
                per_op: total as f64 / span_ms / throughput,
            })
            .collect();
    }

    pub fn render(&self, top: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} hot paths ({})", self.mode, self.table);
        if self.entries.is_empty() {
            out.push_str("  no samples in the measurement window\n");
        }
        for entry in self.entries.iter().take(top) {
            let _ = writeln!(
                out,
                "{:>4} {:>6.2}% {} {}",
                entry.rank, entry.percentage, entry.label, entry.count
            );
        }
        if self.entries.len() > top {
            let hidden = &self.entries[top..];
            let count: u64 = hidden.iter().map(|e| e.count).sum();
            let _ = writeln!(out, "     ... {} more entries, {count} samples", hidden.len());
        }
        for counter in &self.counters {
            let _ = writeln!(
                out,
                "  {} {:.3} #/op (total {})",
                counter.event, counter.per_op, counter.total
            );
        }
        let _ = write!(
            out,
            "in window: {} samples, out of window: {} samples, window: [{}, {}) ns",
            self.in_window, self.out_of_window, self.window.start_ns, self.window.end_ns
        );
        out
    }
}

/// Result of profiling one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IterationOutcome {
    Report(ProfilerReport),
    Failed { kind: FailureKind, message: String },
    Disabled { reason: String },
}

impl IterationOutcome {
    pub fn failed(err: &ProfError) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn report(&self) -> Option<&ProfilerReport> {
        match self {
            Self::Report(report) => Some(report),
            _ => None,
        }
    }

    pub fn render(&self, top: usize) -> String {
        match self {
            Self::Report(report) => report.render(top),
            Self::Failed { kind, message } => {
                format!("profiler failed ({}): {message}", kind.as_str())
            }
            Self::Disabled { reason } => format!("profiler disabled: {reason}"),
        }
    }
}
