//! Groups in-window samples into ranked hot entries.

use serde::{Deserialize, Serialize};
use tracing::debug;

use std::collections::HashMap;

use crate::{
    HotEntry, MeasurementWindow, ProfError, ProfResult, ProfilerReport, ResolvedSymbol, Sample,
    SymbolTable, TableKind,
};

/// Label used for samples that could not be attributed.
pub const UNKNOWN_LABEL: &str = "[unknown]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// One entry per sampled instruction address.
    Instruction,
    /// One entry per enclosing symbol.
    Normalized,
}

impl ProfileMode {
    pub fn all() -> [Self; 2] {
        [Self::Instruction, Self::Normalized]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Normalized => "normalized",
        }
    }

    pub fn parse(value: &str) -> ProfResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "instruction" | "asm" => Ok(Self::Instruction),
            "normalized" | "norm" => Ok(Self::Normalized),
            other => Err(ProfError::InvalidConfig(format!(
                "unknown profile mode {other:?} (expected instruction or normalized)"
            ))),
        }
    }
}

impl std::fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Variant order matters: the unknown bucket sorts after keyed entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum GroupKey {
    Address(u64),
    Symbol(String),
    Unknown,
}

#[derive(Debug, Default)]
struct Bucket {
    count: u64,
    symbol: Option<ResolvedSymbol>,
}

/// Sample-derived totals that feed counter normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleTotals {
    pub weight: u64,
    pub pmc: Vec<u64>,
    pub first_ns: Option<u64>,
    pub last_ns: Option<u64>,
}

impl SampleTotals {
    /// Time between the earliest and latest in-window sample.
    pub fn span_ns(&self) -> u64 {
        match (self.first_ns, self.last_ns) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }
}

/// Single pass over `samples`: filter to `window`, resolve leaf frames, count per group.
pub fn aggregate<I>(
    samples: I,
    window: &MeasurementWindow,
    table: TableKind,
    symbols: &mut SymbolTable<'_>,
    mode: ProfileMode,
) -> ProfResult<ProfilerReport>
where
    I: IntoIterator<Item = ProfResult<Sample>>,
{
    let mut buckets: HashMap<GroupKey, Bucket> = HashMap::new();
    let mut in_window = 0u64;
    let mut out_of_window = 0u64;
    let mut totals = SampleTotals::default();

    for sample in samples {
        let sample = sample?;
        if !window.contains(sample.time_ns) {
            out_of_window += 1;
            continue;
        }
        in_window += 1;
        let t = sample.time_ns;
        totals.first_ns = Some(totals.first_ns.map_or(t, |first| first.min(t)));
        totals.last_ns = Some(totals.last_ns.map_or(t, |last| last.max(t)));
        totals.weight = totals.weight.saturating_add(sample.weight);
        if totals.pmc.len() < sample.pmc.len() {
            totals.pmc.resize(sample.pmc.len(), 0);
        }
        for (total, value) in totals.pmc.iter_mut().zip(&sample.pmc) {
            *total = total.saturating_add(*value);
        }

        let resolved = match sample.leaf() {
            Some(frame) => symbols.resolve(frame).map(|s| (frame.address, s)),
            None => None,
        };
        let (key, symbol) = match (resolved, mode) {
            (None, _) => (GroupKey::Unknown, None),
            (Some((address, symbol)), ProfileMode::Instruction) => {
                (GroupKey::Address(address), Some(symbol))
            }
            (Some((_, symbol)), ProfileMode::Normalized) => {
                (GroupKey::Symbol(symbol.name.clone()), Some(symbol))
            }
        };
        let bucket = buckets.entry(key).or_default();
        bucket.count += 1;
        if bucket.symbol.is_none() {
            bucket.symbol = symbol.cloned();
        }
    }

    let mut ranked: Vec<(GroupKey, Bucket)> = buckets.into_iter().collect();
    ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));

    let entries = ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (key, bucket))| hot_entry(idx + 1, key, bucket, in_window))
        .collect::<Vec<_>>();

    debug!(
        mode = mode.as_str(),
        in_window,
        out_of_window,
        entries = entries.len(),
        resolved = symbols.cached(),
        "aggregated samples"
    );

    Ok(ProfilerReport {
        mode,
        table,
        window: *window,
        in_window,
        out_of_window,
        entries,
        totals,
        counters: Vec::new(),
    })
}

fn hot_entry(rank: usize, key: GroupKey, bucket: Bucket, total: u64) -> HotEntry {
    let percentage = if total == 0 {
        0.0
    } else {
        bucket.count as f64 * 100.0 / total as f64
    };
    let address = match &key {
        GroupKey::Address(address) => Some(*address),
        _ => None,
    };
    let symbol = bucket.symbol;
    let label = match (&key, &symbol) {
        (GroupKey::Unknown, _) | (_, None) => UNKNOWN_LABEL.to_string(),
        (GroupKey::Address(address), Some(symbol)) => instruction_label(*address, symbol),
        (GroupKey::Symbol(name), Some(_)) => name.clone(),
    };
    HotEntry {
        rank,
        label,
        symbol: symbol.as_ref().map(|s| s.name.clone()),
        address,
        instruction: symbol.as_ref().and_then(|s| s.instruction.clone()),
        source: symbol.as_ref().and_then(|s| s.source.clone()),
        binary: symbol.and_then(|s| s.binary),
        count: bucket.count,
        percentage,
    }
}

fn instruction_label(address: u64, symbol: &ResolvedSymbol) -> String {
    let mut label = format!("0x{address:x}");
    if let Some(text) = &symbol.instruction {
        label.push(' ');
        label.push_str(text);
    }
    label.push_str(&format!(" ({}", symbol.name));
    if let Some(source) = &symbol.source {
        label.push_str(&format!(" @ {source}"));
    }
    label.push(')');
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Frame, InstructionLine, RecordedSymbols, StaticSymbols, SymbolRange};

    fn sample(time_ns: u64, address: u64, name: Option<&str>) -> ProfResult<Sample> {
        Ok(Sample {
            time_ns,
            thread: Some(1),
            weight: 1,
            frames: vec![Frame {
                address,
                name: name.map(str::to_string),
                binary: None,
            }],
            pmc: Vec::new(),
        })
    }

    fn window(start_ns: u64, end_ns: u64) -> MeasurementWindow {
        MeasurementWindow { start_ns, end_ns }
    }

    #[test]
    fn four_symbols_split_evenly() {
        let names = ["alpha", "beta", "gamma", "delta"];
        let samples = (0..100u64)
            .map(|i| sample(i, 0x1000 + (i % 4) * 0x100, Some(names[(i % 4) as usize])))
            .collect::<Vec<_>>();
        let mut table = SymbolTable::new(&RecordedSymbols);
        let report = aggregate(
            samples,
            &window(0, 100),
            TableKind::TimeProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect("aggregate");
        assert_eq!(report.in_window, 100);
        assert_eq!(report.entries.len(), 4);
        let labels = report.entries.iter().map(|e| e.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["alpha", "beta", "delta", "gamma"]);
        for (idx, entry) in report.entries.iter().enumerate() {
            assert_eq!(entry.rank, idx + 1);
            assert_eq!(entry.count, 25);
            assert_eq!(entry.percentage, 25.0);
        }
    }

    #[test]
    fn window_filter_and_unknown_bucket() {
        let samples = vec![
            sample(5, 0x10, Some("before")),
            sample(10, 0x20, Some("inside")),
            sample(11, 0x20, Some("inside")),
            sample(12, 0x30, None),
            sample(13, 0x40, Some("0x40")),
            Ok(Sample {
                time_ns: 14,
                ..Sample::default()
            }),
            sample(15, 0x50, Some("lonely")),
            sample(20, 0x20, Some("after")),
        ];
        let mut table = SymbolTable::new(&RecordedSymbols);
        let report = aggregate(
            samples,
            &window(10, 20),
            TableKind::TimeProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect("aggregate");
        assert_eq!(report.in_window, 6);
        assert_eq!(report.out_of_window, 2);
        let total: u64 = report.entries.iter().map(|e| e.count).sum();
        assert_eq!(total, report.in_window);
        assert_eq!(report.entries[0].label, UNKNOWN_LABEL);
        assert_eq!(report.entries[0].count, 3);
        assert_eq!(report.entries[1].label, "inside");
        assert_eq!(report.entries[2].label, "lonely");
        assert!(report.entries.iter().all(|e| e.label != "before" && e.label != "after"));
    }

    #[test]
    fn unknown_sorts_after_equal_counts() {
        let samples = vec![sample(1, 0x30, None), sample(2, 0x10, Some("zeta"))];
        let mut table = SymbolTable::new(&RecordedSymbols);
        let report = aggregate(
            samples,
            &window(0, 10),
            TableKind::CpuProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect("aggregate");
        assert_eq!(report.entries[0].label, "zeta");
        assert_eq!(report.entries[1].label, UNKNOWN_LABEL);
    }

    #[test]
    fn instruction_mode_groups_by_address() {
        let symbols = StaticSymbols::new(vec![SymbolRange {
            start: 0x1000,
            end: 0x1100,
            name: "checksum".to_string(),
            source: Some("checksum.rs".to_string()),
            binary: None,
            instructions: vec![
                InstructionLine {
                    address: 0x1004,
                    text: "eor w0, w0, w1".to_string(),
                    source: Some("checksum.rs:7".to_string()),
                },
                InstructionLine {
                    address: 0x1008,
                    text: "add x2, x2, #1".to_string(),
                    source: None,
                },
            ],
        }])
        .expect("symbols");
        let samples = || {
            [0x1008, 0x1004, 0x1008, 0x1004, 0x1004]
                .into_iter()
                .enumerate()
                .map(|(i, address)| sample(i as u64 + 1, address, None))
        };
        let mut table = SymbolTable::new(&symbols);
        let report = aggregate(
            samples(),
            &window(0, 10),
            TableKind::CpuProfile,
            &mut table,
            ProfileMode::Instruction,
        )
        .expect("instruction");
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].address, Some(0x1004));
        assert_eq!(report.entries[0].count, 3);
        assert_eq!(report.entries[0].label, "0x1004 eor w0, w0, w1 (checksum @ checksum.rs:7)");
        assert_eq!(report.entries[1].label, "0x1008 add x2, x2, #1 (checksum @ checksum.rs)");

        let mut table = SymbolTable::new(&symbols);
        let normalized = aggregate(
            samples(),
            &window(0, 10),
            TableKind::CpuProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect("normalized");
        assert_eq!(normalized.entries.len(), 1);
        assert_eq!(normalized.entries[0].count, 5);
        assert_eq!(normalized.entries[0].percentage, 100.0);
    }

    #[test]
    fn empty_window_yields_empty_report() {
        let samples = vec![sample(1, 0x10, Some("a")), sample(2, 0x10, Some("a"))];
        let mut table = SymbolTable::new(&RecordedSymbols);
        let report = aggregate(
            samples,
            &MeasurementWindow::empty(),
            TableKind::TimeProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect("aggregate");
        assert!(report.entries.is_empty());
        assert_eq!(report.in_window, 0);
        assert_eq!(report.out_of_window, 2);
    }

    #[test]
    fn propagates_stream_errors() {
        let samples = vec![
            sample(1, 0x10, Some("a")),
            Err(ProfError::TraceCorrupt("truncated".to_string())),
        ];
        let mut table = SymbolTable::new(&RecordedSymbols);
        let err = aggregate(
            samples,
            &window(0, 10),
            TableKind::TimeProfile,
            &mut table,
            ProfileMode::Normalized,
        )
        .expect_err("corrupt");
        assert!(matches!(err, ProfError::TraceCorrupt(_)));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(ProfileMode::parse("ASM").expect("asm"), ProfileMode::Instruction);
        assert_eq!(ProfileMode::parse("norm").expect("norm"), ProfileMode::Normalized);
        assert!(ProfileMode::parse("flame").is_err());
    }
}
