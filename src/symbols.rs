//! Address to symbol resolution.

use serde::{Deserialize, Deserializer, Serialize};

use std::collections::HashMap;
use std::path::Path;

use crate::{Frame, ProfError, ProfResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSymbol {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

pub trait SymbolResolver: Send + Sync {
    /// `frame` is the sampled frame the address came from; resolvers may use what the
    /// recorder already attached to it.
    fn resolve(&self, address: u64, frame: &Frame) -> Option<ResolvedSymbol>;
}

/// Uses the symbol names the recorder wrote into the trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedSymbols;

impl SymbolResolver for RecordedSymbols {
    fn resolve(&self, _address: u64, frame: &Frame) -> Option<ResolvedSymbol> {
        let name = frame.name.as_deref()?.trim();
        // Unsymbolicated frames are named after their own address.
        if name.is_empty() || is_hex_address(name) {
            return None;
        }
        Some(ResolvedSymbol {
            name: name.to_string(),
            source: None,
            instruction: None,
            binary: frame.binary.clone(),
        })
    }
}

fn is_hex_address(name: &str) -> bool {
    name.strip_prefix("0x")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SymbolRange {
    #[serde(deserialize_with = "de_address")]
    pub start: u64,
    /// Exclusive.
    #[serde(deserialize_with = "de_address")]
    pub end: u64,
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub instructions: Vec<InstructionLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstructionLine {
    #[serde(deserialize_with = "de_address")]
    pub address: u64,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SymbolFile {
    symbols: Vec<SymbolRange>,
}

/// Fixed address ranges, e.g. from a symbol dump or a test.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols {
    ranges: Vec<SymbolRange>,
}

impl StaticSymbols {
    pub fn new(mut ranges: Vec<SymbolRange>) -> ProfResult<Self> {
        ranges.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.end.cmp(&b.end)));
        for range in &ranges {
            if range.start >= range.end {
                return Err(ProfError::InvalidConfig(format!(
                    "symbol {} has empty range 0x{:x}..0x{:x}",
                    range.name, range.start, range.end
                )));
            }
        }
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(ProfError::InvalidConfig(format!(
                    "symbols {} and {} overlap",
                    pair[0].name, pair[1].name
                )));
            }
        }
        for range in &mut ranges {
            range.instructions.sort_by_key(|line| line.address);
        }
        Ok(Self { ranges })
    }

    /// Reads `{"symbols": [{"start": "0x..", "end": "0x..", "name": ..}, ..]}`.
    pub fn load_json(path: &Path) -> ProfResult<Self> {
        let bytes = std::fs::read(path)?;
        let file: SymbolFile = serde_json::from_slice(&bytes)?;
        Self::new(file.symbols)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn lookup(&self, address: u64) -> Option<&SymbolRange> {
        let idx = self.ranges.partition_point(|r| r.start <= address);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (address < range.end).then_some(range)
    }
}

impl SymbolResolver for StaticSymbols {
    fn resolve(&self, address: u64, _frame: &Frame) -> Option<ResolvedSymbol> {
        let range = self.lookup(address)?;
        let line = range
            .instructions
            .binary_search_by_key(&address, |line| line.address)
            .ok()
            .map(|idx| &range.instructions[idx]);
        Some(ResolvedSymbol {
            name: range.name.clone(),
            source: line
                .and_then(|l| l.source.clone())
                .or_else(|| range.source.clone()),
            instruction: line.map(|l| l.text.clone()),
            binary: range.binary.clone(),
        })
    }
}

/// First resolver that knows the address wins.
#[derive(Default)]
pub struct ChainedSymbols {
    resolvers: Vec<Box<dyn SymbolResolver>>,
}

impl ChainedSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl SymbolResolver for ChainedSymbols {
    fn resolve(&self, address: u64, frame: &Frame) -> Option<ResolvedSymbol> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve(address, frame))
    }
}

/// Per-report memo in front of a resolver.
pub struct SymbolTable<'a> {
    resolver: &'a dyn SymbolResolver,
    cache: HashMap<u64, Option<ResolvedSymbol>>,
}

impl<'a> SymbolTable<'a> {
    pub fn new(resolver: &'a dyn SymbolResolver) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, frame: &Frame) -> Option<&ResolvedSymbol> {
        let resolver = self.resolver;
        self.cache
            .entry(frame.address)
            .or_insert_with(|| resolver.resolve(frame.address, frame))
            .as_ref()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn de_address<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => {
            let parsed = match text.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => text.parse::<u64>(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid address {text:?}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64, name: &str) -> SymbolRange {
        SymbolRange {
            start,
            end,
            name: name.to_string(),
            source: None,
            binary: None,
            instructions: Vec::new(),
        }
    }

    #[test]
    fn recorded_symbols_skip_raw_addresses() {
        let mut frame = Frame::at(0x10);
        assert_eq!(RecordedSymbols.resolve(0x10, &frame), None);
        frame.name = Some("0x10fa3c7d0".to_string());
        assert_eq!(RecordedSymbols.resolve(0x10, &frame), None);
        frame.name = Some("Interpreter".to_string());
        frame.binary = Some("libjvm.dylib".to_string());
        let symbol = RecordedSymbols.resolve(0x10, &frame).expect("named frame");
        assert_eq!(symbol.name, "Interpreter");
        assert_eq!(symbol.binary.as_deref(), Some("libjvm.dylib"));
    }

    #[test]
    fn static_symbols_lookup_by_range() {
        let mut hot = range(0x1000, 0x1100, "hot");
        hot.instructions.push(InstructionLine {
            address: 0x1010,
            text: "add x0, x0, #1".to_string(),
            source: Some("hot.rs:12".to_string()),
        });
        let symbols = StaticSymbols::new(vec![range(0x2000, 0x2100, "cold"), hot]).expect("ranges");
        let frame = Frame::at(0);
        assert_eq!(symbols.resolve(0x0fff, &frame), None);
        assert_eq!(symbols.resolve(0x1000, &frame).expect("start").name, "hot");
        let line = symbols.resolve(0x1010, &frame).expect("line");
        assert_eq!(line.instruction.as_deref(), Some("add x0, x0, #1"));
        assert_eq!(line.source.as_deref(), Some("hot.rs:12"));
        assert_eq!(symbols.resolve(0x1100, &frame), None);
        assert_eq!(symbols.resolve(0x20ff, &frame).expect("end").name, "cold");
    }

    #[test]
    fn static_symbols_reject_overlap() {
        let err = StaticSymbols::new(vec![range(0x0, 0x20, "a"), range(0x10, 0x30, "b")])
            .expect_err("overlap");
        assert!(matches!(err, ProfError::InvalidConfig(_)));
        assert!(StaticSymbols::new(vec![range(0x10, 0x10, "empty")]).is_err());
    }

    #[test]
    fn loads_json_with_hex_or_decimal_addresses() {
        let dir = std::env::temp_dir().join(format!("xctrace-prof-symbols-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("symbols.json");
        std::fs::write(
            &path,
            r#"{"symbols": [
                {"start": "0x1000", "end": "0x1040", "name": "encode", "binary": "libbench.dylib"},
                {"start": 8192, "end": 8256, "name": "decode",
                 "instructions": [{"address": "0x2004", "text": "ldr w8, [x0]"}]}
            ]}"#,
        )
        .expect("write");
        let symbols = StaticSymbols::load_json(&path).expect("load");
        assert_eq!(symbols.len(), 2);
        let frame = Frame::at(0);
        assert_eq!(
            symbols.resolve(0x1020, &frame).expect("encode").binary.as_deref(),
            Some("libbench.dylib")
        );
        assert_eq!(
            symbols.resolve(0x2004, &frame).expect("decode").instruction.as_deref(),
            Some("ldr w8, [x0]")
        );

        std::fs::write(&path, r#"{"symbols": [{"start": "0xzz", "end": 1, "name": "x"}]}"#)
            .expect("write");
        assert!(matches!(StaticSymbols::load_json(&path), Err(ProfError::Json(_))));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn chained_prefers_earlier_resolvers_and_table_memoizes() {
        let chained = ChainedSymbols::new()
            .with(StaticSymbols::new(vec![range(0x1000, 0x2000, "static")]).expect("ranges"))
            .with(RecordedSymbols);
        let mut frame = Frame::at(0x1800);
        frame.name = Some("recorded".to_string());
        assert_eq!(chained.resolve(0x1800, &frame).expect("static").name, "static");
        frame.address = 0x3000;
        assert_eq!(chained.resolve(0x3000, &frame).expect("recorded").name, "recorded");

        let mut table = SymbolTable::new(&chained);
        assert_eq!(table.resolve(&frame).expect("first").name, "recorded");
        assert_eq!(table.resolve(&frame).expect("cached").name, "recorded");
        assert_eq!(table.cached(), 1);
    }
}
