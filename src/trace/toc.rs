//! Table-of-contents export: recording start instant and the tables a trace contains.

use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use std::io::BufRead;
use std::path::Path;

use crate::trace::{TableKind, attr, open_xml, required_attr, unquote, xml_reader};
use crate::{ProfError, ProfResult};

/// Trigger name used for timer-driven counter tables.
pub const TIME_SAMPLE_TRIGGER: &str = "TIME_MICRO_SEC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Tables that do not describe a trigger (time-profile, cpu-profile).
    Unspecified,
    /// Sampled on PMU interrupt after `threshold` occurrences of `event`.
    Pmi { event: String, threshold: u64 },
    /// Sampled on a timer.
    Time { sample_rate_us: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDesc {
    pub kind: TableKind,
    pub trigger: Trigger,
    pub counters: Vec<String>,
}

impl TableDesc {
    pub fn plain(kind: TableKind) -> Self {
        Self {
            kind,
            trigger: Trigger::Unspecified,
            counters: Vec::new(),
        }
    }

    /// Name of the event sample weights count, if any.
    pub fn trigger_event(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Pmi { event, .. } => Some(event),
            Trigger::Time { .. } => Some(TIME_SAMPLE_TRIGGER),
            Trigger::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableOfContents {
    /// Instant the recorder actually started sampling, epoch milliseconds.
    pub record_start_ms: Option<i64>,
    pub tables: Vec<TableDesc>,
}

impl TableOfContents {
    pub fn parse(path: &Path) -> ProfResult<Self> {
        let mut reader = open_xml(path)?;
        Self::read(&mut reader)
    }

    pub fn from_xml(xml: &str) -> ProfResult<Self> {
        let mut reader = xml_reader(xml.as_bytes());
        Self::read(&mut reader)
    }

    fn read<R: BufRead>(reader: &mut quick_xml::Reader<R>) -> ProfResult<Self> {
        let mut toc = Self::default();
        let mut buf = Vec::new();
        let mut in_start_date = false;
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    in_start_date = e.name().as_ref() == b"start-date";
                    toc.visit(&e)?;
                }
                Event::Empty(e) => {
                    in_start_date = false;
                    toc.visit(&e)?;
                }
                Event::Text(t) if in_start_date => {
                    let text = t.unescape()?;
                    toc.record_start_ms = Some(parse_start_date(text.trim())?);
                }
                Event::End(_) => in_start_date = false,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(toc)
    }

    fn visit(&mut self, element: &BytesStart<'_>) -> ProfResult<()> {
        if element.name().as_ref() != b"table" {
            return Ok(());
        }
        let schema = required_attr(element, b"schema")?;
        match TableKind::from_schema(&schema) {
            Some(TableKind::CountersProfile) => self.tables.push(counters_table(element)?),
            Some(kind) => self.tables.push(TableDesc::plain(kind)),
            None => {}
        }
        Ok(())
    }

    pub fn record_start(&self) -> Option<OffsetDateTime> {
        let ms = self.record_start_ms?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
    }

    /// Picks the table to read: the requested one, or the only supported one.
    pub fn select(&self, requested: Option<TableKind>) -> ProfResult<&TableDesc> {
        if self.tables.is_empty() {
            return Err(ProfError::TraceCorrupt(
                "trace does not contain a supported table".to_string(),
            ));
        }
        if let Some(kind) = requested {
            return self.tables.iter().find(|t| t.kind == kind).ok_or_else(|| {
                ProfError::TraceCorrupt(format!("table {kind} not found in trace"))
            });
        }
        match self.tables.as_slice() {
            [only] => Ok(only),
            _ => Err(ProfError::InvalidConfig(format!(
                "trace contains several supported tables ({}); pick one with the table option",
                self.tables
                    .iter()
                    .map(|t| t.kind.schema_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

fn parse_start_date(text: &str) -> ProfResult<i64> {
    let instant = OffsetDateTime::parse(text, &Rfc3339)
        .map_err(|e| ProfError::TraceCorrupt(format!("invalid start-date {text:?}: {e}")))?;
    Ok((instant.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn counters_table(element: &BytesStart<'_>) -> ProfResult<TableDesc> {
    let trigger = required_attr(element, b"trigger")?;
    let counters = parse_events(&attr(element, b"pmc-events")?.unwrap_or_default())?;
    let trigger = match trigger.to_ascii_lowercase().as_str() {
        "pmi" => {
            let event = unquote(&required_attr(element, b"pmi-event")?)?.to_string();
            let threshold = parse_u64("pmi-threshold", &required_attr(element, b"pmi-threshold")?)?;
            Trigger::Pmi { event, threshold }
        }
        "time" => {
            let rate = required_attr(element, b"sample-rate-micro-seconds")?;
            Trigger::Time {
                sample_rate_us: parse_u64("sample-rate-micro-seconds", &rate)?,
            }
        }
        other => {
            return Err(ProfError::TraceCorrupt(format!(
                "unsupported counters trigger {other:?}"
            )));
        }
    };
    Ok(TableDesc {
        kind: TableKind::CountersProfile,
        trigger,
        counters,
    })
}

fn parse_events(events: &str) -> ProfResult<Vec<String>> {
    let mut out = Vec::new();
    for raw in events.split(' ') {
        let name = unquote(raw)?;
        if !name.is_empty() {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

fn parse_u64(what: &str, value: &str) -> ProfResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ProfError::TraceCorrupt(format!("invalid {what} {value:?}: {e}")))
}
