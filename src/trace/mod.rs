//! Exported recorder data: table of contents and sample tables (XML).

pub mod table;
pub mod toc;

#[cfg(test)]
pub(crate) mod fixtures;

use quick_xml::Reader;
use quick_xml::events::BytesStart;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::{ProfError, ProfResult};

pub use table::{Frame, Sample, SampleIter, TraceBounds, TraceSamples};
pub use toc::{TableDesc, TableOfContents, Trigger};

/// Sample tables this crate knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableKind {
    TimeProfile,
    CpuProfile,
    CountersProfile,
}

impl TableKind {
    pub fn schema_name(self) -> &'static str {
        match self {
            Self::TimeProfile => "time-profile",
            Self::CpuProfile => "cpu-profile",
            Self::CountersProfile => "counters-profile",
        }
    }

    pub fn from_schema(name: &str) -> Option<Self> {
        match name {
            "time-profile" => Some(Self::TimeProfile),
            "cpu-profile" => Some(Self::CpuProfile),
            "counters-profile" => Some(Self::CountersProfile),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> ProfResult<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::from_schema(&normalized).ok_or_else(|| {
            ProfError::InvalidConfig(format!(
                "unknown table {value:?} (expected time-profile, cpu-profile or counters-profile)"
            ))
        })
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.schema_name())
    }
}

pub(crate) fn open_xml(path: &Path) -> ProfResult<Reader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| {
        ProfError::TraceCorrupt(format!("cannot open export {}: {e}", path.display()))
    })?;
    Ok(xml_reader(BufReader::new(file)))
}

pub(crate) fn xml_reader<R: std::io::BufRead>(input: R) -> Reader<R> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);
    reader
}

pub(crate) fn attr(element: &BytesStart<'_>, name: &[u8]) -> ProfResult<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == name {
            return Ok(Some(attribute.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

pub(crate) fn required_attr(element: &BytesStart<'_>, name: &[u8]) -> ProfResult<String> {
    attr(element, name)?.ok_or_else(|| {
        ProfError::TraceCorrupt(format!(
            "<{}> is missing attribute {:?}",
            String::from_utf8_lossy(element.name().as_ref()),
            String::from_utf8_lossy(name)
        ))
    })
}

/// Strips one pair of surrounding double quotes, as the recorder emits for event names.
pub(crate) fn unquote(value: &str) -> ProfResult<&str> {
    let starts = value.starts_with('"');
    let ends = value.len() > 1 && value.ends_with('"');
    match (starts, ends) {
        (true, true) => Ok(&value[1..value.len() - 1]),
        (false, false) => Ok(value),
        _ => Err(ProfError::TraceCorrupt(format!("unbalanced quotes in {value:?}"))),
    }
}
