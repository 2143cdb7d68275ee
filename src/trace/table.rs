//! Streaming reader for exported sample tables.
//!
//! The recorder deduplicates repeated values: the first occurrence of an element carries an
//! `id`, later occurrences are empty elements with a `ref` to that id. Rows are read one at
//! a time and only the id cache is kept in memory.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::trace::{TableKind, attr, open_xml, xml_reader};
use crate::{ProfError, ProfResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub address: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

impl Frame {
    pub fn at(address: u64) -> Self {
        Self {
            address,
            name: None,
            binary: None,
        }
    }
}

/// One sampled stack, frames ordered leaf first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Nanoseconds since the recorder started sampling.
    pub time_ns: u64,
    pub thread: Option<u64>,
    pub weight: u64,
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pmc: Vec<u64>,
}

impl Sample {
    pub fn leaf(&self) -> Option<&Frame> {
        self.frames.first()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceBounds {
    pub first_ns: Option<u64>,
    pub last_ns: Option<u64>,
    pub count: u64,
}

/// Handle to an exported table. Every `iter()` re-reads the file from the start.
#[derive(Debug, Clone)]
pub struct TraceSamples {
    path: PathBuf,
    kind: TableKind,
}

impl TraceSamples {
    pub fn open(path: &Path, kind: TableKind) -> ProfResult<Self> {
        if !path.is_file() {
            return Err(ProfError::TraceCorrupt(format!(
                "exported table {} is missing",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn iter(&self) -> ProfResult<SampleIter<BufReader<File>>> {
        Ok(SampleIter::new(open_xml(&self.path)?, self.kind))
    }

    /// Earliest and latest sample timestamps, from one full pass.
    pub fn bounds(&self) -> ProfResult<TraceBounds> {
        bounds_of(self.iter()?)
    }
}

pub fn bounds_of<I>(samples: I) -> ProfResult<TraceBounds>
where
    I: IntoIterator<Item = ProfResult<Sample>>,
{
    let mut bounds = TraceBounds::default();
    for sample in samples {
        let sample = sample?;
        let t = sample.time_ns;
        bounds.first_ns = Some(bounds.first_ns.map_or(t, |first| first.min(t)));
        bounds.last_ns = Some(bounds.last_ns.map_or(t, |last| last.max(t)));
        bounds.count += 1;
    }
    Ok(bounds)
}

#[derive(Debug, Clone)]
enum Cached {
    Number(u64),
    Counters(Vec<u64>),
    Thread(Option<u64>),
    Binary(Option<String>),
    Frame(Frame),
    Backtrace(Vec<Frame>),
    Wrapper(Carried),
}

/// Thread and backtrace found inside an element the parser does not otherwise model.
#[derive(Debug, Clone, Default)]
struct Carried {
    thread: Option<u64>,
    frames: Option<Vec<Frame>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumberRole {
    Time,
    Weight,
    Tid,
}

/// An element of interest that is currently open.
#[derive(Debug)]
enum Open {
    Number {
        role: NumberRole,
        id: Option<u64>,
        value: Option<u64>,
        text: String,
    },
    Counters {
        id: Option<u64>,
        value: Option<Vec<u64>>,
        text: String,
    },
    Thread {
        id: Option<u64>,
        tid: Option<u64>,
    },
    Binary {
        id: Option<u64>,
        name: Option<String>,
    },
    Frame {
        id: Option<u64>,
        frame: Frame,
    },
    Backtrace {
        id: Option<u64>,
        frames: Vec<Frame>,
    },
    /// Untracked element inside a row, e.g. `<tagged-backtrace>`.
    Wrapper {
        id: Option<u64>,
        carried: Carried,
    },
    Row,
    Ignored,
}

pub struct SampleIter<R> {
    reader: Reader<R>,
    kind: TableKind,
    buf: Vec<u8>,
    cache: HashMap<u64, Cached>,
    stack: Vec<Open>,
    current: Option<Sample>,
    done: bool,
}

impl<'a> SampleIter<&'a [u8]> {
    pub fn from_xml(xml: &'a str, kind: TableKind) -> Self {
        Self::new(xml_reader(xml.as_bytes()), kind)
    }
}

impl<R: BufRead> SampleIter<R> {
    pub fn new(reader: Reader<R>, kind: TableKind) -> Self {
        Self {
            reader,
            kind,
            buf: Vec::new(),
            cache: HashMap::new(),
            stack: Vec::new(),
            current: None,
            done: false,
        }
    }

    fn next_sample(&mut self) -> ProfResult<Option<Sample>> {
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf)?.into_owned();
            match event {
                Event::Start(e) => self.open(&e)?,
                Event::Empty(e) => {
                    self.open(&e)?;
                    if let Some(sample) = self.close()? {
                        return Ok(Some(sample));
                    }
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    self.append_text(&text);
                }
                Event::End(_) => {
                    if let Some(sample) = self.close()? {
                        return Ok(Some(sample));
                    }
                }
                Event::Eof => {
                    if !self.stack.is_empty() {
                        return Err(ProfError::TraceCorrupt(
                            "export ended inside an open element".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn open(&mut self, e: &BytesStart<'_>) -> ProfResult<()> {
        let name = e.name();
        let name = name.as_ref();
        if name == b"schema" {
            let schema = attr(e, b"name")?.unwrap_or_default();
            if schema != self.kind.schema_name() {
                return Err(ProfError::TraceCorrupt(format!(
                    "export contains schema {schema:?}, expected {}",
                    self.kind
                )));
            }
            self.stack.push(Open::Ignored);
            return Ok(());
        }
        if name == b"row" {
            self.current = Some(Sample::default());
            self.stack.push(Open::Row);
            return Ok(());
        }
        if self.current.is_none() {
            self.stack.push(Open::Ignored);
            return Ok(());
        }
        if !is_tracked(name) {
            let open = self.wrapper(e)?;
            self.stack.push(open);
            return Ok(());
        }

        let reference = attr(e, b"ref")?.map(|r| parse_id(&r)).transpose()?;
        let cached = match reference {
            Some(r) => Some(self.cache.get(&r).cloned().ok_or_else(|| {
                ProfError::TraceCorrupt(format!("reference to unknown id {r}"))
            })?),
            None => None,
        };
        let id = match reference {
            Some(_) => None,
            None => attr(e, b"id")?.map(|v| parse_id(&v)).transpose()?,
        };

        let open = match name {
            b"sample-time" => number(NumberRole::Time, id, cached)?,
            b"weight" | b"cycle-weight" | b"pmc-event" => number(NumberRole::Weight, id, cached)?,
            b"tid" => number(NumberRole::Tid, id, cached)?,
            b"pmc-events" => Open::Counters {
                id,
                value: match cached {
                    Some(Cached::Counters(v)) => Some(v),
                    Some(other) => return Err(mismatch("pmc-events", &other)),
                    None => None,
                },
                text: String::new(),
            },
            b"thread" => Open::Thread {
                id,
                tid: match cached {
                    Some(Cached::Thread(tid)) => tid,
                    Some(other) => return Err(mismatch("thread", &other)),
                    None => None,
                },
            },
            b"binary" => Open::Binary {
                id,
                name: match cached {
                    Some(Cached::Binary(name)) => name,
                    Some(other) => return Err(mismatch("binary", &other)),
                    None => attr(e, b"name")?,
                },
            },
            b"frame" => Open::Frame {
                id,
                frame: match cached {
                    Some(Cached::Frame(frame)) => frame,
                    Some(other) => return Err(mismatch("frame", &other)),
                    None => Frame {
                        address: parse_address(attr(e, b"addr")?.as_deref())?,
                        name: attr(e, b"name")?,
                        binary: None,
                    },
                },
            },
            b"backtrace" => Open::Backtrace {
                id,
                frames: match cached {
                    Some(Cached::Backtrace(frames)) => frames,
                    Some(other) => return Err(mismatch("backtrace", &other)),
                    None => Vec::new(),
                },
            },
            _ => Open::Ignored,
        };
        self.stack.push(open);
        Ok(())
    }

    /// Untracked elements keep their id so a later `ref` replays what they wrapped.
    /// Refs that do not name a wrapper are not ours to check.
    fn wrapper(&self, e: &BytesStart<'_>) -> ProfResult<Open> {
        if let Some(r) = attr(e, b"ref")? {
            let carried = match r.parse::<u64>().ok().and_then(|r| self.cache.get(&r)) {
                Some(Cached::Wrapper(carried)) => carried.clone(),
                _ => Carried::default(),
            };
            return Ok(Open::Wrapper { id: None, carried });
        }
        let id = attr(e, b"id")?.and_then(|v| v.parse::<u64>().ok());
        Ok(Open::Wrapper {
            id,
            carried: Carried::default(),
        })
    }

    fn append_text(&mut self, text: &str) {
        match self.stack.last_mut() {
            Some(Open::Number {
                value: None, text: buf, ..
            })
            | Some(Open::Counters {
                value: None, text: buf, ..
            }) => buf.push_str(text),
            _ => {}
        }
    }

    /// Pops the innermost element; returns a sample when a row closes.
    fn close(&mut self) -> ProfResult<Option<Sample>> {
        let Some(open) = self.stack.pop() else {
            return Err(ProfError::TraceCorrupt("unbalanced closing element".to_string()));
        };
        match open {
            Open::Ignored => {}
            Open::Row => return Ok(self.current.take()),
            Open::Wrapper { id, carried } => {
                if let Some(id) = id {
                    self.cache
                        .entry(id)
                        .or_insert_with(|| Cached::Wrapper(carried.clone()));
                }
                if let Some(tid) = carried.thread {
                    self.deliver_thread(Some(tid));
                }
                if let Some(frames) = carried.frames {
                    self.deliver_frames(frames);
                }
            }
            Open::Number {
                role,
                id,
                value,
                text,
            } => {
                let value = match value {
                    Some(v) => v,
                    None => parse_number(&text)?,
                };
                self.remember(id, Cached::Number(value))?;
                match role {
                    NumberRole::Tid => {
                        if let Some(Open::Thread { tid, .. }) = self.stack.last_mut() {
                            *tid = Some(value);
                        }
                    }
                    NumberRole::Time => self.with_row(|s| s.time_ns = value),
                    NumberRole::Weight => self.with_row(|s| s.weight = value),
                }
            }
            Open::Counters { id, value, text } => {
                let values = match value {
                    Some(v) => v,
                    None => text
                        .split_whitespace()
                        .map(parse_number)
                        .collect::<ProfResult<Vec<_>>>()?,
                };
                self.remember(id, Cached::Counters(values.clone()))?;
                self.with_row(|s| s.pmc = values);
            }
            Open::Thread { id, tid } => {
                self.remember(id, Cached::Thread(tid))?;
                self.deliver_thread(tid);
            }
            Open::Binary { id, name } => {
                self.remember(id, Cached::Binary(name.clone()))?;
                if let Some(Open::Frame { frame, .. }) = self.stack.last_mut() {
                    frame.binary = name;
                }
            }
            Open::Frame { id, frame } => {
                self.remember(id, Cached::Frame(frame.clone()))?;
                if let Some(Open::Backtrace { frames, .. }) = self.stack.last_mut() {
                    frames.push(frame);
                }
            }
            Open::Backtrace { id, frames } => {
                self.remember(id, Cached::Backtrace(frames.clone()))?;
                self.deliver_frames(frames);
            }
        }
        Ok(None)
    }

    /// Hands a closed `<thread>` to the row, possibly through wrappers.
    fn deliver_thread(&mut self, tid: Option<u64>) {
        match self.stack.last_mut() {
            Some(Open::Row) => {
                if let Some(sample) = self.current.as_mut() {
                    sample.thread = tid;
                }
            }
            Some(Open::Wrapper { carried, .. }) => carried.thread = tid,
            _ => {}
        }
    }

    fn deliver_frames(&mut self, frames: Vec<Frame>) {
        match self.stack.last_mut() {
            Some(Open::Row) => {
                if let Some(sample) = self.current.as_mut() {
                    sample.frames = frames;
                }
            }
            Some(Open::Wrapper { carried, .. }) => carried.frames = Some(frames),
            _ => {}
        }
    }

    fn with_row(&mut self, f: impl FnOnce(&mut Sample)) {
        if let Some(sample) = self.current.as_mut() {
            f(sample);
        }
    }

    fn remember(&mut self, id: Option<u64>, value: Cached) -> ProfResult<()> {
        let Some(id) = id else {
            return Ok(());
        };
        match self.cache.entry(id) {
            Entry::Occupied(_) => Err(ProfError::TraceCorrupt(format!("duplicate id {id}"))),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }
}

impl<R: BufRead> Iterator for SampleIter<R> {
    type Item = ProfResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_sample() {
            Ok(Some(sample)) => Some(Ok(sample)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Elements whose values feed a sample. Anything else inside a row is a wrapper.
fn is_tracked(name: &[u8]) -> bool {
    matches!(
        name,
        b"sample-time"
            | b"weight"
            | b"cycle-weight"
            | b"pmc-event"
            | b"tid"
            | b"pmc-events"
            | b"thread"
            | b"binary"
            | b"frame"
            | b"backtrace"
    )
}

fn number(role: NumberRole, id: Option<u64>, cached: Option<Cached>) -> ProfResult<Open> {
    let value = match cached {
        Some(Cached::Number(v)) => Some(v),
        Some(other) => return Err(mismatch("number", &other)),
        None => None,
    };
    Ok(Open::Number {
        role,
        id,
        value,
        text: String::new(),
    })
}

fn mismatch(expected: &str, found: &Cached) -> ProfError {
    ProfError::TraceCorrupt(format!("reference to {found:?} where {expected} was expected"))
}

fn parse_id(value: &str) -> ProfResult<u64> {
    value
        .parse::<u64>()
        .map_err(|e| ProfError::TraceCorrupt(format!("invalid id {value:?}: {e}")))
}

fn parse_number(text: &str) -> ProfResult<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|e| ProfError::TraceCorrupt(format!("invalid number {text:?}: {e}")))
}

/// Parses `0x...` frame addresses. Sampled PCs are reported one past the instruction.
fn parse_address(value: Option<&str>) -> ProfResult<u64> {
    let Some(value) = value else {
        return Ok(0);
    };
    let hex = value.strip_prefix("0x").ok_or_else(|| {
        ProfError::TraceCorrupt(format!("unexpected address format {value:?}"))
    })?;
    let address = u64::from_str_radix(hex, 16)
        .map_err(|e| ProfError::TraceCorrupt(format!("invalid address {value:?}: {e}")))?;
    Ok(address.saturating_sub(1))
}
