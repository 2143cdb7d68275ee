//! xctrace-prof core library: per-iteration hot-path profiles from an external sampling
//! recorder, for benchmark harnesses and the `xctrace-prof` CLI.

mod adapter;
mod aggregate;
mod config;
mod error;
mod fsutil;
mod reporting;
mod symbols;
mod window;

pub mod cmd;
pub mod runtime;
pub mod trace;

pub use adapter::*;
pub use aggregate::*;
pub use config::*;
pub use error::*;
pub use fsutil::*;
pub use reporting::*;
pub use runtime::{
    CaptureTemplate, ChildGuard, RecordedTrace, RecordingSession, SessionState, TraceRecorder,
    run_bounded,
};
pub use symbols::*;
pub use trace::{
    Frame, Sample, SampleIter, TableDesc, TableKind, TableOfContents, TraceBounds, TraceSamples,
    Trigger,
};
pub use window::*;
