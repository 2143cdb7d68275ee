//! Recorder process lifecycle.

pub mod child;
pub mod recorder;

#[cfg(all(test, unix))]
pub(crate) mod fake;

pub use child::{ChildGuard, run_bounded};
pub use recorder::{CaptureTemplate, RecordedTrace, RecordingSession, SessionState, TraceRecorder};
