//! Crate-wide error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ProfResult<T> = Result<T, ProfError>;

#[derive(Debug, Error)]
pub enum ProfError {
    #[error("recorder unavailable: {0}")]
    ToolUnavailable(String),

    #[error("recording failed: {0}")]
    RecordingFailed(String),

    #[error("trace corrupt: {0}")]
    TraceCorrupt(String),

    #[error("invalid profiler state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<quick_xml::Error> for ProfError {
    fn from(value: quick_xml::Error) -> Self {
        Self::TraceCorrupt(value.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ProfError {
    fn from(value: quick_xml::events::attributes::AttrError) -> Self {
        Self::TraceCorrupt(value.to_string())
    }
}

/// Failure classification surfaced to the harness in place of hot-path data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolUnavailable,
    RecordingFailed,
    TraceCorrupt,
    InvalidState,
    InvalidConfig,
    Io,
}

impl ProfError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ToolUnavailable(_) => FailureKind::ToolUnavailable,
            Self::RecordingFailed(_) => FailureKind::RecordingFailed,
            Self::TraceCorrupt(_) => FailureKind::TraceCorrupt,
            Self::InvalidState(_) => FailureKind::InvalidState,
            Self::InvalidConfig(_) | Self::Toml(_) => FailureKind::InvalidConfig,
            Self::Io(_) => FailureKind::Io,
            Self::Json(_) => FailureKind::TraceCorrupt,
        }
    }
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolUnavailable => "tool_unavailable",
            Self::RecordingFailed => "recording_failed",
            Self::TraceCorrupt => "trace_corrupt",
            Self::InvalidState => "invalid_state",
            Self::InvalidConfig => "invalid_config",
            Self::Io => "io",
        }
    }
}
