//! Trace record controller: drives the external recorder through one session.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::runtime::child::{ChildGuard, format_status, run_bounded};
use crate::{
    Config, ProfError, ProfResult, RecorderSpec, SessionDir, TableKind, find_trace_bundle,
    tail_lines,
};

const TRACE_FILE_NAME: &str = "recording.trace";
const RECORDER_LOG: &str = "recorder.log";
const EXPORT_LOG: &str = "export.log";

/// Capture template handed to the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTemplate {
    /// CPU-cycle sampling.
    CpuProfiler,
    /// Wall-clock timer sampling.
    TimeProfiler,
    /// PMC counter sampling.
    CpuCounters,
    Custom(String),
}

impl CaptureTemplate {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "CPU Profiler" | "cpu" => Self::CpuProfiler,
            "Time Profiler" | "Time Profile" | "time" => Self::TimeProfiler,
            "CPU Counters" | "counters" => Self::CpuCounters,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CpuProfiler => "CPU Profiler",
            Self::TimeProfiler => "Time Profiler",
            Self::CpuCounters => "CPU Counters",
            Self::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Recording,
    Exited,
}

/// Clears the controller's busy flag when the owning session goes away.
#[derive(Debug)]
struct ActiveSlot(Arc<AtomicBool>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One recorder invocation.
///
/// Field order matters: the child is reaped before the workspace is removed.
#[derive(Debug)]
pub struct RecordingSession {
    child: ChildGuard,
    trace_path: PathBuf,
    log_path: PathBuf,
    template: CaptureTemplate,
    target_pid: u32,
    started_at: OffsetDateTime,
    workspace: SessionDir,
    _slot: ActiveSlot,
}

impl RecordingSession {
    pub fn trace_path(&self) -> &Path {
        &self.trace_path
    }

    pub fn template(&self) -> &CaptureTemplate {
        &self.template
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    pub fn recorder_pid(&self) -> u32 {
        self.child.id()
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.as_path()
    }

    pub fn state(&mut self) -> SessionState {
        if self.child.is_running() {
            SessionState::Recording
        } else {
            SessionState::Exited
        }
    }
}

/// A finished recording whose artifacts live until this value is dropped.
#[derive(Debug)]
pub struct RecordedTrace {
    pub trace_path: PathBuf,
    pub template: CaptureTemplate,
    pub started_at: OffsetDateTime,
    pub stopped_at: OffsetDateTime,
    workspace: SessionDir,
}

impl RecordedTrace {
    pub fn workspace(&self) -> &Path {
        self.workspace.as_path()
    }
}

#[derive(Debug)]
pub struct TraceRecorder {
    spec: RecorderSpec,
    stop_timeout: Duration,
    export_timeout: Duration,
    work_dir: PathBuf,
    keep_artifacts: bool,
    active: Arc<AtomicBool>,
}

impl TraceRecorder {
    pub fn new(config: &Config) -> Self {
        Self {
            spec: config.recorder.clone(),
            stop_timeout: config.stop_timeout(),
            export_timeout: config.export_timeout(),
            work_dir: config.work_dir(),
            keep_artifacts: config.keep_artifacts,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn program(&self) -> &Path {
        &self.spec.program
    }

    /// Runs the recorder's version command; any failure means "not usable here".
    pub fn probe(&self) -> bool {
        match self.check_available() {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("recorder probe failed: {err}");
                false
            }
        }
    }

    pub fn check_available(&self) -> ProfResult<()> {
        let scratch = SessionDir::create(&self.work_dir, false)?;
        let mut cmd = self.command(&self.spec.version_args, &[]);
        run_bounded(&mut cmd, "recorder version", &scratch.join(EXPORT_LOG), self.export_timeout)
            .map_err(|e| match e {
                ProfError::ToolUnavailable(msg) => ProfError::ToolUnavailable(msg),
                other => ProfError::ToolUnavailable(other.to_string()),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Starts recording `target_pid` with `template`.
    pub fn start(&self, template: &CaptureTemplate, target_pid: u32) -> ProfResult<RecordingSession> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProfError::InvalidState(
                "a recording session is already active".to_string(),
            ));
        }
        let slot = ActiveSlot(Arc::clone(&self.active));

        let workspace = SessionDir::create(&self.work_dir, self.keep_artifacts)?;
        let trace_path = workspace.join(TRACE_FILE_NAME);
        let log_path = workspace.join(RECORDER_LOG);
        let pid = target_pid.to_string();
        let output = trace_path.to_string_lossy().to_string();
        let mut cmd = self.command(
            &self.spec.record_args,
            &[
                ("template", template.as_str()),
                ("pid", pid.as_str()),
                ("output", output.as_str()),
            ],
        );
        let started_at = OffsetDateTime::now_utc();
        let child = ChildGuard::spawn(&mut cmd, "recorder", &log_path)?;
        tracing::info!(
            recorder_pid = child.id(),
            target_pid,
            template = template.as_str(),
            "recording started"
        );
        Ok(RecordingSession {
            child,
            trace_path,
            log_path,
            template: template.clone(),
            target_pid,
            started_at,
            workspace,
            _slot: slot,
        })
    }

    /// Interrupts the recorder and waits for it to finalize the trace.
    pub fn stop(&self, session: RecordingSession) -> ProfResult<RecordedTrace> {
        let RecordingSession {
            mut child,
            trace_path,
            log_path,
            template,
            started_at,
            workspace,
            _slot,
            ..
        } = session;

        let waited = child
            .interrupt()
            .and_then(|()| child.wait_timeout(self.stop_timeout));
        let status = settle_stop(&mut child, waited, self.stop_timeout)?;
        let stopped_at = OffsetDateTime::now_utc();
        if !status.success() {
            return Err(ProfError::RecordingFailed(format!(
                "recorder exited with {}: {}",
                format_status(status),
                tail_lines(&log_path, 5)
            )));
        }

        let trace_path = if trace_path.exists() {
            trace_path
        } else {
            find_trace_bundle(workspace.as_path())?
        };
        tracing::info!(trace = %trace_path.display(), "recording stopped");
        Ok(RecordedTrace {
            trace_path,
            template,
            started_at,
            stopped_at,
            workspace,
        })
    }

    /// Exports the trace's table of contents.
    pub fn export_toc(&self, trace: &RecordedTrace) -> ProfResult<PathBuf> {
        let output = trace.workspace.join("toc.xml");
        self.export(trace, &self.spec.export_toc_args, &output, None)?;
        Ok(output)
    }

    /// Exports one table of the trace.
    pub fn export_table(&self, trace: &RecordedTrace, table: TableKind) -> ProfResult<PathBuf> {
        let output = trace.workspace.join(&format!("{}.xml", table.schema_name()));
        self.export(trace, &self.spec.export_table_args, &output, Some(table))?;
        Ok(output)
    }

    fn export(
        &self,
        trace: &RecordedTrace,
        args: &[String],
        output: &Path,
        table: Option<TableKind>,
    ) -> ProfResult<()> {
        let input = trace.trace_path.to_string_lossy().to_string();
        let out = output.to_string_lossy().to_string();
        let schema = table.map(|t| t.schema_name()).unwrap_or_default();
        let mut cmd = self.command(
            args,
            &[
                ("input", input.as_str()),
                ("output", out.as_str()),
                ("schema", schema),
            ],
        );
        tracing::debug!(output = %output.display(), "exporting trace");
        run_bounded(
            &mut cmd,
            "recorder export",
            &trace.workspace.join(EXPORT_LOG),
            self.export_timeout,
        )?;
        if !output.is_file() {
            return Err(ProfError::RecordingFailed(format!(
                "export produced no file at {}",
                output.display()
            )));
        }
        Ok(())
    }

    fn command(&self, args: &[String], vars: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(expand_args(args, vars));
        cmd
    }
}

/// Any outcome other than a clean exit kills the recorder before its workspace can go.
fn settle_stop(
    child: &mut ChildGuard,
    waited: ProfResult<Option<ExitStatus>>,
    timeout: Duration,
) -> ProfResult<ExitStatus> {
    match waited {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            child.terminate();
            Err(ProfError::RecordingFailed(format!(
                "recorder did not stop within {}ms and was killed",
                timeout.as_millis()
            )))
        }
        Err(err) => {
            child.terminate();
            Err(err)
        }
    }
}

/// Replaces `{name}` placeholders in each argument.
pub fn expand_args(args: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}
