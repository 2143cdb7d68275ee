//! Harness-facing profiler: one recording per measured iteration.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::{
    CaptureTemplate, Config, FailureKind, IterationOutcome, ProfError, ProfResult,
    ProfileMode, ProfilerOptions, ProfilerReport, RecordedSymbols, RecordingSession,
    SymbolResolver, SymbolTable, TableDesc, TableOfContents, TraceRecorder, TraceSamples,
    WindowReconciler, aggregate,
};

/// Boundaries of one measured iteration as seen by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationTiming {
    pub begin: OffsetDateTime,
    pub end: OffsetDateTime,
    /// Benchmark operations completed in the iteration, when the harness counts them.
    pub operations: Option<u64>,
}

impl IterationTiming {
    pub fn measured(&self) -> std::time::Duration {
        std::time::Duration::try_from(self.end - self.begin).unwrap_or_default()
    }
}

/// Profiler hooks a benchmark harness calls around each measured iteration.
pub trait IterationProfiler {
    fn on_iteration_start(&mut self, options: &ProfilerOptions) -> ProfResult<()>;

    fn on_iteration_end(&mut self, timing: &IterationTiming) -> IterationOutcome;

    fn list_available_modes(&self) -> BTreeSet<ProfileMode>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerPhase {
    Idle,
    Recording,
    Stopping,
    Reported,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeCapability {
    pub mode: ProfileMode,
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct ActiveIteration {
    session: RecordingSession,
    options: ProfilerOptions,
}

enum State {
    Idle,
    Recording(Box<ActiveIteration>),
    Stopping,
    Reported,
    Failed(FailureKind),
    Disabled(String),
}

pub struct XctraceProfiler {
    config: Config,
    recorder: TraceRecorder,
    resolver: Box<dyn SymbolResolver>,
    available: OnceLock<bool>,
    state: State,
}

impl XctraceProfiler {
    pub fn new(config: Config) -> Self {
        Self {
            recorder: TraceRecorder::new(&config),
            config,
            resolver: Box::new(RecordedSymbols),
            available: OnceLock::new(),
            state: State::Idle,
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> ProfilerPhase {
        match &self.state {
            State::Idle => ProfilerPhase::Idle,
            State::Recording(_) => ProfilerPhase::Recording,
            State::Stopping => ProfilerPhase::Stopping,
            State::Reported => ProfilerPhase::Reported,
            State::Failed(_) => ProfilerPhase::Failed,
            State::Disabled(_) => ProfilerPhase::Disabled,
        }
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        match &self.state {
            State::Failed(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        match &self.state {
            State::Recording(active) => Some(&active.session),
            _ => None,
        }
    }

    /// Whether the recorder can be run here; probed once per profiler.
    pub fn is_available(&self) -> bool {
        if matches!(self.state, State::Disabled(_)) {
            return false;
        }
        *self.available.get_or_init(|| self.recorder.probe())
    }

    pub fn capabilities(&self) -> Vec<ModeCapability> {
        let reason = match &self.state {
            State::Disabled(reason) => Some(reason.clone()),
            _ if !self.is_available() => Some(format!(
                "recorder {} is not available on {}/{}",
                self.recorder.program().display(),
                std::env::consts::OS,
                std::env::consts::ARCH
            )),
            _ => None,
        };
        ProfileMode::all()
            .into_iter()
            .map(|mode| ModeCapability {
                mode,
                supported: reason.is_none(),
                reason: reason.clone(),
            })
            .collect()
    }

    fn disable(&mut self, err: &ProfError) {
        let reason = err.to_string();
        warn!("profiling disabled for the rest of the run: {reason}");
        self.state = State::Disabled(reason);
    }

    fn finish(&self, active: ActiveIteration, timing: &IterationTiming) -> ProfResult<ProfilerReport> {
        let ActiveIteration { session, options } = active;
        let trace = self.recorder.stop(session)?;
        let toc = TableOfContents::parse(&self.recorder.export_toc(&trace)?)?;
        let desc = toc.select(options.table)?;
        let table_path = self.recorder.export_table(&trace, desc.kind)?;
        let samples = TraceSamples::open(&table_path, desc.kind)?;

        let reconciler = WindowReconciler::new(options.fix_start_time);
        let origin = reconciler.origin(trace.started_at, toc.record_start());
        analyze_samples(
            &samples,
            desc,
            origin,
            timing,
            &reconciler,
            self.resolver.as_ref(),
            options.mode,
        )
    }
}

impl IterationProfiler for XctraceProfiler {
    fn on_iteration_start(&mut self, options: &ProfilerOptions) -> ProfResult<()> {
        match std::mem::replace(&mut self.state, State::Idle) {
            disabled @ State::Disabled(_) => {
                self.state = disabled;
                debug!("profiler disabled; skipping iteration");
                return Ok(());
            }
            State::Recording(active) => {
                let pid = active.session.recorder_pid();
                drop(active);
                self.state = State::Failed(FailureKind::InvalidState);
                return Err(ProfError::InvalidState(format!(
                    "iteration started while recorder {pid} was still recording; recording discarded"
                )));
            }
            State::Stopping => {
                self.state = State::Failed(FailureKind::InvalidState);
                return Err(ProfError::InvalidState(
                    "iteration started while the previous one was stopping".to_string(),
                ));
            }
            State::Idle | State::Reported | State::Failed(_) => {}
        }

        if !self.is_available() {
            let err = ProfError::ToolUnavailable(format!(
                "{} did not respond to its version command",
                self.recorder.program().display()
            ));
            self.disable(&err);
            return Err(err);
        }

        let template = CaptureTemplate::from_name(options.template_or(&self.config));
        let target_pid = options.pid.unwrap_or_else(std::process::id);
        match self.recorder.start(&template, target_pid) {
            Ok(session) => {
                self.state = State::Recording(Box::new(ActiveIteration {
                    session,
                    options: options.clone(),
                }));
                Ok(())
            }
            Err(err @ ProfError::ToolUnavailable(_)) => {
                self.disable(&err);
                Err(err)
            }
            Err(err) => {
                self.state = State::Failed(err.kind());
                Err(err)
            }
        }
    }

    fn on_iteration_end(&mut self, timing: &IterationTiming) -> IterationOutcome {
        let active = match std::mem::replace(&mut self.state, State::Stopping) {
            State::Recording(active) => active,
            State::Disabled(reason) => {
                self.state = State::Disabled(reason.clone());
                return IterationOutcome::Disabled { reason };
            }
            _ => {
                self.state = State::Failed(FailureKind::InvalidState);
                return IterationOutcome::failed(&ProfError::InvalidState(
                    "iteration ended without an active recording".to_string(),
                ));
            }
        };

        match self.finish(*active, timing) {
            Ok(report) => {
                info!(
                    mode = report.mode.as_str(),
                    in_window = report.in_window,
                    out_of_window = report.out_of_window,
                    "iteration profiled"
                );
                self.state = State::Reported;
                IterationOutcome::Report(report)
            }
            Err(err) => {
                warn!("iteration profile failed: {err}");
                self.state = State::Failed(err.kind());
                IterationOutcome::failed(&err)
            }
        }
    }

    fn list_available_modes(&self) -> BTreeSet<ProfileMode> {
        if self.is_available() {
            ProfileMode::all().into_iter().collect()
        } else {
            BTreeSet::new()
        }
    }
}

/// Reconciles the window, aggregates, and normalizes counters for one exported table.
pub fn analyze_samples(
    samples: &TraceSamples,
    desc: &TableDesc,
    origin: OffsetDateTime,
    timing: &IterationTiming,
    reconciler: &WindowReconciler,
    resolver: &dyn SymbolResolver,
    mode: ProfileMode,
) -> ProfResult<ProfilerReport> {
    let bounds = samples.bounds()?;
    let window = reconciler.reconcile(timing.begin, timing.end, origin, &bounds);
    debug!(
        samples = bounds.count,
        start_ns = window.start_ns,
        end_ns = window.end_ns,
        "measurement window"
    );
    let mut symbols = SymbolTable::new(resolver);
    let mut report = aggregate(samples.iter()?, &window, desc.kind, &mut symbols, mode)?;
    report.normalize_counters(desc, timing.operations, timing.measured());
    Ok(report)
}
