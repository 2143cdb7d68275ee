//! Profiler commands (`xctrace-prof modes|analyze|attach`).

use clap::Subcommand;
use serde::Serialize;
use time::OffsetDateTime;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    ChainedSymbols, Config, IterationOutcome, IterationProfiler, IterationTiming, ProfResult,
    ProfileMode, ProfilerOptions, RecordedSymbols, StaticSymbols, SymbolResolver,
    TableDesc, TableKind, TableOfContents, TraceSamples, WindowReconciler, XctraceProfiler,
    analyze_samples,
};

/// Upper bound used when `analyze` is given no end offset.
const OPEN_ENDED_DAYS: i64 = 36_500;

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Report which profile modes the recorder supports on this host.
    Modes,
    /// Aggregate an already exported sample table.
    Analyze {
        /// Exported table XML (`xctrace export --xpath ...`).
        #[arg(value_name = "TABLE_XML")]
        table: PathBuf,
        /// Exported table of contents; supplies the table kind, counters and start date.
        #[arg(long)]
        toc: Option<PathBuf>,
        /// Table schema when no TOC is given or it lists several tables.
        #[arg(long, value_parser = parse_table_kind)]
        kind: Option<TableKind>,
        #[arg(long, default_value = "normalized", value_parser = parse_mode)]
        mode: ProfileMode,
        /// JSON symbol ranges consulted before the recorder's own names.
        #[arg(long)]
        symbols: Option<PathBuf>,
        /// Window start, milliseconds after sampling began.
        #[arg(long, default_value_t = 0)]
        from_ms: u64,
        /// Window end, milliseconds after sampling began.
        #[arg(long)]
        to_ms: Option<u64>,
        /// Operations completed in the window, for counter normalization.
        #[arg(long)]
        operations: Option<u64>,
        #[arg(long)]
        top: Option<usize>,
    },
    /// Record a running process for a fixed duration and report its hot paths.
    Attach {
        #[arg(long)]
        pid: u32,
        #[arg(long, default_value_t = 1_000)]
        duration_ms: u64,
        /// Profiler options, e.g. `mode=instruction;template=Time Profiler`.
        #[arg(long, default_value = "")]
        options: String,
        #[arg(long)]
        symbols: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Value(serde_json::Value),
    Outcome {
        #[serde(flatten)]
        outcome: IterationOutcome,
        #[serde(skip)]
        top: usize,
    },
}

pub fn profile_command(config: &Config, command: &ProfileCommand) -> ProfResult<CommandOutput> {
    match command {
        ProfileCommand::Modes => Ok(CommandOutput::Value(modes_report(config))),

        ProfileCommand::Analyze {
            table,
            toc,
            kind,
            mode,
            symbols,
            from_ms,
            to_ms,
            operations,
            top,
        } => {
            let (desc, record_start) = match toc {
                Some(path) => {
                    let toc = TableOfContents::parse(path)?;
                    (toc.select(*kind)?.clone(), toc.record_start())
                }
                None => (
                    TableDesc::plain(kind.unwrap_or(TableKind::TimeProfile)),
                    None,
                ),
            };
            let origin = record_start.unwrap_or(OffsetDateTime::UNIX_EPOCH);
            let begin = origin + Duration::from_millis(*from_ms);
            let end = match to_ms {
                Some(ms) => origin + Duration::from_millis(*ms),
                None => origin + time::Duration::days(OPEN_ENDED_DAYS),
            };
            let samples = TraceSamples::open(table, desc.kind)?;
            let resolver = resolver(symbols.as_deref())?;
            let report = analyze_samples(
                &samples,
                &desc,
                origin,
                &IterationTiming {
                    begin,
                    end,
                    operations: *operations,
                },
                &WindowReconciler::default(),
                resolver.as_ref(),
                *mode,
            )?;
            Ok(CommandOutput::Outcome {
                outcome: IterationOutcome::Report(report),
                top: top.unwrap_or(config.top),
            })
        }

        ProfileCommand::Attach {
            pid,
            duration_ms,
            options,
            symbols,
        } => {
            let mut options = ProfilerOptions::parse(options)?;
            options.pid = Some(*pid);
            let top = options.top.unwrap_or(config.top);
            let mut profiler =
                XctraceProfiler::new(config.clone()).with_resolver(resolver(symbols.as_deref())?);
            profiler.on_iteration_start(&options)?;
            let begin = OffsetDateTime::now_utc();
            std::thread::sleep(Duration::from_millis(*duration_ms));
            let end = OffsetDateTime::now_utc();
            let outcome = profiler.on_iteration_end(&IterationTiming {
                begin,
                end,
                operations: None,
            });
            Ok(CommandOutput::Outcome { outcome, top })
        }
    }
}

fn resolver(symbols: Option<&Path>) -> ProfResult<Box<dyn SymbolResolver>> {
    match symbols {
        Some(path) => Ok(Box::new(
            ChainedSymbols::new()
                .with(StaticSymbols::load_json(path)?)
                .with(RecordedSymbols),
        )),
        None => Ok(Box::new(RecordedSymbols)),
    }
}

fn modes_report(config: &Config) -> serde_json::Value {
    let profiler = XctraceProfiler::new(config.clone());
    let capabilities = profiler.capabilities();
    serde_json::json!({
        "schemaVersion": "xctrace-prof.modes.v1",
        "host": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "recorder": config.recorder.program.display().to_string(),
        "available": capabilities.iter().any(|c| c.supported),
        "defaultTemplate": config.default_template,
        "modes": capabilities,
    })
}

fn parse_mode(value: &str) -> Result<ProfileMode, String> {
    ProfileMode::parse(value).map_err(|e| e.to_string())
}

fn parse_table_kind(value: &str) -> Result<TableKind, String> {
    TableKind::parse(value).map_err(|e| e.to_string())
}
