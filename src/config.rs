//! `xctrace-prof.toml` config loading and profiler init-line options.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ProfError, ProfResult, ProfileMode, TableKind};

pub const CONFIG_FILE_NAME: &str = "xctrace-prof.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// How to invoke the external sampling recorder.
    #[serde(default)]
    pub recorder: RecorderSpec,

    /// Capture template used when the init line does not name one.
    #[serde(default = "default_template")]
    pub default_template: String,

    /// Upper bound on waiting for the recorder to exit after it was interrupted.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Upper bound on each export / version invocation.
    #[serde(default = "default_export_timeout_ms")]
    pub export_timeout_ms: u64,

    /// Parent directory for per-session workspaces. Defaults to the system temp dir.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Keep session workspaces (trace bundle, exports, recorder log) after reporting.
    #[serde(default)]
    pub keep_artifacts: bool,

    /// Number of hot entries rendered in text reports.
    #[serde(default = "default_top")]
    pub top: usize,
}

/// Program and argument templates for the recorder.
///
/// Argument templates may contain `{template}`, `{pid}`, `{output}`, `{input}` and
/// `{schema}` placeholders, expanded per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecorderSpec {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_record_args")]
    pub record_args: Vec<String>,
    #[serde(default = "default_export_toc_args")]
    pub export_toc_args: Vec<String>,
    #[serde(default = "default_export_table_args")]
    pub export_table_args: Vec<String>,
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
}

fn default_template() -> String {
    "CPU Profiler".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    30_000
}

fn default_export_timeout_ms() -> u64 {
    120_000
}

fn default_top() -> usize {
    20
}

fn default_program() -> PathBuf {
    PathBuf::from("xctrace")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_record_args() -> Vec<String> {
    strings(&[
        "record",
        "--template",
        "{template}",
        "--attach",
        "{pid}",
        "--output",
        "{output}",
    ])
}

fn default_export_toc_args() -> Vec<String> {
    strings(&["export", "--input", "{input}", "--output", "{output}", "--toc"])
}

fn default_export_table_args() -> Vec<String> {
    strings(&[
        "export",
        "--input",
        "{input}",
        "--output",
        "{output}",
        "--xpath",
        "/trace-toc/run/data/table[@schema=\"{schema}\"]",
    ])
}

fn default_version_args() -> Vec<String> {
    strings(&["version"])
}

impl Default for RecorderSpec {
    fn default() -> Self {
        Self {
            program: default_program(),
            record_args: default_record_args(),
            export_toc_args: default_export_toc_args(),
            export_table_args: default_export_table_args(),
            version_args: default_version_args(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recorder: RecorderSpec::default(),
            default_template: default_template(),
            stop_timeout_ms: default_stop_timeout_ms(),
            export_timeout_ms: default_export_timeout_ms(),
            work_dir: None,
            keep_artifacts: false,
            top: default_top(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn load_strict(path: &Path) -> ProfResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<Config>(&s)?)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }
}

/// Per-iteration options, parsed from a `key=value;key=value` init line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProfilerOptions {
    pub template: Option<String>,
    pub mode: ProfileMode,
    pub table: Option<TableKind>,
    pub fix_start_time: bool,
    pub top: Option<usize>,
    pub pid: Option<u32>,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            template: None,
            mode: ProfileMode::Normalized,
            table: None,
            fix_start_time: true,
            top: None,
            pid: None,
        }
    }
}

impl ProfilerOptions {
    /// Parses `template=Time Profiler;mode=instruction;fix_start_time=false`.
    ///
    /// Pairs may be separated by `;` or `:`. A `:` only separates when a known key follows
    /// it, so template paths may contain colons. Keys are case-insensitive and accept
    /// camelCase spellings (`fixStartTime`).
    pub fn parse(init_line: &str) -> ProfResult<Self> {
        let mut out = Self::default();
        for pair in split_pairs(init_line) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ProfError::InvalidConfig(format!("expected key=value, got {pair:?}"))
            })?;
            let value = value.trim();
            match normalize_key(key).as_str() {
                "template" => {
                    if value.is_empty() {
                        return Err(ProfError::InvalidConfig("template must not be empty".into()));
                    }
                    out.template = Some(value.to_string());
                }
                "mode" => out.mode = ProfileMode::parse(value)?,
                "table" => out.table = Some(TableKind::parse(value)?),
                "fixstarttime" => out.fix_start_time = parse_bool(key, value)?,
                "top" => {
                    out.top = Some(value.parse::<usize>().map_err(|e| {
                        ProfError::InvalidConfig(format!("invalid top {value:?}: {e}"))
                    })?)
                }
                "pid" => {
                    out.pid = Some(value.parse::<u32>().map_err(|e| {
                        ProfError::InvalidConfig(format!("invalid pid {value:?}: {e}"))
                    })?)
                }
                other => {
                    return Err(ProfError::InvalidConfig(format!(
                        "unknown profiler option {other:?}"
                    )));
                }
            }
        }
        Ok(out)
    }

    pub fn template_or<'a>(&'a self, config: &'a Config) -> &'a str {
        self.template.as_deref().unwrap_or(&config.default_template)
    }
}

const OPTION_KEYS: [&str; 6] = ["template", "mode", "table", "fixstarttime", "top", "pid"];

fn split_pairs(init_line: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    for chunk in init_line.split(';') {
        let mut start = 0;
        for (i, _) in chunk.match_indices(':') {
            if starts_with_option(&chunk[i + 1..]) {
                pairs.push(&chunk[start..i]);
                start = i + 1;
            }
        }
        pairs.push(&chunk[start..]);
    }
    pairs
}

fn starts_with_option(rest: &str) -> bool {
    rest.split_once('=')
        .is_some_and(|(key, _)| OPTION_KEYS.contains(&normalize_key(key).as_str()))
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> ProfResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ProfError::InvalidConfig(format!(
            "invalid boolean for {key}: {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("xctrace-prof-missing-{}.toml", Uuid::new_v4()));
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.default_template, "CPU Profiler");
        assert_eq!(cfg.recorder.program, PathBuf::from("xctrace"));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_config_keeps_recorder_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            stop_timeout_ms = 250
            keep_artifacts = true

            [recorder]
            program = "/opt/xcode/usr/bin/xctrace"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.stop_timeout_ms, 250);
        assert!(cfg.keep_artifacts);
        assert_eq!(cfg.recorder.program, PathBuf::from("/opt/xcode/usr/bin/xctrace"));
        assert_eq!(cfg.recorder.version_args, vec!["version".to_string()]);
        assert_eq!(cfg.top, 20);
    }

    #[test]
    fn malformed_config_is_ignored_with_defaults() {
        let path = std::env::temp_dir().join(format!("xctrace-prof-bad-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "stop_timeout_ms = \"soon\"").expect("write");
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.stop_timeout_ms, 30_000);
        assert!(Config::load_strict(&path).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn init_line_parses_known_keys() {
        let opts = ProfilerOptions::parse(
            "fixStartTime=false:template=Time Profiler;mode=instruction;table=time-profile;top=5",
        )
        .expect("parse");
        assert!(!opts.fix_start_time);
        assert_eq!(opts.template.as_deref(), Some("Time Profiler"));
        assert_eq!(opts.mode, ProfileMode::Instruction);
        assert_eq!(opts.table, Some(TableKind::TimeProfile));
        assert_eq!(opts.top, Some(5));
    }

    #[test]
    fn init_line_keeps_colons_inside_values() {
        let opts = ProfilerOptions::parse(
            "template=/Volumes/Bench:Data/Hot.tracetemplate:mode=instruction",
        )
        .expect("parse");
        assert_eq!(
            opts.template.as_deref(),
            Some("/Volumes/Bench:Data/Hot.tracetemplate")
        );
        assert_eq!(opts.mode, ProfileMode::Instruction);

        let opts = ProfilerOptions::parse("template=C:fixStartTime=no;top=3").expect("parse");
        assert_eq!(opts.template.as_deref(), Some("C"));
        assert!(!opts.fix_start_time);
        assert_eq!(opts.top, Some(3));
    }

    #[test]
    fn init_line_rejects_unknown_and_malformed_pairs() {
        assert!(matches!(
            ProfilerOptions::parse("frobnicate=1"),
            Err(ProfError::InvalidConfig(_))
        ));
        assert!(matches!(
            ProfilerOptions::parse("template"),
            Err(ProfError::InvalidConfig(_))
        ));
        assert!(matches!(
            ProfilerOptions::parse("fix_start_time=maybe"),
            Err(ProfError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_init_line_is_default() {
        let opts = ProfilerOptions::parse("").expect("parse");
        assert_eq!(opts, ProfilerOptions::default());
        let cfg = Config::default();
        assert_eq!(opts.template_or(&cfg), "CPU Profiler");
    }
}
