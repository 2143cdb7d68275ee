use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use xctrace_prof::IterationOutcome;

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    pub fn print_serialized<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
            return Ok(());
        }

        let rendered = render_value(&serde_json::to_value(value)?, 0);
        println!("{rendered}");
        Ok(())
    }

    pub fn print_outcome(&self, outcome: &IterationOutcome, top: usize) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(outcome)?);
            return Ok(());
        }

        match outcome {
            IterationOutcome::Report(report) => {
                let mut out = format!(
                    "{} {} {}\n",
                    self.style("xctrace-prof", "36;1"),
                    self.style(report.mode.as_str(), "37;1"),
                    self.style(report.table.schema_name(), "90")
                );
                // The first rendered line is the plain header.
                for line in report.render(top).lines().skip(1) {
                    out.push_str(line);
                    out.push('\n');
                }
                println!("{}", out.trim_end());
            }
            IterationOutcome::Failed { kind, message } => {
                println!(
                    "{} {} {message}",
                    self.style("FAILED", "31;1"),
                    self.style(kind.as_str(), "90")
                );
            }
            IterationOutcome::Disabled { reason } => {
                self.print_warning(&format!("profiling disabled: {reason}"));
            }
        }
        Ok(())
    }

    pub fn print_error(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "error",
                "code": "error",
                "message": msg,
            });
            println!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    pub fn print_warning(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "warning",
                "code": "warning",
                "message": msg,
            });
            eprintln!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("warn", "33;1"));
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}

/// Renders JSON as an indented outline for terminal output.
fn render_value(value: &Value, indent: usize) -> String {
    let mut out = String::new();
    write_value(&mut out, value, indent);
    out.trim_end().to_string()
}

fn write_value(out: &mut String, value: &Value, indent: usize) {
    let pad = " ".repeat(indent);
    match value {
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Array(items) => {
            for item in items {
                write_entry(out, &format!("{pad}-"), item, indent);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                write_entry(out, &format!("{pad}{key}:"), item, indent);
            }
        }
        Value::String(v) => out.push_str(v),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_entry(out: &mut String, prefix: &str, item: &Value, indent: usize) {
    out.push_str(prefix);
    let nested = matches!(item, Value::Array(v) if !v.is_empty())
        || matches!(item, Value::Object(m) if !m.is_empty());
    out.push(if nested { '\n' } else { ' ' });
    write_value(out, item, indent + 2);
    if !out.ends_with('\n') {
        out.push('\n');
    }
}
