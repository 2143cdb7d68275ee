use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xctrace_prof::cmd::{CommandOutput, ProfileCommand, profile_command};
use xctrace_prof::{CONFIG_FILE_NAME, Config, IterationOutcome};

use std::path::{Path, PathBuf};

mod cli_logger;

use cli_logger::CliLogger;

#[derive(Debug, Parser)]
#[command(
    name = "xctrace-prof",
    version,
    about = "Hot-path profiles from the xctrace sampling recorder"
)]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    no_color: bool,
    /// Config file; defaults to ./xctrace-prof.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: ProfileCommand,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let logger = CliLogger::new(cli.json, cli.no_color);
    let code = match run(&cli, &logger) {
        Ok(code) => code,
        Err(err) => {
            logger.print_error(&format!("{err:#}"));
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli, logger: &CliLogger) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load_strict(path)?,
        None => Config::load_optional(Path::new(CONFIG_FILE_NAME)),
    };
    match profile_command(&config, &cli.command)? {
        CommandOutput::Value(value) => {
            logger.print_serialized(&value)?;
            Ok(0)
        }
        CommandOutput::Outcome { outcome, top } => {
            logger.print_outcome(&outcome, top)?;
            Ok(match outcome {
                IterationOutcome::Failed { .. } => 1,
                IterationOutcome::Report(_) | IterationOutcome::Disabled { .. } => 0,
            })
        }
    }
}
