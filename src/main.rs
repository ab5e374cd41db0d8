use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser as ClapParser;
use env_logger::fmt::Formatter;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;

use cli::command::{Cli, Commands, LogFormat};

mod cli;
mod config;
mod input;
pub(crate) mod timestamp;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let multi = MultiProgress::new();

    let progress = match init_logging(&cli, &multi) {
        Ok(progress) => progress,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, progress) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, progress: Option<&MultiProgress>) -> Result<()> {
    match &cli.command {
        Commands::Decode(args) => cli::decode::cmd_decode(args, cli, progress),
        Commands::Info(args) => cli::info::cmd_info(args, cli, progress),
        Commands::Synth(args) => cli::synth::cmd_synth(args, cli, progress),
    }
}

/// Installs the global logger. With `--progress` records are routed through
/// `multi` so they do not tear the bars.
fn init_logging<'a>(cli: &Cli, multi: &'a MultiProgress) -> Result<Option<&'a MultiProgress>> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(cli.loglevel.to_level_filter());

    match cli.log_format {
        LogFormat::Plain => {
            builder.format_timestamp_millis();
        }
        LogFormat::Json => {
            builder.format(|buf, record| write_json_record(buf, record));
        }
    }

    if cli.progress {
        LogWrapper::new(multi.clone(), builder.build()).try_init()?;
        Ok(Some(multi))
    } else {
        builder.try_init()?;
        Ok(None)
    }
}

fn write_json_record(buf: &mut Formatter, record: &log::Record) -> std::io::Result<()> {
    let line = json_record(
        &buf.timestamp_millis().to_string(),
        record.level(),
        record.target(),
        &record.args().to_string(),
    )?;
    writeln!(buf, "{line}")
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    ts: &'a str,
    lvl: &'a str,
    target: &'a str,
    msg: &'a str,
}

fn json_record(ts: &str, level: log::Level, target: &str, msg: &str) -> serde_json::Result<String> {
    serde_json::to_string(&JsonRecord {
        ts,
        lvl: level.as_str(),
        target,
        msg,
    })
}

#[test]
fn json_records_escape_messages() {
    let line = json_record(
        "2026-01-01T00:00:00.000Z",
        log::Level::Warn,
        "framepipe::process::driver",
        "Decode \"sync\" failed\n\x1b[31m",
    )
    .unwrap();
    assert_eq!(
        line,
        r#"{"ts":"2026-01-01T00:00:00.000Z","lvl":"WARN","target":"framepipe::process::driver","msg":"Decode \"sync\" failed\n\u001b[31m"}"#
    );

    let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(parsed["msg"], "Decode \"sync\" failed\n\x1b[31m");
}
