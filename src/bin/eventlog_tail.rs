//! eventlog-tail runner
//!
//! Tails one Windows Event Log channel and prints each new record as a
//! metric on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use eventlog_tail::logging::init_tracing;
use eventlog_tail::{CollectorConfig, CollectorError, OutputFormat};

/// Runner options
struct Args {
    /// TOML config file
    config: Option<PathBuf>,
    channel: Option<String>,
    query: Option<String>,
    /// Delay between cycles
    interval: Duration,
    /// Run a single cycle and exit
    once: bool,
    format: OutputFormat,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            channel: None,
            query: None,
            interval: Duration::from_secs(10),
            once: false,
            format: OutputFormat::Line,
        }
    }
}

fn print_help() {
    println!("eventlog-tail - incremental Windows Event Log reader");
    println!();
    println!("USAGE:");
    println!("    eventlog-tail [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       TOML config file");
    println!("        --channel <NAME>      Channel to tail [default: Application]");
    println!("    -q, --query <XPATH>       Filter query [default: *]");
    println!("    -i, --interval <SECS>     Seconds between cycles [default: 10]");
    println!("        --once                Run one cycle and exit");
    println!("    -f, --format <FORMAT>     line or json [default: line]");
    println!("    -h, --help                Print help information");
}

fn value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                parsed.config = Some(PathBuf::from(value(args, i, "--config")?));
                i += 2;
            }
            "--channel" => {
                parsed.channel = Some(value(args, i, "--channel")?);
                i += 2;
            }
            "--query" | "-q" => {
                parsed.query = Some(value(args, i, "--query")?);
                i += 2;
            }
            "--interval" | "-i" => {
                let raw = value(args, i, "--interval")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid interval: {raw}"))?;
                if secs == 0 {
                    return Err("interval must be at least 1 second".to_string());
                }
                parsed.interval = Duration::from_secs(secs);
                i += 2;
            }
            "--once" => {
                parsed.once = true;
                i += 1;
            }
            "--format" | "-f" => {
                parsed.format = match value(args, i, "--format")?.as_str() {
                    "line" => OutputFormat::Line,
                    "json" => OutputFormat::Json,
                    other => return Err(format!("unknown format: {other}")),
                };
                i += 2;
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Some(parsed))
}

fn build_config(args: &Args) -> Result<CollectorConfig, CollectorError> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::from_file(path)?,
        None => CollectorConfig::new(args.channel.clone().unwrap_or_else(|| "Application".to_string())),
    };
    if let Some(channel) = &args.channel {
        config.eventlog_name.clone_from(channel);
    }
    if let Some(query) = &args.query {
        config.xpath_query.clone_from(query);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(windows)]
fn run(args: &Args, config: CollectorConfig) -> ExitCode {
    use eventlog_tail::{Collector, WindowsEventLog, WriterSink};
    use tracing::{error, info, warn};

    let mut collector = match Collector::new(config, WindowsEventLog::new()) {
        Ok(c) => c,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    info!(channel = %collector.config().eventlog_name, "starting");

    let mut sink = WriterSink::new(std::io::stdout().lock(), args.format);
    loop {
        match collector.gather_into(&mut sink) {
            Ok(report) => {
                if !report.skipped.is_empty() {
                    warn!(skipped = report.skipped.len(), "records skipped this cycle");
                }
            }
            Err(err) => error!(error = %err, "cycle failed; retrying next interval"),
        }
        if let Err(err) = sink.flush() {
            error!(error = %err, "failed to flush stdout");
        }
        if args.once {
            break;
        }
        std::thread::sleep(args.interval);
    }

    collector.shutdown();
    ExitCode::SUCCESS
}

#[cfg(not(windows))]
fn run(_args: &Args, _config: CollectorConfig) -> ExitCode {
    tracing::error!("the Windows Event Log is not available on this platform");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_tracing() {
        eprintln!("warning: tracing already initialised: {err}");
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    run(&args, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("eventlog-tail")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(&argv(&["--channel", "System", "-i", "5", "--once", "-f", "json"]))
            .unwrap()
            .unwrap();
        assert_eq!(args.channel.as_deref(), Some("System"));
        assert_eq!(args.interval, Duration::from_secs(5));
        assert!(args.once);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&argv(&["--interval"])).is_err());
        assert!(parse_args(&argv(&["--interval", "0"])).is_err());
        assert!(parse_args(&argv(&["--format", "xml"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert!(parse_args(&argv(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = parse_args(&argv(&["--channel", "Security", "--query", "*[System[Level=2]]"]))
            .unwrap()
            .unwrap();
        let config = build_config(&args).unwrap();
        assert_eq!(config.eventlog_name, "Security");
        assert_eq!(config.xpath_query, "*[System[Level=2]]");

        let bad = parse_args(&argv(&["--query", "not xpath"])).unwrap().unwrap();
        assert!(build_config(&bad).is_err());
    }
}
