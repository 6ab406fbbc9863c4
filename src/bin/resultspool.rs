//! Result spooler command-line tool
//!
//! Spools newline-delimited records through the same bounded-memory,
//! disk-overflowing buffer a query engine uses, then replays them to stdout.
//!
//! # Examples
//!
//! ```bash
//! # Spool a file with a 64 KiB in-memory threshold
//! resultspool spool --input rows.txt --threshold 65536
//!
//! # Unbounded disk overflow, records read from stdin
//! cat rows.txt | resultspool spool --max-spool -1 --spool-dir /var/tmp
//!
//! # Print the effective configuration
//! resultspool --config resultspool.toml config
//! ```

use clap::{Args, Parser, Subcommand};
use resultspool::metrics::{export_metrics, init_metrics};
use resultspool::{PeekingRecordIterator, ReaderSource, SpoolConfig, SpoolingIteratorFactory};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bounded-memory result spooler
#[derive(Parser, Debug)]
#[command(name = "resultspool")]
#[command(version = resultspool::VERSION)]
#[command(about = "Bounded-memory result spooler with disk overflow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "RESULTSPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for rolling log files; logs go to stderr only if unset
    #[arg(long, global = true, env = "RESULTSPOOL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG directives apply on top
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spool records and replay them to stdout
    Spool(SpoolArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct SpoolArgs {
    /// Input file of newline-delimited records (default: stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Bytes to hold in memory before overflowing to disk
    #[arg(short, long)]
    threshold: Option<usize>,

    /// Bytes allowed on disk past the threshold; negative = unbounded
    #[arg(long, allow_hyphen_values = true)]
    max_spool: Option<i64>,

    /// Directory for spool files
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Append the length of the following record to each line
    #[arg(long)]
    peek: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    init_metrics();

    let mut config = SpoolConfig::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Spool(args) => spool_command(&mut config, args),
        Commands::Config => config_command(&config),
    };

    if cli.metrics {
        eprint!("{}", export_metrics());
    }
    result
}

/// Setup logging to stderr and, optionally, rolling files
///
/// Stdout carries replayed records, so console logs go to stderr.
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let file_layer = match &cli.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "resultspool.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Spool command - buffer the input, then replay it
fn spool_command(config: &mut SpoolConfig, args: SpoolArgs) -> anyhow::Result<()> {
    if let Some(threshold) = args.threshold {
        config.spool.threshold_bytes = threshold;
    }
    if let Some(max_spool) = args.max_spool {
        config.spool.max_spool_to_disk_bytes = max_spool;
    }
    if let Some(dir) = args.spool_dir {
        config.spool.directory = dir;
    }
    config.validate()?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let factory = SpoolingIteratorFactory::from_config(config);
    debug!(?factory, "Spooling input");

    let started = Instant::now();
    let mut iter = factory.new_iterator(ReaderSource::new(reader))?;
    let in_memory = iter.is_in_memory();

    let mut plan = Vec::new();
    iter.explain(&mut plan);
    info!(
        plan = ?plan,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Input spooled"
    );

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut records = 0u64;
    let mut bytes = 0u64;

    while let Some(record) = iter.next()? {
        records += 1;
        bytes += record.len() as u64;
        out.write_all(record)?;

        // Lookahead: length of the following record, "-" at the end
        if args.peek {
            match iter.peek()? {
                Some(next) => write!(out, "\t{}", next.len())?,
                None => write!(out, "\t-")?,
            }
        }
        out.write_all(b"\n")?;
    }
    out.flush()?;
    iter.close()?;

    eprintln!(
        "{} records, {} bytes, spooled {}",
        records,
        bytes,
        if in_memory { "in memory" } else { "to disk" }
    );
    Ok(())
}

/// Config command - print the effective configuration
fn config_command(config: &SpoolConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_directives_do_not_override_level_flag() {
        std::env::set_var("RUST_LOG", "resultspool=debug");
        let cli = Cli::try_parse_from(["resultspool", "config"]).expect("parse");
        assert_eq!(cli.log_level, "warn");
        assert!(cli.log_level.parse::<tracing::Level>().is_ok());

        let cli = Cli::try_parse_from(["resultspool", "--log-level", "debug", "config"]).expect("parse");
        assert_eq!(cli.log_level, "debug");
    }
}
