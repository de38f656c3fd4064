//! backfill CLI
//!
//! # Commands
//!
//! - `backfill run`: replay the retention window into the event stream
//! - `backfill inspect <LOG>`: summarize an append-log sink
//!
//! Exit code 0 when a run finishes or is skipped, 1 when it fails.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use backfill_core::config::{Config, LogFormat, SinkKind};
use backfill_core::error::{ConfigError, format_error_with_remediation};
use backfill_core::logging::init_logging;
use backfill_core::orchestrator::{StopSignal, skipped_by_flag};
use backfill_core::publish::{AppendLogPublisher, JsonLinesPublisher, StreamPublisher, summarize_log};
use backfill_core::source::SqliteSource;
use backfill_core::{BackfillFailure, BackfillOrchestrator, BackfillReport};

/// Replay retained records into the event stream without live side effects
#[derive(Parser)]
#[command(name = "backfill")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backfill over the retention window
    Run(RunArgs),
    /// Summarize an append-log sink
    Inspect {
        /// Append-log file written by `backfill run`
        log: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record store (SQLite)
    #[arg(long)]
    db: Option<PathBuf>,

    /// `stdout` or an append-log path
    #[arg(long)]
    sink: Option<String>,

    /// Skip the run entirely (also BACKFILL_SKIP)
    #[arg(long)]
    skip: bool,

    /// Retention in days; zero or negative means 90
    #[arg(long, allow_hyphen_values = true)]
    retention_days: Option<i64>,

    /// Records per page
    #[arg(long)]
    page_size: Option<usize>,

    /// Fail on dangling container/group references instead of skipping
    #[arg(long)]
    strict: bool,

    /// Only publish records with a key greater than this
    #[arg(long)]
    resume_after: Option<i64>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Inspect { log, json } => inspect(&log, json),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<backfill_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn resolve_config(args: &RunArgs) -> backfill_core::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    config.apply_process_env()?;

    if let Some(db) = &args.db {
        config.source.db_path.clone_from(db);
    }
    match args.sink.as_deref() {
        Some("stdout" | "-") => config.sink.kind = SinkKind::Stdout,
        Some(path) => {
            config.sink.kind = SinkKind::AppendLog;
            config.sink.path = PathBuf::from(path);
        }
        None => {}
    }
    if args.skip {
        config.backfill.skip = true;
    }
    if args.retention_days.is_some() {
        config.backfill.retention_days = args.retention_days;
    }
    if let Some(page_size) = args.page_size {
        config.backfill.page_size = page_size;
    }
    if args.strict {
        config.backfill.strict_integrity = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    config.validate()?;
    if args.json && config.sink.kind == SinkKind::Stdout {
        return Err(ConfigError::ValidationError(
            "--json cannot be combined with the stdout sink; the report would mix into the event stream"
                .to_string(),
        )
        .into());
    }
    Ok(config)
}

fn open_publisher(config: &Config) -> backfill_core::Result<Box<dyn StreamPublisher + Send>> {
    Ok(match config.sink.kind {
        SinkKind::Stdout => Box::new(JsonLinesPublisher::new(std::io::stdout())),
        SinkKind::AppendLog => Box::new(AppendLogPublisher::open(
            &config.sink.path,
            config.sink.fsync,
        )?),
    })
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = resolve_config(&args)?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    if let Some(report) = skipped_by_flag(&config.backfill) {
        print_report(&report, args.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let source = SqliteSource::open(&config.source.db_path).map_err(backfill_core::Error::from)?;
    let publisher = open_publisher(&config)?;

    let stop = StopSignal::new();
    let mut orchestrator = BackfillOrchestrator::new(config.backfill.clone(), source, publisher)
        .with_stop_signal(stop.clone())
        .resume_after(args.resume_after);

    let mut task = tokio::task::spawn_blocking(move || orchestrator.run());
    let outcome = tokio::select! {
        joined = &mut task => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupt received; stopping at the next page boundary");
            stop.raise();
            task.await
        }
    }
    .context("backfill task panicked")?;

    Ok(match outcome {
        Ok(report) => {
            print_report(&report, args.json)?;
            ExitCode::SUCCESS
        }
        Err(failure) => {
            print_failure(&failure, args.json)?;
            ExitCode::FAILURE
        }
    })
}

fn print_report(report: &BackfillReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        let p = &report.progress;
        eprintln!(
            "{}: published {} of {} records ({} excluded) in {} pages, {} ms",
            report.outcome, p.published, p.total, p.excluded, p.pages, report.elapsed_ms
        );
    }
    Ok(())
}

fn print_failure(failure: &BackfillFailure, json: bool) -> anyhow::Result<()> {
    eprintln!("{}", format_error_with_remediation(&failure.error));
    eprintln!();
    match failure.page {
        Some(page) => eprintln!(
            "Stopped at page {page}{}.",
            failure
                .record_id
                .map(|id| format!(", record {id}"))
                .unwrap_or_default()
        ),
        None => eprintln!("Stopped before the first page."),
    }
    if let Some(key) = failure.resume_after() {
        eprintln!("Resume with: backfill run --resume-after {key}");
    }

    if json {
        let summary = serde_json::json!({
            "outcome": "failed",
            "error": failure.error.to_string(),
            "retryable": failure.error.is_retryable_by_rerun(),
            "page": failure.page,
            "record_id": failure.record_id,
            "resume_after": failure.resume_after(),
            "window": failure.window,
            "progress": failure.progress,
            "elapsed_ms": failure.elapsed_ms,
        });
        println!("{summary}");
    }
    Ok(())
}

fn inspect(log: &std::path::Path, json: bool) -> anyhow::Result<ExitCode> {
    let summary =
        summarize_log(log).with_context(|| format!("failed to read {}", log.display()))?;
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        let fmt_id = |id: Option<i64>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
        println!("frames: {}", summary.frames);
        println!("first record: {}", fmt_id(summary.first_record_id));
        println!("last record: {}", fmt_id(summary.last_record_id));
        println!("bytes: {}", summary.bytes);
    }
    Ok(ExitCode::SUCCESS)
}
