//! bidsrun CLI entry point.
//!
//! Usage:
//!   bidsrun -c config.json                       # plan + dispatch
//!   bidsrun -c config.json --subjects 001 002    # explicit units
//!   bidsrun -c config.json --from-report r.json  # report-driven re-run
//!   bidsrun -c config.json --dry-run             # print commands only
//!   bidsrun -c config.json --validate-only       # verification pass only

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bidsrun_engine::dispatch::Backend;
use bidsrun_engine::{Orchestrator, RunOptions, RunSummary};

#[derive(Debug, Parser)]
#[command(
    name = "bidsrun",
    version,
    about = "Batch execution engine for BIDS App pipelines"
)]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Process only these subjects (with or without the sub- prefix).
    #[arg(long, num_args = 1..)]
    subjects: Option<Vec<String>>,

    /// Plan from an existing validator report (implies --force).
    #[arg(long, value_name = "PATH")]
    from_report: Option<PathBuf>,

    /// Restrict a multi-pipeline report (and verification) to one pipeline.
    #[arg(long)]
    pipeline: Option<String>,

    /// Ignore "already done" verdicts and reprocess.
    #[arg(long)]
    force: bool,

    /// Compute the plan and print the commands without executing anything.
    #[arg(long)]
    dry_run: bool,

    /// Process one randomly chosen unit with parallelism 1.
    #[arg(long)]
    pilot: bool,

    /// Parallelism override for the local backend.
    #[arg(long)]
    jobs: Option<usize>,

    /// Tee per-unit stdout/stderr to separate log files; forces one worker.
    #[arg(long)]
    debug: bool,

    /// Verify pipeline outputs after the run.
    #[arg(long)]
    validate: bool,

    /// Only verify pipeline outputs; skip execution.
    #[arg(long, conflicts_with = "validate")]
    validate_only: bool,

    /// Re-dispatch units with missing outputs until clean or the round
    /// limit is reached.
    #[arg(long)]
    reprocess_missing: bool,

    /// Maximum reprocess rounds.
    #[arg(long, default_value_t = 3, value_name = "N")]
    reprocess_limit: usize,

    /// Force the local worker-pool backend.
    #[arg(long, conflicts_with = "cluster")]
    local: bool,

    /// Force the cluster-scheduler backend.
    #[arg(long)]
    cluster: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    ExitCode::from(rt.block_on(run(cli)))
}

async fn run(cli: Cli) -> u8 {
    let backend = if cli.local {
        Some(Backend::Local)
    } else if cli.cluster {
        Some(Backend::Cluster)
    } else {
        None
    };

    let orchestrator = Orchestrator::new(RunOptions {
        config_path: cli.config,
        subjects: cli.subjects,
        from_report: cli.from_report,
        pipeline: cli.pipeline,
        force: cli.force,
        dry_run: cli.dry_run,
        pilot: cli.pilot,
        jobs: cli.jobs,
        debug: cli.debug,
        validate: cli.validate,
        validate_only: cli.validate_only,
        reprocess_missing: cli.reprocess_missing,
        reprocess_limit: cli.reprocess_limit,
        backend,
    });

    // A single token flows top-down; Ctrl-C sets it.
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; shutting down");
            cancel.cancel();
        }
    });

    match orchestrator.run().await {
        Ok(summary) => {
            print_summary(&summary);
            summary.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

/// Console logging honoring `--log-level` (RUST_LOG overrides), plus the
/// main run log file once the log directory is known.
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));

    let file_layer = open_run_log(cli).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();
}

/// Best-effort: peek at the config for `common.log_dir` (default ./logs)
/// and open `run_<ts>.log` there. Config errors are reported properly by
/// the orchestrator, not here.
fn open_run_log(cli: &Cli) -> Option<File> {
    let text = std::fs::read_to_string(&cli.config).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    let dir = value
        .get("common")
        .and_then(|c| c.get("log_dir"))
        .and_then(|d| d.as_str())
        .unwrap_or("logs");
    std::fs::create_dir_all(dir).ok()?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    File::create(PathBuf::from(dir).join(format!("run_{stamp}.log"))).ok()
}

fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("DRY RUN - commands that would execute:");
        for line in &summary.dry_run_commands {
            println!("{line}");
        }
        println!("(nothing was executed)");
        return;
    }

    println!();
    println!("{}", "=".repeat(60));
    println!("EXECUTION SUMMARY");
    println!("{}", "=".repeat(60));

    let states = summary.final_states();
    println!("Units planned or skipped: {}", states.len());
    for (label, count) in summary.classification_counts() {
        println!("  {label}: {count}");
    }
    if summary.cancelled {
        println!("Run was cancelled before completion.");
    }
    if summary.verified {
        match summary.findings.len() {
            0 => println!("Verification: no missing outputs."),
            n => println!("Verification: {n} finding(s)."),
        }
    }
    if let Some(path) = &summary.report_path {
        println!("Report: {}", path.display());
    }
    println!("Logs: {}", summary.log_dir.display());
    println!("Total time: {:.2} seconds", summary.elapsed_secs);
    println!("{}", "=".repeat(60));
}
