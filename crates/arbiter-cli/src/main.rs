//! Arbiter CLI - hold, inspect and benchmark exclusive resource sessions

use arbiter_core::{Arbiter, ArbiterConfig, HolderRecord, Liveness, LockError, Release};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code when the resource is held by someone else
const EXIT_UNAVAILABLE: u8 = 2;

/// Staged records older than this were abandoned by a dead writer
const STAGED_MAX_AGE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(author, version, about = "Exclusive sessions on shared hardware resources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Lock directory (overrides config and ARBITER_LOCK_DIR)
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a resource, hold it, then release it
    Hold(HoldArgs),

    /// Show who holds a resource
    Status {
        /// Resource key
        key: String,
    },

    /// List all held resources
    List,

    /// Remove records left behind by dead holders and writers
    Reap {
        /// Also delete records that cannot be parsed
        #[arg(long)]
        purge_corrupt: bool,
    },

    /// Measure contention between threads sharing one resource
    Bench(BenchArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct HoldArgs {
    /// Resource key
    key: String,

    /// Session name recorded with the lock
    #[arg(short, long)]
    name: Option<String>,

    /// Wait up to this long for the resource (default: try once)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Release after this long (default: until interrupted)
    #[arg(short, long)]
    duration_ms: Option<u64>,
}

#[derive(Args)]
struct BenchArgs {
    /// Number of contending threads
    #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..=256))]
    threads: u16,

    /// How long to run
    #[arg(short, long, default_value_t = 1000)]
    runtime_ms: u64,

    /// Timeout of each acquisition attempt
    #[arg(long, default_value_t = 50)]
    timeout_ms: u64,

    /// Time spent inside the critical section
    #[arg(long, default_value_t = 100)]
    hold_us: u64,

    /// Resource key to contend on
    #[arg(short, long, default_value = "arbiter-bench")]
    key: String,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arbiter=info".parse()?)
                .add_directive("arbiter_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => Ok(code),
        Err(e) => {
            report_error(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = ArbiterConfig::load()?;
    if let Some(dir) = cli.lock_dir {
        config.lock_dir = dir;
    }
    let format = cli.format;

    match cli.command {
        Commands::Hold(args) => cmd_hold(&config, args, format).await,

        Commands::Status { key } => {
            cmd_status(&Arbiter::open(&config)?, &key, format)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::List => {
            cmd_list(&Arbiter::open(&config)?, format)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reap { purge_corrupt } => {
            cmd_reap(&Arbiter::open(&config)?, purge_corrupt, format)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Bench(args) => {
            cmd_bench(Arbiter::open(&config)?, args, format).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config { action } => {
            cmd_config(&config, action, format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<LockError>() {
        Some(lock_err) => {
            eprintln!("Error [{}]: {}", lock_err.code(), lock_err);
            if let Some(hint) = lock_err.suggestion() {
                eprintln!("  Hint: {}", hint);
            }
        }
        None => eprintln!("Error: {:#}", err),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_hold(
    config: &ArbiterConfig,
    args: HoldArgs,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let arbiter = Arbiter::open(config)?;
    let name = args
        .name
        .unwrap_or_else(|| format!("arbiter-hold-{}", std::process::id()));
    let mut session = arbiter.session(name, args.key.as_str())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let timeout_ms = args.timeout_ms;
    let waiter_cancel = cancel.clone();
    let (mut session, acquired) = tokio::task::spawn_blocking(move || {
        let acquired = match timeout_ms {
            Some(ms) => session.timed_start_until(ms, &waiter_cancel)?,
            None => session.start()?,
        };
        Ok::<_, LockError>((session, acquired))
    })
    .await??;

    if !acquired {
        let holder = arbiter.registry().read(session.resource_key())?;
        match format {
            OutputFormat::Json => print_json(&HoldReport {
                resource_key: session.resource_key(),
                session_name: session.name(),
                acquired: false,
                holder: holder.as_ref(),
            })?,
            OutputFormat::Text => {
                eprintln!("Couldn't grab session lock");
                if let Some(holder) = &holder {
                    eprintln!("  Held by: {}", holder);
                }
            }
        }
        return Ok(ExitCode::from(EXIT_UNAVAILABLE));
    }

    match format {
        OutputFormat::Json => print_json(&HoldReport {
            resource_key: session.resource_key(),
            session_name: session.name(),
            acquired: true,
            holder: session.record(),
        })?,
        OutputFormat::Text => println!(
            "Holding '{}' as '{}'",
            session.resource_key(),
            session.name()
        ),
    }

    let until = async {
        match args.duration_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(until);

    // Keep the heartbeat well inside the staleness threshold
    let refresh_every = config.stale_after().map(|limit| limit / 3);
    let period = refresh_every
        .unwrap_or(Duration::from_secs(3600))
        .max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = &mut until => break,
            _ = cancel.cancelled() => {
                info!(resource_key = %session.resource_key(), "Interrupted, releasing");
                break;
            }
            _ = heartbeat.tick(), if refresh_every.is_some() => session.refresh()?,
        }
    }

    session.stop()?;
    if format == OutputFormat::Text {
        println!("Released '{}'", session.resource_key());
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct HoldReport<'a> {
    resource_key: &'a str,
    session_name: &'a str,
    acquired: bool,
    holder: Option<&'a HolderRecord>,
}

#[derive(Serialize)]
struct StatusReport {
    resource_key: String,
    held: bool,
    holder: Option<HolderRecord>,
    liveness: Option<Liveness>,
}

impl StatusReport {
    fn new(arbiter: &Arbiter, resource_key: &str, holder: Option<HolderRecord>) -> Self {
        let liveness = holder.as_ref().map(|record| arbiter.probe(record));
        Self {
            resource_key: resource_key.to_string(),
            held: holder.is_some(),
            holder,
            liveness,
        }
    }
}

fn cmd_status(arbiter: &Arbiter, key: &str, format: OutputFormat) -> anyhow::Result<()> {
    let report = StatusReport::new(arbiter, key, arbiter.registry().read(key)?);

    if format == OutputFormat::Json {
        return print_json(&report);
    }

    match (&report.holder, report.liveness) {
        (Some(holder), Some(liveness)) => {
            println!("Resource: {}", key);
            println!("  Session: {}", holder.session_name);
            println!("  Holder: {}", holder.holder);
            println!("  Liveness: {}", liveness);
            println!(
                "  Acquired: {}",
                holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "  Heartbeat: {}s ago (generation {})",
                holder.heartbeat_age().num_seconds(),
                holder.generation
            );
        }
        _ => println!("Resource '{}' is free", key),
    }
    Ok(())
}

fn cmd_list(arbiter: &Arbiter, format: OutputFormat) -> anyhow::Result<()> {
    let reports: Vec<StatusReport> = arbiter
        .registry()
        .list()?
        .into_iter()
        .map(|record| {
            let key = record.resource_key.clone();
            StatusReport::new(arbiter, &key, Some(record))
        })
        .collect();

    if format == OutputFormat::Json {
        return print_json(&reports);
    }

    if reports.is_empty() {
        println!("No resources held.");
        return Ok(());
    }

    println!("Held resources:");
    for report in &reports {
        if let (Some(holder), Some(liveness)) = (&report.holder, report.liveness) {
            println!(
                "  {} - {} [{}] for {}s",
                report.resource_key,
                holder,
                liveness,
                holder.held_for().num_seconds()
            );
        }
    }
    Ok(())
}

#[derive(Serialize, Default)]
struct ReapReport {
    reaped: Vec<String>,
    swept: Vec<PathBuf>,
    purged: Vec<PathBuf>,
    corrupt: Vec<PathBuf>,
}

fn cmd_reap(arbiter: &Arbiter, purge_corrupt: bool, format: OutputFormat) -> anyhow::Result<()> {
    let registry = arbiter.registry();
    let mut report = ReapReport::default();

    for record in registry.list()? {
        if !arbiter.probe(&record).is_reclaimable() {
            continue;
        }
        // Compare-and-delete: a holder that took over meanwhile is left alone
        match registry.release(&record)? {
            Release::Released => {
                info!(resource_key = %record.resource_key, holder = %record, "Reaped dead holder");
                report.reaped.push(record.resource_key);
            }
            Release::NotOwner(_) => {}
        }
    }

    report.swept = registry.sweep_staged(STAGED_MAX_AGE)?;

    for path in registry.corrupt_entries()? {
        if purge_corrupt {
            if registry.purge(&path)? {
                warn!(path = %path.display(), "Purged corrupt record");
                report.purged.push(path);
            }
        } else {
            report.corrupt.push(path);
        }
    }

    if format == OutputFormat::Json {
        return print_json(&report);
    }

    println!("Reaped {} stale lock(s)", report.reaped.len());
    for key in &report.reaped {
        println!("  {}", key);
    }
    if !report.swept.is_empty() {
        println!("Swept {} abandoned staged file(s)", report.swept.len());
    }
    if !report.purged.is_empty() {
        println!("Purged {} corrupt record(s)", report.purged.len());
    }
    if !report.corrupt.is_empty() {
        println!(
            "Found {} corrupt record(s); rerun with --purge-corrupt to delete them",
            report.corrupt.len()
        );
        for path in &report.corrupt {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

/// Shared state of a benchmark run
struct BenchShared {
    key: String,
    timeout_ms: u64,
    hold: Duration,
    runtime: Duration,
    inside: AtomicUsize,
    overlaps: AtomicUsize,
    start: Barrier,
}

fn bench_worker(arbiter: Arbiter, id: u16, shared: Arc<BenchShared>) -> Result<u64, LockError> {
    let mut session = arbiter.session(format!("bench-{id}"), shared.key.as_str())?;
    shared.start.wait();

    let deadline = Instant::now() + shared.runtime;
    let mut entries = 0;
    while Instant::now() < deadline {
        if !session.timed_start(shared.timeout_ms)? {
            continue;
        }
        if shared.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(shared.hold);
        shared.inside.fetch_sub(1, Ordering::SeqCst);
        session.stop()?;
        entries += 1;
    }
    Ok(entries)
}

#[derive(Debug, Serialize, PartialEq)]
struct BenchStats {
    total: u64,
    min: u64,
    max: u64,
    mean: f64,
    stdev: f64,
}

/// Summary of per-thread entry counts (population standard deviation)
fn summarize(counts: &[u64]) -> BenchStats {
    if counts.is_empty() {
        return BenchStats {
            total: 0,
            min: 0,
            max: 0,
            mean: 0.0,
            stdev: 0.0,
        };
    }
    let total: u64 = counts.iter().sum();
    let mean = total as f64 / counts.len() as f64;
    let variance = counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / counts.len() as f64;
    BenchStats {
        total,
        min: counts.iter().copied().min().unwrap_or(0),
        max: counts.iter().copied().max().unwrap_or(0),
        mean,
        stdev: variance.sqrt(),
    }
}

#[derive(Serialize)]
struct BenchReport {
    resource_key: String,
    threads: u16,
    runtime_ms: u64,
    timeout_ms: u64,
    counts: Vec<u64>,
    stats: BenchStats,
    overlaps: usize,
}

async fn cmd_bench(arbiter: Arbiter, args: BenchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let shared = Arc::new(BenchShared {
        key: args.key.clone(),
        timeout_ms: args.timeout_ms,
        hold: Duration::from_micros(args.hold_us),
        runtime: Duration::from_millis(args.runtime_ms),
        inside: AtomicUsize::new(0),
        overlaps: AtomicUsize::new(0),
        start: Barrier::new(usize::from(args.threads)),
    });

    info!(
        threads = args.threads,
        runtime_ms = args.runtime_ms,
        resource_key = %args.key,
        "Starting benchmark"
    );

    let workers: Vec<_> = (0..args.threads)
        .map(|id| {
            let arbiter = arbiter.clone();
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || bench_worker(arbiter, id, shared))
        })
        .collect();

    let mut counts = Vec::with_capacity(workers.len());
    for worker in workers {
        counts.push(worker.await??);
    }

    let report = BenchReport {
        resource_key: args.key,
        threads: args.threads,
        runtime_ms: args.runtime_ms,
        timeout_ms: args.timeout_ms,
        stats: summarize(&counts),
        counts,
        overlaps: shared.overlaps.load(Ordering::SeqCst),
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "Benchmark: {} thread(s) on '{}' for {}ms",
                report.threads, report.resource_key, report.runtime_ms
            );
            for (id, count) in report.counts.iter().enumerate() {
                println!("  bench-{}: {}", id, count);
            }
            println!(
                "Total: {}  min: {}  max: {}  mean: {:.2}  stdev: {:.2}",
                report.stats.total,
                report.stats.min,
                report.stats.max,
                report.stats.mean,
                report.stats.stdev
            );
        }
    }

    if report.overlaps > 0 {
        anyhow::bail!(
            "Mutual exclusion violated: {} overlapping critical sections",
            report.overlaps
        );
    }
    Ok(())
}

fn cmd_config(
    config: &ArbiterConfig,
    action: ConfigAction,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => match format {
            OutputFormat::Json => print_json(config)?,
            OutputFormat::Text => print!("{}", config.to_toml()?),
        },
        ConfigAction::Path => {
            let path = ArbiterConfig::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
