//! Harvest CLI: fetch pipeline and cache management commands.
//!
//! Commands:
//! - `fetch`: run the pipeline for a list of symbols, with an operator
//!   console on stdin for live pause/resume/cancel/skip
//! - `cache status`: report cache entries, size and per-symbol ranges
//! - `cache clear`: drop cached segments for one symbol or everything

use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::{Clock, EodhdProvider, RangeCache, SystemClock};
use harvest_runner::{
    format_duration, generate_summary, save_status, ControlHandle, FetchMode, JobController,
    JsonProfileStore, PipelineConfig, PipelineEvent, PipelineStatus, RunOptions, SummaryFeatures,
    API_KEY_ENV,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvest CLI: rate-limited intraday data pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch bars for the given symbols, compute features and store profiles.
    Fetch {
        /// Symbols to process (e.g., SPY QQQ AAPL).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of parallel workers. Overrides the config file.
        #[arg(long)]
        workers: Option<usize>,

        /// incremental or full. Overrides the config file.
        #[arg(long)]
        mode: Option<FetchMode>,

        /// Cache directory. Defaults to ~/.harvest_cache.
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Directory holding one JSON profile per symbol.
        #[arg(long, default_value = "profiles")]
        profiles_dir: PathBuf,

        /// Write a per-job report when the run ends (.json or .csv).
        #[arg(long)]
        report: Option<PathBuf>,

        /// Do not read operator commands from stdin.
        #[arg(long, default_value_t = false)]
        no_console: bool,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report cache entries, size, and per-symbol date ranges.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cache directory. Defaults to ~/.harvest_cache.
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Remove cached segments for one symbol, or all of them.
    Clear {
        /// Only this symbol.
        #[arg(long)]
        symbol: Option<String>,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Cache directory. Defaults to ~/.harvest_cache.
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            symbols,
            config,
            workers,
            mode,
            cache_dir,
            profiles_dir,
            report,
            no_console,
        } => run_fetch(
            symbols,
            config,
            workers,
            mode,
            cache_dir,
            profiles_dir,
            report,
            no_console,
        ),
        Commands::Cache { action } => match action {
            CacheAction::Status { config, cache_dir } => {
                run_cache_status(config.as_deref(), cache_dir)
            }
            CacheAction::Clear {
                symbol,
                config,
                cache_dir,
            } => run_cache_clear(config.as_deref(), cache_dir, symbol),
        },
    }
}

// ─── Shared setup ───────────────────────────────────────────────────

fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => {
            let config = PipelineConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            info!(path = %path.display(), "config loaded");
            config
        }
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env();
            config
        }
    };
    if cache_dir.is_some() {
        config.cache.dir = cache_dir;
    }
    Ok(config)
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harvest_cache")
}

fn open_cache(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Result<RangeCache> {
    let cache_config = config.cache.to_cache_config(&default_cache_dir());
    let dir = cache_config.dir.clone();
    RangeCache::open(cache_config, clock)
        .with_context(|| format!("failed to open cache at {}", dir.display()))
}

// ─── fetch ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_fetch(
    symbols: Vec<String>,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    mode: Option<FetchMode>,
    cache_dir: Option<PathBuf>,
    profiles_dir: PathBuf,
    report: Option<PathBuf>,
    no_console: bool,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref(), cache_dir)?;
    if let Some(workers) = workers {
        config.pipeline.workers = workers;
    }
    if let Some(mode) = mode {
        config.pipeline.mode = mode;
    }
    config.validate()?;
    if config.api.api_key.is_empty() {
        bail!("no API key: set [api] api_key in the config file or {API_KEY_ENV}");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(open_cache(&config, clock.clone())?);
    let provider = Arc::new(EodhdProvider::new(config.api.clone())?);
    let store = Arc::new(
        JsonProfileStore::new(&profiles_dir)
            .with_context(|| format!("failed to open profile dir {}", profiles_dir.display()))?,
    );
    let options = RunOptions::from_settings(&config.pipeline);

    let (tx, rx) = mpsc::channel();
    let mut controller = JobController::new(
        config,
        provider,
        cache,
        Arc::new(SummaryFeatures),
        store,
        clock,
        tx,
    );
    controller.submit(&symbols, options)?;

    if !no_console {
        spawn_console(controller.handle())?;
        println!("Console: pause | resume | stop | pause|resume|cancel|skip SYMBOL | status");
    }

    for event in rx.iter() {
        let last = matches!(
            event,
            PipelineEvent::PipelineCompleted(_) | PipelineEvent::PipelineStopped(_)
        );
        print_event(&event);
        if last {
            break;
        }
    }

    let summary = controller.wait()?;
    let status = controller.status();
    if let Some(path) = &report {
        save_status(&status, path)?;
        println!("Report written to {}", path.display());
    }
    println!();
    print!("{}", generate_summary(&summary, &status));

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted { total, workers } => {
            println!("Started {total} job(s) on {workers} worker(s)");
        }
        PipelineEvent::JobStarted { symbol } => println!("  {symbol}: started"),
        PipelineEvent::Progress(update) if update.paused => {
            println!("  {}: paused at {:.0}%", update.symbol, update.percent);
        }
        PipelineEvent::Progress(_) => {}
        PipelineEvent::JobCompleted {
            symbol,
            data_points,
            api_calls,
            duration_secs,
            message,
        } => {
            let note = message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default();
            println!(
                "  {symbol}: completed, {data_points} bars, {api_calls} API call(s), {}{note}",
                format_duration(*duration_secs)
            );
        }
        PipelineEvent::JobFailed { symbol, error } => println!("  {symbol}: FAILED: {error}"),
        PipelineEvent::JobSkipped { symbol, reason } => println!("  {symbol}: skipped ({reason})"),
        PipelineEvent::JobCancelled { symbol, reason } => {
            println!("  {symbol}: cancelled ({reason})");
        }
        PipelineEvent::PipelinePaused => println!("Pipeline paused"),
        PipelineEvent::PipelineResumed => println!("Pipeline resumed"),
        PipelineEvent::PipelineStopped(_) => println!("Pipeline stopped"),
        PipelineEvent::PipelineCompleted(_) => println!("Pipeline completed"),
        PipelineEvent::PipelineCleared => {}
        PipelineEvent::Metrics(m) => println!(
            "[progress] {}/{} ({:.1}%), {} active, ETA {}, {:.1} jobs/min",
            m.total - m.remaining,
            m.total,
            m.progress_percent,
            m.active,
            m.eta_text,
            m.throughput_per_min
        ),
        PipelineEvent::RateLimitUsage(u) => println!(
            "[rate] {}/{} per minute, {}/{} today across {} worker(s)",
            u.minute_calls, u.minute_limit, u.daily_calls, u.daily_limit, u.workers
        ),
    }
}

fn print_status(status: &PipelineStatus) {
    println!(
        "{:?}: {} job(s), {} completed, {} failed, {} skipped, {} cancelled",
        status.state,
        status.total,
        status.counters.completed,
        status.counters.failed,
        status.counters.skipped,
        status.counters.cancelled
    );
    println!(
        "{:<8} {:<10} {:>7} {:>8} {:>6}  {}",
        "Symbol", "Status", "Done", "Bars", "Calls", "Stage"
    );
    println!("{}", "-".repeat(64));
    for job in &status.jobs {
        println!(
            "{:<8} {:<10} {:>6.0}% {:>8} {:>6}  {}",
            job.symbol,
            job.status,
            job.progress,
            job.data_points,
            job.api_calls,
            job.message.as_deref().unwrap_or(&job.stage)
        );
    }
}

// ─── Operator console ───────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Pause,
    Resume,
    Stop,
    PauseSymbol(String),
    ResumeSymbol(String),
    CancelSymbol(String),
    Skip(String),
    Status,
}

fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let symbol = parts.next().map(str::to_string);
    if parts.next().is_some() {
        bail!("too many arguments: '{line}'");
    }

    let command = match (verb.to_ascii_lowercase().as_str(), symbol) {
        ("pause", None) => ConsoleCommand::Pause,
        ("resume", None) => ConsoleCommand::Resume,
        ("stop", None) => ConsoleCommand::Stop,
        ("status", None) => ConsoleCommand::Status,
        ("pause", Some(s)) => ConsoleCommand::PauseSymbol(s),
        ("resume", Some(s)) => ConsoleCommand::ResumeSymbol(s),
        ("cancel", Some(s)) => ConsoleCommand::CancelSymbol(s),
        ("skip", Some(s)) => ConsoleCommand::Skip(s),
        ("cancel" | "skip", None) => bail!("'{verb}' needs a symbol"),
        _ => bail!("unknown command: '{line}'"),
    };
    Ok(Some(command))
}

fn apply_command(handle: &ControlHandle, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Pause => handle.pause(),
        ConsoleCommand::Resume => handle.resume(),
        ConsoleCommand::Stop => handle.cancel(),
        ConsoleCommand::PauseSymbol(s) => handle.pause_symbol(&s)?,
        ConsoleCommand::ResumeSymbol(s) => handle.resume_symbol(&s)?,
        ConsoleCommand::CancelSymbol(s) => handle.cancel_symbol(&s)?,
        ConsoleCommand::Skip(s) => handle.skip(&s)?,
        ConsoleCommand::Status => print_status(&handle.status()),
    }
    Ok(())
}

fn spawn_console(handle: ControlHandle) -> Result<()> {
    thread::Builder::new()
        .name("harvest-console".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "console input closed");
                        break;
                    }
                };
                let result = parse_command(&line)
                    .and_then(|cmd| cmd.map_or(Ok(()), |cmd| apply_command(&handle, cmd)));
                if let Err(e) = result {
                    eprintln!("{e}");
                }
            }
        })
        .context("failed to spawn console thread")?;
    Ok(())
}

// ─── cache ──────────────────────────────────────────────────────────

fn run_cache_status(config_path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, cache_dir)?;
    let cache = open_cache(&config, Arc::new(SystemClock))?;
    let stats = cache.stats();

    println!("Cache: {}", stats.dir.display());
    println!("Entries: {} ({} degraded)", stats.entries, stats.degraded);
    println!(
        "Total size: {} of {} ({:.1}%)",
        format_size(stats.total_bytes),
        format_size(stats.max_total_bytes),
        stats.usage_percent
    );

    // symbol -> (segments, rows, bytes)
    let mut per_symbol: BTreeMap<String, (usize, usize, u64)> = BTreeMap::new();
    for (_, entry) in cache.entries() {
        if let Some(symbol) = entry.symbol {
            let row = per_symbol.entry(symbol).or_default();
            row.0 += 1;
            row.1 += entry.rows;
            row.2 += entry.size_bytes;
        }
    }
    if per_symbol.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:<8} {:>8} {:>10} {:>10}  {}",
        "Symbol", "Segments", "Rows", "Size", "Ranges"
    );
    println!("{}", "-".repeat(70));
    for (symbol, (segments, rows, bytes)) in &per_symbol {
        let ranges: Vec<String> = cache
            .cached_ranges(symbol)
            .iter()
            .map(|(from, to)| format!("{from}..{to}"))
            .collect();
        println!(
            "{:<8} {:>8} {:>10} {:>10}  {}",
            symbol,
            segments,
            rows,
            format_size(*bytes),
            ranges.join(", ")
        );
    }
    Ok(())
}

fn run_cache_clear(
    config_path: Option<&Path>,
    cache_dir: Option<PathBuf>,
    symbol: Option<String>,
) -> Result<()> {
    let config = load_config(config_path, cache_dir)?;
    let cache = open_cache(&config, Arc::new(SystemClock))?;
    let symbol = symbol.map(|s| s.trim().to_uppercase());
    let removed = cache.clear(symbol.as_deref())?;
    match symbol {
        Some(symbol) => println!("Removed {removed} segment(s) for {symbol}"),
        None => println!("Removed {removed} segment(s)"),
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
