//! Thin-clone maintenance tool
//!
//! Offline inspection of the state a thin-clone coordinator persisted:
//! the clone-to-base cache, GC candidates and pending GC jobs. Run it while
//! no coordinator is bound to the same directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use thinclone::persist::{PersistentMap, RetryQueue};
use thinclone::{GcJob, Lun, ThinCloneConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Inspect and repair persisted thin-clone coordinator state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory the coordinator persists its state in
    #[arg(long, env = "TC_PERSIST_PATH")]
    persist_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show cached clones, GC candidates and pending GC jobs
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Drop a base LUN from the GC candidates after manual cleanup
    ForgetCandidate {
        /// Base LUN id
        id: String,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = ThinCloneConfig::default();
    let cache: PersistentMap<Lun> =
        PersistentMap::open(&args.persist_path, &config.cache_namespace)
            .context("failed to open clone-to-base cache")?;
    let candidates: PersistentMap<Lun> =
        PersistentMap::open(&args.persist_path, &config.candidates_namespace)
            .context("failed to open GC candidates")?;

    match args.command {
        Command::Inspect { json } => {
            let queue: RetryQueue<GcJob> = RetryQueue::open(
                &config.queue_path(&args.persist_path),
                config.queue_config(),
            )
            .context("failed to open GC queue")?;
            inspect(&cache, &candidates, &queue, json)
        }
        Command::ForgetCandidate { id } => {
            match candidates.remove(&id)? {
                Some(base) => info!(base = %base, "Removed GC candidate"),
                None => warn!(base = %id, "Not a GC candidate"),
            }
            Ok(())
        }
    }
}

fn inspect(
    cache: &PersistentMap<Lun>,
    candidates: &PersistentMap<Lun>,
    queue: &RetryQueue<GcJob>,
    as_json: bool,
) -> anyhow::Result<()> {
    let jobs = queue.pending();

    if as_json {
        let report = json!({
            "tc_cache": cache.snapshot(),
            "gc_candidates": candidates.snapshot(),
            "gc_jobs": jobs,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Clone-to-base cache ({} entries, {})", cache.len(), source(cache));
    for (clone_id, base) in cache.snapshot() {
        println!("  {} -> {}", clone_id, base);
    }

    println!("GC candidates ({} entries, {})", candidates.len(), source(candidates));
    for base in candidates.snapshot().values() {
        println!("  {}", base);
    }

    println!("Pending GC jobs ({} entries)", jobs.len());
    for queued in &jobs {
        println!(
            "  {} {} attempts={} enqueued={} last_error={}",
            queued.id,
            queued.job.base(),
            queued.attempts,
            queued.enqueued_at.to_rfc3339(),
            queued.last_error.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

fn source(map: &PersistentMap<Lun>) -> String {
    map.path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "in memory".to_string())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
