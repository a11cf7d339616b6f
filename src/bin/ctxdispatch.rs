//! ctxdispatch: operator tooling for the ordered per-context dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use ctx_dispatch::config::{Config, QueueMode};
use ctx_dispatch::dispatch::{DispatchStats, Dispatcher};
use ctx_dispatch::pool::TokioBlockingPool;
use ctx_dispatch::telemetry::metrics::MetricsObserver;
use ctx_dispatch::telemetry::{TelemetryConfig, init_telemetry};
use ctx_dispatch::{ContextKey, Task};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "ctxdispatch", about = "Ordered per-context task dispatch")]
struct Cli {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a concurrent load through a dispatcher and verify ordering
    Soak {
        /// Number of distinct context keys
        #[arg(long, default_value_t = 10)]
        contexts: usize,
        /// Number of producer threads
        #[arg(long, default_value_t = 100)]
        producers: usize,
        /// Tasks dispatched by each producer
        #[arg(long, default_value_t = 1_000)]
        tasks: usize,
        /// Simulated work per task, in microseconds
        #[arg(long, default_value_t = 0)]
        work_us: u64,
        /// Override the configured queue mode ("per-key" or "sharded")
        #[arg(long)]
        mode: Option<String>,
        /// How long to wait for the load to drain, in seconds
        #[arg(long, default_value_t = 60)]
        drain_secs: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Soak {
            contexts,
            producers,
            tasks,
            work_us,
            mode,
            drain_secs,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.dispatcher.mode = mode.parse()?;
            }
            let _guard = init_telemetry(TelemetryConfig::from_config(&config, "ctxdispatch"))?;
            let load = SoakLoad {
                contexts: contexts.max(1),
                producers: producers.max(1),
                tasks,
                work: Duration::from_micros(work_us),
                drain: Duration::from_secs(drain_secs),
            };
            let pool = Arc::new(TokioBlockingPool::new(tokio::runtime::Handle::current()));
            let dispatcher = Dispatcher::builder(pool)
                .config(config.dispatcher.clone())
                .observer(Arc::new(MetricsObserver::new()))
                .build()?;

            let report = tokio::task::spawn_blocking(move || run_soak(&dispatcher, &load))
                .await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.ordering_violations > 0 || report.overlap_violations > 0 {
                anyhow::bail!(
                    "soak found {} ordering and {} overlap violations",
                    report.ordering_violations,
                    report.overlap_violations
                );
            }
            Ok(())
        }
    }
}

struct SoakLoad {
    contexts: usize,
    producers: usize,
    tasks: usize,
    work: Duration,
    drain: Duration,
}

#[derive(Serialize)]
struct SoakReport {
    mode: QueueMode,
    contexts: usize,
    producers: usize,
    dispatched: u64,
    rejected: u64,
    elapsed_ms: u64,
    tasks_per_sec: f64,
    drained: bool,
    ordering_violations: u64,
    overlap_violations: u64,
    stats: DispatchStats,
}

/// Per-context bookkeeping used to check ordering and single-flight.
struct ContextProbe {
    running: AtomicBool,
    /// Last sequence number seen from each producer.
    last_seen: Mutex<HashMap<usize, usize>>,
}

fn run_soak(dispatcher: &Dispatcher, load: &SoakLoad) -> anyhow::Result<SoakReport> {
    let probes: Arc<Vec<ContextProbe>> = Arc::new(
        (0..load.contexts)
            .map(|_| ContextProbe {
                running: AtomicBool::new(false),
                last_seen: Mutex::new(HashMap::new()),
            })
            .collect(),
    );
    let ordering_violations = Arc::new(AtomicU64::new(0));
    let overlap_violations = Arc::new(AtomicU64::new(0));
    let rejected = AtomicU64::new(0);
    let dispatched = AtomicU64::new(0);
    let mode = dispatcher.snapshot().mode;

    info!(
        contexts = load.contexts,
        producers = load.producers,
        tasks = load.tasks,
        "soak starting"
    );
    let start = Instant::now();

    thread::scope(|scope| -> anyhow::Result<()> {
        let mut handles = Vec::with_capacity(load.producers);
        for producer in 0..load.producers {
            let probes = Arc::clone(&probes);
            let ordering_violations = Arc::clone(&ordering_violations);
            let overlap_violations = Arc::clone(&overlap_violations);
            let rejected = &rejected;
            let dispatched = &dispatched;
            handles.push(scope.spawn(move || -> ctx_dispatch::Result<()> {
                for seq in 0..load.tasks {
                    let context = (producer + seq) % load.contexts;
                    let key = ContextKey::from(format!("ctx-{context}"));
                    let probes = Arc::clone(&probes);
                    let ordering_violations = Arc::clone(&ordering_violations);
                    let overlap_violations = Arc::clone(&overlap_violations);
                    let work = load.work;
                    let task = Task::new(key, move || {
                        let probe = &probes[context];
                        if probe.running.swap(true, Ordering::SeqCst) {
                            overlap_violations.fetch_add(1, Ordering::Relaxed);
                        }
                        let previous = probe.last_seen.lock().insert(producer, seq);
                        if previous.is_some_and(|previous| previous >= seq) {
                            ordering_violations.fetch_add(1, Ordering::Relaxed);
                        }
                        if !work.is_zero() {
                            thread::sleep(work);
                        }
                        probe.running.store(false, Ordering::SeqCst);
                    });
                    let status = dispatcher.dispatch(task, Some(Duration::from_secs(5)))?;
                    dispatched.fetch_add(1, Ordering::Relaxed);
                    if !status.is_accepted() {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
        }
        Ok(())
    })?;

    let drained = dispatcher.await_idle(load.drain);
    let elapsed = start.elapsed();
    let dispatched = dispatched.load(Ordering::Relaxed);
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        drained, "soak finished"
    );

    Ok(SoakReport {
        mode,
        contexts: load.contexts,
        producers: load.producers,
        dispatched,
        rejected: rejected.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis() as u64,
        tasks_per_sec: dispatched as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        drained,
        ordering_violations: ordering_violations.load(Ordering::Relaxed),
        overlap_violations: overlap_violations.load(Ordering::Relaxed),
        stats: dispatcher.stats(),
    })
}
