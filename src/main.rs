//! aiot-collector - industrial telemetry collector
//!
//! Acquires measurement values from field controllers, keeps a short-horizon
//! forecast per measurement, and raises deviation alerts when observed values
//! drift from their forecast.
//!
//! # Usage
//!
//! ```bash
//! # Run against the devices in ./devices.toml
//! aiot-collector --config collector.toml
//!
//! # Serve every endpoint from the built-in simulator
//! aiot-collector --simulate --devices demos/devices.toml
//!
//! # One deviation scan over stored data, then exit
//! aiot-collector --scan-once
//! ```
//!
//! # Environment Variables
//!
//! - `AIOT_CONFIG`: path to the collector TOML file
//! - `AIOT_DEVICES`: path to the devices file (overrides `registry.devices_file`)
//! - `RUST_LOG`: log filter (overrides `logging.level`)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aiot_collector::alerting::{AlertService, DeviationScanner};
use aiot_collector::background;
use aiot_collector::config::{self, CollectorConfig, LoggingConfig};
use aiot_collector::prediction::{build_predictor, PredictionCache};
use aiot_collector::registry::watcher::run_registry_watcher;
use aiot_collector::registry::{DeviceRegistry, FileRegistry};
use aiot_collector::storage;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "aiot-collector")]
#[command(about = "Industrial telemetry collector with forecast caching and deviation alerting")]
#[command(version)]
struct CliArgs {
    /// Path to the collector TOML file (otherwise AIOT_CONFIG, then ./collector.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the devices file
    #[arg(long, env = "AIOT_DEVICES", value_name = "PATH")]
    devices: Option<PathBuf>,

    /// Serve every endpoint from the built-in simulated transport
    #[arg(long)]
    simulate: bool,

    /// Run a single deviation scan over stored data and exit (no acquisition)
    #[arg(long)]
    scan_once: bool,
}

// ============================================================================
// Task Supervision
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Acquisition,
    ValueRouter,
    Prefetch,
    Scan,
    RegistryWatcher,
    RegistryEvents,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Acquisition => write!(f, "Acquisition"),
            TaskName::ValueRouter => write!(f, "ValueRouter"),
            TaskName::Prefetch => write!(f, "Prefetch"),
            TaskName::Scan => write!(f, "Scan"),
            TaskName::RegistryWatcher => write!(f, "RegistryWatcher"),
            TaskName::RegistryEvents => write!(f, "RegistryEvents"),
        }
    }
}

/// Wait until shutdown is requested or a task fails.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!(tasks = task_set.len(), "Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Supervisor: task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Let cancelled tasks finish their shutdown work, up to `limit`.
async fn drain_tasks(task_set: &mut JoinSet<Result<TaskName>>, limit: Duration) {
    let drained = tokio::time::timeout(limit, async {
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(task)) => info!(task = %task, "Task stopped"),
                Ok(Err(e)) => warn!(error = %e, "Task stopped with error"),
                Err(e) => warn!(error = %e, "Task aborted"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = task_set.len(), "Shutdown timed out, aborting remaining tasks");
        task_set.abort_all();
    }
}

// ============================================================================
// Logging
// ============================================================================

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Install the process-wide subscriber from the `[logging]` section.
fn init_tracing(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&logging.level))
        .with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Config loading logs before the configured subscriber exists
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_target(false)
        .finish();
    let loaded = tracing::subscriber::with_default(bootstrap, || {
        CollectorConfig::load(args.config.as_deref())
    });

    init_tracing(&loaded.logging);
    config::init(loaded);
    let cfg = config::get();

    info!("======================================================================");
    info!("  aiot-collector {}", env!("CARGO_PKG_VERSION"));
    info!("======================================================================");
    info!(
        strategy = ?cfg.acquisition.strategy,
        predictor = ?cfg.predictor.kind,
        storage = ?cfg.storage.backend,
        simulate = args.simulate,
        "Configuration"
    );

    let (series, alerts) =
        storage::open_stores(&cfg.storage).context("Failed to open storage")?;

    let devices_path = args
        .devices
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.registry.devices_file));
    let file_registry = Arc::new(
        FileRegistry::open(&devices_path)
            .with_context(|| format!("Failed to load devices file {}", devices_path.display()))?,
    );
    let registry: Arc<dyn DeviceRegistry> = file_registry.clone();

    let predictor = build_predictor(&cfg.predictor).context("Failed to build predictor")?;
    info!(predictor = predictor.name(), "Predictor ready");
    let cache = Arc::new(PredictionCache::new(
        cfg.prediction_cache.clone(),
        &cfg.predictor,
        predictor,
        series.clone(),
    ));
    let scanner = Arc::new(DeviationScanner::new(
        cfg.alert.clone(),
        cache.clone(),
        series.clone(),
        alerts.clone(),
    ));

    if args.scan_once {
        let devices = registry
            .list_devices_with_measurements()
            .context("Device registry unavailable")?;
        let summary = scanner.scan_once(&devices).await;
        let stats = AlertService::new(alerts)
            .stats(chrono::Utc::now())
            .context("Failed to read alert statistics")?;
        info!(
            checked = summary.checked,
            created = summary.created,
            suppressed = summary.suppressed,
            no_baseline = summary.no_baseline,
            active_alerts = stats.active_count,
            "Scan complete"
        );
        return Ok(());
    }

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    if cfg.acquisition.enabled {
        let client = background::build_client(args.simulate);
        let parts =
            background::build_collector(&cfg.acquisition, registry.clone(), client, series.clone());
        if let Some((router, rx)) = parts.router {
            let token = cancel_token.clone();
            task_set.spawn(async move {
                router.run(rx, token).await;
                Ok(TaskName::ValueRouter)
            });
        }
        let collector = parts.collector;
        let period = cfg.acquisition.tick_period();
        let token = cancel_token.clone();
        task_set.spawn(async move {
            background::run_acquisition_loop(collector, period, token).await;
            Ok(TaskName::Acquisition)
        });
    } else {
        info!("Acquisition disabled");
    }

    {
        let cache = cache.clone();
        let registry = registry.clone();
        let period = cfg.prediction_cache.prefetch_interval();
        let token = cancel_token.clone();
        task_set.spawn(async move {
            background::run_prefetch_loop(cache, registry, period, token).await;
            Ok(TaskName::Prefetch)
        });
    }

    {
        let registry = registry.clone();
        let period = cfg.alert.scan_interval();
        let token = cancel_token.clone();
        task_set.spawn(async move {
            background::run_scan_loop(scanner, registry, period, token).await;
            Ok(TaskName::Scan)
        });
    }

    if cfg.registry.watch {
        let (tx, rx) = mpsc::channel(16);
        let token = cancel_token.clone();
        task_set.spawn(async move {
            run_registry_watcher(file_registry, tx, token).await;
            Ok(TaskName::RegistryWatcher)
        });
        let token = cancel_token.clone();
        task_set.spawn(async move {
            background::run_registry_events(rx, token).await;
            Ok(TaskName::RegistryEvents)
        });
    }

    let result = run_supervisor(&mut task_set, cancel_token.clone()).await;
    cancel_token.cancel();

    // acquisition disconnects every session, each bounded separately
    let grace = cfg.acquisition.shutdown_disconnect_timeout() + Duration::from_secs(2);
    drain_tasks(&mut task_set, grace).await;
    info!("Shutdown complete");
    result
}
