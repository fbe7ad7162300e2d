//! vpnfib FIB manager entry point.
//!
//! Without `--scenario` the engine runs against an empty in-memory fabric
//! until interrupted. With a scenario file the fabric is built from the
//! file's topology and its events are fed through the daemon.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vpnfib_fibmanager::config::DEFAULT_CONFIG_PATH;
use vpnfib_fibmanager::daemon::{FibDaemon, FibOrch};
use vpnfib_fibmanager::reconciler::ReconcilerDump;
use vpnfib_fibmanager::sim::{FabricSnapshot, InMemoryFabric, Topology};
use vpnfib_fibmanager::{audit, FibConfig, RouteReconciler};

/// Ticks allowed for `--once` before giving up on draining the orchs.
const MAX_IDLE_TICKS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// L3VPN FIB reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "fibmanager")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// JSON topology and event file to replay
    #[arg(short = 's', long)]
    scenario: Option<PathBuf>,

    /// Exit once every event has been processed
    #[arg(long)]
    once: bool,

    /// Print engine and per-node forwarding state as JSON before exiting
    #[arg(long)]
    dump_state: bool,

    /// Heartbeat interval in milliseconds, overrides the configuration file
    #[arg(long)]
    heartbeat_interval: Option<u64>,
}

#[derive(Serialize)]
struct StateDump {
    engine: ReconcilerDump,
    fabric: FabricSnapshot,
}

fn load_topology(path: &Path) -> anyhow::Result<Topology> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing scenario {}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.log_format {
        LogFormat::Text => {
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(&args.log_level),
            )
            .init();
        }
        LogFormat::Json => audit::init_logging(&args.log_level),
    }

    info!("====================================================================");
    info!("Starting vpnfib fibmanager");
    info!("====================================================================");

    let mut config = match FibConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(interval) = args.heartbeat_interval {
        config.daemon.heartbeat_interval_ms = interval;
    }
    info!("Configuration: {}", args.config.display());
    info!("Heartbeat interval: {}ms", config.daemon.heartbeat_interval_ms);
    info!("Max concurrent jobs: {}", config.jobs.max_concurrent_jobs);
    if config.upgrade.upgrade_in_progress {
        info!("Upgrade mode: ENABLED");
    }

    let topology = match &args.scenario {
        Some(path) => match load_topology(path) {
            Ok(topology) => {
                info!(
                    "Scenario {}: {} domains, {} events",
                    path.display(),
                    topology.domains.len(),
                    topology.events.len()
                );
                topology
            }
            Err(e) => {
                error!("Failed to load scenario: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            warn!("No scenario given, running against an empty in-memory fabric");
            Topology::default()
        }
    };

    let fabric = InMemoryFabric::from_topology(&topology);
    fabric.set_pool_range(
        &config.nexthop.pool_name,
        config.nexthop.pool_start,
        config.nexthop.pool_end,
    );

    let daemon_config = config.daemon.clone();
    let reconciler = Arc::new(RouteReconciler::new(config, fabric.collaborators()));
    let (orch, events) = FibOrch::new(reconciler.clone(), daemon_config.batch_size);

    let mut daemon = FibDaemon::new(daemon_config);
    daemon.register_orch(Box::new(orch));
    if !daemon.init().await {
        error!("Failed to initialize fibmanager daemon");
        return ExitCode::FAILURE;
    }

    for event in topology.events {
        fabric.record_event(&event);
        if let Err(e) = events.send(event) {
            error!("Failed to queue event: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if args.once {
        if !daemon.run_until_idle(MAX_IDLE_TICKS).await {
            warn!("Events still pending after {} ticks", MAX_IDLE_TICKS);
        }
    } else {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received SIGINT, shutting down gracefully...");
                    trigger.cancel();
                }
                Err(err) => error!("Failed to listen for ctrl-c: {}", err),
            }
        });
        daemon.run(shutdown).await;
        signal_handle.abort();
    }
    reconciler.wait_idle().await;

    for line in daemon.dump() {
        debug!("{}", line);
    }
    let stats = reconciler.stats();
    info!(
        "Routes: {} added, {} updated, {} ignored updates, {} removed, {} failures",
        stats.routes_added,
        stats.routes_updated,
        stats.updates_ignored,
        stats.routes_removed,
        stats.failures
    );

    if args.dump_state {
        let dump = StateDump {
            engine: reconciler.dump(),
            fabric: fabric.snapshot(),
        };
        match serde_json::to_string_pretty(&dump) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize state: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    info!("====================================================================");
    info!("fibmanager shutdown complete");
    info!("====================================================================");

    if args.once && stats.failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
