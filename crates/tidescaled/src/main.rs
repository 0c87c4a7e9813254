//! tidescaled — the Tidescale daemon.
//!
//! Single binary that assembles the controller:
//! - State store (redb), seeded from the config file
//! - Store-backed capacity and metrics providers
//! - Status syncers + reconciler
//! - Trigger dispatcher
//! - Simulated load sampler and utilization sample reaper
//!
//! # Usage
//!
//! ```text
//! tidescaled run --config /etc/tidescale/tidescaled.toml --data-dir /var/lib/tidescale
//! tidescaled check --config /etc/tidescale/tidescaled.toml
//! ```

mod load;
mod seed;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tidescale_autoscale::{
    Clock, Dispatcher, PolicyStore, Reconciler, StoreBackend, SyncSettings, SyncerRegistry,
    SystemClock,
};
use tidescale_core::DaemonConfig;
use tidescale_state::StateStore;

const DEFAULT_LOG_FILTER: &str = "info,tidescaled=debug,tidescale=debug";

#[derive(Parser)]
#[command(name = "tidescaled", about = "Tidescale autoscaling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Path to tidescaled.toml.
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/tidescale")]
        data_dir: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Validate a config file and print what it would seed.
    Check {
        /// Path to tidescaled.toml.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            run(&config, &data_dir).await
        }
        Command::Check { config } => {
            init_tracing(false);
            check(&config)
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<DaemonConfig> {
    DaemonConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn run(config_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    info!("Tidescale daemon starting");

    let file = load(config_path)?;
    let config = file.resolve()?;
    info!(
        sync_interval = ?config.sync_interval,
        resync_interval = ?config.resync_interval,
        rounding = ?config.rounding,
        "configuration loaded"
    );

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("tidescale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let seeded = seed::apply_seeds(&store, &file)?;
    info!(
        policies = seeded.policies,
        secrets = seeded.secrets,
        clusters = seeded.clusters,
        "seed entries applied"
    );
    if file.clusters.is_empty() {
        warn!("no [[cluster]] entries; the built-in backend has nothing to observe");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policies: Arc<dyn PolicyStore> = Arc::new(store.clone());
    let reaper_store = store.clone();
    let reaper_clock = clock.clone();
    let sampler_store = store.clone();
    let sampler_clock = clock.clone();

    let syncers = Arc::new(SyncerRegistry::new(
        policies.clone(),
        clock.clone(),
        SyncSettings::from_config(&config),
    ));
    let reconciler = Arc::new(Reconciler::new(
        policies.clone(),
        Arc::new(store.clone()),
        Arc::new(StoreBackend::new(store, clock.clone())),
        syncers,
        clock,
        config.clone(),
    ));
    let dispatcher = Dispatcher::new(policies, reconciler, &config);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_shutdown = shutdown_rx.clone();
    let sampler_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let dispatch_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    // Load sampler: one utilization sample per project every sync interval.
    let clusters = file.clusters.clone();
    let sample_interval = config.sync_interval;
    let sampler_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sample_interval);
        let mut shutdown = sampler_shutdown;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) =
                        load::record_load_samples(&sampler_store, &clusters, sampler_clock.now())
                    {
                        warn!(error = %e, "failed to record utilization samples");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });

    // Sample reaper: utilization older than two metrics windows is never read.
    let retention = config.metrics_window * 2;
    let reaper_interval = config.resync_interval;
    let reaper_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        let mut shutdown = reaper_shutdown;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let before = reaper_clock.now().saturating_sub(retention.as_secs());
                    match reaper_store.prune_utilization(before) {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "pruned old utilization samples"),
                        Err(e) => warn!(error = %e, "utilization pruning failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    dispatch_handle.await?;
    let _ = sampler_handle.await;
    let _ = reaper_handle.await;

    info!("Tidescale daemon stopped");
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let file = load(config_path)?;
    let config = file.resolve()?;

    println!("✓ {} is valid", config_path.display());
    println!(
        "  sync every {:?}, resync every {:?}, cooldowns up {:?} / down {:?}",
        config.sync_interval,
        config.resync_interval,
        config.scale_up_cooldown,
        config.scale_down_cooldown
    );
    println!("  rounding: {:?}, write attempts: {}", config.rounding, config.write_attempts);
    for seed in &file.policies {
        let p = &seed.policy;
        println!(
            "  policy {}: {}..={} nodes at {}% → {}",
            seed.id(),
            p.min_nodes,
            p.max_nodes,
            p.target_utilization,
            p.cluster_ref.table_key()
        );
    }
    for seed in &file.secrets {
        println!("  secret {}/{} ({} keys)", seed.namespace, seed.name, seed.data.len());
    }
    for seed in &file.clusters {
        let load = seed
            .load
            .map_or_else(|| "no load".to_string(), |l| format!("load {l}"));
        println!(
            "  cluster {}: {} nodes, {}",
            seed.cluster_ref().table_key(),
            seed.nodes,
            load
        );
    }
    Ok(())
}
