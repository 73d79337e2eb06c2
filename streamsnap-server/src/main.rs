//! StreamSnap Server - Stream Replication Service
//!
//! Mirrors version-control streams into a content-addressed snapshot store
//! so build agents can fetch arbitrary past revisions without talking to
//! the version-control server. Multiple server processes cooperate through
//! a shared coordination store.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamsnap_core::sim::SimDepot;
use streamsnap_core::status::format_record;
use streamsnap_core::{
    Cluster, CommitIngester, CoordinationStore, DepotClient, Keys, MemoryCommitStore,
    MemoryCoordinationStore, MemoryTreeStore, MemoryUserDirectory, RedisCoordinationStore,
    ReplicationConfig, Scheduler, SchedulerOptions, SharedSettings, StatusLog, ViewEntry,
};

/// StreamSnap Server Configuration
#[derive(Parser, Debug)]
#[command(name = "streamsnap")]
#[command(author = "StreamSnap Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Stream replication service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the replication service
    Start {
        /// Path to the JSON configuration file
        #[arg(short, long, default_value = "streamsnap.json")]
        config: PathBuf,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Show replication status per stream
    Status {
        /// Path to the JSON configuration file
        #[arg(short, long, default_value = "streamsnap.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            cmd_start(config).await
        }

        Commands::Status { config } => cmd_status(config).await,
    }
}

async fn connect_coordination(
    config: &ReplicationConfig,
) -> Result<Arc<dyn CoordinationStore>> {
    match &config.coordination {
        Some(url) => {
            let store = RedisCoordinationStore::connect(url)
                .await
                .with_context(|| format!("Failed to connect coordination store at {}", url))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no coordination store configured; using in-process store");
            Ok(Arc::new(MemoryCoordinationStore::new()))
        }
    }
}

/// Bind a depot client per cluster. `sim://` clusters run the in-process
/// simulator; real protocol connectors are linked by embedding deployments.
async fn connect_depots(
    config: &ReplicationConfig,
) -> Result<HashMap<String, Arc<dyn DepotClient>>> {
    let mut depots: HashMap<String, Arc<dyn DepotClient>> = HashMap::new();
    for (name, cluster) in &config.clusters {
        if cluster.address.starts_with("sim://") {
            let depot = SimDepot::new();
            for (id, stream) in &config.streams {
                if &stream.cluster == name {
                    depot
                        .define_stream(
                            id,
                            vec![ViewEntry::include(&format!("{}/...", stream.root), "/...")],
                        )
                        .await;
                }
            }
            depots.insert(name.clone(), Arc::new(depot));
        } else {
            bail!(
                "cluster {}: unsupported depot address {:?} (only sim:// is built in)",
                name,
                cluster.address
            );
        }
    }
    Ok(depots)
}

async fn cmd_start(config_path: PathBuf) -> Result<()> {
    let config = ReplicationConfig::load(&config_path)?;
    if !config.enabled {
        warn!("replication is disabled in {}", config_path.display());
    }
    info!(
        "starting streamsnap: {} clusters, {} streams, {} workers",
        config.clusters.len(),
        config.streams.len(),
        config.max_workers
    );

    let keys = Keys::new(&config.namespace);
    let coordination = connect_coordination(&config).await?;
    let depots = connect_depots(&config).await?;

    let tree_store = Arc::new(MemoryTreeStore::new());
    let commits = Arc::new(MemoryCommitStore::new());
    let users = Arc::new(MemoryUserDirectory::new());
    let settings = Arc::new(SharedSettings::new(config.clone()));

    let ingester = CommitIngester::new(
        Arc::clone(&coordination),
        commits,
        users,
        keys.clone(),
    );
    let clusters: Vec<Cluster> = config
        .streams_by_cluster()
        .into_iter()
        .filter_map(|(name, streams)| {
            depots.get(&name).map(|client| Cluster {
                name,
                client: Arc::clone(client),
                streams,
            })
        })
        .collect();

    let options = SchedulerOptions {
        max_workers: config.max_workers,
        lease: config.lease(),
        heartbeat: config.heartbeat(),
        batch_bytes: config.batch_bytes,
    };
    let mut scheduler = Scheduler::new(
        coordination,
        keys,
        tree_store,
        settings,
        depots,
        options,
    );
    if let Some(dir) = &config.status_dir {
        scheduler = scheduler.with_status(Arc::new(StatusLog::new(dir)));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_task =
        tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    // Ingestion poll loop, independent of the workers
    let mut shutdown = shutdown_rx;
    let mut ticker = tokio::time::interval(config.poll_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ingester.poll_all(&clusters).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("waiting for scheduler to drain");
    scheduler_task
        .await
        .context("scheduler task panicked")?
        .context("scheduler failed")?;
    info!("shutdown complete");
    Ok(())
}

async fn cmd_status(config_path: PathBuf) -> Result<()> {
    let config = ReplicationConfig::load(&config_path)?;
    let keys = Keys::new(&config.namespace);
    let coordination = connect_coordination(&config).await?;
    let status = config.status_dir.as_ref().map(StatusLog::new);

    let reservations = coordination.zset_entries(&keys.reservations()).await?;
    let dirty = coordination.set_members(&keys.dirty_streams()).await?;

    println!("Namespace: {}", config.namespace);
    println!("Streams:   {}", config.streams.len());
    println!();

    for (id, stream) in &config.streams {
        let watermark = coordination.counter_get(&keys.watermark(id)).await?;
        let pending = coordination.list_len(&keys.pending_changes(id)).await?;
        let reserved = reservations.iter().find(|(member, _)| member == id);

        println!("{} ({}, {:?})", id, stream.cluster, stream.mode);
        match watermark {
            Some(change) => println!("  Last ingested:  @{}", change),
            None => println!("  Last ingested:  none"),
        }
        println!("  Pending:        {} changes", pending);
        println!("  Dirty:          {}", dirty.iter().any(|s| s == id));
        match reserved {
            Some((_, expiry)) => {
                let expires = chrono::DateTime::from_timestamp_millis(*expiry)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| expiry.to_string());
                println!("  Reservation:    held, expires {}", expires);
            }
            None => println!("  Reservation:    free"),
        }
        if let Some(log) = &status {
            if let Some(record) = log.latest(id)? {
                println!("  Last build:     {}", format_record(&record));
            }
        }
        println!();
    }
    Ok(())
}
