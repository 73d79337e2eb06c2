//! Replication scheduler
//!
//! One control loop per process, cooperating with every other process
//! through the coordination store: a stream may be claimed by at most one
//! worker cluster-wide, claims expire unless heartbeated, and a crashed
//! worker's stream is reclaimed by whichever scheduler notices the lapsed
//! reservation first.

use chrono::Utc;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildRequest, SnapshotBuilder};
use crate::config::{ReplicationMode, SettingsSource, StreamSettings};
use crate::coordination::{CoordinationStore, Keys};
use crate::depot::{DepotClient, SyncClient};
use crate::error::{ReplicationError, Result};
use crate::status::{BuildRecord, StatusLog};
use crate::tree::{Snapshot, snapshot_ref};
use crate::treestore::TreeStore;

/// Cached replication clients kept per scheduler, never shared across
/// workers of different streams.
const CLIENT_CACHE_SIZE: usize = 32;

/// Tuning knobs for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Concurrent workers in this process.
    pub max_workers: usize,
    /// Reservation lifetime.
    pub lease: Duration,
    /// Reservation extension period; must stay below the lease.
    pub heartbeat: Duration,
    /// Byte cap per content sync batch.
    pub batch_bytes: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: 2,
            lease: Duration::from_secs(60),
            heartbeat: Duration::from_secs(40),
            batch_bytes: 1024 * 1024 * 1024,
        }
    }
}

struct CachedClient {
    client: Box<dyn SyncClient>,
    /// Workspace root the client was bound for; a changed root invalidates
    /// the binding.
    root: String,
}

struct WorkerExit {
    stream: String,
    client: Option<CachedClient>,
    result: Result<()>,
}

/// The per-process replication control loop.
pub struct Scheduler {
    coordination: Arc<dyn CoordinationStore>,
    keys: Keys,
    store: Arc<dyn TreeStore>,
    settings: Arc<dyn SettingsSource>,
    depots: HashMap<String, Arc<dyn DepotClient>>,
    status: Option<Arc<StatusLog>>,
    options: SchedulerOptions,
    clients: LruCache<String, CachedClient>,
    workers: JoinSet<WorkerExit>,
    task_streams: HashMap<tokio::task::Id, String>,
    in_flight: HashSet<String>,
}

enum Wake {
    Worker(Option<std::result::Result<(tokio::task::Id, WorkerExit), tokio::task::JoinError>>),
    Notified,
    Deadline,
}

impl Scheduler {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        keys: Keys,
        store: Arc<dyn TreeStore>,
        settings: Arc<dyn SettingsSource>,
        depots: HashMap<String, Arc<dyn DepotClient>>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            coordination,
            keys,
            store,
            settings,
            depots,
            status: None,
            options,
            clients: LruCache::new(NonZeroUsize::new(CLIENT_CACHE_SIZE).unwrap()),
            workers: JoinSet::new(),
            task_streams: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Record completed builds into a status log.
    pub fn with_status(mut self, status: Arc<StatusLog>) -> Self {
        self.status = Some(status);
        self
    }

    /// Run until `shutdown` reads true, then await in-flight workers. A
    /// worker mid-batch finishes its current batch (checkpointed) before
    /// stopping.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut notifications = self
            .coordination
            .subscribe(&self.keys.notify_channel())
            .await?;

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = self.workers.try_join_next_with_id() {
                self.reap(joined);
            }

            let now = Utc::now().timestamp_millis();
            let expired = self
                .coordination
                .zset_remove_below(&self.keys.reservations(), now)
                .await?;
            if expired > 0 {
                info!("reclaimed {} expired reservations", expired);
            }

            if self.in_flight.len() < self.options.max_workers {
                let dirty = self
                    .coordination
                    .set_members(&self.keys.dirty_streams())
                    .await?;
                for stream in dirty {
                    if self.in_flight.len() >= self.options.max_workers {
                        break;
                    }
                    if self.in_flight.contains(&stream) {
                        continue;
                    }
                    if let Err(e) = self.try_claim(&stream, shutdown.clone()).await {
                        warn!("failed to start worker for {}: {}", stream, e);
                    }
                }
            }

            let deadline = self.wait_duration().await;
            let wake = tokio::select! {
                joined = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    Wake::Worker(joined)
                }
                _ = notifications.recv() => Wake::Notified,
                _ = tokio::time::sleep(deadline) => Wake::Deadline,
                _ = shutdown.changed() => Wake::Deadline,
            };
            if let Wake::Worker(Some(joined)) = wake {
                self.reap(joined);
            }
        }

        if !self.workers.is_empty() {
            info!(
                "scheduler stopping; waiting for {} in-flight workers",
                self.workers.len()
            );
        }
        while let Some(joined) = self.workers.join_next_with_id().await {
            self.reap(joined);
        }
        Ok(())
    }

    /// Attempt to reserve a stream and start its worker.
    async fn try_claim(&mut self, stream: &str, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Some(stream_settings) = self.settings.stream(stream) else {
            debug!("dirty stream {} has no configuration; leaving for later", stream);
            return Ok(());
        };
        let Some(depot) = self.depots.get(&stream_settings.cluster).cloned() else {
            warn!(
                "stream {} references unknown cluster {}",
                stream, stream_settings.cluster
            );
            return Ok(());
        };

        let expiry = Utc::now().timestamp_millis() + self.options.lease.as_millis() as i64;
        let reserved = self
            .coordination
            .zset_add_if_absent(&self.keys.reservations(), stream, expiry)
            .await?;
        if !reserved {
            // Another process holds the stream
            debug!("stream {} already reserved elsewhere", stream);
            return Ok(());
        }

        let client = match self.take_client(stream, &stream_settings, &*depot).await {
            Ok(client) => client,
            Err(e) => {
                let _ = self
                    .coordination
                    .zset_remove(&self.keys.reservations(), stream)
                    .await;
                return Err(e);
            }
        };

        let ctx = WorkerContext {
            stream: stream.to_string(),
            root: stream_settings.root,
            coordination: Arc::clone(&self.coordination),
            keys: self.keys.clone(),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            depot,
            client,
            lease: self.options.lease,
            heartbeat: self.options.heartbeat,
            batch_bytes: self.options.batch_bytes,
            status: self.status.clone(),
            shutdown,
        };
        let handle = self.workers.spawn(run_worker(ctx));
        self.task_streams.insert(handle.id(), stream.to_string());
        self.in_flight.insert(stream.to_string());
        info!("reserved {} and started worker", stream);
        Ok(())
    }

    /// Reuse the cached client for a stream, rebinding when the workspace
    /// root changed.
    async fn take_client(
        &mut self,
        stream: &str,
        stream_settings: &StreamSettings,
        depot: &dyn DepotClient,
    ) -> Result<Box<dyn SyncClient>> {
        if let Some(cached) = self.clients.pop(stream) {
            if cached.root == stream_settings.root {
                return Ok(cached.client);
            }
            debug!(
                "workspace root for {} changed ({} -> {}); rebinding",
                stream, cached.root, stream_settings.root
            );
        }
        depot.connect_workspace(stream).await
    }

    fn reap(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, WorkerExit), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((id, exit)) => {
                self.task_streams.remove(&id);
                self.in_flight.remove(&exit.stream);
                if let Some(cached) = exit.client {
                    self.clients.put(exit.stream.clone(), cached);
                }
                match exit.result {
                    Ok(()) => debug!("worker for {} finished", exit.stream),
                    Err(ReplicationError::Interrupted) => {
                        info!("worker for {} paused at its checkpoint", exit.stream)
                    }
                    Err(e) => warn!("worker for {} failed: {}", exit.stream, e),
                }
            }
            Err(e) => {
                // Caught at the worker boundary: the stream's reservation
                // lapses by expiry and a future pass retries it.
                match self.task_streams.remove(&e.id()) {
                    Some(stream) => {
                        self.in_flight.remove(&stream);
                        error!("worker for {} aborted: {}", stream, e);
                    }
                    None => error!("worker task aborted: {}", e),
                }
            }
        }
    }

    /// Sleep until the soonest outstanding reservation could expire, so an
    /// orphaned lease is reclaimed promptly.
    async fn wait_duration(&self) -> Duration {
        let now = Utc::now().timestamp_millis();
        match self.coordination.zset_entries(&self.keys.reservations()).await {
            Ok(entries) if !entries.is_empty() => {
                let soonest = entries[0].1;
                Duration::from_millis((soonest - now).clamp(100, 60_000) as u64)
            }
            Ok(_) => self.options.lease,
            Err(e) => {
                warn!("failed to read reservations: {}", e);
                Duration::from_secs(1)
            }
        }
    }
}

struct WorkerContext {
    stream: String,
    root: String,
    coordination: Arc<dyn CoordinationStore>,
    keys: Keys,
    store: Arc<dyn TreeStore>,
    settings: Arc<dyn SettingsSource>,
    depot: Arc<dyn DepotClient>,
    client: Box<dyn SyncClient>,
    lease: Duration,
    heartbeat: Duration,
    batch_bytes: u64,
    status: Option<Arc<StatusLog>>,
    shutdown: watch::Receiver<bool>,
}

async fn run_worker(mut ctx: WorkerContext) -> WorkerExit {
    // Parallel heartbeat: extend our own reservation so long-running builds
    // are not reclaimed by another process.
    let heartbeat = {
        let coordination = Arc::clone(&ctx.coordination);
        let keys = ctx.keys.clone();
        let stream = ctx.stream.clone();
        let lease = ctx.lease;
        let every = ctx.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expiry = Utc::now().timestamp_millis() + lease.as_millis() as i64;
                match coordination
                    .zset_update(&keys.reservations(), &stream, expiry)
                    .await
                {
                    Ok(true) => debug!("extended reservation for {}", stream),
                    Ok(false) => warn!("reservation for {} vanished during heartbeat", stream),
                    Err(e) => warn!("failed to extend reservation for {}: {}", stream, e),
                }
            }
        })
    };

    let result = process_stream(&mut ctx).await;
    heartbeat.abort();

    // Unconditional release; expiry would reclaim it anyway.
    if let Err(e) = ctx
        .coordination
        .zset_remove(&ctx.keys.reservations(), &ctx.stream)
        .await
    {
        warn!("failed to release reservation for {}: {}", ctx.stream, e);
    }

    WorkerExit {
        stream: ctx.stream,
        client: Some(CachedClient {
            client: ctx.client,
            root: ctx.root,
        }),
        result,
    }
}

/// Drain a stream's pending-change log, building snapshots pairwise, until
/// no work is left and the stream can leave the dirty set.
async fn process_stream(ctx: &mut WorkerContext) -> Result<()> {
    let changes_key = ctx.keys.pending_changes(&ctx.stream);
    loop {
        process_pending(ctx, &changes_key).await?;

        // Leave the dirty set only while the log holds at most the head
        // entry; a failed condition means new work arrived concurrently.
        let removed = ctx
            .coordination
            .set_remove_if_list_short(
                &ctx.keys.dirty_streams(),
                &ctx.stream,
                &changes_key,
                1,
            )
            .await?;
        if removed {
            return Ok(());
        }
        debug!("{}: new work arrived while finishing; continuing", ctx.stream);
    }
}

async fn process_pending(ctx: &mut WorkerContext, changes_key: &str) -> Result<()> {
    loop {
        if *ctx.shutdown.borrow() {
            return Err(ReplicationError::Interrupted);
        }

        // Settings are re-read every iteration: replication may be disabled
        // or switched to revisions-only at any time.
        let Some(stream_settings) = ctx.settings.stream(&ctx.stream) else {
            ctx.coordination.list_trim_to_last(changes_key).await?;
            return Ok(());
        };
        if !ctx.settings.enabled() || stream_settings.mode == ReplicationMode::Disabled {
            debug!("{}: replication disabled; draining pending log", ctx.stream);
            ctx.coordination.list_trim_to_last(changes_key).await?;
            return Ok(());
        }

        let entries = ctx.coordination.list_range(changes_key, 0, 1).await?;
        match entries.as_slice() {
            [] => return Ok(()),
            [only] => {
                let target = parse_change(only)?;
                let ref_name = snapshot_ref(
                    &ctx.stream,
                    target,
                    stream_settings.filter.as_deref(),
                    stream_settings.mode,
                );
                if ctx.store.has_ref(&ref_name).await? {
                    // Head already replicated; it stays as the next base.
                    return Ok(());
                }
                build_one(ctx, &stream_settings, 0, target).await?;
            }
            [base, target, ..] => {
                let base = parse_change(base)?;
                let target = parse_change(target)?;
                if base == target {
                    // Duplicate append from a crashed ingestion pass
                    ctx.coordination
                        .list_pop_if_head(changes_key, &base.to_string())
                        .await?;
                    continue;
                }
                let base_ref = snapshot_ref(
                    &ctx.stream,
                    base,
                    stream_settings.filter.as_deref(),
                    stream_settings.mode,
                );
                if !ctx.store.has_ref(&base_ref).await? {
                    // The head was never replicated (crash before its
                    // build); catch it up first so no change is skipped.
                    build_one(ctx, &stream_settings, 0, base).await?;
                    continue;
                }
                build_one(ctx, &stream_settings, base, target).await?;
                ctx.coordination
                    .list_pop_if_head(changes_key, &base.to_string())
                    .await?;
            }
        }
    }
}

fn parse_change(raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|e| {
        ReplicationError::Coordination(format!("bad change number {:?} in pending log: {}", raw, e))
    })
}

async fn build_one(
    ctx: &mut WorkerContext,
    stream_settings: &StreamSettings,
    base: u64,
    target: u64,
) -> Result<()> {
    let started = Instant::now();
    let filter = stream_settings.filter.as_deref();
    let view = ctx.depot.stream_view(&ctx.stream).await?;

    let base_snapshot = if base > 0 {
        ctx.store
            .read_snapshot(&snapshot_ref(&ctx.stream, base, filter, stream_settings.mode))
            .await?
            .unwrap_or_else(Snapshot::new)
    } else {
        Snapshot::new()
    };

    let request = BuildRequest {
        stream: &ctx.stream,
        base,
        target,
        mode: stream_settings.mode,
        filter,
    };
    let mut builder =
        SnapshotBuilder::new(&*ctx.store, ctx.client.as_mut(), &view, ctx.batch_bytes)
            .with_cancel(ctx.shutdown.clone());
    let result = builder.build(&request, &base_snapshot).await;

    if let Some(status) = &ctx.status {
        // An interruption is a pause, not an outcome worth recording.
        if !matches!(result, Err(ReplicationError::Interrupted)) {
            let outcome = result.as_ref().ok();
            let record = BuildRecord {
                stream: ctx.stream.clone(),
                base,
                target,
                timestamp: Utc::now().timestamp(),
                files: outcome.map(|o| o.files).unwrap_or(0),
                bytes: outcome.map(|o| o.bytes).unwrap_or(0),
                duration_ms: started.elapsed().as_millis() as u64,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            if let Err(e) = status.append(&record) {
                warn!("failed to append status record for {}: {}", ctx.stream, e);
            }
        }
    }

    let outcome = result?;
    info!(
        "replicated {}@{} ({} files, {} bytes, {} batches{})",
        ctx.stream,
        target,
        outcome.files,
        outcome.bytes,
        outcome.batches,
        if outcome.resumed { ", resumed" } else { "" }
    );
    Ok(())
}
