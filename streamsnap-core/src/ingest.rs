//! Commit ingestion
//!
//! Polls each version-control cluster for newly submitted changelists,
//! normalizes them into per-stream Commit records, appends pending work to
//! the coordination store, and wakes the schedulers. Listener callbacks run
//! on a background dispatch task so a slow subscriber never stalls polling.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commit::{Commit, CommitStore, UserDirectory, parse_merge_tags};
use crate::coordination::{CoordinationStore, Keys};
use crate::depot::DepotClient;
use crate::error::Result;
use crate::view::{ViewMap, common_prefix, minimal_depot_roots};

/// One version-control cluster and the streams polled from it.
pub struct Cluster {
    pub name: String,
    pub client: Arc<dyn DepotClient>,
    pub streams: Vec<String>,
}

type ListenerFn = Arc<dyn Fn(&Commit) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    listeners: Mutex<Vec<(u64, ListenerFn)>>,
}

/// Deregisters its listener when dropped.
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut listeners = registry.listeners.lock().unwrap();
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Discovers and records new commits.
pub struct CommitIngester {
    coordination: Arc<dyn CoordinationStore>,
    commits: Arc<dyn CommitStore>,
    users: Arc<dyn UserDirectory>,
    keys: Keys,
    registry: Arc<ListenerRegistry>,
    next_listener: AtomicU64,
    dispatch: mpsc::UnboundedSender<Commit>,
}

impl CommitIngester {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        commits: Arc<dyn CommitStore>,
        users: Arc<dyn UserDirectory>,
        keys: Keys,
    ) -> Self {
        let registry = Arc::new(ListenerRegistry::default());
        let (dispatch, mut rx) = mpsc::unbounded_channel::<Commit>();

        // Background continuation chain: listeners run sequentially, in
        // subscription order, one commit at a time.
        let dispatch_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(commit) = rx.recv().await {
                let listeners: Vec<(u64, ListenerFn)> = {
                    let listeners = dispatch_registry.listeners.lock().unwrap();
                    listeners.clone()
                };
                for (id, listener) in listeners {
                    if let Err(e) = listener(&commit) {
                        warn!(
                            "commit listener {} failed for {}@{}: {}",
                            id, commit.stream, commit.change, e
                        );
                    }
                }
            }
        });

        Self {
            coordination,
            commits,
            users,
            keys,
            registry,
            next_listener: AtomicU64::new(1),
            dispatch,
        }
    }

    /// Register a callback receiving every ingested commit, at-least-once,
    /// with no ordering guarantee across streams.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Commit) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.registry.listeners.lock().unwrap();
        listeners.push((id, Arc::new(listener)));
        SubscriptionHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Poll every cluster once. A failing cluster is logged and skipped, so
    /// it never blocks ingestion for the others.
    pub async fn poll_all(&self, clusters: &[Cluster]) {
        for cluster in clusters {
            match self.poll_cluster(cluster).await {
                Ok(0) => {}
                Ok(count) => info!("cluster {}: ingested {} commits", cluster.name, count),
                Err(e) => warn!("cluster {}: ingestion failed: {}", cluster.name, e),
            }
        }
    }

    /// Poll one cluster for new changelists. Returns how many commits were
    /// recorded.
    pub async fn poll_cluster(&self, cluster: &Cluster) -> Result<u64> {
        // Resolve every stream's view up front; views are cheap and may have
        // changed since the previous pass.
        let mut views: HashMap<&str, ViewMap> = HashMap::new();
        let mut watermarks: HashMap<&str, u64> = HashMap::new();
        for stream in &cluster.streams {
            let view = cluster.client.stream_view(stream).await?;
            let watermark = self
                .coordination
                .counter_get(&self.keys.watermark(stream))
                .await?
                .unwrap_or(0);
            views.insert(stream.as_str(), view);
            watermarks.insert(stream.as_str(), watermark);
        }

        // One query per minimal depot root, from the lowest watermark of the
        // streams that root covers.
        let mut roots: BTreeMap<String, u64> = BTreeMap::new();
        for (stream, view) in &views {
            let watermark = watermarks[*stream];
            for root in minimal_depot_roots(view.include_sources().iter().map(String::as_str)) {
                let floor = roots.entry(root).or_insert(u64::MAX);
                *floor = (*floor).min(watermark);
            }
        }

        let mut changes: BTreeSet<u64> = BTreeSet::new();
        for (root, floor) in &roots {
            let found = cluster.client.changes_since(root, *floor).await?;
            changes.extend(found);
        }

        let mut ingested = 0u64;
        for change in changes {
            let info = cluster.client.describe(change).await?;
            let tags = parse_merge_tags(&info.description);

            for stream in &cluster.streams {
                if change <= watermarks[stream.as_str()] {
                    continue;
                }
                let view = &views[stream.as_str()];
                let mapped: Vec<String> = info
                    .files
                    .iter()
                    .filter_map(|f| view.map_path(&f.depot_path))
                    .collect();
                if mapped.is_empty() {
                    continue;
                }
                let base_path = common_prefix(mapped.iter().map(String::as_str));
                if base_path.is_empty() {
                    continue;
                }

                let author_id = self.users.find_or_add(&info.author).await?;
                let owner_id = match &tags.owner {
                    Some(owner) => self.users.find_or_add(owner).await?,
                    None => author_id,
                };

                let commit = Commit {
                    stream: stream.clone(),
                    change,
                    original_change: tags.source_change.unwrap_or(change),
                    author_id,
                    owner_id,
                    description: info.description.clone(),
                    base_path,
                    date_utc: info.date,
                };

                self.commits.upsert(&commit).await?;
                self.coordination
                    .list_push(&self.keys.pending_changes(stream), &change.to_string())
                    .await?;
                self.coordination
                    .set_add(&self.keys.dirty_streams(), stream)
                    .await?;
                self.coordination
                    .counter_set(&self.keys.watermark(stream), change)
                    .await?;
                self.coordination
                    .publish(&self.keys.notify_channel(), stream)
                    .await?;
                debug!("ingested {}@{} base={}", stream, change, commit.base_path);

                // Dispatch task owns delivery; ingestion never waits on it.
                let _ = self.dispatch.send(commit);
                ingested += 1;
            }
        }
        Ok(ingested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{MemoryCommitStore, MemoryUserDirectory};
    use crate::coordination::MemoryCoordinationStore;
    use crate::sim::{SimDepot, SimFile};
    use crate::view::ViewEntry;
    use std::time::Duration;

    struct Fixture {
        coordination: Arc<MemoryCoordinationStore>,
        commits: Arc<MemoryCommitStore>,
        users: Arc<MemoryUserDirectory>,
        ingester: CommitIngester,
        keys: Keys,
    }

    fn fixture() -> Fixture {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let commits = Arc::new(MemoryCommitStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let keys = Keys::new("test");
        let ingester = CommitIngester::new(
            coordination.clone(),
            commits.clone(),
            users.clone(),
            keys.clone(),
        );
        Fixture {
            coordination,
            commits,
            users,
            ingester,
            keys,
        }
    }

    fn cluster(depot: &SimDepot, streams: &[&str]) -> Cluster {
        Cluster {
            name: "main".to_string(),
            client: Arc::new(depot.clone()),
            streams: streams.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_poll_records_commit_and_pending_work() {
        let depot = SimDepot::new();
        depot
            .define_stream("s1", vec![ViewEntry::include("//depot/main/...", "/...")])
            .await;
        let fx = fixture();

        let change = depot
            .submit(
                "alice",
                "first",
                vec![
                    SimFile::add("//depot/main/src/a.rs", b"a"),
                    SimFile::add("//depot/main/src/b.rs", b"b"),
                ],
            )
            .await;

        let count = fx.ingester.poll_cluster(&cluster(&depot, &["s1"])).await.unwrap();
        assert_eq!(count, 1);

        let commit = fx.commits.get("s1", change).await.unwrap().unwrap();
        assert_eq!(commit.base_path, "/src");
        assert_eq!(commit.original_change, change);
        assert_eq!(commit.author_id, commit.owner_id);

        assert_eq!(
            fx.coordination
                .list_range(&fx.keys.pending_changes("s1"), 0, -1)
                .await
                .unwrap(),
            vec![change.to_string()]
        );
        assert_eq!(
            fx.coordination.set_members(&fx.keys.dirty_streams()).await.unwrap(),
            vec!["s1"]
        );
        assert_eq!(
            fx.coordination
                .counter_get(&fx.keys.watermark("s1"))
                .await
                .unwrap(),
            Some(change)
        );
    }

    #[tokio::test]
    async fn test_poll_is_incremental() {
        let depot = SimDepot::new();
        depot
            .define_stream("s1", vec![ViewEntry::include("//depot/main/...", "/...")])
            .await;
        let fx = fixture();
        let cl = cluster(&depot, &["s1"]);

        depot
            .submit("a", "one", vec![SimFile::add("//depot/main/a.txt", b"1")])
            .await;
        assert_eq!(fx.ingester.poll_cluster(&cl).await.unwrap(), 1);
        // Nothing new: watermark prevents re-ingestion
        assert_eq!(fx.ingester.poll_cluster(&cl).await.unwrap(), 0);

        depot
            .submit("a", "two", vec![SimFile::edit("//depot/main/a.txt", b"2")])
            .await;
        assert_eq!(fx.ingester.poll_cluster(&cl).await.unwrap(), 1);
        assert_eq!(
            fx.coordination
                .list_len(&fx.keys.pending_changes("s1"))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_shared_file_reaches_both_streams_independently() {
        let depot = SimDepot::new();
        depot
            .define_stream("wide", vec![ViewEntry::include("//depot/a/...", "/...")])
            .await;
        depot
            .define_stream("narrow", vec![ViewEntry::include("//depot/a/b/...", "/b/...")])
            .await;
        let fx = fixture();

        let change = depot
            .submit(
                "alice",
                "shared",
                vec![
                    SimFile::add("//depot/a/b.txt", b"top"),
                    SimFile::add("//depot/a/b/deep.txt", b"deep"),
                ],
            )
            .await;

        let count = fx
            .ingester
            .poll_cluster(&cluster(&depot, &["wide", "narrow"]))
            .await
            .unwrap();
        assert_eq!(count, 2);

        // Each stream gets its own record with its own minimal base path
        let wide = fx.commits.get("wide", change).await.unwrap().unwrap();
        assert_eq!(wide.base_path, "/");
        let narrow = fx.commits.get("narrow", change).await.unwrap().unwrap();
        assert_eq!(narrow.base_path, "/b/deep.txt");
    }

    #[tokio::test]
    async fn test_merge_tags_resolve_owner_and_source() {
        let depot = SimDepot::new();
        depot
            .define_stream("s1", vec![ViewEntry::include("//depot/main/...", "/...")])
            .await;
        let fx = fixture();

        let change = depot
            .submit(
                "buildbot",
                "Merge fixes\n\nSource-Change: 17\nChange-Owner: jdoe",
                vec![SimFile::add("//depot/main/fix.txt", b"f")],
            )
            .await;
        fx.ingester.poll_cluster(&cluster(&depot, &["s1"])).await.unwrap();

        let commit = fx.commits.get("s1", change).await.unwrap().unwrap();
        assert_eq!(commit.original_change, 17);
        assert_ne!(commit.owner_id, commit.author_id);
        assert_eq!(fx.users.known_users().await, 2);
    }

    #[tokio::test]
    async fn test_unmapped_change_is_skipped() {
        let depot = SimDepot::new();
        depot
            .define_stream("s1", vec![ViewEntry::include("//depot/main/...", "/...")])
            .await;
        let fx = fixture();

        depot
            .submit("a", "elsewhere", vec![SimFile::add("//depot/other/x.txt", b"x")])
            .await;
        assert_eq!(
            fx.ingester.poll_cluster(&cluster(&depot, &["s1"])).await.unwrap(),
            0
        );
        assert!(
            fx.coordination
                .set_members(&fx.keys.dirty_streams())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_listeners_receive_commits_and_unsubscribe() {
        let depot = SimDepot::new();
        depot
            .define_stream("s1", vec![ViewEntry::include("//depot/main/...", "/...")])
            .await;
        let fx = fixture();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handle = fx.ingester.subscribe(move |commit| {
            seen_clone.lock().unwrap().push(commit.change);
            Ok(())
        });
        // A failing listener is logged, never retried, and does not block
        // the one above.
        let _failing = fx.ingester.subscribe(|_| anyhow::bail!("listener down"));

        depot
            .submit("a", "one", vec![SimFile::add("//depot/main/a.txt", b"1")])
            .await;
        fx.ingester.poll_cluster(&cluster(&depot, &["s1"])).await.unwrap();

        // Dispatch runs on a background task
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        handle.unsubscribe();
        depot
            .submit("a", "two", vec![SimFile::edit("//depot/main/a.txt", b"2")])
            .await;
        fx.ingester.poll_cluster(&cluster(&depot, &["s1"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
