//! In-process depot simulator
//!
//! A small in-memory version-control server implementing [`DepotClient`] and
//! [`SyncClient`]. Used by the test suite and by `sim://` clusters in local
//! deployments; real deployments bind the protocol library instead.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use crate::depot::{
    ChangeInfo, ChangedFile, DepotClient, FileAction, FileRevision, SyncClient, SyncEvent,
};
use crate::error::{ReplicationError, Result};
use crate::view::{ViewEntry, ViewMap};

const WRITE_CHUNK: usize = 64 * 1024;

/// One file touched by a simulated submit.
#[derive(Debug, Clone)]
pub struct SimFile {
    pub depot_path: String,
    pub action: FileAction,
    pub content: Option<Bytes>,
}

impl SimFile {
    pub fn add(depot_path: &str, content: &[u8]) -> Self {
        Self {
            depot_path: depot_path.to_string(),
            action: FileAction::Add,
            content: Some(Bytes::copy_from_slice(content)),
        }
    }

    pub fn edit(depot_path: &str, content: &[u8]) -> Self {
        Self {
            depot_path: depot_path.to_string(),
            action: FileAction::Edit,
            content: Some(Bytes::copy_from_slice(content)),
        }
    }

    pub fn delete(depot_path: &str) -> Self {
        Self {
            depot_path: depot_path.to_string(),
            action: FileAction::Delete,
            content: None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimChange {
    info: ChangeInfo,
}

#[derive(Default)]
struct SimState {
    views: HashMap<String, ViewMap>,
    changes: BTreeMap<u64, SimChange>,
    next_change: u64,
    head_revision: HashMap<String, u64>,
    contents: HashMap<(String, u64), Bytes>,
    sync_scopes: Vec<Vec<String>>,
    replayed_scopes: Vec<Vec<String>>,
}

/// Shared in-memory depot.
#[derive(Clone, Default)]
pub struct SimDepot {
    state: Arc<RwLock<SimState>>,
}

impl SimDepot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream with its view mapping.
    pub async fn define_stream(&self, stream: &str, entries: Vec<ViewEntry>) {
        let mut state = self.state.write().await;
        state.views.insert(stream.to_string(), ViewMap::new(entries));
    }

    /// Submit a changelist; returns its change number.
    pub async fn submit(&self, author: &str, description: &str, files: Vec<SimFile>) -> u64 {
        let mut state = self.state.write().await;
        state.next_change += 1;
        let change = state.next_change;

        let mut changed = Vec::with_capacity(files.len());
        for file in files {
            let revision = {
                let head = state.head_revision.entry(file.depot_path.clone()).or_insert(0);
                *head += 1;
                *head
            };
            if let Some(content) = file.content {
                state
                    .contents
                    .insert((file.depot_path.clone(), revision), content);
            }
            changed.push(ChangedFile {
                depot_path: file.depot_path,
                revision,
                action: file.action,
            });
        }

        state.changes.insert(
            change,
            SimChange {
                info: ChangeInfo {
                    change,
                    author: author.to_string(),
                    description: description.to_string(),
                    date: Utc::now(),
                    files: changed,
                },
            },
        );
        change
    }

    /// Number of content syncs issued so far (one per batch).
    pub async fn sync_call_count(&self) -> usize {
        self.state.read().await.sync_scopes.len()
    }

    /// Path scopes of every content sync issued so far, in order.
    pub async fn sync_scopes(&self) -> Vec<Vec<String>> {
        self.state.read().await.sync_scopes.clone()
    }

    /// Path scopes of every quiet replay issued so far, in order.
    pub async fn replayed_scopes(&self) -> Vec<Vec<String>> {
        self.state.read().await.replayed_scopes.clone()
    }
}

/// Match a sync scope pattern: `...` any suffix, `/*` direct children of a
/// directory, otherwise exact.
fn matches_scope(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("...") {
        path.starts_with(prefix)
    } else if let Some(dir) = pattern.strip_suffix("/*") {
        path.rsplit_once('/').map(|(parent, _)| parent == dir).unwrap_or(false)
    } else {
        pattern == path
    }
}

fn in_scope(paths: &[String], path: &str) -> bool {
    paths.iter().any(|pattern| matches_scope(pattern, path))
}

/// Last (revision, action) per path among changes in `(from, to]` matching
/// the scope.
fn changed_between(
    state: &SimState,
    from: u64,
    to: u64,
    paths: &[String],
) -> BTreeMap<String, (u64, FileAction)> {
    let mut latest = BTreeMap::new();
    for (_, change) in state.changes.range(from + 1..=to) {
        for file in &change.info.files {
            if in_scope(paths, &file.depot_path) {
                latest.insert(file.depot_path.clone(), (file.revision, file.action));
            }
        }
    }
    latest
}

fn revisions_between(state: &SimState, from: u64, to: u64, paths: &[String]) -> Vec<FileRevision> {
    changed_between(state, from, to, paths)
        .into_iter()
        .map(|(depot_path, (revision, action))| {
            let size = state
                .contents
                .get(&(depot_path.clone(), revision))
                .map(|c| c.len() as u64)
                .unwrap_or(0);
            FileRevision {
                depot_path,
                revision,
                action,
                size,
            }
        })
        .collect()
}

#[async_trait]
impl DepotClient for SimDepot {
    async fn stream_view(&self, stream: &str) -> Result<ViewMap> {
        let state = self.state.read().await;
        state
            .views
            .get(stream)
            .cloned()
            .ok_or_else(|| ReplicationError::Protocol(format!("unknown stream: {}", stream)))
    }

    async fn changes_since(&self, depot_root: &str, since: u64) -> Result<Vec<u64>> {
        let state = self.state.read().await;
        let scope = vec![depot_root.to_string()];
        Ok(state
            .changes
            .range(since.max(1)..)
            .filter(|(_, c)| c.info.files.iter().any(|f| in_scope(&scope, &f.depot_path)))
            .map(|(change, _)| *change)
            .collect())
    }

    async fn describe(&self, change: u64) -> Result<ChangeInfo> {
        let state = self.state.read().await;
        state
            .changes
            .get(&change)
            .map(|c| c.info.clone())
            .ok_or_else(|| ReplicationError::Protocol(format!("no such change: {}", change)))
    }

    async fn connect_workspace(&self, stream: &str) -> Result<Box<dyn SyncClient>> {
        let state = self.state.read().await;
        if !state.views.contains_key(stream) {
            return Err(ReplicationError::Protocol(format!(
                "unknown stream: {}",
                stream
            )));
        }
        Ok(Box::new(SimSyncClient {
            state: Arc::clone(&self.state),
            workspace: format!("streamsnap-{}-{}", stream, uuid::Uuid::new_v4()),
            have: 0,
        }))
    }
}

/// Workspace-bound client over the shared simulator state.
pub struct SimSyncClient {
    state: Arc<RwLock<SimState>>,
    workspace: String,
    have: u64,
}

#[async_trait]
impl SyncClient for SimSyncClient {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn flush_have(&mut self, change: u64) -> Result<()> {
        self.have = change;
        Ok(())
    }

    async fn sync_metadata(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>> {
        let state = self.state.read().await;
        Ok(revisions_between(&state, self.have, change, paths))
    }

    async fn preview_sync(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>> {
        let state = self.state.read().await;
        Ok(revisions_between(&state, self.have, change, paths))
    }

    async fn sync(&mut self, paths: &[String], change: u64) -> Result<mpsc::Receiver<SyncEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.write().await;
        state.sync_scopes.push(paths.to_vec());

        let mut events = Vec::new();
        for (depot_path, (revision, action)) in changed_between(&state, self.have, change, paths) {
            if action.is_delete() {
                events.push(SyncEvent::Unlink { depot_path });
                continue;
            }
            let content = state
                .contents
                .get(&(depot_path.clone(), revision))
                .cloned()
                .unwrap_or_default();
            events.push(SyncEvent::Open { depot_path });
            for chunk in content.chunks(WRITE_CHUNK) {
                events.push(SyncEvent::Write {
                    data: Bytes::copy_from_slice(chunk),
                });
            }
            events.push(SyncEvent::Close);
        }
        drop(state);

        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn replay_synced(&mut self, paths: &[String], _change: u64) -> Result<()> {
        let mut state = self.state.write().await;
        state.replayed_scopes.push(paths.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_entries() -> Vec<ViewEntry> {
        vec![ViewEntry::include("//depot/main/...", "/...")]
    }

    #[tokio::test]
    async fn test_submit_assigns_changes_and_revisions() {
        let depot = SimDepot::new();
        depot.define_stream("main", view_entries()).await;

        let c1 = depot
            .submit("alice", "add", vec![SimFile::add("//depot/main/a.txt", b"one")])
            .await;
        let c2 = depot
            .submit("bob", "edit", vec![SimFile::edit("//depot/main/a.txt", b"two")])
            .await;
        assert_eq!((c1, c2), (1, 2));

        let info = depot.describe(c2).await.unwrap();
        assert_eq!(info.author, "bob");
        assert_eq!(info.files[0].revision, 2);
    }

    #[tokio::test]
    async fn test_changes_since_scopes_and_floor() {
        let depot = SimDepot::new();
        depot.define_stream("main", view_entries()).await;
        depot
            .submit("a", "one", vec![SimFile::add("//depot/main/x.txt", b"x")])
            .await;
        depot
            .submit("a", "two", vec![SimFile::add("//other/y.txt", b"y")])
            .await;
        depot
            .submit("a", "three", vec![SimFile::edit("//depot/main/x.txt", b"xx")])
            .await;

        let changes = depot.changes_since("//depot/...", 0).await.unwrap();
        assert_eq!(changes, vec![1, 3]);
        let changes = depot.changes_since("//depot/...", 2).await.unwrap();
        assert_eq!(changes, vec![3]);
    }

    #[tokio::test]
    async fn test_incremental_sync_reports_only_diff() {
        let depot = SimDepot::new();
        depot.define_stream("main", view_entries()).await;
        let c1 = depot
            .submit("a", "one", vec![SimFile::add("//depot/main/a.txt", b"aaa")])
            .await;
        let c2 = depot
            .submit(
                "a",
                "two",
                vec![
                    SimFile::add("//depot/main/b.txt", b"bbbb"),
                    SimFile::delete("//depot/main/a.txt"),
                ],
            )
            .await;

        let mut client = depot.connect_workspace("main").await.unwrap();
        client.flush_have(c1).await.unwrap();
        let scope = vec!["//depot/main/...".to_string()];
        let revisions = client.preview_sync(&scope, c2).await.unwrap();

        assert_eq!(revisions.len(), 2);
        let a = revisions.iter().find(|r| r.depot_path.ends_with("a.txt")).unwrap();
        assert!(a.action.is_delete());
        let b = revisions.iter().find(|r| r.depot_path.ends_with("b.txt")).unwrap();
        assert_eq!(b.size, 4);
    }

    #[tokio::test]
    async fn test_sync_event_stream_shape() {
        let depot = SimDepot::new();
        depot.define_stream("main", view_entries()).await;
        let c1 = depot
            .submit(
                "a",
                "one",
                vec![
                    SimFile::add("//depot/main/dir/a.txt", b"hello"),
                    SimFile::add("//depot/main/dir/b.txt", b""),
                ],
            )
            .await;

        let mut client = depot.connect_workspace("main").await.unwrap();
        let mut rx = client
            .sync(&["//depot/main/dir/*".to_string()], c1)
            .await
            .unwrap();

        let mut opens = 0;
        let mut closes = 0;
        let mut bytes = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                SyncEvent::Open { .. } => opens += 1,
                SyncEvent::Write { data } => bytes += data.len(),
                SyncEvent::Close => closes += 1,
                SyncEvent::Unlink { .. } => panic!("unexpected unlink"),
            }
        }
        assert_eq!(opens, 2);
        assert_eq!(closes, 2);
        assert_eq!(bytes, 5);
        assert_eq!(depot.sync_call_count().await, 1);
    }

    #[test]
    fn test_scope_matching() {
        assert!(matches_scope("//d/a/...", "//d/a/b/c.txt"));
        assert!(!matches_scope("//d/a/...", "//d/b/c.txt"));
        assert!(matches_scope("//d/a/*", "//d/a/c.txt"));
        assert!(!matches_scope("//d/a/*", "//d/a/b/c.txt"));
        assert!(matches_scope("//d/a/c.txt", "//d/a/c.txt"));
    }
}
