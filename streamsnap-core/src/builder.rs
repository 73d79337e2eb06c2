//! Snapshot builder
//!
//! Turns a (base change, target change) pair into a content-addressed
//! snapshot by applying only the file-level diff. Full-content builds run in
//! size-capped directory batches; after every batch the partial tree is
//! persisted under an interim ref, so a crashed or interrupted build resumes
//! from its last checkpoint instead of starting over.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ReplicationMode;
use crate::depot::{SyncClient, SyncEvent};
use crate::error::{ReplicationError, Result};
use crate::tree::{FileEntry, Snapshot, interim_ref, snapshot_ref};
use crate::treestore::{BlobWriter, TreeStore, write_blob};
use crate::view::ViewMap;

/// One snapshot construction request.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub stream: &'a str,
    /// Base change with a known snapshot; 0 when none exists.
    pub base: u64,
    pub target: u64,
    pub mode: ReplicationMode,
    pub filter: Option<&'a str>,
}

/// What a completed build did.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOutcome {
    /// File entries written into the tree.
    pub files: u64,
    /// Content bytes streamed (pointer bytes in revisions-only mode).
    pub bytes: u64,
    /// Content sync batches issued.
    pub batches: u64,
    /// Whether the build resumed from an interim checkpoint.
    pub resumed: bool,
}

/// Builds one snapshot against a stream-bound sync client.
pub struct SnapshotBuilder<'a> {
    store: &'a dyn TreeStore,
    client: &'a mut dyn SyncClient,
    view: &'a ViewMap,
    batch_bytes: u64,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        store: &'a dyn TreeStore,
        client: &'a mut dyn SyncClient,
        view: &'a ViewMap,
        batch_bytes: u64,
    ) -> Self {
        Self {
            store,
            client,
            view,
            batch_bytes,
            cancel: None,
        }
    }

    /// Stop cleanly between batches when the receiver reads `true`. The
    /// current batch always completes and checkpoints first.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the snapshot at `req.target`, given the snapshot at `req.base`
    /// (the empty tree when none exists).
    pub async fn build(&mut self, req: &BuildRequest<'_>, base: &Snapshot) -> Result<BuildOutcome> {
        if req.mode == ReplicationMode::Disabled {
            return Err(ReplicationError::Config(format!(
                "stream {} is disabled",
                req.stream
            )));
        }
        info!(
            "building {}@{} from base @{} ({:?})",
            req.stream, req.target, req.base, req.mode
        );
        self.client.flush_have(req.base).await?;

        match req.mode {
            ReplicationMode::RevisionsOnly => self.build_revisions_only(req, base).await,
            _ => self.build_full(req, base).await,
        }
    }

    fn scope(&self, req: &BuildRequest<'_>) -> Vec<String> {
        match req.filter {
            Some(filter) => vec![filter.to_string()],
            None => self.view.include_sources(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false)
    }

    /// Metadata-only replication: one pointer blob per changed file, no
    /// content bytes read from the server.
    async fn build_revisions_only(
        &mut self,
        req: &BuildRequest<'_>,
        base: &Snapshot,
    ) -> Result<BuildOutcome> {
        let perm = snapshot_ref(req.stream, req.target, req.filter, req.mode);
        let interim = interim_ref(req.stream, req.target, req.filter, req.mode);

        let mut snapshot = base.clone();
        snapshot.pending_replay.clear();

        let scope = self.scope(req);
        let files = self.client.sync_metadata(&scope, req.target).await?;

        let mut outcome = BuildOutcome::default();
        for file in files {
            let Some(rel) = self.view.map_path(&file.depot_path) else {
                continue;
            };
            if file.action.is_delete() {
                snapshot.root.remove_file(&rel);
                continue;
            }
            let pointer = format!("{}#{}", file.depot_path, file.revision);
            let id = write_blob(self.store, pointer.as_bytes()).await?;
            snapshot.root.insert_file(
                &rel,
                FileEntry {
                    id,
                    size: pointer.len() as u64,
                },
            );
            outcome.files += 1;
            outcome.bytes += pointer.len() as u64;
        }

        self.store.write_snapshot(&perm, &snapshot).await?;
        self.store.delete_ref(&interim).await?;
        Ok(outcome)
    }

    async fn build_full(&mut self, req: &BuildRequest<'_>, base: &Snapshot) -> Result<BuildOutcome> {
        let perm = snapshot_ref(req.stream, req.target, req.filter, req.mode);
        let interim = interim_ref(req.stream, req.target, req.filter, req.mode);

        let (mut snapshot, resumed) = match self.store.read_snapshot(&interim).await? {
            Some(checkpoint) => (checkpoint, true),
            None => {
                let mut fresh = base.clone();
                fresh.pending_replay.clear();
                (fresh, false)
            }
        };

        let scope = self.scope(req);
        let preview = self.client.preview_sync(&scope, req.target).await?;

        let mut pending = PendingWork::default();
        let mut sizes: HashMap<String, u64> = HashMap::new();
        for file in &preview {
            let Some(rel) = self.view.map_path(&file.depot_path) else {
                continue;
            };
            if file.action.is_delete() {
                snapshot.root.remove_file(&rel);
                continue;
            }
            pending.insert_file(&file.depot_path, file.size);
            sizes.insert(file.depot_path.clone(), file.size);
        }

        if resumed {
            let replayed = snapshot.pending_replay.clone();
            if !replayed.is_empty() {
                // Bring the fresh workspace up to date with what the tree
                // already holds, without re-reading any bytes.
                self.client.replay_synced(&replayed, req.target).await?;
                pending.apply_replay_list(&replayed);
            }
        }

        let mut outcome = BuildOutcome {
            resumed,
            ..Default::default()
        };

        let remaining = pending.remaining();
        for batch in plan_batches(&remaining, self.batch_bytes) {
            if self.cancelled() {
                return Err(ReplicationError::Interrupted);
            }
            let paths: Vec<String> = batch.iter().map(|(dir, _)| format!("{}/*", dir)).collect();
            debug!(
                "{}@{}: syncing batch of {} directories ({} bytes)",
                req.stream,
                req.target,
                batch.len(),
                batch.iter().map(|(_, size)| size).sum::<u64>()
            );
            self.apply_batch(&paths, req.target, &sizes, &mut snapshot, &mut outcome)
                .await?;

            for (dir, _) in &batch {
                pending.mark_synced(dir);
            }
            snapshot.pending_replay = pending.replay_list();
            self.store.write_snapshot(&interim, &snapshot).await?;
            outcome.batches += 1;
        }

        snapshot.pending_replay.clear();
        self.store.write_snapshot(&perm, &snapshot).await?;
        self.store.delete_ref(&interim).await?;
        Ok(outcome)
    }

    /// Consume one batch's event stream: open/write/close/unlink, verifying
    /// every closed file against its previewed size.
    async fn apply_batch(
        &mut self,
        paths: &[String],
        target: u64,
        sizes: &HashMap<String, u64>,
        snapshot: &mut Snapshot,
        outcome: &mut BuildOutcome,
    ) -> Result<()> {
        let mut rx = self.client.sync(paths, target).await?;
        let mut open: Option<OpenFile> = None;
        let mut discarding = false;

        while let Some(event) = rx.recv().await {
            match event {
                SyncEvent::Open { depot_path } => {
                    if open.is_some() || discarding {
                        return Err(ReplicationError::Protocol(format!(
                            "open for {} while another file is open",
                            depot_path
                        )));
                    }
                    match self.view.map_path(&depot_path) {
                        Some(rel) => {
                            let expected = sizes.get(&depot_path).copied();
                            let writer = self.store.new_blob(expected.unwrap_or(0)).await?;
                            open = Some(OpenFile {
                                depot_path,
                                rel,
                                expected,
                                writer,
                            });
                        }
                        // Outside the view (excluded); skim its bytes.
                        None => discarding = true,
                    }
                }
                SyncEvent::Write { data } => {
                    if discarding {
                        continue;
                    }
                    match open.as_mut() {
                        Some(file) => file.writer.append(&data).await?,
                        None => {
                            return Err(ReplicationError::Protocol(
                                "write without an open file".to_string(),
                            ));
                        }
                    }
                }
                SyncEvent::Close => {
                    if discarding {
                        discarding = false;
                        continue;
                    }
                    let file = open.take().ok_or_else(|| {
                        ReplicationError::Protocol("close without an open file".to_string())
                    })?;
                    let written = file.writer.bytes_written();
                    if let Some(expected) = file.expected {
                        if written != expected {
                            return Err(ReplicationError::SizeMismatch {
                                path: file.depot_path,
                                expected,
                                actual: written,
                            });
                        }
                    }
                    let id = file.writer.finish().await?;
                    snapshot.root.insert_file(&file.rel, FileEntry { id, size: written });
                    outcome.files += 1;
                    outcome.bytes += written;
                }
                SyncEvent::Unlink { depot_path } => {
                    if let Some(rel) = self.view.map_path(&depot_path) {
                        snapshot.root.remove_file(&rel);
                    }
                }
            }
        }

        if open.is_some() || discarding {
            return Err(ReplicationError::Protocol(
                "sync stream ended mid-file".to_string(),
            ));
        }
        Ok(())
    }
}

struct OpenFile {
    depot_path: String,
    rel: String,
    expected: Option<u64>,
    writer: Box<dyn BlobWriter>,
}

/// Partition directories (lexicographically sorted, with previewed byte
/// totals) into sync batches: repeatedly the largest contiguous tail whose
/// total stays within the cap, always at least one directory.
pub(crate) fn plan_batches(dirs: &[(String, u64)], cap: u64) -> Vec<Vec<(String, u64)>> {
    let mut batches = Vec::new();
    let mut end = dirs.len();
    while end > 0 {
        let mut start = end - 1;
        let mut total = dirs[start].1;
        while start > 0 && total + dirs[start - 1].1 <= cap {
            start -= 1;
            total += dirs[start].1;
        }
        batches.push(dirs[start..end].to_vec());
        end = start;
    }
    batches
}

/// Directory tree of not-yet-synced work, built from a preview sync.
/// Ancestor directories are materialized even when they hold no files, so
/// fully-synced subtrees can collapse into a single wildcard entry.
#[derive(Debug, Default)]
struct PendingWork {
    dirs: BTreeMap<String, PendingDir>,
}

#[derive(Debug, Default)]
struct PendingDir {
    bytes: u64,
    file_count: usize,
    synced: bool,
    children: BTreeSet<String>,
}

fn parent_of(path: &str) -> Option<&str> {
    let (parent, _) = path.rsplit_once('/')?;
    if parent.len() <= 1 {
        return None;
    }
    Some(parent)
}

impl PendingWork {
    fn insert_file(&mut self, depot_path: &str, size: u64) {
        let Some(dir) = parent_of(depot_path) else {
            return;
        };
        {
            let entry = self.dirs.entry(dir.to_string()).or_default();
            entry.bytes += size;
            entry.file_count += 1;
        }
        let mut child = dir.to_string();
        while let Some(parent) = parent_of(&child) {
            let entry = self.dirs.entry(parent.to_string()).or_default();
            entry.children.insert(child.clone());
            child = parent.to_string();
        }
    }

    /// Unsynced directories holding files, in lexicographic order, with
    /// their previewed byte totals.
    fn remaining(&self) -> Vec<(String, u64)> {
        self.dirs
            .iter()
            .filter(|(_, dir)| dir.file_count > 0 && !dir.synced)
            .map(|(path, dir)| (path.clone(), dir.bytes))
            .collect()
    }

    fn mark_synced(&mut self, dir: &str) {
        if let Some(entry) = self.dirs.get_mut(dir) {
            entry.synced = true;
        }
    }

    fn subtree_synced(&self, dir: &str) -> bool {
        let Some(entry) = self.dirs.get(dir) else {
            return true;
        };
        (entry.file_count == 0 || entry.synced)
            && entry.children.iter().all(|child| self.subtree_synced(child))
    }

    fn has_files(&self, dir: &str) -> bool {
        let Some(entry) = self.dirs.get(dir) else {
            return false;
        };
        entry.file_count > 0 || entry.children.iter().any(|child| self.has_files(child))
    }

    /// Compact wildcard list of everything synced so far: a fully-synced
    /// subtree collapses to `dir/...`, a synced directory with unsynced
    /// descendants stays `dir/*`.
    fn replay_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        for root in self.roots() {
            self.emit_replayed(&root, &mut out);
        }
        out
    }

    fn roots(&self) -> Vec<String> {
        self.dirs
            .keys()
            .filter(|path| parent_of(path).is_none())
            .cloned()
            .collect()
    }

    fn emit_replayed(&self, dir: &str, out: &mut Vec<String>) {
        if !self.has_files(dir) {
            return;
        }
        if self.subtree_synced(dir) {
            out.push(format!("{}/...", dir));
            return;
        }
        let Some(entry) = self.dirs.get(dir) else {
            return;
        };
        if entry.synced && entry.file_count > 0 {
            out.push(format!("{}/*", dir));
        }
        for child in &entry.children {
            self.emit_replayed(child, out);
        }
    }

    /// Mark directories covered by a previously checkpointed replay list as
    /// already synced.
    fn apply_replay_list(&mut self, paths: &[String]) {
        for path in paths {
            if let Some(dir) = path.strip_suffix("/...") {
                let prefix = format!("{}/", dir);
                for (key, entry) in self.dirs.iter_mut() {
                    if key.as_str() == dir || key.starts_with(&prefix) {
                        entry.synced = true;
                    }
                }
            } else if let Some(dir) = path.strip_suffix("/*") {
                self.mark_synced(dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(sizes: &[(&str, u64)]) -> Vec<(String, u64)> {
        sizes.iter().map(|(d, s)| (d.to_string(), *s)).collect()
    }

    #[test]
    fn test_plan_batches_respects_cap() {
        // Sizes 0.3/0.3/0.5 of the cap: exactly two batches, neither above
        // the cap.
        let plan = plan_batches(&dirs(&[("//d/a", 300), ("//d/b", 300), ("//d/c", 500)]), 1000);
        assert_eq!(plan.len(), 2);
        for batch in &plan {
            assert!(batch.iter().map(|(_, s)| s).sum::<u64>() <= 1000);
        }
        // Tail first: c+b fit, a spills into the second batch
        assert_eq!(plan[0].len(), 2);
        assert_eq!(plan[1].len(), 1);
        assert_eq!(plan[1][0].0, "//d/a");
    }

    #[test]
    fn test_plan_batches_single_oversized_dir() {
        let plan = plan_batches(&dirs(&[("//d/a", 100), ("//d/huge", 5000)]), 1000);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], dirs(&[("//d/huge", 5000)]));
        assert_eq!(plan[1], dirs(&[("//d/a", 100)]));
    }

    #[test]
    fn test_plan_batches_all_fit() {
        let plan = plan_batches(&dirs(&[("//d/a", 10), ("//d/b", 20)]), 1000);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len(), 2);
    }

    #[test]
    fn test_plan_batches_empty() {
        assert!(plan_batches(&[], 1000).is_empty());
    }

    #[test]
    fn test_pending_work_materializes_ancestors() {
        let mut pending = PendingWork::default();
        pending.insert_file("//d/a/b/one.txt", 10);
        pending.insert_file("//d/a/b/two.txt", 20);
        pending.insert_file("//d/a/three.txt", 5);

        assert_eq!(
            pending.remaining(),
            vec![("//d/a".to_string(), 5), ("//d/a/b".to_string(), 30)]
        );
        // //d holds no files but is materialized for collapsing
        assert!(pending.dirs.contains_key("//d"));
        assert_eq!(pending.roots(), vec!["//d".to_string()]);
    }

    #[test]
    fn test_replay_list_collapses_synced_subtrees() {
        let mut pending = PendingWork::default();
        pending.insert_file("//d/a/one.txt", 1);
        pending.insert_file("//d/a/sub/two.txt", 1);
        pending.insert_file("//d/b/three.txt", 1);

        pending.mark_synced("//d/a");
        pending.mark_synced("//d/a/sub");
        assert_eq!(pending.replay_list(), vec!["//d/a/...".to_string()]);

        pending.mark_synced("//d/b");
        // Everything under //d is now synced: adjacent wildcards merge
        assert_eq!(pending.replay_list(), vec!["//d/...".to_string()]);
    }

    #[test]
    fn test_replay_list_partial_dir_stays_narrow() {
        let mut pending = PendingWork::default();
        pending.insert_file("//d/a/one.txt", 1);
        pending.insert_file("//d/a/sub/two.txt", 1);

        pending.mark_synced("//d/a");
        assert_eq!(pending.replay_list(), vec!["//d/a/*".to_string()]);
    }

    #[test]
    fn test_apply_replay_list_roundtrip() {
        let make = || {
            let mut pending = PendingWork::default();
            pending.insert_file("//d/a/one.txt", 1);
            pending.insert_file("//d/a/sub/two.txt", 1);
            pending.insert_file("//d/b/three.txt", 1);
            pending
        };

        let mut first = make();
        first.mark_synced("//d/a");
        first.mark_synced("//d/a/sub");
        let list = first.replay_list();

        let mut resumed = make();
        resumed.apply_replay_list(&list);
        assert_eq!(resumed.remaining(), vec![("//d/b".to_string(), 1)]);
    }
}
