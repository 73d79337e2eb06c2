//! Version-control client interface
//!
//! The protocol library itself is an external collaborator; replication only
//! depends on the operations below. `DepotClient` is a per-cluster
//! connection used by commit ingestion; `SyncClient` binds a connection to a
//! dedicated read-only workspace for one stream and is mutated only by the
//! worker holding that stream's reservation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::view::ViewMap;

/// What a changelist did to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    Add,
    Edit,
    Delete,
    Branch,
    Integrate,
    MoveAdd,
    MoveDelete,
    Purge,
    Archive,
}

impl FileAction {
    /// Whether this action removes the file from the stream. Deleted files
    /// must resolve to "absent" in a snapshot, never to a stale entry.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            FileAction::Delete | FileAction::MoveDelete | FileAction::Purge | FileAction::Archive
        )
    }
}

/// One file touched by a changelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub depot_path: String,
    pub revision: u64,
    pub action: FileAction,
}

/// A described changelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub change: u64,
    pub author: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub files: Vec<ChangedFile>,
}

/// One file revision reported by a metadata or preview sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    pub depot_path: String,
    pub revision: u64,
    pub action: FileAction,
    pub size: u64,
}

/// Low-level event emitted by a content sync, consumed by a single-threaded
/// reducer per batch (file writers are never shared across batches).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A file transfer begins.
    Open { depot_path: String },
    /// Content bytes for the currently open file.
    Write { data: Bytes },
    /// The currently open file is complete.
    Close,
    /// A file was removed at the target change.
    Unlink { depot_path: String },
}

/// Per-cluster connection to the version-control server.
///
/// Transient protocol errors ("no such files") are the implementation's
/// concern: they surface as empty results, not errors.
#[async_trait]
pub trait DepotClient: Send + Sync {
    /// Resolve a stream's current view mapping.
    async fn stream_view(&self, stream: &str) -> Result<ViewMap>;

    /// Submitted changelist numbers under a depot root pattern, at or above
    /// `since`. Order is unspecified; duplicates allowed.
    async fn changes_since(&self, depot_root: &str, since: u64) -> Result<Vec<u64>>;

    /// Describe one submitted changelist.
    async fn describe(&self, change: u64) -> Result<ChangeInfo>;

    /// Bind a connection plus a dedicated read-only workspace to a stream.
    async fn connect_workspace(&self, stream: &str) -> Result<Box<dyn SyncClient>>;
}

/// A connection bound to one stream's replication workspace.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Identifier of the bound workspace (used for cache invalidation).
    fn workspace(&self) -> &str;

    /// Force the workspace's "have" state to exactly `change`; 0 flushes to
    /// an empty workspace.
    async fn flush_have(&mut self, change: u64) -> Result<()>;

    /// Metadata-only sync ("sync -k"): report every file's revision at
    /// `change` under the given path patterns without transferring content.
    async fn sync_metadata(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>>;

    /// Preview sync: what would change, with previewed byte sizes, without
    /// transferring content or moving the have state.
    async fn preview_sync(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>>;

    /// Real content sync restricted to the given path patterns, emitting the
    /// low-level event stream.
    async fn sync(&mut self, paths: &[String], change: u64) -> Result<mpsc::Receiver<SyncEvent>>;

    /// Quiet forced sync of already-replicated paths to `change`, updating
    /// workspace state without re-reading file bytes.
    async fn replay_synced(&mut self, paths: &[String], change: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_actions() {
        assert!(FileAction::Delete.is_delete());
        assert!(FileAction::MoveDelete.is_delete());
        assert!(FileAction::Purge.is_delete());
        assert!(FileAction::Archive.is_delete());
        assert!(!FileAction::Add.is_delete());
        assert!(!FileAction::Edit.is_delete());
        assert!(!FileAction::Branch.is_delete());
        assert!(!FileAction::Integrate.is_delete());
        assert!(!FileAction::MoveAdd.is_delete());
    }
}
