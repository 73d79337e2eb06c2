//! Snapshot tree model
//!
//! Content-addressable directory trees describing a stream's files at one
//! changelist, plus the ref-naming scheme used to persist them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::ReplicationMode;

/// Version prefix baked into every persisted ref name. Bump when the
/// serialized snapshot layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Unique identifier for any stored blob or tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A replicated file: content hash plus size in bytes.
///
/// In revisions-only mode the hash addresses a pointer blob of the form
/// `"<depotPath>#<revision>"` rather than the file's real content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: ObjectId,
    pub size: u64,
}

/// Directory tree of replicated files.
///
/// Entries are kept sorted so serialization (and therefore hashing) is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirTree {
    pub files: BTreeMap<String, FileEntry>,
    pub dirs: BTreeMap<String, DirTree>,
}

impl DirTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file at a stream-relative path.
    pub fn insert_file(&mut self, path: &str, entry: FileEntry) {
        let mut parts = split_path(path);
        let Some(name) = parts.pop() else {
            return;
        };
        let mut node = self;
        for part in parts {
            node = node.dirs.entry(part.to_string()).or_default();
        }
        node.files.insert(name.to_string(), entry);
    }

    /// Remove a file, pruning directories left empty. Returns the removed
    /// entry if the path existed.
    pub fn remove_file(&mut self, path: &str) -> Option<FileEntry> {
        let mut parts = split_path(path);
        let name = parts.pop()?;
        self.remove_inner(&parts, name)
    }

    fn remove_inner(&mut self, dirs: &[&str], name: &str) -> Option<FileEntry> {
        match dirs.split_first() {
            None => self.files.remove(name),
            Some((head, rest)) => {
                let child = self.dirs.get_mut(*head)?;
                let removed = child.remove_inner(rest, name);
                if removed.is_some() && child.is_empty() {
                    self.dirs.remove(*head);
                }
                removed
            }
        }
    }

    /// Look up a file by stream-relative path.
    pub fn get_file(&self, path: &str) -> Option<&FileEntry> {
        let mut parts = split_path(path);
        let name = parts.pop()?;
        let mut node = self;
        for part in parts {
            node = node.dirs.get(part)?;
        }
        node.files.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    /// Total number of files in the tree.
    pub fn file_count(&self) -> u64 {
        self.files.len() as u64 + self.dirs.values().map(DirTree::file_count).sum::<u64>()
    }

    /// Visit every file as `(stream-relative path, entry)`.
    pub fn walk(&self, mut visit: impl FnMut(&str, &FileEntry)) {
        self.walk_inner(String::new(), &mut visit);
    }

    fn walk_inner(&self, prefix: String, visit: &mut impl FnMut(&str, &FileEntry)) {
        for (name, entry) in &self.files {
            visit(&format!("{}/{}", prefix, name), entry);
        }
        for (name, dir) in &self.dirs {
            dir.walk_inner(format!("{}/{}", prefix, name), visit);
        }
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(&bincode::serialize(self).unwrap_or_default())
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// A stream snapshot as persisted under a ref name.
///
/// `pending_replay` lists depot-relative directory scopes already captured in
/// `root` but not yet replayed against a fresh workspace — non-empty only on
/// interim checkpoints. A completed snapshot always carries an empty list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pending_replay: Vec<String>,
    pub root: DirTree,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.pending_replay.is_empty()
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(&bincode::serialize(self).unwrap_or_default())
    }
}

/// Permanent ref name for a stream snapshot:
/// `v{SCHEMA}/{stream}/{change}[-flt_{6-hex-filter-digest}][-revs]`.
pub fn snapshot_ref(
    stream: &str,
    change: u64,
    filter: Option<&str>,
    mode: ReplicationMode,
) -> String {
    let mut name = format!("v{}/{}/{}", SCHEMA_VERSION, stream, change);
    if let Some(filter) = filter {
        name.push_str("-flt_");
        name.push_str(&filter_digest(filter));
    }
    if mode == ReplicationMode::RevisionsOnly {
        name.push_str("-revs");
    }
    name
}

/// Interim checkpoint ref for the same snapshot, written after every
/// sub-batch and deleted only on successful completion.
pub fn interim_ref(
    stream: &str,
    change: u64,
    filter: Option<&str>,
    mode: ReplicationMode,
) -> String {
    format!("{}-inc", snapshot_ref(stream, change, filter, mode))
}

fn filter_digest(filter: &str) -> String {
    let digest = Sha256::digest(filter.as_bytes());
    hex::encode(digest)[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8]) -> FileEntry {
        FileEntry {
            id: ObjectId::from_data(data),
            size: data.len() as u64,
        }
    }

    #[test]
    fn test_object_id_roundtrip() {
        let bytes = [42u8; 32];
        let id = ObjectId::new(bytes);
        let hex = id.to_hex();
        let id2 = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_insert_get_remove() {
        let mut tree = DirTree::new();
        tree.insert_file("/a/b/file.txt", entry(b"hello"));
        assert!(tree.get_file("/a/b/file.txt").is_some());
        assert_eq!(tree.file_count(), 1);

        tree.remove_file("/a/b/file.txt");
        assert!(tree.get_file("/a/b/file.txt").is_none());
        // Empty intermediate directories are pruned
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_keeps_populated_dirs() {
        let mut tree = DirTree::new();
        tree.insert_file("/a/one.txt", entry(b"1"));
        tree.insert_file("/a/two.txt", entry(b"2"));
        tree.remove_file("/a/one.txt");
        assert!(tree.get_file("/a/two.txt").is_some());
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_tree_id_is_order_independent() {
        let mut a = DirTree::new();
        a.insert_file("/x/1.txt", entry(b"1"));
        a.insert_file("/x/2.txt", entry(b"2"));

        let mut b = DirTree::new();
        b.insert_file("/x/2.txt", entry(b"2"));
        b.insert_file("/x/1.txt", entry(b"1"));

        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_walk_visits_all_files() {
        let mut tree = DirTree::new();
        tree.insert_file("/a/1.txt", entry(b"1"));
        tree.insert_file("/a/b/2.txt", entry(b"2"));
        tree.insert_file("/3.txt", entry(b"3"));

        let mut seen = Vec::new();
        tree.walk(|path, _| seen.push(path.to_string()));
        seen.sort();
        assert_eq!(seen, vec!["/3.txt", "/a/1.txt", "/a/b/2.txt"]);
    }

    #[test]
    fn test_ref_names() {
        assert_eq!(
            snapshot_ref("ue-main", 42, None, ReplicationMode::Full),
            "v1/ue-main/42"
        );
        let with_filter = snapshot_ref("ue-main", 42, Some("/Engine/..."), ReplicationMode::Full);
        assert!(with_filter.starts_with("v1/ue-main/42-flt_"));
        assert_eq!(with_filter.len(), "v1/ue-main/42-flt_".len() + 6);

        assert_eq!(
            snapshot_ref("ue-main", 42, None, ReplicationMode::RevisionsOnly),
            "v1/ue-main/42-revs"
        );
        assert_eq!(
            interim_ref("ue-main", 42, None, ReplicationMode::RevisionsOnly),
            "v1/ue-main/42-revs-inc"
        );
    }

    #[test]
    fn test_filter_changes_digest() {
        let a = snapshot_ref("s", 1, Some("/Engine/..."), ReplicationMode::Full);
        let b = snapshot_ref("s", 1, Some("/Game/..."), ReplicationMode::Full);
        assert_ne!(a, b);
    }
}
