//! Tree-store abstraction
//!
//! Interface to the external content-addressed blob/tree store. The engine
//! itself (chunking, compression, garbage collection) lives outside this
//! crate; replication only needs to stream blob bytes in, persist snapshot
//! nodes under named refs, and read them back.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::tree::{ObjectId, Snapshot};

/// Result type for tree-store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during tree-store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Incremental writer for one file's content.
///
/// Bytes are fed to the store's chunker as they arrive from the
/// version-control event stream; `finish` seals the blob and returns its
/// content hash.
#[async_trait]
pub trait BlobWriter: Send {
    /// Append a chunk of content.
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Total bytes appended so far.
    fn bytes_written(&self) -> u64;

    /// Seal the blob and return its content id.
    async fn finish(self: Box<Self>) -> Result<ObjectId>;
}

/// Interface to the content-addressed snapshot store.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Open an incremental writer for one file. `size_hint` is the previewed
    /// byte count and may be used to size buffers.
    async fn new_blob(&self, size_hint: u64) -> Result<Box<dyn BlobWriter>>;

    /// Read a blob back by content id.
    async fn read_blob(&self, id: ObjectId) -> Result<Option<Bytes>>;

    /// Serialize a snapshot under a named ref, returning its root id.
    /// Overwrites any previous value of the ref.
    async fn write_snapshot(&self, ref_name: &str, snapshot: &Snapshot) -> Result<ObjectId>;

    /// Read a snapshot back from a named ref.
    async fn read_snapshot(&self, ref_name: &str) -> Result<Option<Snapshot>>;

    /// Whether a named ref exists.
    async fn has_ref(&self, ref_name: &str) -> Result<bool>;

    /// Delete a named ref. Returns whether it existed. Blob data is left to
    /// the store's own garbage collection.
    async fn delete_ref(&self, ref_name: &str) -> Result<bool>;
}

/// In-memory tree store for tests and embedded deployments.
///
/// Blobs are deduplicated by content hash, so replicating a change costs
/// only the blobs that actually differ from what is already stored.
#[derive(Default)]
pub struct MemoryTreeStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: HashMap<ObjectId, Bytes>,
    refs: HashMap<String, Bytes>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held (after deduplication).
    pub fn blob_count(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }

    /// All ref names currently present, sorted.
    pub fn ref_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().refs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn new_blob(&self, size_hint: u64) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            inner: Arc::clone(&self.inner),
            hasher: Sha256::new(),
            buf: Vec::with_capacity(size_hint.min(64 * 1024 * 1024) as usize),
        }))
    }

    async fn read_blob(&self, id: ObjectId) -> Result<Option<Bytes>> {
        Ok(self.inner.lock().unwrap().blobs.get(&id).cloned())
    }

    async fn write_snapshot(&self, ref_name: &str, snapshot: &Snapshot) -> Result<ObjectId> {
        let data =
            bincode::serialize(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = ObjectId::from_data(&data);
        let mut inner = self.inner.lock().unwrap();
        inner.refs.insert(ref_name.to_string(), Bytes::from(data));
        Ok(id)
    }

    async fn read_snapshot(&self, ref_name: &str) -> Result<Option<Snapshot>> {
        let data = match self.inner.lock().unwrap().refs.get(ref_name) {
            Some(data) => data.clone(),
            None => return Ok(None),
        };
        let snapshot =
            bincode::deserialize(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn has_ref(&self, ref_name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().refs.contains_key(ref_name))
    }

    async fn delete_ref(&self, ref_name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().refs.remove(ref_name).is_some())
    }
}

struct MemoryBlobWriter {
    inner: Arc<Mutex<MemoryInner>>,
    hasher: Sha256,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn finish(self: Box<Self>) -> Result<ObjectId> {
        let this = *self;
        let id = ObjectId::new(this.hasher.finalize().into());
        let mut inner = this.inner.lock().unwrap();
        inner.blobs.entry(id).or_insert_with(|| Bytes::from(this.buf));
        Ok(id)
    }
}

/// Write a complete small blob in one call and return its entry-sized id.
pub async fn write_blob(store: &dyn TreeStore, data: &[u8]) -> Result<ObjectId> {
    let mut writer = store.new_blob(data.len() as u64).await?;
    writer.append(data).await?;
    writer.finish().await
}
