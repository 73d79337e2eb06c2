//! Shared fixtures for the replication integration tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use streamsnap_core::depot::{FileRevision, SyncClient, SyncEvent};
use streamsnap_core::error::{ReplicationError, Result};

/// Wraps a sync client and fails the Nth content sync, simulating a worker
/// crash mid-build. Earlier batches complete (and checkpoint) normally.
pub struct CrashingSyncClient {
    inner: Box<dyn SyncClient>,
    fail_on_call: usize,
    calls: Arc<AtomicUsize>,
}

impl CrashingSyncClient {
    pub fn new(inner: Box<dyn SyncClient>, fail_on_call: usize) -> Self {
        Self {
            inner,
            fail_on_call,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn sync_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncClient for CrashingSyncClient {
    fn workspace(&self) -> &str {
        self.inner.workspace()
    }

    async fn flush_have(&mut self, change: u64) -> Result<()> {
        self.inner.flush_have(change).await
    }

    async fn sync_metadata(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>> {
        self.inner.sync_metadata(paths, change).await
    }

    async fn preview_sync(&mut self, paths: &[String], change: u64) -> Result<Vec<FileRevision>> {
        self.inner.preview_sync(paths, change).await
    }

    async fn sync(&mut self, paths: &[String], change: u64) -> Result<mpsc::Receiver<SyncEvent>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            return Err(ReplicationError::Protocol(
                "simulated connection loss".to_string(),
            ));
        }
        self.inner.sync(paths, change).await
    }

    async fn replay_synced(&mut self, paths: &[String], change: u64) -> Result<()> {
        self.inner.replay_synced(paths, change).await
    }
}
