//! StreamSnap Core Library
//!
//! Core functionality for StreamSnap including:
//! - Commit ingestion (changelist discovery, cross-branch deduplication)
//! - Distributed replication scheduler (reservations, heartbeats, expiry)
//! - Incremental snapshot builder with crash-recoverable checkpoints
//! - Coordination store abstraction (in-process and Redis)
//! - Content-addressed snapshot tree model and store interface
//! - Version-control client interface and in-process simulator

pub mod builder;
pub mod commit;
pub mod config;
pub mod coordination;
pub mod depot;
pub mod error;
pub mod ingest;
pub mod redis_coordination;
pub mod scheduler;
pub mod sim;
pub mod status;
pub mod tree;
pub mod treestore;
pub mod view;

pub use builder::{BuildOutcome, BuildRequest, SnapshotBuilder};
pub use commit::{Commit, CommitStore, MemoryCommitStore, MemoryUserDirectory, UserDirectory};
pub use config::{
    ReplicationConfig, ReplicationMode, SettingsSource, SharedSettings, StreamSettings,
};
pub use coordination::{CoordinationStore, Keys, MemoryCoordinationStore};
pub use depot::{
    ChangeInfo, ChangedFile, DepotClient, FileAction, FileRevision, SyncClient, SyncEvent,
};
pub use error::{ReplicationError, Result};
pub use ingest::{Cluster, CommitIngester, SubscriptionHandle};
pub use redis_coordination::RedisCoordinationStore;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use status::{BuildRecord, StatusLog};
pub use tree::{DirTree, FileEntry, ObjectId, SCHEMA_VERSION, Snapshot, interim_ref, snapshot_ref};
pub use treestore::{BlobWriter, MemoryTreeStore, StoreError, TreeStore};
pub use view::{ViewEntry, ViewMap};
