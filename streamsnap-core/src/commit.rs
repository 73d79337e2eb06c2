//! Commit records
//!
//! Immutable, per-stream records of submitted changelists, produced by
//! commit ingestion and read by the scheduler and external consumers.
//! Identity is `(stream, change)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;

/// Resolved user identifier.
pub type UserId = u64;

/// Description tag naming the changelist a cross-stream merge was copied
/// from, e.g. `Source-Change: 12345`.
pub const TAG_SOURCE_CHANGE: &str = "source-change:";

/// Description tag naming the login a merge was submitted on behalf of,
/// e.g. `Change-Owner: jdoe`.
pub const TAG_CHANGE_OWNER: &str = "change-owner:";

/// One submitted changelist as seen by one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Stream this record belongs to.
    pub stream: String,
    /// Changelist number on this stream.
    pub change: u64,
    /// Changelist the content originated from; differs from `change` only
    /// for cross-stream merges annotated in the description.
    pub original_change: u64,
    /// User who submitted the changelist.
    pub author_id: UserId,
    /// User the change was merged on behalf of; equals `author_id` unless
    /// the description carries an owner tag.
    pub owner_id: UserId,
    /// Changelist description.
    pub description: String,
    /// Longest common stream-relative prefix of the files this change
    /// touched within the stream's view.
    pub base_path: String,
    /// Submission time.
    pub date_utc: DateTime<Utc>,
}

/// Optional merge annotations parsed out of a changelist description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeTags {
    pub source_change: Option<u64>,
    pub owner: Option<String>,
}

/// Scan a description for merge tags. Tags are matched per line,
/// case-insensitively, anywhere in the text; the first occurrence of each
/// tag wins.
pub fn parse_merge_tags(description: &str) -> MergeTags {
    let mut tags = MergeTags::default();
    for line in description.lines() {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        if tags.source_change.is_none() {
            if let Some(pos) = lower.find(TAG_SOURCE_CHANGE) {
                let rest = line[pos + TAG_SOURCE_CHANGE.len()..].trim();
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                tags.source_change = digits.parse().ok();
            }
        }
        if tags.owner.is_none() {
            if let Some(pos) = lower.find(TAG_CHANGE_OWNER) {
                let rest = line[pos + TAG_CHANGE_OWNER.len()..].trim();
                let login: String = rest
                    .chars()
                    .take_while(|c| !c.is_whitespace())
                    .collect();
                if !login.is_empty() {
                    tags.owner = Some(login);
                }
            }
        }
    }
    tags
}

/// Durable commit storage. Upserts must be idempotent on `(stream, change)`.
#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn upsert(&self, commit: &Commit) -> Result<()>;

    async fn get(&self, stream: &str, change: u64) -> Result<Option<Commit>>;

    /// Commits for one stream in ascending change order.
    async fn list(&self, stream: &str) -> Result<Vec<Commit>>;
}

/// User lookup, creating records on first sight of a login.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_or_add(&self, login: &str) -> Result<UserId>;
}

/// In-memory commit store.
#[derive(Default)]
pub struct MemoryCommitStore {
    commits: Arc<RwLock<HashMap<(String, u64), Commit>>>,
}

impl MemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitStore for MemoryCommitStore {
    async fn upsert(&self, commit: &Commit) -> Result<()> {
        let mut commits = self.commits.write().await;
        commits.insert((commit.stream.clone(), commit.change), commit.clone());
        Ok(())
    }

    async fn get(&self, stream: &str, change: u64) -> Result<Option<Commit>> {
        let commits = self.commits.read().await;
        Ok(commits.get(&(stream.to_string(), change)).cloned())
    }

    async fn list(&self, stream: &str) -> Result<Vec<Commit>> {
        let commits = self.commits.read().await;
        let mut result: Vec<Commit> = commits
            .values()
            .filter(|c| c.stream == stream)
            .cloned()
            .collect();
        result.sort_by_key(|c| c.change);
        Ok(result)
    }
}

/// In-memory user directory assigning sequential ids.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Arc<RwLock<HashMap<String, UserId>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn known_users(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_or_add(&self, login: &str) -> Result<UserId> {
        let mut users = self.users.write().await;
        let next = users.len() as UserId + 1;
        Ok(*users.entry(login.to_string()).or_insert(next))
    }
}
