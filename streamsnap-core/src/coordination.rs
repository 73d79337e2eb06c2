//! Coordination store abstraction
//!
//! Shared key-value service used for cross-process scheduling: a set of
//! dirty streams, a pending-change list per stream, a sorted set of
//! reservations, and a notification channel. Conditional operations return
//! whether the condition held; a `false` means "someone else changed the
//! state" and callers retry, they never treat it as an error.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{ReplicationError, Result};

/// Key layout for one deployment namespace.
#[derive(Debug, Clone)]
pub struct Keys {
    ns: String,
}

impl Keys {
    pub fn new(ns: &str) -> Self {
        Self { ns: ns.to_string() }
    }

    /// Set of stream ids with pending work.
    pub fn dirty_streams(&self) -> String {
        format!("{}/streams", self.ns)
    }

    /// Sorted set of stream reservations, score = lease expiry (epoch ms).
    pub fn reservations(&self) -> String {
        format!("{}/reservations", self.ns)
    }

    /// List of pending change numbers for one stream.
    pub fn pending_changes(&self, stream: &str) -> String {
        format!("{}/stream/{}/changes", self.ns, stream)
    }

    /// Last-ingested change number for one stream.
    pub fn watermark(&self, stream: &str) -> String {
        format!("{}/stream/{}/watermark", self.ns, stream)
    }

    /// Channel carrying a stream id whenever new work is appended.
    pub fn notify_channel(&self) -> String {
        format!("{}/notify", self.ns)
    }
}

/// Redis-like coordination service: sets, lists, sorted sets, pub/sub, and
/// atomic conditional transactions.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Add a member to a set. Returns whether it was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Remove `member` from the set only if the list at `list_key` holds at
    /// most `max_len` entries. Returns whether the condition held (the
    /// member may already have been absent).
    async fn set_remove_if_list_short(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        max_len: u64,
    ) -> Result<bool>;

    /// Append to the tail of a list; returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<u64>;

    /// Inclusive range read, Redis-style indices (0-based, negative from the
    /// tail).
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Pop the head of the list only if it still equals `expected`.
    async fn list_pop_if_head(&self, key: &str, expected: &str) -> Result<bool>;

    /// Drop everything but the newest entry.
    async fn list_trim_to_last(&self, key: &str) -> Result<()>;

    /// Insert a scored member only if absent. Returns whether it was
    /// inserted — the "create if absent" reservation acquire.
    async fn zset_add_if_absent(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Update an existing member's score. Returns false if the member is
    /// gone (e.g. the reservation expired under us).
    async fn zset_update(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove members with score at or below `cutoff`; returns how many.
    async fn zset_remove_below(&self, key: &str, cutoff: i64) -> Result<u64>;

    /// All members with scores, ascending by score.
    async fn zset_entries(&self, key: &str) -> Result<Vec<(String, i64)>>;

    async fn counter_get(&self, key: &str) -> Result<Option<u64>>;

    async fn counter_set(&self, key: &str, value: u64) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. The receiver yields payloads published after
    /// this call returns.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// Single-process coordination store for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, Vec<String>>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
    counters: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let start = norm(start);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.sets.entry(key.to_string()).or_default();
        if set.iter().any(|m| m == member) {
            Ok(false)
        } else {
            set.push(member.to_string());
            Ok(true)
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sets.get(key).cloned().unwrap_or_default())
    }

    async fn set_remove_if_list_short(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        max_len: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.lists.get(list_key).map(|l| l.len() as u64).unwrap_or(0);
        if len > max_len {
            return Ok(false);
        }
        if let Some(set) = inner.sets.get_mut(set_key) {
            set.retain(|m| m != member);
        }
        Ok(true)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = resolve_range(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_pop_if_head(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(false);
        };
        if list.front().map(|s| s.as_str()) == Some(expected) {
            list.pop_front();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_trim_to_last(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.lists.get_mut(key) {
            while list.len() > 1 {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn zset_add_if_absent(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        if zset.contains_key(member) {
            Ok(false)
        } else {
            zset.insert(member.to_string(), score);
            Ok(true)
        }
    }

    async fn zset_update(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.zsets.get_mut(key).and_then(|z| z.get_mut(member)) {
            Some(existing) => {
                *existing = score;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zset_remove_below(&self, key: &str, cutoff: i64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, score| *score > cutoff);
        Ok((before - zset.len()) as u64)
    }

    async fn zset_entries(&self, key: &str) -> Result<Vec<(String, i64)>> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<(String, i64)> = inner
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by_key(|(_, score)| *score);
        Ok(entries)
    }

    async fn counter_get(&self, key: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.counters.get(key).copied())
    }

    async fn counter_set(&self, key: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

/// Map a backend error into the coordination taxonomy.
pub(crate) fn backend_err(e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Coordination(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("snap");
        assert_eq!(keys.dirty_streams(), "snap/streams");
        assert_eq!(keys.reservations(), "snap/reservations");
        assert_eq!(keys.pending_changes("main"), "snap/stream/main/changes");
        assert_eq!(keys.watermark("main"), "snap/stream/main/watermark");
        assert_eq!(keys.notify_channel(), "snap/notify");
    }

    #[tokio::test]
    async fn test_set_add_is_idempotent() {
        let store = MemoryCoordinationStore::new();
        assert!(store.set_add("s", "a").await.unwrap());
        assert!(!store.set_add("s", "a").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_list_range_and_len() {
        let store = MemoryCoordinationStore::new();
        for v in ["1", "2", "3"] {
            store.list_push("l", v).await.unwrap();
        }
        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(store.list_range("l", 0, 1).await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.list_range("l", -1, -1).await.unwrap(), vec!["3"]);
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["1", "2", "3"]);
        assert!(store.list_range("missing", 0, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_pop_if_head() {
        let store = MemoryCoordinationStore::new();
        store.list_push("l", "10").await.unwrap();
        store.list_push("l", "20").await.unwrap();

        assert!(!store.list_pop_if_head("l", "20").await.unwrap());
        assert!(store.list_pop_if_head("l", "10").await.unwrap());
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["20"]);
    }

    #[tokio::test]
    async fn test_list_trim_to_last() {
        let store = MemoryCoordinationStore::new();
        for v in ["1", "2", "3"] {
            store.list_push("l", v).await.unwrap();
        }
        store.list_trim_to_last("l").await.unwrap();
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["3"]);

        // Trimming an empty list is a no-op
        store.list_trim_to_last("empty").await.unwrap();
        assert_eq!(store.list_len("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_remove_guarded_by_list_len() {
        let store = MemoryCoordinationStore::new();
        store.set_add("dirty", "main").await.unwrap();
        store.list_push("changes", "1").await.unwrap();
        store.list_push("changes", "2").await.unwrap();

        // Two entries left: condition fails, member stays
        assert!(
            !store
                .set_remove_if_list_short("dirty", "main", "changes", 1)
                .await
                .unwrap()
        );
        assert_eq!(store.set_members("dirty").await.unwrap(), vec!["main"]);

        store.list_pop_if_head("changes", "1").await.unwrap();
        assert!(
            store
                .set_remove_if_list_short("dirty", "main", "changes", 1)
                .await
                .unwrap()
        );
        assert!(store.set_members("dirty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zset_reservation_semantics() {
        let store = MemoryCoordinationStore::new();
        assert!(store.zset_add_if_absent("r", "main", 100).await.unwrap());
        // Second acquire fails while the reservation is live
        assert!(!store.zset_add_if_absent("r", "main", 200).await.unwrap());

        // Heartbeat extends only existing members
        assert!(store.zset_update("r", "main", 300).await.unwrap());
        assert!(!store.zset_update("r", "ghost", 300).await.unwrap());

        assert_eq!(store.zset_entries("r").await.unwrap(), vec![("main".to_string(), 300)]);

        // Expiry sweep removes at-or-below the cutoff
        assert_eq!(store.zset_remove_below("r", 300).await.unwrap(), 1);
        assert!(store.zset_add_if_absent("r", "main", 400).await.unwrap());
        assert!(store.zset_remove("r", "main").await.unwrap());
        assert!(!store.zset_remove("r", "main").await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_roundtrip() {
        let store = MemoryCoordinationStore::new();
        assert_eq!(store.counter_get("w").await.unwrap(), None);
        store.counter_set("w", 41).await.unwrap();
        store.counter_set("w", 42).await.unwrap();
        assert_eq!(store.counter_get("w").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryCoordinationStore::new();
        let mut rx = store.subscribe("ch").await.unwrap();
        store.publish("ch", "main").await.unwrap();
        store.publish("other", "ignored").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "main");
        assert!(rx.try_recv().is_err());
    }
}
