//! Redis-backed coordination store
//!
//! Production implementation of [`CoordinationStore`]. The conditional
//! transactions (guarded set removal, head-checked list pop) run as Lua
//! scripts so they stay atomic against concurrent schedulers on other
//! processes.

use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;

use crate::coordination::{CoordinationStore, backend_err};
use crate::error::Result;

const POP_IF_HEAD: &str = r#"
if redis.call('LINDEX', KEYS[1], 0) == ARGV[1] then
  redis.call('LPOP', KEYS[1])
  return 1
else
  return 0
end
"#;

const SREM_IF_LIST_SHORT: &str = r#"
if redis.call('LLEN', KEYS[2]) <= tonumber(ARGV[2]) then
  redis.call('SREM', KEYS[1], ARGV[1])
  return 1
else
  return 0
end
"#;

/// Coordination store backed by a Redis server.
pub struct RedisCoordinationStore {
    client: Client,
    pop_if_head: Script,
    srem_if_list_short: Script,
}

impl RedisCoordinationStore {
    /// Connect and verify the server responds to a ping.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(backend_err)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_err)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;

        Ok(Self {
            client,
            pop_if_head: Script::new(POP_IF_HEAD),
            srem_if_list_short: Script::new(SREM_IF_LIST_SHORT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_err)
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = conn.sadd(key, member).await.map_err(backend_err)?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(backend_err)
    }

    async fn set_remove_if_list_short(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        max_len: u64,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let held: i64 = self
            .srem_if_list_short
            .key(set_key)
            .key(list_key)
            .arg(member)
            .arg(max_len)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(held == 1)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: i64 = conn.rpush(key, value).await.map_err(backend_err)?;
        Ok(len as u64)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(backend_err)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: i64 = conn.llen(key).await.map_err(backend_err)?;
        Ok(len as u64)
    }

    async fn list_pop_if_head(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let popped: i64 = self
            .pop_if_head
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(popped == 1)
    }

    async fn list_trim_to_last(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.ltrim(key, -1, -1).await.map_err(backend_err)?;
        Ok(())
    }

    async fn zset_add_if_absent(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg("CH")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(added > 0)
    }

    async fn zset_update(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let changed: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("XX")
            .arg("CH")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(changed > 0)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(key, member).await.map_err(backend_err)?;
        Ok(removed > 0)
    }

    async fn zset_remove_below(&self, key: &str, cutoff: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .zrembyscore(key, "-inf", cutoff)
            .await
            .map_err(backend_err)?;
        Ok(removed as u64)
    }

    async fn zset_entries(&self, key: &str) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(key, 0, -1)
            .await
            .map_err(backend_err)?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn counter_get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(backend_err)?;
        match value {
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|e| backend_err(format!("bad counter at {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn counter_set(&self, key: &str, value: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, value).await.map_err(backend_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.publish(channel, payload).await.map_err(backend_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend_err)?;
        pubsub.subscribe(channel).await.map_err(backend_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("dropping undecodable notification: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
