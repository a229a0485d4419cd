//! Key-value store behind the key manager.
//!
//! [`KeyStore`] is the small Redis-shaped surface the manager needs: strings
//! with optional TTL, sorted sets for the expiry index, sets for the
//! user/venue indexes, and hashes for version history. [`RedisStore`] is the
//! production backend; [`MemoryStore`] backs tests and the mock venue.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::info;

use crate::error::{Error, Result};

/// Minimal key-value capability set (see module docs).
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Set with expiry (`SETEX`).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Sorted-set insert (score-keyed index).
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()>;
    /// Members with `min <= score <= max`.
    async fn zrange_by_score(&self, set: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zrem(&self, set: &str, member: &str) -> Result<()>;

    async fn sadd(&self, set: &str, member: &str) -> Result<()>;
    async fn smembers(&self, set: &str) -> Result<Vec<String>>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()>;
    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>>;

    /// Liveness probe; used at startup to fail fast on an unreachable store.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-memory store with the same observable semantics as Redis.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.write();
        if let Some((_, Some(expiry))) = inner.strings.get(key) {
            if Instant::now() >= *expiry {
                inner.strings.remove(key);
                return Ok(None);
            }
        }
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.write().strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().strings.remove(key);
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        self.inner
            .write()
            .zsets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, set: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let Some(zset) = inner.zsets.get(set) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        if let Some(zset) = self.inner.write().zsets.get_mut(set) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        self.inner
            .write()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .read()
            .hashes
            .get(hash)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// Redis-backed store using a managed multiplexed connection.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server responds.
    ///
    /// # Errors
    /// Returns [`Error::Store`] when the server is unreachable, which is the fatal
    /// dependency error at startup.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::Store(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Store(format!("redis connect: {e}")))?;
        info!("Connected to redis key store");
        let store = Self { conn };
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(set, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(&self, set: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore(set, min, max).await?)
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(set, member).await?;
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(set, member).await?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(set).await?)
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(hash, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(hash).await?;
        Ok(map.into_iter().collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Store(format!("redis ping: {e}")))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::Store(format!("unexpected ping reply: {pong}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store
            .set_ex("backup", "snapshot", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("backup").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("backup").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zset_range_is_score_ordered() {
        let store = MemoryStore::new();
        store.zadd("expiring", "c", 30.0).await.unwrap();
        store.zadd("expiring", "a", 10.0).await.unwrap();
        store.zadd("expiring", "b", 20.0).await.unwrap();

        let range = store.zrange_by_score("expiring", 0.0, 25.0).await.unwrap();
        assert_eq!(range, vec!["a".to_string(), "b".to_string()]);

        store.zrem("expiring", "a").await.unwrap();
        let range = store.zrange_by_score("expiring", 0.0, 100.0).await.unwrap();
        assert_eq!(range, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn zadd_updates_score_in_place() {
        let store = MemoryStore::new();
        store.zadd("idx", "m", 10.0).await.unwrap();
        store.zadd("idx", "m", 99.0).await.unwrap();
        assert!(store.zrange_by_score("idx", 0.0, 50.0).await.unwrap().is_empty());
        assert_eq!(
            store.zrange_by_score("idx", 50.0, 100.0).await.unwrap(),
            vec!["m".to_string()]
        );
    }

    #[tokio::test]
    async fn sets_deduplicate() {
        let store = MemoryStore::new();
        store.sadd("user_keys:alice", "k1").await.unwrap();
        store.sadd("user_keys:alice", "k1").await.unwrap();
        store.sadd("user_keys:alice", "k2").await.unwrap();
        let mut members = store.smembers("user_keys:alice").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[tokio::test]
    async fn hashes_store_fields() {
        let store = MemoryStore::new();
        store.hset("versions", "1", "key-a").await.unwrap();
        store.hset("versions", "2", "key-b").await.unwrap();
        let mut all = store.hgetall("versions").await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("1".to_string(), "key-a".to_string()),
                ("2".to_string(), "key-b".to_string())
            ]
        );
    }
}
