use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{ProxyError, Result};

/// Deadline for a single store round trip. Exceeding it is treated as a
/// miss by the caller, never as a request failure.
const OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Abstraction over the external key-value store holding cached responses.
///
/// The engine only assumes per-key atomicity and expiring writes, so any
/// backend with `GET`/`SET EX` semantics can stand in.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn health(&self) -> bool;
}

/// Redis-backed store.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let url = format!(
            "redis://{}:{}/{}",
            config.host, config.port, config.database
        );
        let client = redis::Client::open(url.as_str())?;
        let manager = timeout(Duration::from_secs(2), ConnectionManager::new(client))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connecting to {}", url)))??;

        info!("Connected to cache store at {}", url);
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value = timeout(OP_TIMEOUT, conn.get::<_, Option<Vec<u8>>>(key))
            .await
            .map_err(|_| ProxyError::Timeout(format!("cache lookup for {}", key)))??;
        Ok(value)
    }

    async fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        timeout(OP_TIMEOUT, conn.set_ex::<_, _, ()>(key, value, seconds))
            .await
            .map_err(|_| ProxyError::Timeout(format!("cache store for {}", key)))??;
        Ok(())
    }

    async fn health(&self) -> bool {
        let mut conn = self.manager.clone();
        matches!(
            timeout(OP_TIMEOUT, redis::cmd("PING").query_async::<String>(&mut conn)).await,
            Ok(Ok(_))
        )
    }
}

/// In-process store used when the external store is unreachable and in tests.
///
/// Expiry is enforced lazily: an expired entry is removed on the lookup that
/// finds it, exactly as if it were absent.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

struct MemoryEntry {
    value: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                debug!("Evicted expired cache entry: {}", key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip_is_byte_identical() {
        let store = MemoryStore::new();
        let payload = vec![0u8, 1, 2, 254, 255];
        store
            .store("k", payload.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        let found = store.lookup("k").await.unwrap();
        assert_eq!(found, Some(payload));
    }

    #[tokio::test]
    async fn memory_store_expired_entries_are_absent() {
        let store = MemoryStore::new();
        store
            .store("k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.lookup("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_overwrites_wholesale() {
        let store = MemoryStore::new();
        store
            .store("k", b"old".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .store("k", b"new".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.lookup("k").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
