pub mod store;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::upstream::UpstreamResponse;

pub use store::{CacheStore, MemoryStore, RedisStore};

/// Headers that participate in the cache key; everything else is ignored so
/// equivalent requests share an entry.
const VARY_HEADERS: [&str; 3] = ["accept", "accept-language", "accept-encoding"];

/// Serialized form of a cached response. Entries are immutable once written
/// and always overwritten wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl From<&UpstreamResponse> for CachedResponse {
    fn from(response: &UpstreamResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        Self {
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
        }
    }
}

impl From<CachedResponse> for UpstreamResponse {
    fn from(cached: CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in cached.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                headers.append(name, value);
            }
        }

        UpstreamResponse {
            status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(cached.body),
        }
    }
}

/// Cache manager over the external key-value store.
///
/// Only successful GET responses without explicit no-store semantics are
/// cached. Store failures and timeouts degrade to a miss so the request can
/// still be forwarded.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Normalized request identity: method + target + vary-relevant headers.
    pub fn key(&self, method: &Method, target: &str, headers: &HeaderMap) -> String {
        let mut hasher = DefaultHasher::new();
        method.as_str().hash(&mut hasher);
        target.hash(&mut hasher);

        for name in VARY_HEADERS {
            if let Some(value) = headers.get(name) {
                name.hash(&mut hasher);
                value.as_bytes().hash(&mut hasher);
            }
        }

        format!("cache:{:x}", hasher.finish())
    }

    /// Fetch a fresh entry. Absent, expired, undecodable and failed lookups
    /// all come back as `None`.
    pub async fn lookup(&self, key: &str) -> Option<UpstreamResponse> {
        let raw = match self.store.lookup(key).await {
            Ok(found) => found?,
            Err(err) => {
                let err = crate::error::ProxyError::CacheUnavailable(err.to_string());
                warn!("Treating failed lookup as miss: {}", err);
                return None;
            }
        };

        match serde_json::from_slice::<CachedResponse>(&raw) {
            Ok(cached) => {
                debug!("Cache HIT for key: {}", key);
                Some(cached.into())
            }
            Err(err) => {
                warn!("Discarding undecodable cache entry {}: {}", key, err);
                None
            }
        }
    }

    pub fn should_store(
        &self,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> bool {
        if method != Method::GET {
            return false;
        }

        if !(status.is_success() || status.is_redirection()) {
            return false;
        }

        if let Some(cache_control) = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
        {
            if cache_control.contains("no-store") || cache_control.contains("no-cache") {
                return false;
            }
        }

        true
    }

    /// Write an entry with the configured expiration.
    pub async fn store(&self, key: &str, response: &UpstreamResponse) -> crate::error::Result<()> {
        let serialized = serde_json::to_vec(&CachedResponse::from(response))?;
        self.store
            .store(key, serialized, self.ttl)
            .await
            .map_err(|err| crate::error::ProxyError::CacheUnavailable(err.to_string()))?;
        debug!("Cache SET for key: {} (ttl {:?})", key, self.ttl);
        Ok(())
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.health().await
    }
}
