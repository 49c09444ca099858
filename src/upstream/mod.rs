pub mod balancer;
pub mod pool;

use anyhow::Context;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::error::{ProxyError, Result};

use balancer::RoundRobin;

pub use pool::{ConnectionPool, PooledConn};

/// An unhealthy backend becomes eligible for selection again after being
/// passed over this many times.
const COOLDOWN_SELECTIONS: u32 = 5;

/// Response relayed from a backend (or replayed from the cache).
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A single backend origin server.
///
/// Health is a two-state machine: a connection failure marks the backend
/// unhealthy, and either a later success or the selection cooldown brings it
/// back. There is no background health-check loop.
#[derive(Debug)]
pub struct Backend {
    origin: Url,
    authority: String,
    weight: u32,
    healthy: AtomicBool,
    skipped: AtomicU32,
}

impl Backend {
    pub fn new(origin: Url) -> anyhow::Result<Self> {
        let host = origin
            .host_str()
            .with_context(|| format!("Backend '{}' has no host", origin))?;
        let port = origin
            .port_or_known_default()
            .with_context(|| format!("Backend '{}' has no port", origin))?;

        Ok(Self {
            authority: format!("{}:{}", host, port),
            origin,
            weight: 1,
            healthy: AtomicBool::new(true),
            skipped: AtomicU32::new(0),
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// `host:port` used for dialing and the forwarded `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_failure(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!("Backend {} marked unhealthy", self.authority);
        }
    }

    pub fn mark_success(&self) {
        self.skipped.store(0, Ordering::Relaxed);
        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!("Backend {} recovered", self.authority);
        }
    }

    /// Record one passed-over selection; returns true once the cooldown is
    /// spent and the backend should be offered again.
    pub(crate) fn note_skip(&self) -> bool {
        let skips = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        if skips >= COOLDOWN_SELECTIONS {
            self.skipped.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// The configured backend set plus the selection policy over it.
pub struct BackendSet {
    backends: Vec<Arc<Backend>>,
    balancer: RoundRobin,
}

impl BackendSet {
    pub fn from_config(origins: &[String]) -> Result<Self> {
        let mut backends = Vec::with_capacity(origins.len());
        for origin in origins {
            let url = Url::parse(origin)
                .with_context(|| format!("Invalid backend URL: {}", origin))
                .map_err(ProxyError::Config)?;
            backends.push(Arc::new(Backend::new(url).map_err(ProxyError::Config)?));
        }

        info!("Configured {} backend servers", backends.len());
        Ok(Self {
            backends,
            balancer: RoundRobin::new(),
        })
    }

    /// Pick the next backend; falls open to the full set when every backend
    /// is unhealthy.
    pub fn select(&self) -> Option<Arc<Backend>> {
        self.balancer.select(&self.backends)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }
}
