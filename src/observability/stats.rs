use chrono::{DateTime, Utc};
use http::Method;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// Concurrent request statistics.
///
/// Every worker updates these counters on every request; each field is an
/// independent relaxed atomic, so individual counters are exact while a
/// snapshot may observe fields mid-update relative to each other.
pub struct StatsCollector {
    started_at: Instant,
    start_time: DateTime<Utc>,
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limited_requests: AtomicU64,
    active_connections: AtomicU64,
    methods: MethodCounters,
}

#[derive(Default)]
struct MethodCounters {
    get: AtomicU64,
    post: AtomicU64,
    put: AtomicU64,
    delete: AtomicU64,
    other: AtomicU64,
}

/// Flat read-only view handed to external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub rate_limited_requests: u64,
    pub active_connections: u64,
    pub request_methods: MethodSnapshot,
    pub uptime_seconds: u64,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSnapshot {
    #[serde(rename = "GET")]
    pub get: u64,
    #[serde(rename = "POST")]
    pub post: u64,
    #[serde(rename = "PUT")]
    pub put: u64,
    #[serde(rename = "DELETE")]
    pub delete: u64,
    #[serde(rename = "OTHER")]
    pub other: u64,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            start_time: Utc::now(),
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            methods: MethodCounters::default(),
        }
    }

    pub fn record_request(&self, method: &Method) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let slot = match *method {
            Method::GET => &self.methods.get,
            Method::POST => &self.methods.post,
            Method::PUT => &self.methods.put,
            Method::DELETE => &self.methods.delete,
            _ => &self.methods.other,
        };
        slot.fetch_add(1, Ordering::Relaxed);

        counter!("proxy_requests_total", "method" => method.as_str().to_string()).increment(1);
    }

    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.requests_error.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_requests_failed").increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_cache_hits").increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_cache_misses").increment(1);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_rate_limited_total").increment(1);
    }

    pub fn record_bytes_in(&self, count: u64) {
        self.bytes_in.fetch_add(count, Ordering::Relaxed);
        counter!("proxy_bytes_in_total").increment(count);
    }

    pub fn record_bytes_out(&self, count: u64) {
        self.bytes_out.fetch_add(count, Ordering::Relaxed);
        counter!("proxy_bytes_out_total").increment(count);
    }

    pub fn record_duration(&self, method: &Method, seconds: f64) {
        histogram!("proxy_request_duration_seconds", "method" => method.as_str().to_string())
            .record(seconds);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        gauge!("proxy_active_connections").increment(1.0);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauge!("proxy_active_connections").decrement(1.0);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let probes = cache_hits + cache_misses;
        let cache_hit_ratio = if probes > 0 {
            cache_hits as f64 / probes as f64
        } else {
            0.0
        };

        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_ratio,
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            request_methods: MethodSnapshot {
                get: self.methods.get.load(Ordering::Relaxed),
                post: self.methods.post.load(Ordering::Relaxed),
                put: self.methods.put.load(Ordering::Relaxed),
                delete: self.methods.delete.load(Ordering::Relaxed),
                other: self.methods.other.load(Ordering::Relaxed),
            },
            uptime_seconds: self.started_at.elapsed().as_secs(),
            start_time: self.start_time,
        }
    }
}

/// Install the Prometheus recorder and describe the exported series.
/// Returns `None` when a recorder is already installed in this process.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_counter!("proxy_requests_total", "Total requests processed");
            describe_counter!("proxy_requests_failed", "Requests that ended in a proxy error");
            describe_counter!("proxy_cache_hits", "Responses served from the cache");
            describe_counter!("proxy_cache_misses", "Cache lookups that missed");
            describe_counter!("proxy_rate_limited_total", "Requests denied by the rate limiter");
            describe_counter!("proxy_bytes_in_total", "Request body bytes received");
            describe_counter!("proxy_bytes_out_total", "Response body bytes sent");
            describe_histogram!(
                "proxy_request_duration_seconds",
                "End-to-end request duration in seconds"
            );
            describe_gauge!("proxy_active_connections", "Connections currently in flight");
            Some(handle)
        }
        Err(err) => {
            warn!("Prometheus recorder not installed: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = StatsCollector::new();
        stats.record_request(&Method::GET);
        stats.record_request(&Method::POST);
        stats.record_request(&Method::PATCH);
        stats.record_success();
        stats.record_success();
        stats.record_error();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_cache_miss();
        stats.record_rate_limited();
        stats.record_bytes_in(100);
        stats.record_bytes_out(2500);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_success, 2);
        assert_eq!(snapshot.requests_error, 1);
        assert_eq!(snapshot.request_methods.get, 1);
        assert_eq!(snapshot.request_methods.post, 1);
        assert_eq!(snapshot.request_methods.other, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert!((snapshot.cache_hit_ratio - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.rate_limited_requests, 1);
        assert_eq!(snapshot.bytes_in, 100);
        assert_eq!(snapshot.bytes_out, 2500);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(StatsCollector::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_request(&Method::GET);
                        stats.record_success();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_total, 8000);
        assert_eq!(snapshot.requests_success, 8000);
        assert_eq!(snapshot.request_methods.get, 8000);
    }

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let stats = StatsCollector::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 1);
    }

    #[test]
    fn snapshot_serializes_with_method_names() {
        let stats = StatsCollector::new();
        stats.record_request(&Method::GET);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"GET\":1"));
        assert!(json.contains("uptime_seconds"));
    }
}
