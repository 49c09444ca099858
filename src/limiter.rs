use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-client fixed-window rate limiter.
///
/// Each client address maps to a bucket holding the current window start and
/// the number of admitted requests. The DashMap entry guard serializes all
/// updates to one client's bucket, so concurrent requests from the same
/// client can never be over-admitted.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: DashMap<IpAddr, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Admit or deny one request from `client`.
    pub fn admit(&self, client: IpAddr) -> bool {
        let mut bucket = self.buckets.entry(client).or_insert_with(|| Bucket {
            window_start: Instant::now(),
            count: 0,
        });

        if bucket.window_start.elapsed() > self.window {
            bucket.window_start = Instant::now();
            bucket.count = 0;
        }

        if bucket.count >= self.limit {
            return false;
        }

        bucket.count += 1;
        true
    }

    /// Drop buckets whose window expired several windows ago.
    pub fn prune(&self) {
        let horizon = self.window.saturating_mul(4);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.window_start.elapsed() <= horizon);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!("Pruned {} idle rate-limit buckets", removed);
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn client(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn denies_after_limit_within_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        for _ in 0..5 {
            assert!(limiter.admit(client(1)));
        }
        assert!(!limiter.admit(client(1)));
        // another client has its own bucket
        assert!(limiter.admit(client(2)));
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.admit(client(1)));
        assert!(limiter.admit(client(1)));
        assert!(!limiter.admit(client(1)));

        std::thread::sleep(Duration::from_millis(70));
        assert!(limiter.admit(client(1)));
    }

    #[test]
    fn concurrent_burst_never_over_admits() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(10)));
        let admitted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if limiter.admit(client(1)) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn prune_drops_stale_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(5));
        limiter.admit(client(1));
        limiter.admit(client(2));
        assert_eq!(limiter.tracked_clients(), 2);

        std::thread::sleep(Duration::from_millis(40));
        limiter.prune();
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
