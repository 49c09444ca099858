use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::Backend;

/// Round-robin backend selector.
///
/// Unhealthy backends are skipped until their cooldown is spent. When every
/// backend is unhealthy the selector fails open and hands out the plain
/// round-robin choice rather than refusing all traffic.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();

        for i in 0..len {
            let backend = &backends[(start + i) % len];
            if backend.is_healthy() || backend.note_skip() {
                return Some(backend.clone());
            }
        }

        let fallback = &backends[start % len];
        debug!(
            "All backends unhealthy, failing open to {}",
            fallback.authority()
        );
        Some(fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use url::Url;

    fn backends(count: usize) -> Vec<Arc<Backend>> {
        (0..count)
            .map(|i| {
                let url = Url::parse(&format!("http://127.0.0.1:{}", 9000 + i)).unwrap();
                Arc::new(Backend::new(url).unwrap())
            })
            .collect()
    }

    #[test]
    fn cycles_through_healthy_backends() {
        let lb = RoundRobin::new();
        let set = backends(3);

        let picks: Vec<String> = (0..6)
            .map(|_| lb.select(&set).unwrap().authority().to_string())
            .collect();

        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
    }

    #[test]
    fn distributes_requests_evenly() {
        let lb = RoundRobin::new();
        let set = backends(3);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let pick = lb.select(&set).unwrap();
            *counts.entry(pick.authority().to_string()).or_default() += 1;
        }

        // 10 requests over 3 backends: each gets floor or ceiling
        for count in counts.values() {
            assert!(*count == 3 || *count == 4, "uneven distribution: {:?}", counts);
        }
    }

    #[test]
    fn skips_unhealthy_backends() {
        let lb = RoundRobin::new();
        let set = backends(2);
        set[0].mark_failure();

        for _ in 0..4 {
            let pick = lb.select(&set).unwrap();
            assert_eq!(pick.authority(), set[1].authority());
        }
    }

    #[test]
    fn unhealthy_backend_returns_after_cooldown() {
        let lb = RoundRobin::new();
        let set = backends(2);
        set[0].mark_failure();

        let mut saw_cooled_backend = false;
        for _ in 0..16 {
            let pick = lb.select(&set).unwrap();
            if pick.authority() == set[0].authority() {
                saw_cooled_backend = true;
                break;
            }
        }
        assert!(saw_cooled_backend);
    }

    #[test]
    fn fails_open_when_all_backends_are_unhealthy() {
        let lb = RoundRobin::new();
        let set = backends(2);
        set[0].mark_failure();
        set[1].mark_failure();

        // cooldown counters start at zero, so the first selections fall
        // through to the fail-open branch
        assert!(lb.select(&set).is_some());
    }

    #[test]
    fn empty_set_selects_nothing() {
        let lb = RoundRobin::new();
        assert!(lb.select(&[]).is_none());
    }
}
