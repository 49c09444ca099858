use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// One retained log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Bounded in-process event log.
///
/// Every significant per-request action (start, deny, serve, error) is
/// appended here for external observers polling [`EventLog::lines`], and
/// mirrored to `tracing`. Oldest lines are dropped once the capacity is
/// reached.
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogLine>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, level: &str, message: String) {
        match level {
            "error" => error!("{}", message),
            "warn" => warn!("{}", message),
            "debug" => debug!("{}", message),
            _ => info!("{}", message),
        }

        let mut entries = self.entries.lock().expect("event log lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogLine {
            timestamp: Utc::now(),
            level: level.to_string(),
            message,
        });
    }

    pub fn request(&self, method: &str, target: &str, client: IpAddr) {
        self.push("debug", format!("request {} {} from {}", method, target, client));
    }

    pub fn deny(&self, reason: &str, method: &str, target: &str, client: IpAddr) {
        self.push(
            "warn",
            format!("denied ({}) {} {} from {}", reason, method, target, client),
        );
    }

    pub fn serve(&self, method: &str, target: &str, status: u16, from_cache: bool) {
        let source = if from_cache { "cache" } else { "backend" };
        self.push(
            "info",
            format!("served {} {} -> {} ({})", method, target, status, source),
        );
    }

    pub fn error(&self, message: String) {
        self.push("error", message);
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<LogLine> {
        self.entries
            .lock()
            .expect("event log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_is_bounded_and_ordered() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.push("info", format!("line {}", i));
        }

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].message, "line 2");
        assert_eq!(lines[2].message, "line 4");
    }

    #[test]
    fn helpers_record_structured_events() {
        let log = EventLog::new(16);
        let client: IpAddr = "127.0.0.1".parse().unwrap();

        log.request("GET", "/index.html", client);
        log.deny("filter", "GET", "/ads/banner", client);
        log.serve("GET", "/index.html", 200, true);
        log.error("backend exploded".to_string());

        let lines = log.lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].level, "debug");
        assert!(lines[1].message.contains("filter"));
        assert!(lines[2].message.contains("cache"));
        assert_eq!(lines[3].level, "error");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = EventLog::new(0);
        log.push("info", "survives".to_string());
        assert_eq!(log.len(), 1);
    }
}
