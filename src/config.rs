use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub pool: PoolConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
    /// Ordered list of backend origin URLs.
    pub backends: Vec<String>,
    /// Substring patterns; a request whose target matches any of them is rejected.
    pub filters: Vec<String>,
    pub enable_compression: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of workers draining the request backlog.
    pub thread_pool_size: usize,
    /// Capacity of the request backlog; connections beyond it are rejected.
    pub request_queue_size: usize,
    /// Per-connection deadline in seconds, applied to client reads and
    /// backend round trips alike.
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    /// Entry TTL in seconds.
    pub expiration: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admitted requests per client within one window.
    pub requests: u32,
    /// Window length in seconds.
    pub window: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_per_backend: usize,
    /// Idle connections older than this many seconds are discarded on the
    /// next acquisition attempt.
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum retained event log lines.
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pool: PoolConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
            backends: vec!["http://localhost:8000".to_string()],
            filters: vec![
                "ads".to_string(),
                "trackers".to_string(),
                "malware".to_string(),
            ],
            enable_compression: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            thread_pool_size: 50,
            request_queue_size: 100,
            connection_timeout: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            expiration: 300,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window: 60,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_backend: 10,
            idle_timeout: 90,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Overlay configuration from environment variables.
    ///
    /// Variable names match the deployment surface this replaces (`HOST`,
    /// `PORT`, `THREAD_POOL_SIZE`, ...). Unparseable values keep the current
    /// setting.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_var("HOST") {
            self.server.host = v;
        }
        set_parsed(&mut self.server.port, "PORT");
        set_parsed(&mut self.server.thread_pool_size, "THREAD_POOL_SIZE");
        set_parsed(&mut self.server.request_queue_size, "REQUEST_QUEUE_SIZE");
        set_parsed(&mut self.server.connection_timeout, "CONNECTION_TIMEOUT");
        if let Some(v) = env_var("REDIS_HOST") {
            self.cache.host = v;
        }
        set_parsed(&mut self.cache.port, "REDIS_PORT");
        set_parsed(&mut self.cache.database, "REDIS_DB");
        set_parsed(&mut self.cache.expiration, "CACHE_EXPIRATION");
        set_parsed(&mut self.rate_limit.requests, "RATE_LIMIT_REQUESTS");
        set_parsed(&mut self.rate_limit.window, "RATE_LIMIT_WINDOW");
        if let Some(v) = env_var("BACKEND_SERVERS") {
            let servers = split_list(&v);
            if !servers.is_empty() {
                self.backends = servers;
            }
        }
        if let Some(v) = env_var("REQUEST_FILTERS") {
            self.filters = split_list(&v);
        }
        if let Some(v) = env_var("ENABLE_COMPRESSION") {
            self.enable_compression = matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "yes" | "1" | "t" | "y"
            );
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.thread_pool_size == 0 {
            anyhow::bail!("Worker count cannot be zero");
        }

        if self.server.request_queue_size == 0 {
            anyhow::bail!("Request queue size cannot be zero");
        }

        if self.backends.is_empty() {
            anyhow::bail!("At least one backend server must be configured");
        }

        for backend in &self.backends {
            let url =
                Url::parse(backend).with_context(|| format!("Invalid backend URL: {}", backend))?;
            if url.scheme() != "http" {
                anyhow::bail!("Backend '{}' must use the http scheme", backend);
            }
            if url.host_str().is_none() {
                anyhow::bail!("Backend '{}' has no host", backend);
            }
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connection_timeout)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache.expiration)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.idle_timeout)
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.cache.host, self.cache.port, self.cache.database
        )
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, name: &str) {
    if let Some(raw) = env_var(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring unparseable value for {}: {}", name, raw),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_baseline() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.thread_pool_size, 50);
        assert_eq!(config.server.request_queue_size, 100);
        assert_eq!(config.cache.expiration, 300);
        assert_eq!(config.rate_limit.requests, 100);
        assert_eq!(config.rate_limit.window, 60);
        assert_eq!(config.backends, vec!["http://localhost:8000"]);
        assert!(config.enable_compression);
        config.validate().unwrap();
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 9090
backends:
  - "http://10.0.0.1:8000"
  - "http://10.0.0.2:8000"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.backends.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_empty_backends() {
        let mut config = Config::default();
        config.backends.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_http_backends() {
        let mut config = Config::default();
        config.backends = vec!["https://secure.example.com".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.server.thread_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overlay_parses_lists_and_booleans() {
        std::env::set_var("BACKEND_SERVERS", "http://a:8000, http://b:8000");
        std::env::set_var("ENABLE_COMPRESSION", "no");
        std::env::set_var("RATE_LIMIT_REQUESTS", "7");
        let mut config = Config::default();
        config.apply_env();
        std::env::remove_var("BACKEND_SERVERS");
        std::env::remove_var("ENABLE_COMPRESSION");
        std::env::remove_var("RATE_LIMIT_REQUESTS");

        assert_eq!(config.backends, vec!["http://a:8000", "http://b:8000"]);
        assert!(!config.enable_compression);
        assert_eq!(config.rate_limit.requests, 7);
    }
}
