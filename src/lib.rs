//! A multithreaded caching reverse proxy.
//!
//! The engine accepts client connections on a bounded backlog, dispatches
//! them to a fixed pool of workers, and runs each request through a filter,
//! a per-client rate limiter, a response cache backed by an external
//! key-value store, and a round-robin load balancer over the configured
//! backends. Statistics and a bounded event log are exposed for external
//! dashboards via [`ProxyEngine::stats`] and [`ProxyEngine::logs`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod observability;
pub mod upstream;

pub use config::Config;
pub use engine::{EngineStatus, ProxyEngine};
pub use error::{ProxyError, Result};
