use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProxyError, Result};

use super::Backend;

/// Pool of reusable backend connections.
///
/// Each backend keeps a bounded deque of idle HTTP/1 send handles. A handle
/// is owned by exactly one worker between `acquire` and `release`; stale or
/// closed handles are discarded lazily on the next acquisition attempt
/// rather than by a background sweep. The pool exists to amortize the TCP
/// handshake under sustained load against a small backend set.
pub struct ConnectionPool {
    idle: DashMap<String, VecDeque<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

struct IdleConn {
    sender: SendRequest<Full<Bytes>>,
    created_at: Instant,
    idle_since: Instant,
}

/// A connection checked out of the pool.
pub struct PooledConn {
    sender: SendRequest<Full<Bytes>>,
    authority: String,
    created_at: Instant,
}

impl ConnectionPool {
    pub fn new(max_idle: usize, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            max_idle,
            idle_timeout,
            connect_timeout,
        }
    }

    /// Reuse an idle connection to `backend` or open a new one.
    pub async fn acquire(&self, backend: &Backend) -> Result<PooledConn> {
        if let Some(mut queue) = self.idle.get_mut(backend.authority()) {
            while let Some(idle) = queue.pop_front() {
                if idle.idle_since.elapsed() > self.idle_timeout || idle.sender.is_closed() {
                    debug!(
                        "Discarding stale connection to {} (age {:?})",
                        backend.authority(),
                        idle.created_at.elapsed()
                    );
                    continue;
                }
                return Ok(PooledConn {
                    sender: idle.sender,
                    authority: backend.authority().to_string(),
                    created_at: idle.created_at,
                });
            }
        }

        self.dial(backend).await
    }

    async fn dial(&self, backend: &Backend) -> Result<PooledConn> {
        let authority = backend.authority().to_string();

        let stream = timeout(self.connect_timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connect to {}", authority)))?
            .map_err(|err| {
                ProxyError::BackendUnreachable(format!("{}: {}", authority, err))
            })?;

        let (sender, conn) = timeout(
            self.connect_timeout,
            http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream)),
        )
        .await
        .map_err(|_| ProxyError::Timeout(format!("handshake with {}", authority)))?
        .map_err(ProxyError::Http)?;

        // Drive the connection until the sender is dropped or the peer
        // closes it.
        let driver_authority = authority.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Connection to {} closed: {}", driver_authority, err);
            }
        });

        debug!("Opened new connection to {}", authority);
        Ok(PooledConn {
            sender,
            authority,
            created_at: Instant::now(),
        })
    }

    /// Return a connection after use. Connections that saw a transport error
    /// are dropped instead of being pooled.
    pub fn release(&self, conn: PooledConn, reusable: bool) {
        if !reusable || conn.sender.is_closed() {
            return;
        }

        let mut queue = self.idle.entry(conn.authority).or_default();
        if queue.len() < self.max_idle {
            queue.push_back(IdleConn {
                sender: conn.sender,
                created_at: conn.created_at,
                idle_since: Instant::now(),
            });
        }
    }

    pub fn idle_count(&self, authority: &str) -> usize {
        self.idle.get(authority).map(|q| q.len()).unwrap_or(0)
    }
}

impl PooledConn {
    /// Send one request over this connection and wait for the response head.
    pub async fn send(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> std::result::Result<Response<Incoming>, hyper::Error> {
        self.sender.ready().await?;
        self.sender.send_request(request).await
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use url::Url;

    /// Accepts connections and holds them open without speaking HTTP; the
    /// http1 handshake itself performs no IO, so this is enough for pool
    /// checkout tests.
    async fn passive_listener() -> (std::net::SocketAddr, Arc<TcpListener>) {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let held = listener.clone();
        tokio::spawn(async move {
            let mut streams = Vec::new();
            while let Ok((stream, _)) = held.accept().await {
                streams.push(stream);
            }
        });
        (addr, listener)
    }

    fn backend_for(addr: std::net::SocketAddr) -> Backend {
        Backend::new(Url::parse(&format!("http://{}", addr)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let (addr, _listener) = passive_listener().await;
        let backend = backend_for(addr);
        let pool = ConnectionPool::new(4, Duration::from_secs(60), Duration::from_secs(2));

        let conn = pool.acquire(&backend).await.unwrap();
        pool.release(conn, true);
        assert_eq!(pool.idle_count(backend.authority()), 1);

        let _conn = pool.acquire(&backend).await.unwrap();
        assert_eq!(pool.idle_count(backend.authority()), 0);
    }

    #[tokio::test]
    async fn broken_connections_are_not_pooled() {
        let (addr, _listener) = passive_listener().await;
        let backend = backend_for(addr);
        let pool = ConnectionPool::new(4, Duration::from_secs(60), Duration::from_secs(2));

        let conn = pool.acquire(&backend).await.unwrap();
        pool.release(conn, false);
        assert_eq!(pool.idle_count(backend.authority()), 0);
    }

    #[tokio::test]
    async fn stale_idle_connections_are_discarded_on_acquire() {
        let (addr, _listener) = passive_listener().await;
        let backend = backend_for(addr);
        let pool = ConnectionPool::new(4, Duration::from_millis(10), Duration::from_secs(2));

        let conn = pool.acquire(&backend).await.unwrap();
        pool.release(conn, true);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // the stale handle is dropped and a fresh dial happens instead
        let _conn = pool.acquire(&backend).await.unwrap();
        assert_eq!(pool.idle_count(backend.authority()), 0);
    }

    #[tokio::test]
    async fn idle_set_is_bounded() {
        let (addr, _listener) = passive_listener().await;
        let backend = backend_for(addr);
        let pool = ConnectionPool::new(1, Duration::from_secs(60), Duration::from_secs(2));

        let first = pool.acquire(&backend).await.unwrap();
        let second = pool.dial(&backend).await.unwrap();
        pool.release(first, true);
        pool.release(second, true);

        assert_eq!(pool.idle_count(backend.authority()), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_fast() {
        // bind + drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = backend_for(addr);
        let pool = ConnectionPool::new(4, Duration::from_secs(60), Duration::from_secs(2));

        match pool.acquire(&backend).await {
            Err(ProxyError::BackendUnreachable(_)) | Err(ProxyError::Timeout(_)) => {}
            other => panic!("expected connect failure, got {:?}", other.map(|_| ())),
        }
    }
}
