use anyhow::anyhow;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheStore, MemoryStore, RedisStore};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::filter::RequestFilter;
use crate::limiter::RateLimiter;
use crate::observability::{self, EventLog, LogLine, StatsCollector, StatsSnapshot};
use crate::upstream::{Backend, BackendSet, ConnectionPool, UpstreamResponse};

/// Bodies at or below this size are relayed uncompressed.
const MIN_COMPRESS_BYTES: usize = 1024;

/// One accepted client connection waiting for a worker.
struct WorkItem {
    stream: TcpStream,
    peer: SocketAddr,
    accepted_at: Instant,
}

/// Engine state shared by the accept loop and every worker.
struct Shared {
    config: Config,
    filter: RequestFilter,
    limiter: RateLimiter,
    cache: CacheManager,
    backends: BackendSet,
    pool: ConnectionPool,
    stats: StatsCollector,
    log: EventLog,
    prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
}

#[derive(Default)]
struct EngineState {
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// The proxy engine.
///
/// `start` binds the listener and spawns the worker pool; `stop` lets
/// in-flight and already-queued work finish, then tears everything down.
/// Both are idempotent. `stats`, `logs` and `status` are safe to call from
/// external collaborators at any time.
pub struct ProxyEngine {
    shared: Arc<Shared>,
    running: AtomicBool,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    state: Mutex<EngineState>,
}

impl ProxyEngine {
    /// Build an engine, connecting to the configured cache store. An
    /// unreachable store degrades to the in-process cache instead of
    /// failing startup.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;
        let store = build_store(&config).await;
        Self::with_store(config, store)
    }

    /// Build an engine over an explicit cache store implementation.
    pub fn with_store(config: Config, store: Arc<dyn CacheStore>) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;

        let prometheus = if config.metrics.enabled {
            observability::install_prometheus()
        } else {
            None
        };

        let backends = BackendSet::from_config(&config.backends)?;
        let pool = ConnectionPool::new(
            config.pool.max_idle_per_backend,
            config.pool_idle_timeout(),
            config.connection_timeout(),
        );

        let shared = Shared {
            filter: RequestFilter::new(&config.filters),
            limiter: RateLimiter::new(config.rate_limit.requests, config.rate_limit_window()),
            cache: CacheManager::new(store, config.cache_expiration()),
            backends,
            pool,
            stats: StatsCollector::new(),
            log: EventLog::new(config.log.capacity),
            prometheus,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            running: AtomicBool::new(false),
            local_addr: std::sync::Mutex::new(None),
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Bind the listening socket and spawn the worker pool. A no-op when
    /// already running; a bind failure is fatal and leaves the engine
    /// stopped.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.running.load(Ordering::SeqCst) {
            info!("Proxy engine already running");
            return Ok(());
        }

        let bind_addr = format!(
            "{}:{}",
            self.shared.config.server.host, self.shared.config.server.port
        );
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| ProxyError::Config(anyhow!("Failed to bind {}: {}", bind_addr, err)))?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) =
            mpsc::channel::<WorkItem>(self.shared.config.server.request_queue_size);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let worker_count = self.shared.config.server.thread_pool_size;
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                self.shared.clone(),
                queue_rx.clone(),
            )));
        }

        state.accept_task = Some(tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            queue_tx,
            shutdown_rx.clone(),
        )));
        state.monitor_task = Some(tokio::spawn(monitor_loop(self.shared.clone(), shutdown_rx)));
        state.shutdown = Some(shutdown_tx);
        state.workers = workers;
        self.running.store(true, Ordering::SeqCst);

        self.shared
            .log
            .push("info", format!("proxy engine listening on {}", local_addr));
        info!(
            "Proxy engine started on {} with {} workers (queue capacity {})",
            local_addr, worker_count, self.shared.config.server.request_queue_size
        );
        Ok(())
    }

    /// Stop accepting, drain queued and in-flight work, and shut the pool
    /// down. A no-op when already stopped.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            info!("Proxy engine already stopped");
            return;
        }

        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = state.accept_task.take() {
            let _ = task.await;
        }
        for worker in state.workers.drain(..) {
            let _ = worker.await;
        }
        if let Some(task) = state.monitor_task.take() {
            let _ = task.await;
        }

        *self.local_addr.lock().expect("addr lock poisoned") = None;
        self.running.store(false, Ordering::SeqCst);
        self.shared.log.push("info", "proxy engine stopped".to_string());
        info!("Proxy engine stopped");
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.shared.log.lines()
    }

    /// Address the engine is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }
}

async fn build_store(config: &Config) -> Arc<dyn CacheStore> {
    match RedisStore::connect(&config.cache).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(
                "Cache store at {} unreachable, using in-memory cache: {}",
                config.redis_url(),
                err
            );
            Arc::new(MemoryStore::new())
        }
    }
}

/// Accept connections and push them onto the bounded backlog. A full
/// backlog rejects the connection immediately instead of queueing it.
async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    queue: mpsc::Sender<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let item = WorkItem { stream, peer, accepted_at: Instant::now() };
                        match queue.try_send(item) {
                            Ok(()) => shared.stats.connection_opened(),
                            Err(TrySendError::Full(item)) => {
                                shared.stats.record_error();
                                shared.log.push(
                                    "warn",
                                    format!("backlog full, rejecting connection from {}", item.peer),
                                );
                                tokio::spawn(reject_queue_full(item.stream));
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(err) => error!("Failed to accept connection: {}", err),
                }
            }
        }
    }
    debug!("Accept loop exited");
}

/// Write the queue-full rejection directly to the raw socket; the
/// connection never reaches a worker.
async fn reject_queue_full(mut stream: TcpStream) {
    let body = serde_json::json!({
        "error": {
            "code": ProxyError::QueueFull.error_code(),
            "message": ProxyError::QueueFull.to_string(),
            "status": StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        }
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// One worker: pull connections off the shared backlog until the queue
/// closes, then exit. A failing connection never takes the worker with it.
async fn worker_loop(id: usize, shared: Arc<Shared>, queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>) {
    loop {
        let item = { queue.lock().await.recv().await };
        let Some(item) = item else { break };
        debug!(
            worker = id,
            peer = %item.peer,
            queued_ms = item.accepted_at.elapsed().as_millis() as u64,
            "Processing connection"
        );
        serve_item(&shared, item).await;
        shared.stats.connection_closed();
    }
    debug!(worker = id, "Worker exited");
}

async fn serve_item(shared: &Arc<Shared>, item: WorkItem) {
    let peer = item.peer;
    let io = TokioIo::new(item.stream);
    let service_shared = shared.clone();
    let svc = service_fn(move |req: Request<Incoming>| {
        let shared = service_shared.clone();
        async move { Ok::<_, Infallible>(handle_request(shared, peer, req).await) }
    });

    // One request per work item; the client reconnects for the next one.
    let mut builder = http1::Builder::new();
    builder.keep_alive(false);

    match timeout(
        shared.config.connection_timeout(),
        builder.serve_connection(io, svc),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            shared.stats.record_error();
            shared
                .log
                .error(format!("connection from {} failed: {}", peer, err));
        }
        Err(_) => {
            shared.stats.record_error();
            shared.log.error(format!("connection from {} timed out", peer));
        }
    }
}

async fn handle_request(
    shared: Arc<Shared>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let method = req.method().clone();
    // full target so filter rules can match the host of absolute-form
    // (forward-proxy) request lines too
    let target = req.uri().to_string();
    let client_ip = peer.ip();

    shared.stats.record_request(&method);
    shared.log.request(method.as_str(), &target, client_ip);

    let response = match route_request(&shared, client_ip, &target, req).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ProxyError::FilterDenied { .. } => {
                    shared.log.deny("filter", method.as_str(), &target, client_ip);
                }
                ProxyError::RateLimited { .. } => {
                    shared.stats.record_rate_limited();
                    shared
                        .log
                        .deny("rate limit", method.as_str(), &target, client_ip);
                }
                _ => {
                    shared.stats.record_error();
                    shared.log.error(format!(
                        "{} {} from {} failed: {}",
                        method, target, client_ip, err
                    ));
                }
            }
            err.to_response()
        }
    };

    shared
        .stats
        .record_duration(&method, started.elapsed().as_secs_f64());
    response
}

async fn route_request(
    shared: &Arc<Shared>,
    client_ip: IpAddr,
    target: &str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    // Denied requests consume neither rate-limit quota nor a cache lookup.
    if let Some(rule) = shared.filter.matched_rule(target) {
        return Err(ProxyError::FilterDenied {
            pattern: rule.to_string(),
        });
    }

    if req.method() == Method::GET {
        match req.uri().path() {
            "/proxy-stats" => return Ok(stats_response(shared)),
            "/proxy-metrics" => return Ok(metrics_response(shared)),
            _ => {}
        }
    }

    if !shared.limiter.admit(client_ip) {
        return Err(ProxyError::RateLimited { client: client_ip });
    }

    let request_id = Uuid::new_v4().to_string();
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|err| ProxyError::MalformedRequest(err.to_string()))?
        .to_bytes();
    shared.stats.record_bytes_in(body.len() as u64);

    let cache_key = shared.cache.key(&parts.method, target, &parts.headers);
    if parts.method == Method::GET {
        if let Some(cached) = shared.cache.lookup(&cache_key).await {
            shared.stats.record_cache_hit();
            shared.stats.record_success();
            shared
                .log
                .serve(parts.method.as_str(), target, cached.status.as_u16(), true);
            return Ok(build_client_response(shared, cached, true, &parts.headers));
        }
        shared.stats.record_cache_miss();
    }

    let upstream = forward_with_retries(shared, &request_id, &parts, body, client_ip).await?;

    if shared
        .cache
        .should_store(&parts.method, upstream.status, &upstream.headers)
    {
        if let Err(err) = shared.cache.store(&cache_key, &upstream).await {
            // next lookup simply misses
            warn!("Cache store failed for {}: {}", cache_key, err);
        }
    }

    shared.stats.record_success();
    shared
        .log
        .serve(parts.method.as_str(), target, upstream.status.as_u16(), false);
    Ok(build_client_response(shared, upstream, false, &parts.headers))
}

/// Try each backend at most once, skipping to the next on connect or
/// transport failure. Exhaustion surfaces as a gateway error.
async fn forward_with_retries(
    shared: &Arc<Shared>,
    request_id: &str,
    parts: &http::request::Parts,
    body: Bytes,
    client_ip: IpAddr,
) -> Result<UpstreamResponse> {
    let attempts = shared.backends.len().max(1);
    let mut last_error: Option<ProxyError> = None;

    for _ in 0..attempts {
        let Some(backend) = shared.backends.select() else {
            break;
        };

        match forward_once(shared, &backend, request_id, parts, body.clone(), client_ip).await {
            Ok(response) => {
                backend.mark_success();
                return Ok(response);
            }
            Err(err) => {
                backend.mark_failure();
                warn!("Forward to {} failed: {}", backend.authority(), err);
                last_error = Some(err);
            }
        }
    }

    Err(match last_error {
        Some(err @ ProxyError::Timeout(_)) | Some(err @ ProxyError::BackendUnreachable(_)) => err,
        Some(err) => ProxyError::BackendUnreachable(err.to_string()),
        None => ProxyError::BackendUnreachable("no backends configured".to_string()),
    })
}

async fn forward_once(
    shared: &Arc<Shared>,
    backend: &Backend,
    request_id: &str,
    parts: &http::request::Parts,
    body: Bytes,
    client_ip: IpAddr,
) -> Result<UpstreamResponse> {
    let deadline = shared.config.connection_timeout();
    let mut conn = shared.pool.acquire(backend).await?;

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(origin_form(&parts.uri))
        .body(Full::new(body))
        .map_err(|err| ProxyError::MalformedRequest(err.to_string()))?;

    {
        let headers = outbound.headers_mut();
        for (name, value) in &parts.headers {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str) || name_str == "host" || name_str == "content-length" {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            header::HOST,
            HeaderValue::from_str(backend.authority())
                .map_err(|err| ProxyError::MalformedRequest(err.to_string()))?,
        );
        if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
            headers.insert("x-forwarded-for", value.clone());
            headers.insert("x-real-ip", value);
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }
    }

    let response = timeout(deadline, conn.send(outbound))
        .await
        .map_err(|_| ProxyError::Timeout(format!("request to {}", backend.authority())))?
        .map_err(ProxyError::Http)?;

    let (head, incoming) = response.into_parts();
    let body = timeout(deadline, incoming.collect())
        .await
        .map_err(|_| ProxyError::Timeout(format!("response body from {}", backend.authority())))?
        .map_err(ProxyError::Http)?
        .to_bytes();

    shared.pool.release(conn, true);

    Ok(UpstreamResponse {
        status: head.status,
        headers: head.headers,
        body,
    })
}

fn build_client_response(
    shared: &Arc<Shared>,
    upstream: UpstreamResponse,
    from_cache: bool,
    request_headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let mut headers = relay_headers(&upstream.headers);
    let mut body = upstream.body;

    if should_compress(&shared.config, request_headers, &headers, body.len()) {
        match gzip_bytes(&body) {
            Ok(compressed) => {
                body = Bytes::from(compressed);
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
            Err(err) => warn!("Compression failed, sending identity body: {}", err),
        }
    }

    headers.insert(
        "x-cache",
        HeaderValue::from_static(if from_cache { "HIT" } else { "MISS" }),
    );
    headers.insert(
        "x-proxy",
        HeaderValue::from_static(concat!("rproxy/", env!("CARGO_PKG_VERSION"))),
    );

    shared.stats.record_bytes_out(body.len() as u64);

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}

fn stats_response(shared: &Arc<Shared>) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec_pretty(&shared.stats.snapshot()).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn metrics_response(shared: &Arc<Shared>) -> Response<Full<Bytes>> {
    match &shared.prometheus {
        Some(handle) => {
            let mut response = Response::new(Full::new(Bytes::from(handle.render())));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        }
        None => {
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"metrics collection is disabled\n",
            )));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

/// Periodically log a statistics snapshot and prune idle limiter buckets.
async fn monitor_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match serde_json::to_string(&shared.stats.snapshot()) {
                    Ok(snapshot) => info!("Server stats: {}", snapshot),
                    Err(err) => warn!("Failed to serialize stats: {}", err),
                }
                shared.limiter.prune();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers relayed to the client: hop-by-hop headers are dropped and the
/// content length is recomputed from the actual body.
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || name_str == "content-length" {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }
    relayed
}

fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(pq) => Uri::builder()
            .path_and_query(pq.clone())
            .build()
            .unwrap_or_else(|_| Uri::from_static("/")),
        None => Uri::from_static("/"),
    }
}

fn should_compress(
    config: &Config,
    request_headers: &HeaderMap,
    response_headers: &HeaderMap,
    body_len: usize,
) -> bool {
    if !config.enable_compression || body_len <= MIN_COMPRESS_BYTES {
        return false;
    }
    if response_headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }

    let client_accepts_gzip = request_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    if !client_accepts_gzip {
        return false;
    }

    response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            ct.contains("text") || ct.contains("json") || ct.contains("javascript") || ct.contains("xml")
        })
        .unwrap_or(false)
}

fn gzip_bytes(input: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}
