//! Host-routing reverse proxy in front of the serving worker of each app

use crate::app::Application;
use crate::error::{json_error_response, routing_error_response, ProxyErrorCode, RoutingError};
use crate::limiter::{Decision, RateLimiter};
use crate::pool::{ConnectionPool, PoolError};
use crate::registry::Registry;
use crate::slug::Slug;
use crate::tracking::{TrackingGuard, TOTAL_KEY};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Marks requests that went through this proxy
const X_PROXY: &str = "x-proxy";

/// Delay before replaying a request whose connection was reset
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long a request may wait for a slug caught mid-transition
#[derive(Debug, Clone, Copy)]
pub struct ReadyGate {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_millis(100),
        }
    }
}

/// Everything the request path reads
pub struct ProxyState {
    registry: Arc<Registry>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPool>,
    gate: ReadyGate,
}

impl ProxyState {
    pub fn new(registry: Arc<Registry>, limiter: Arc<RateLimiter>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            registry,
            limiter,
            pool,
            gate: ReadyGate::default(),
        }
    }

    pub fn with_gate(mut self, gate: ReadyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ProxyState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request. Every failure becomes a proxy error response.
pub async fn handle_request<B>(
    mut req: Request<B>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => return Ok(routing_error_response(&RoutingError::MissingHost)),
    };
    let remote = client_addr.ip().to_string();

    let mut tracked = state.limiter.tracking().hold(vec![
        TOTAL_KEY.to_string(),
        format!("host,{}", hostname),
        format!("addr,{}", remote),
    ]);

    // Forwarded headers are overwritten, never appended: this proxy is the
    // first trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&remote) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    headers.insert(X_PROXY, HeaderValue::from_static(crate::PKG_NAME));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let Some(app) = state.registry.app_for_domain(&hostname) else {
        return Ok(routing_error_response(&RoutingError::UnknownHost(hostname)));
    };

    let method = req.method().to_string();
    let path = req.uri().path_and_query().map(|pq| pq.to_string()).unwrap_or_else(|| "/".to_string());

    let response = match route(req, &state, &app, &hostname, &remote, &request_id, &mut tracked).await {
        Ok(response) => response,
        Err(err) => {
            debug!(app = %app.name(), hostname, request_id, error = %err, "Request not routed");
            routing_error_response(&err)
        }
    };

    app.log_access(response.status().as_u16(), &remote, &hostname, &method, &path)
        .await;
    Ok(response)
}

async fn route<B>(
    req: Request<B>,
    state: &ProxyState,
    app: &Arc<Application>,
    hostname: &str,
    remote: &str,
    request_id: &str,
    tracked: &mut TrackingGuard,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, RoutingError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    match state.limiter.admit(hostname, remote, request_id).await {
        Ok(Decision::Limited(_)) => return Err(RoutingError::RateLimited),
        Ok(_) => {}
        Err(e) => warn!(hostname, remote, request_id, error = %e, "Rate limiter failed, letting request through"),
    }

    if app.is_maintenance() {
        return Err(RoutingError::Maintenance(app.name().to_string()));
    }

    let host = app.origin().host;
    let slug = await_serving_slug(state, app.name(), &host).await?;
    // The slug may have been swapped out since the gate let us through
    let live = match slug.live_port(&host).await {
        Some(port) => Some(port),
        None => serving_port(state, app.name(), &host).await,
    };
    let Some(port) = live else {
        return Err(RoutingError::NotReady(app.name().to_string()));
    };
    tracked.extend(vec![format!("port,{}", port)]);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(app = %app.name(), request_id, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to read request body",
            ));
        }
    };

    let timeout = app.timeouts(&state.registry.config().timeouts).origin_request();
    let mut result = state.pool.send(&parts, body.clone(), &host, port, Some(timeout)).await;

    if let Err(e) = &result {
        let next_port = serving_port(state, app.name(), &host).await.unwrap_or(port);
        if e.is_reset() || (e.is_connect() && next_port != port) {
            debug!(app = %app.name(), port, next_port, request_id, error = %e, "Retrying request once");
            tokio::time::sleep(RETRY_DELAY).await;
            state.pool.record_retry();
            result = state.pool.send(&parts, body, &host, next_port, Some(timeout)).await;
        }
    }

    match result {
        Ok(response) => Ok(response.map(|body| body.map_err(|never| match never {}).boxed())),
        Err(e) => Ok(origin_error_response(app.name(), port, request_id, &e)),
    }
}

fn origin_error_response(
    app: &str,
    port: u16,
    request_id: &str,
    err: &PoolError,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    // Detail stays in the log; the client gets a generic message
    error!(app, port, request_id, error = %err, "Failed to forward request");
    let message = match err.code() {
        ProxyErrorCode::RequestTimeout => "Backend did not respond in time",
        ProxyErrorCode::ConnectionFailed => "Failed to connect to backend",
        _ => "Failed to read backend response",
    };
    json_error_response(err.code(), message)
}

/// Live port of whatever slug serves the app right now
async fn serving_port(state: &ProxyState, name: &str, host: &str) -> Option<u16> {
    let archive = state.registry.app(name)?.this_slug()?;
    state.registry.slug(&archive).ok()?.live_port(host).await
}

/// Wait a bounded time for the app's serving slug to be both running and
/// ready. Only a slug that is running, or whose app is being deployed,
/// is waited for; anything else is a 502 on first sight. The serving slug
/// is re-resolved on every attempt so a request caught mid-transition
/// follows the swap.
async fn await_serving_slug(state: &ProxyState, name: &str, host: &str) -> Result<Arc<Slug>, RoutingError> {
    let mut slug_name = String::new();

    for attempt in 0..state.gate.attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(state.gate.interval).await;
        }

        let Some(app) = state.registry.app(name) else {
            return Err(RoutingError::UnknownHost(name.to_string()));
        };
        let Some(archive) = app.this_slug() else {
            return Err(RoutingError::NotRunning(name.to_string()));
        };
        let current = match state.registry.slug(&archive) {
            Ok(slug) => slug,
            Err(e) => {
                warn!(app = name, error = %e, "Serving slug is unusable");
                return Err(RoutingError::NotRunning(name.to_string()));
            }
        };

        match current.is_running_ready(host).await {
            (true, true) => return Ok(current),
            (true, false) => {}
            (false, ready) => {
                if ready {
                    warn!(app = name, slug = %current.name(), "Port is open but no worker is running; not routing");
                }
                if !state.registry.is_deploying(name) {
                    return Err(RoutingError::NotRunning(name.to_string()));
                }
            }
        }
        slug_name = current.name().to_string();
    }

    warn!(app = name, slug = %slug_name, "Serving slug did not become ready in time");
    Err(RoutingError::NotReady(name.to_string()))
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen and dot only; keeps hostnames out of log
            // injection
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}
