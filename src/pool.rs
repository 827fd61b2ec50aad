//! Pooled HTTP client for forwarding requests to app workers
//!
//! Request bodies are buffered before forwarding so a request can be replayed
//! once when a pooled connection turns out to be dead.

use crate::error::ProxyErrorCode;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Request build error: {0}")]
    RequestBuild(String),

    #[error("Origin did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Failed to read origin response: {0}")]
    Body(#[source] hyper::Error),
}

impl PoolError {
    /// The connection could not be established at all
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }

    /// A pooled connection was closed under us; the request never reached
    /// the worker and may be replayed
    pub fn is_reset(&self) -> bool {
        let PoolError::Client(err) = self else {
            return false;
        };
        let mut source: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
                ) {
                    return true;
                }
            }
            if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                    return true;
                }
            }
            source = cause.source();
        }
        false
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            PoolError::Client(_) => ProxyErrorCode::ConnectionFailed,
            PoolError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            PoolError::RequestBuild(_) | PoolError::Body(_) => ProxyErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Budget for one origin round trip, body included
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub type OriginResponse = Response<Full<Bytes>>;

/// A pooled client shared by every proxied request
pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward one buffered request to `host:port` and collect the response.
    /// `timeout` overrides the pool default for this request.
    pub async fn send(
        &self,
        parts: &Parts,
        body: Bytes,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<OriginResponse, PoolError> {
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://{}:{}{}", host, port, path);

        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let origin_req = builder
            .body(Full::new(body))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let exchange = async {
            let response = self.client.request(origin_req).await?;
            collect(response).await
        };
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout(timeout)),
        };
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    pub(crate) fn record_retry(&self) {
        self.stats.record_retry();
    }
}

async fn collect(response: Response<Incoming>) -> Result<OriginResponse, PoolError> {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.map_err(PoolError::Body)?.to_bytes();
    Ok(Response::from_parts(parts, Full::new(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn parts(uri: &str) -> Parts {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-test", "1")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    /// One-shot origin that echoes the request head back as the body
    async fn echo_origin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                head.len(),
                head
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_retry();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_retries(), 1);
        assert_eq!(stats.get_failures(), 0);
    }

    #[tokio::test]
    async fn test_send_rewrites_uri_and_keeps_headers() {
        let port = echo_origin().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let response = pool
            .send(&parts("http://blog.test/posts?page=2"), Bytes::from_static(b"hi"), "127.0.0.1", port, None)
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let head = String::from_utf8_lossy(&body).to_lowercase();

        assert!(head.starts_with("post /posts?page=2 http/1.1"));
        assert!(head.contains("x-test: 1"));
        assert_eq!(pool.stats().get_total_requests(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_maps_to_bad_gateway() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let pool = ConnectionPool::new(PoolConfig::default());

        let err = pool
            .send(&parts("/"), Bytes::new(), "127.0.0.1", port, None)
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert_eq!(err.code(), ProxyErrorCode::ConnectionFailed);
        assert_eq!(pool.stats().get_failures(), 1);
    }

    #[tokio::test]
    async fn test_silent_origin_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let pool = ConnectionPool::new(PoolConfig::default());

        let err = pool
            .send(&parts("/"), Bytes::new(), "127.0.0.1", port, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(err.code(), ProxyErrorCode::RequestTimeout);
        assert_eq!(err.code().status_code(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
