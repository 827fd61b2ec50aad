//! Error taxonomy and proxy-originated HTTP error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Malformed or colliding configuration. Fatal at load; a failed reload keeps
/// the previous registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),

    #[error("application already exists: {name} ({path})")]
    DuplicateName { name: String, path: PathBuf },

    #[error("origin port {port} claimed by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("domain {domain} claimed by both {first} and {second}")]
    DuplicateDomain {
        domain: String,
        first: String,
        second: String,
    },
}

/// Failure of one deployment. Contained to that deployment; the serving slug
/// is left untouched.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown application: {0}")]
    UnknownApp(String),

    #[error("no slug to deploy for {0}")]
    NoSlug(String),

    #[error("invalid slug archive name: {0}")]
    InvalidSlugName(String),

    #[error("slug archive not found: {0}")]
    ArchiveMissing(PathBuf),

    #[error("failed to unpack {archive}: {reason}")]
    Unpack { archive: PathBuf, reason: String },

    #[error("port {port} already bound: {reason}")]
    AlreadyBound { port: u16, reason: &'static str },

    #[error("no free port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("invalid process manifest for {slug}: {reason}")]
    Manifest { slug: String, reason: String },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{slug} did not open port {port} within {timeout:?}")]
    ReadinessTimeout {
        slug: String,
        port: u16,
        timeout: Duration,
    },

    #[error("{slug} exited before becoming ready ({status})")]
    ProcessExited { slug: String, status: String },

    #[error("{slug} exited with {status}")]
    ExitFailure { slug: String, status: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a request could not be routed. Always surfaced to the client as a
/// status code.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("missing or invalid Host header")]
    MissingHost,

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("{0} is in maintenance mode")]
    Maintenance(String),

    #[error("{0} has no running slug")]
    NotRunning(String),

    #[error("{0} is running but not ready")]
    NotReady(String),

    #[error("rate limit reached")]
    RateLimited,
}

impl RoutingError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RoutingError::MissingHost => ProxyErrorCode::UnknownHost,
            RoutingError::UnknownHost(_) => ProxyErrorCode::UnknownHost,
            RoutingError::Maintenance(_) => ProxyErrorCode::Maintenance,
            RoutingError::NotRunning(_) => ProxyErrorCode::BackendNotRunning,
            RoutingError::NotReady(_) => ProxyErrorCode::BackendNotReady,
            RoutingError::RateLimited => ProxyErrorCode::RateLimited,
        }
    }

    /// Client-facing message; never includes internal detail
    pub fn public_message(&self) -> &'static str {
        match self {
            RoutingError::MissingHost => "Missing or invalid Host header",
            RoutingError::UnknownHost(_) => "Unknown or unconfigured host",
            RoutingError::Maintenance(_) => "Service is under maintenance",
            RoutingError::NotRunning(_) => "Backend is not running",
            RoutingError::NotReady(_) => "Backend is not ready",
            RoutingError::RateLimited => "429 - Too Many Requests",
        }
    }
}

/// Signal delivery or PID/port file problems. Logged and treated as
/// "not running".
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} does not contain a number: {content:?}")]
    InvalidNumber { path: PathBuf, content: String },

    #[error("process {pid} is not running")]
    NotRunning { pid: u32 },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is locked by another running instance")]
    Locked(PathBuf),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),
}

/// Limiter malfunctions. Never fatal: the proxy fails open.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("no tracking keys supplied")]
    NoKeys,

    #[error("invalid limiter configuration: {0}")]
    InvalidConfig(String),
}

/// Error codes for proxy-originated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No application serves this domain, or the Host header is missing
    UnknownHost,
    /// Application is in maintenance mode
    Maintenance,
    /// Serving slug is not running
    BackendNotRunning,
    /// Serving slug is running but has not opened its port
    BackendNotReady,
    /// Request exceeded the rate limit
    RateLimited,
    /// Failed to connect to the worker
    ConnectionFailed,
    /// Worker did not answer in time; reported as a failed backend read
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendNotRunning => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::Maintenance => "MAINTENANCE",
            ProxyErrorCode::BackendNotRunning => "BACKEND_NOT_RUNNING",
            ProxyErrorCode::BackendNotReady => "BACKEND_NOT_READY",
            ProxyErrorCode::RateLimited => "RATE_LIMITED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// Response for a routing failure
pub fn routing_error_response(err: &RoutingError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(err.code(), err.public_message())
}
