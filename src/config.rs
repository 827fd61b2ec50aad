use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Listener and pool configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Default timeouts, overridable per application
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Per-host and per-address rate limiting
    #[serde(default)]
    pub proxy_limit: RateLimitConfig,

    /// Whether workers follow the daemon's start and stop
    #[serde(default)]
    pub include_slugs: IncludeSlugs,

    /// Keep superseded slug archives instead of destroying them
    #[serde(default)]
    pub keep_slugs: bool,

    /// OS identity for spawned workers (only applied when running as root)
    #[serde(default)]
    pub run_as: RunAsConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443, only bound when TLS is enabled, 0 disables)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Serve HTTPS with certificates from the secrets directory
    #[serde(default)]
    pub enable_tls: bool,

    /// First port handed out to candidate workers
    #[serde(default = "default_app_port_start")]
    pub app_port_start: u16,

    /// End (exclusive) of the worker port range
    #[serde(default = "default_app_port_end")]
    pub app_port_end: u16,

    /// Maximum idle connections per worker port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            enable_tls: false,
            app_port_start: default_app_port_start(),
            app_port_end: default_app_port_end(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn https_enabled(&self) -> bool {
        self.enable_tls && self.https_port != 0
    }

    pub fn http_enabled(&self) -> bool {
        self.http_port != 0
    }
}

/// Root directories; everything else is derived from these
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_etc_dir")]
    pub etc: PathBuf,

    #[serde(default = "default_var_dir")]
    pub var: PathBuf,

    #[serde(default = "default_tmp_dir")]
    pub tmp: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            etc: default_etc_dir(),
            var: default_var_dir(),
            tmp: default_tmp_dir(),
        }
    }
}

impl PathsConfig {
    pub fn apps_dir(&self) -> PathBuf {
        self.etc.join("apps.d")
    }

    pub fn users_dir(&self) -> PathBuf {
        self.etc.join("users.d")
    }

    pub fn proxy_secrets_dir(&self) -> PathBuf {
        self.etc.join("secrets.proxy.d")
    }

    pub fn slugs_dir(&self) -> PathBuf {
        self.var.join("slugs.d")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.var.join("logs.d")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.var.join("repos.d")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.tmp.join("runner.d")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.var.join("slugway.pid")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.var.join("slugway.sock")
    }

    /// Create every directory the daemon writes into
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [
            self.apps_dir(),
            self.users_dir(),
            self.proxy_secrets_dir(),
            self.slugs_dir(),
            self.logs_dir(),
            self.repos_dir(),
            self.run_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for dir in [&mut self.etc, &mut self.var, &mut self.tmp] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

/// Timeouts shared by every application unless its descriptor overrides them
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TimeoutConfig {
    /// How long a candidate worker gets to open its port
    #[serde(default = "default_slug_startup")]
    pub slug_startup_secs: u64,

    /// Interval between readiness checks during a deploy
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Bound on a single proxied request to a worker
    #[serde(default = "default_origin_request")]
    pub origin_request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            slug_startup_secs: default_slug_startup(),
            ready_interval_ms: default_ready_interval(),
            origin_request_secs: default_origin_request(),
        }
    }
}

impl TimeoutConfig {
    pub fn slug_startup(&self) -> Duration {
        Duration::from_secs(self.slug_startup_secs)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn origin_request(&self) -> Duration {
        Duration::from_secs(self.origin_request_secs)
    }
}

/// Token-bucket limits applied to every proxied request
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained requests per second per key
    #[serde(default = "default_limit_max")]
    pub max: f64,

    /// Bucket capacity; 0 means max(1, max)
    #[serde(default)]
    pub burst: u32,

    /// Longest a request is held before being rejected
    #[serde(default = "default_limit_max_delay")]
    pub max_delay_ms: u64,

    /// Number of re-checks spread across max_delay
    #[serde(default = "default_limit_delay_scale")]
    pub delay_scale: u32,

    /// Idle buckets older than this are purged
    #[serde(default = "default_limit_ttl")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub log_allowed: bool,

    #[serde(default)]
    pub log_delayed: bool,

    #[serde(default)]
    pub log_limited: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_limit_max(),
            burst: 0,
            max_delay_ms: default_limit_max_delay(),
            delay_scale: default_limit_delay_scale(),
            ttl_secs: default_limit_ttl(),
            log_allowed: false,
            log_delayed: false,
            log_limited: false,
        }
    }
}

impl RateLimitConfig {
    pub fn effective_burst(&self) -> f64 {
        if self.burst > 0 {
            self.burst as f64
        } else {
            self.max.max(1.0)
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Sleep between two re-checks of a delayed request
    pub fn step_delay(&self) -> Duration {
        self.max_delay() / self.delay_scale.max(1)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IncludeSlugs {
    /// Start every serving slug when the daemon starts
    #[serde(default = "default_true")]
    pub on_start: bool,

    /// Stop every worker when the daemon stops
    #[serde(default)]
    pub on_stop: bool,
}

impl Default for IncludeSlugs {
    fn default() -> Self {
        Self {
            on_start: true,
            on_stop: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RunAsConfig {
    pub user: Option<String>,
    pub group: Option<String>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_app_port_start() -> u16 {
    4200
}

fn default_app_port_end() -> u16 {
    4400
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_etc_dir() -> PathBuf {
    PathBuf::from("/etc/slugway")
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/slugway")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/var/lib/slugway/tmp")
}

fn default_slug_startup() -> u64 {
    300 // 5 minutes for a slug to open its port
}

fn default_ready_interval() -> u64 {
    1000
}

fn default_origin_request() -> u64 {
    60
}

fn default_limit_max() -> f64 {
    150.0
}

fn default_limit_max_delay() -> u64 {
    2000
}

fn default_limit_delay_scale() -> u32 {
    10
}

fn default_limit_ttl() -> u64 {
    31_536_000 // one year
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            timeouts: TimeoutConfig::default(),
            proxy_limit: RateLimitConfig::default(),
            include_slugs: IncludeSlugs::default(),
            keep_slugs: false,
            run_as: RunAsConfig::default(),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file. Relative paths in
    /// `[paths]` are resolved against the file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.paths.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let server = &self.server;

        if server.app_port_start == 0 || server.app_port_start >= server.app_port_end {
            errors.push(format!(
                "app port range {}..{} is empty",
                server.app_port_start, server.app_port_end
            ));
        }
        for (name, port) in [
            ("http_port", server.http_port),
            ("https_port", server.https_port),
            ("app_port_end", server.app_port_end),
        ] {
            if port == u16::MAX {
                errors.push(format!("'{}' must be within 1..=65534", name));
            }
        }
        if server.http_enabled() && server.https_enabled() && server.http_port == server.https_port {
            errors.push(format!(
                "http_port and https_port are both {}",
                server.http_port
            ));
        }

        let limit = &self.proxy_limit;
        if !(limit.max.is_finite() && limit.max > 0.0) {
            errors.push("'proxy_limit.max' must be a positive number".to_string());
        }
        if limit.delay_scale == 0 {
            errors.push("'proxy_limit.delay_scale' must be greater than 0".to_string());
        }

        if self.timeouts.slug_startup_secs == 0 {
            errors.push("'timeouts.slug_startup_secs' must be greater than 0".to_string());
        }
        if self.timeouts.ready_interval_ms == 0 {
            errors.push("'timeouts.ready_interval_ms' must be greater than 0".to_string());
        }

        if self.run_as.group.is_some() && self.run_as.user.is_none() {
            errors.push("'run_as.group' requires 'run_as.user'".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        Ok(())
    }
}
