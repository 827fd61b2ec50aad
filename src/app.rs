//! Application descriptors and the in-memory application model

use crate::config::{PathsConfig, TimeoutConfig};
use crate::error::ConfigError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Where an application's current worker is reachable
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Origin {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Optional per-application overrides of the global timeouts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug_startup_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request_secs: Option<u64>,
}

/// On-disk form of `apps.d/<name>.toml`. Plain values come before tables so
/// the file serializes cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_name: Option<String>,

    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub maintenance: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_slug: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_slug: Option<PathBuf>,

    #[serde(default)]
    pub timeouts: AppTimeouts,

    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub origin: Origin,
}

impl AppDescriptor {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.origin.scheme.trim().is_empty() {
            errors.push("missing origin scheme".to_string());
        }
        if self.origin.host.trim().is_empty() {
            errors.push("missing origin host".to_string());
        }
        if self.origin.port == 0 {
            errors.push("origin port must be greater than 0".to_string());
        }
        if self.domains.is_empty() {
            errors.push("at least one domain is required".to_string());
        }
        if self.domains.iter().any(|d| d.trim().is_empty()) {
            errors.push("domains must not be empty strings".to_string());
        }
        errors
    }
}

/// One configured application. The descriptor is the only mutable part and
/// is always replaced as a whole, so readers see either the old or the new
/// slug pointers.
#[derive(Debug)]
pub struct Application {
    name: String,
    source: PathBuf,
    repo_path: PathBuf,
    log_file: PathBuf,
    access_log: PathBuf,
    state: RwLock<AppDescriptor>,
    write_lock: Mutex<()>,
}

impl Application {
    /// Load a descriptor; the application is named after the file stem
    pub fn load(source: &Path, paths: &PathsConfig) -> Result<Self, ConfigError> {
        let name = source
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Invalid {
                path: source.to_path_buf(),
                message: "descriptor file name is not valid UTF-8".to_string(),
            })?;

        let content = std::fs::read_to_string(source).map_err(|e| ConfigError::Read {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mut descriptor = AppDescriptor::parse(&content).map_err(|e| ConfigError::Parse {
            path: source.to_path_buf(),
            source: e,
        })?;

        let errors = descriptor.validate();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid {
                path: source.to_path_buf(),
                message: errors.join(", "),
            });
        }

        descriptor.domains = descriptor
            .domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .collect();

        if let Some(this_slug) = &descriptor.this_slug {
            if !this_slug.is_file() {
                debug!(app = %name, slug = %this_slug.display(), "Serving slug archive is missing, clearing");
                descriptor.this_slug = None;
            }
        }

        Ok(Self::new(name, source.to_path_buf(), paths, descriptor))
    }

    pub fn new(name: String, source: PathBuf, paths: &PathsConfig, descriptor: AppDescriptor) -> Self {
        Self {
            repo_path: paths.repos_dir().join(format!("{}.git", name)),
            log_file: paths.logs_dir().join(format!("{}.log", name)),
            access_log: paths.logs_dir().join(format!("{}.access.log", name)),
            name,
            source,
            state: RwLock::new(descriptor),
            write_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn access_log_file(&self) -> &Path {
        &self.access_log
    }

    /// Snapshot of the current descriptor
    pub fn descriptor(&self) -> AppDescriptor {
        self.state.read().clone()
    }

    pub fn domains(&self) -> Vec<String> {
        self.state.read().domains.clone()
    }

    pub fn origin(&self) -> Origin {
        self.state.read().origin.clone()
    }

    pub fn is_maintenance(&self) -> bool {
        self.state.read().maintenance
    }

    pub fn this_slug(&self) -> Option<PathBuf> {
        self.state.read().this_slug.clone()
    }

    pub fn next_slug(&self) -> Option<PathBuf> {
        self.state.read().next_slug.clone()
    }

    pub fn bin_name(&self) -> Option<String> {
        self.state.read().bin_name.clone()
    }

    /// Global timeouts with this application's overrides applied
    pub fn timeouts(&self, defaults: &TimeoutConfig) -> TimeoutConfig {
        let state = self.state.read();
        let overrides = &state.timeouts;
        TimeoutConfig {
            slug_startup_secs: overrides
                .slug_startup_secs
                .unwrap_or(defaults.slug_startup_secs),
            ready_interval_ms: overrides
                .ready_interval_ms
                .unwrap_or(defaults.ready_interval_ms),
            origin_request_secs: overrides
                .origin_request_secs
                .unwrap_or(defaults.origin_request_secs),
        }
    }

    /// Settings exported to workers, keyed in upper snake case
    pub fn environment(&self) -> Vec<(String, String)> {
        let state = self.state.read();
        state
            .settings
            .iter()
            .map(|(key, value)| (screaming_snake(key), setting_value(value)))
            .collect()
    }

    /// Apply a change, persist it, then publish it. The in-memory
    /// descriptor is only replaced once the file has been written.
    pub fn update<F>(&self, change: F) -> Result<AppDescriptor, ConfigError>
    where
        F: FnOnce(&mut AppDescriptor),
    {
        let _guard = self.write_lock.lock();
        let mut next = self.descriptor();
        change(&mut next);
        self.save(&next)?;
        *self.state.write() = next.clone();
        Ok(next)
    }

    fn save(&self, descriptor: &AppDescriptor) -> Result<(), ConfigError> {
        let encoded = toml::to_string_pretty(descriptor).map_err(|source| ConfigError::Encode {
            path: self.source.clone(),
            source,
        })?;
        let dir = self.source.parent().unwrap_or_else(|| Path::new("."));

        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(encoded.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&self.source).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|source| ConfigError::Write {
            path: self.source.clone(),
            source,
        })
    }

    /// Append one line to the access log
    pub async fn log_access(&self, status: u16, remote: &str, host: &str, method: &str, path: &str) {
        let line = format!(
            "[{}] [{}] {} - {} - ({}) - {} {}\n",
            self.name,
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            remote,
            host,
            status,
            method,
            path
        );
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.access_log)
                .await?;
            file.write_all(line.as_bytes()).await?;
            // tokio hands writes to a blocking task; flush before returning
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(app = %self.name, error = %e, "Failed to write access log");
        }
    }
}

/// `fooBar-baz.qux` -> `FOO_BAR_BAZ_QUX`
pub fn screaming_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev: Option<char> = None;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            let boundary = matches!(prev, Some(p) if c.is_ascii_uppercase()
                && (p.is_ascii_lowercase() || p.is_ascii_digit()));
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_uppercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
        prev = Some(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn setting_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        other => other.to_string(),
    }
}
