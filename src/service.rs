//! The daemon's shared context: everything built once at startup and handed
//! to the listeners, the control socket and the signal handlers.

use crate::config::Config;
use crate::deploy::{DeployState, Deployer, StartOutcome, StopOutcome};
use crate::error::DeployError;
use crate::limiter::RateLimiter;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::{self, RunAs};
use crate::proxy::ProxyState;
use crate::registry::{Registry, ReloadResult};
use crate::slug::WorkerStatus;
use crate::tls::CertStore;
use crate::tracking::Tracking;
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often idle rate-limit buckets are purged
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What `status` reports for one application
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub state: DeployState,
    pub serving: Option<String>,
    pub pending: Option<String>,
    pub port: u16,
    pub maintenance: bool,
    pub domains: Vec<String>,
    pub workers: Vec<WorkerStatus>,
}

impl AppStatus {
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.running && w.ready).count()
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} port={} maintenance={} live={}/{}",
            self.name,
            self.state,
            self.port,
            self.maintenance,
            self.live_workers(),
            self.workers.len()
        )?;
        if let Some(pending) = &self.pending {
            write!(f, " pending={}", pending)?;
        }
        for worker in &self.workers {
            let pid = worker.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
            let port = worker.port.map_or_else(|| "-".to_string(), |p| p.to_string());
            write!(
                f,
                "\n  {} pid={} port={} running={} ready={}",
                worker.hash, pid, port, worker.running, worker.ready
            )?;
        }
        Ok(())
    }
}

pub struct Service {
    config_path: PathBuf,
    registry: Arc<Registry>,
    deployer: Arc<Deployer>,
    limiter: Arc<RateLimiter>,
    proxy: Arc<ProxyState>,
    certs: Option<Arc<CertStore>>,
}

impl Service {
    /// Build every component from a loaded configuration
    pub fn new(config_path: &Path, config: Config) -> anyhow::Result<Arc<Self>> {
        let run_as = process::resolve_run_as(&config.run_as).context("Failed to resolve run_as")?;
        if let Some(RunAs { uid, gid }) = run_as {
            info!(uid, gid, "Workers will run as an unprivileged user");
        }

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            request_timeout: config.timeouts.origin_request(),
        };
        let tracking = Tracking::new();
        let limiter = Arc::new(RateLimiter::new(config.proxy_limit.clone(), tracking));
        let https = config.server.https_enabled();
        let secrets = config.paths.proxy_secrets_dir();

        let registry = Registry::load(config).context("Failed to load application registry")?;
        let deployer = Deployer::new(Arc::clone(&registry), run_as);
        let pool = Arc::new(ConnectionPool::new(pool_config));
        let proxy = Arc::new(ProxyState::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            pool,
        ));

        let certs = if https {
            Some(CertStore::load(&secrets, &all_domains(&registry))?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            config_path: config_path.to_path_buf(),
            registry,
            deployer,
            limiter,
            proxy,
            certs,
        }))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> Arc<Config> {
        self.registry.config()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn tracking(&self) -> &Arc<Tracking> {
        self.limiter.tracking()
    }

    pub fn proxy(&self) -> &Arc<ProxyState> {
        &self.proxy
    }

    pub fn certs(&self) -> Option<&Arc<CertStore>> {
        self.certs.as_ref()
    }

    /// Re-read the configuration file and every descriptor. Listener, path
    /// and run_as changes need a restart; everything else applies now. A
    /// failed reload changes nothing.
    pub fn reload(&self) -> anyhow::Result<ReloadResult> {
        let mut config = Config::load(&self.config_path)
            .with_context(|| format!("Failed to reload {}", self.config_path.display()))?;
        let current = self.registry.config();

        if config.paths != current.paths {
            warn!("Path changes take effect after a restart");
            config.paths = current.paths.clone();
        }
        if config.server.bind != current.server.bind
            || config.server.http_port != current.server.http_port
            || config.server.https_port != current.server.https_port
            || config.server.enable_tls != current.server.enable_tls
        {
            warn!("Listener changes take effect after a restart");
        }
        if config.run_as != current.run_as {
            warn!("run_as changes take effect after a restart");
        }

        let limits = config.proxy_limit.clone();
        let result = self.registry.reload_with(Arc::new(config))?;
        if limits != current.proxy_limit {
            self.limiter.reconfigure(limits);
        }
        if let Some(certs) = &self.certs {
            if let Err(e) = certs.reload(&all_domains(&self.registry)) {
                error!(error = %e, "Failed to reload certificates, keeping the previous set");
            }
        }
        Ok(result)
    }

    /// Status of the named applications, or of all of them
    pub async fn status(&self, names: &[String]) -> Result<Vec<AppStatus>, DeployError> {
        let apps = if names.is_empty() {
            self.registry.apps()
        } else {
            names
                .iter()
                .map(|name| {
                    self.registry
                        .app(name)
                        .ok_or_else(|| DeployError::UnknownApp(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut statuses = Vec::with_capacity(apps.len());
        for app in apps {
            let serving = app.this_slug();
            let workers = match &serving {
                Some(archive) => self.registry.slug(archive)?.status(&app.origin().host).await,
                None => Vec::new(),
            };
            let slug_name = |p: Option<PathBuf>| {
                p.and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            };
            statuses.push(AppStatus {
                name: app.name().to_string(),
                state: self.deployer.state(app.name()),
                serving: slug_name(serving),
                pending: slug_name(app.next_slug()),
                port: app.origin().port,
                maintenance: app.is_maintenance(),
                domains: app.domains(),
                workers,
            });
        }
        Ok(statuses)
    }

    /// Tracking table plus connection pool counters
    pub fn stats_report(&self) -> String {
        let stats = self.proxy.pool().stats();
        format!(
            "{}\npool.requests={}\npool.retries={}\npool.failures={}",
            self.tracking().render(),
            stats.get_total_requests(),
            stats.get_retries(),
            stats.get_failures()
        )
    }

    /// Start every serving slug when `include_slugs.on_start` is set
    pub async fn start_on_boot(&self) {
        if !self.config().include_slugs.on_start {
            debug!("Not starting slugs on boot");
            return;
        }
        for (app, result) in self.deployer.start_all().await {
            match result {
                Ok(StartOutcome::Started(outcome)) => {
                    info!(app, slug = %outcome.slug, port = outcome.port, "Started on boot")
                }
                Ok(StartOutcome::AlreadyRunning { slug }) => {
                    info!(app, slug, "Adopted running slug")
                }
                Err(e) => error!(app, error = %e, "Failed to start on boot"),
            }
        }
    }

    /// Stop every worker when `include_slugs.on_stop` is set; otherwise they
    /// keep running and are adopted by the next daemon
    pub async fn shutdown(&self) {
        if !self.config().include_slugs.on_stop {
            info!("Leaving workers running");
            return;
        }
        info!("Stopping all workers...");
        for (app, result) in self.deployer.stop_all().await {
            match result {
                Ok(StopOutcome::Stopped { slug, workers }) => info!(app, slug, workers, "Stopped"),
                Ok(StopOutcome::NotRunning) => {}
                Err(e) => error!(app, error = %e, "Failed to stop"),
            }
        }
    }

    /// Purge idle limiter buckets until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.limiter.sweep();
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn all_domains(registry: &Registry) -> Vec<String> {
    let mut domains: Vec<String> = registry.snapshot().domains.keys().cloned().collect();
    domains.sort();
    domains
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("config_path", &self.config_path)
            .field("registry", &self.registry)
            .field("tls", &self.certs.is_some())
            .finish()
    }
}
