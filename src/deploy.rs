//! Per-application deployment state machine.
//!
//! A deployment moves an application from its serving slug to a candidate:
//! pick a port, start a fresh worker of the candidate, wait for it to open
//! the port, then swap the application's pointers and retire the old slug.
//! If the candidate never becomes ready it is stopped and nothing else
//! changes. Deployments of one application are serialized by its deploy
//! lock; different applications deploy in parallel.

use crate::app::Application;
use crate::config::TimeoutConfig;
use crate::error::DeployError;
use crate::ports::{ReadinessCheck, TcpCheck};
use crate::process::RunAs;
use crate::registry::Registry;
use crate::slug::Slug;
use crate::worker::LaunchSpec;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Where an application is in its deployment cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeployState {
    Idle { serving: Option<String> },
    Deploying { serving: Option<String>, candidate: String },
    Transitioned { serving: String },
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployState::Idle { serving: Some(s) } => write!(f, "idle({})", s),
            DeployState::Idle { serving: None } => write!(f, "idle"),
            DeployState::Deploying { candidate, .. } => write!(f, "deploying({})", candidate),
            DeployState::Transitioned { serving } => write!(f, "transitioned({})", serving),
        }
    }
}

/// Which pointers a deployment started from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    /// Nothing was serving yet
    First,
    /// A different slug replaces the serving one
    Swap,
    /// The serving archive was pushed again
    Redeploy,
    /// No pending slug; the serving slug gets a fresh worker
    Restart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployOutcome {
    pub app: String,
    pub slug: String,
    pub worker: String,
    pub port: u16,
    pub kind: DeployKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(DeployOutcome),
    AlreadyRunning { slug: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped { slug: String, workers: usize },
    NotRunning,
}

pub struct Deployer {
    registry: Arc<Registry>,
    check: Arc<dyn ReadinessCheck>,
    run_as: Option<RunAs>,
    states: DashMap<String, DeployState>,
}

impl Deployer {
    pub fn new(registry: Arc<Registry>, run_as: Option<RunAs>) -> Arc<Self> {
        Self::with_check(registry, run_as, Arc::new(TcpCheck))
    }

    pub fn with_check(
        registry: Arc<Registry>,
        run_as: Option<RunAs>,
        check: Arc<dyn ReadinessCheck>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            check,
            run_as,
            states: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state(&self, app: &str) -> DeployState {
        if let Some(state) = self.states.get(app) {
            return state.clone();
        }
        DeployState::Idle {
            serving: self
                .registry
                .app(app)
                .and_then(|a| a.this_slug())
                .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned())),
        }
    }

    fn set_state(&self, app: &str, state: DeployState) {
        debug!(app, %state, "Deploy state");
        self.states.insert(app.to_string(), state);
    }

    /// Deploy the application's pending slug, or restart its serving slug
    /// when nothing is pending
    pub async fn deploy(&self, name: &str) -> Result<DeployOutcome, DeployError> {
        let lock = self.registry.deploy_lock(name);
        let _guard = lock.lock().await;

        let app = self
            .registry
            .app(name)
            .ok_or_else(|| DeployError::UnknownApp(name.to_string()))?;
        let descriptor = app.descriptor();

        let (kind, candidate_path) = match (&descriptor.this_slug, &descriptor.next_slug) {
            (None, Some(next)) => (DeployKind::First, next),
            (Some(this), Some(next)) if this == next => (DeployKind::Redeploy, next),
            (Some(_), Some(next)) => (DeployKind::Swap, next),
            (Some(this), None) => (DeployKind::Restart, this),
            (None, None) => return Err(DeployError::NoSlug(name.to_string())),
        };

        let serving = descriptor
            .this_slug
            .as_deref()
            .map(|path| self.registry.slug(path))
            .transpose()?;
        let candidate = self.registry.slug(candidate_path)?;
        let serving_name = serving.as_ref().map(|s| s.name().to_string());

        info!(app = name, slug = %candidate.name(), ?kind, "Deploying");
        self.set_state(
            name,
            DeployState::Deploying {
                serving: serving_name.clone(),
                candidate: candidate.name().to_string(),
            },
        );

        let result = self
            .transition(&app, serving.as_ref(), &candidate, kind)
            .await;

        match &result {
            Ok(outcome) => {
                info!(app = name, slug = %outcome.slug, port = outcome.port, "Deploy complete");
                self.set_state(
                    name,
                    DeployState::Transitioned {
                        serving: outcome.slug.clone(),
                    },
                );
            }
            Err(e) => {
                error!(app = name, slug = %candidate.name(), error = %e, "Deploy failed, keeping serving slug");
                self.set_state(name, DeployState::Idle { serving: serving_name });
            }
        }
        result
    }

    async fn transition(
        &self,
        app: &Application,
        serving: Option<&Arc<Slug>>,
        candidate: &Arc<Slug>,
        kind: DeployKind,
    ) -> Result<DeployOutcome, DeployError> {
        let config = self.registry.config();
        let timeouts = app.timeouts(&config.timeouts);
        let launch = LaunchSpec::for_app(app, self.run_as);

        // A running slug keeps its port; the candidate gets a reserved one
        let reservation = match serving {
            Some(slug) if slug.is_running() => {
                Some(self.registry.reserve_port(app.name(), &launch.host).await?)
            }
            _ => None,
        };
        let port = reservation
            .as_ref()
            .map_or_else(|| app.origin().port, |r| r.port());

        let worker = candidate.new_worker();
        let mut started = match worker.start(port, &launch).await {
            Ok(started) => started,
            Err(e) => {
                candidate.stop_worker(worker.hash());
                return Err(e);
            }
        };

        if let Err(e) = self
            .await_ready(candidate.name(), &launch.host, port, &timeouts, &mut started.exited)
            .await
        {
            warn!(app = %app.name(), worker = %worker.name(), error = %e, "Candidate not ready, stopping it");
            candidate.stop_worker(worker.hash());
            return Err(e);
        }

        let superseded = match self
            .registry
            .commit_transition(app.name(), candidate.archive(), port)
        {
            Ok(superseded) => superseded,
            Err(e) => {
                candidate.stop_worker(worker.hash());
                return Err(e);
            }
        };
        drop(reservation);
        debug!(app = %app.name(), old_port = superseded.port, port, "Swapped serving slug");

        if let Some(old) = serving {
            if Arc::ptr_eq(old, candidate) {
                candidate.stop_all_except(worker.hash());
            } else if config.keep_slugs {
                old.stop_all();
            } else {
                old.destroy();
                self.registry.forget_slug(old.name());
            }
        }

        if let Err(e) = self.registry.reload() {
            warn!(app = %app.name(), error = %e, "Reload after transition failed, keeping current tables");
        }

        Ok(DeployOutcome {
            app: app.name().to_string(),
            slug: candidate.name().to_string(),
            worker: worker.hash().to_string(),
            port,
            kind,
        })
    }

    /// Connect at a fixed interval until the port opens, the process exits or
    /// the startup timeout elapses
    async fn await_ready(
        &self,
        slug: &str,
        host: &str,
        port: u16,
        timeouts: &TimeoutConfig,
        exited: &mut oneshot::Receiver<String>,
    ) -> Result<(), DeployError> {
        let startup = timeouts.slug_startup();
        let deadline = tokio::time::sleep(startup);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(timeouts.ready_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(DeployError::ReadinessTimeout {
                        slug: slug.to_string(),
                        port,
                        timeout: startup,
                    });
                }
                status = &mut *exited => {
                    return Err(DeployError::ProcessExited {
                        slug: slug.to_string(),
                        status: status.unwrap_or_else(|_| "unknown status".to_string()),
                    });
                }
                _ = ticker.tick() => {
                    if self.check.check(host, port).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Start the application unless its serving slug is already up
    pub async fn start_app(&self, name: &str) -> Result<StartOutcome, DeployError> {
        let app = self
            .registry
            .app(name)
            .ok_or_else(|| DeployError::UnknownApp(name.to_string()))?;

        if let (Some(this), None) = (app.this_slug(), app.next_slug()) {
            let slug = self.registry.slug(&this)?;
            if let (true, true) = slug.is_running_ready(&app.origin().host).await {
                return Ok(StartOutcome::AlreadyRunning {
                    slug: slug.name().to_string(),
                });
            }
        }

        self.deploy(name).await.map(StartOutcome::Started)
    }

    /// Stop every worker of the serving slug
    pub async fn stop_app(&self, name: &str) -> Result<StopOutcome, DeployError> {
        let lock = self.registry.deploy_lock(name);
        let _guard = lock.lock().await;

        let app = self
            .registry
            .app(name)
            .ok_or_else(|| DeployError::UnknownApp(name.to_string()))?;
        let Some(this) = app.this_slug() else {
            return Ok(StopOutcome::NotRunning);
        };

        let slug = self.registry.slug(&this)?;
        let (workers, report) = slug.stop_all();
        if !report.is_clean() {
            warn!(app = name, failures = report.failures().len(), "Stop left files behind");
        }
        self.set_state(
            name,
            DeployState::Idle {
                serving: Some(slug.name().to_string()),
            },
        );

        if workers == 0 {
            Ok(StopOutcome::NotRunning)
        } else {
            Ok(StopOutcome::Stopped {
                slug: slug.name().to_string(),
                workers,
            })
        }
    }

    pub async fn restart_app(&self, name: &str) -> Result<DeployOutcome, DeployError> {
        self.deploy(name).await
    }

    /// Start every application that has a slug and is not in maintenance.
    /// Each application's result is reported separately.
    pub async fn start_all(&self) -> Vec<(String, Result<StartOutcome, DeployError>)> {
        let names: Vec<String> = self
            .registry
            .apps()
            .iter()
            .filter(|app| !app.is_maintenance())
            .filter(|app| app.this_slug().is_some() || app.next_slug().is_some())
            .map(|app| app.name().to_string())
            .collect();

        let results = join_all(names.iter().map(|name| self.start_app(name))).await;
        names.into_iter().zip(results).collect()
    }

    pub async fn stop_all(&self) -> Vec<(String, Result<StopOutcome, DeployError>)> {
        let names: Vec<String> = self
            .registry
            .apps()
            .iter()
            .map(|app| app.name().to_string())
            .collect();

        let results = join_all(names.iter().map(|name| self.stop_app(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Run a deployment in the background; the outcome is logged
    pub fn spawn_deploy(self: &Arc<Self>, name: &str) -> JoinHandle<Result<DeployOutcome, DeployError>> {
        let deployer = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move { deployer.deploy(&name).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{test_config, write_app};
    use crate::worker::tests::write_slug;
    use futures::future::BoxFuture;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports ready after a number of checks; never, if `ready_after` is None
    struct CountingCheck {
        checks: AtomicUsize,
        ready_after: Option<usize>,
    }

    impl CountingCheck {
        fn new(ready_after: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                checks: AtomicUsize::new(0),
                ready_after,
            })
        }
    }

    impl ReadinessCheck for CountingCheck {
        fn check<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, bool> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            let ready = self.ready_after.is_some_and(|after| n >= after);
            Box::pin(async move { ready })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<Registry>,
        slugs_dir: PathBuf,
    }

    fn fixture(origin_port: u16, extra: &str) -> Fixture {
        fixture_with(origin_port, extra, false)
    }

    fn fixture_with(origin_port: u16, extra: &str, keep_slugs: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.keep_slugs = keep_slugs;
        let source = write_app(&config, "blog", "blog.test", origin_port);
        if !extra.is_empty() {
            let content = std::fs::read_to_string(&source).unwrap();
            std::fs::write(&source, format!("{}\n{}", content, extra)).unwrap();
        }
        let slugs_dir = config.paths.slugs_dir();
        let registry = Registry::load(config).unwrap();
        Fixture {
            _dir: dir,
            registry,
            slugs_dir,
        }
    }

    fn queue_slug(fx: &Fixture, commit: &str, procfile: &str) -> PathBuf {
        let archive = fx.slugs_dir.join(format!("blog--{}.zip", commit));
        write_slug(&archive, Some(procfile));
        fx.registry
            .app("blog")
            .unwrap()
            .update(|d| d.next_slug = Some(archive.clone()))
            .unwrap();
        archive
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_deploy_transitions() {
        let port = free_port();
        let fx = fixture(port, "");
        let archive = queue_slug(&fx, "abc123", "web: sleep 60\n");
        let check = CountingCheck::new(Some(3));
        let deployer = Deployer::with_check(fx.registry.clone(), None, check.clone());

        let outcome = deployer.deploy("blog").await.unwrap();

        assert_eq!(outcome.kind, DeployKind::First);
        assert_eq!(outcome.port, port);
        assert_eq!(check.checks.load(Ordering::SeqCst), 3);
        let app = fx.registry.app("blog").unwrap();
        assert_eq!(app.this_slug(), Some(archive.clone()));
        assert_eq!(app.next_slug(), None);
        assert_eq!(
            deployer.state("blog"),
            DeployState::Transitioned {
                serving: "blog--abc123".to_string()
            }
        );

        let slug = fx.registry.slug(&archive).unwrap();
        assert!(slug.is_running());
        deployer.stop_app("blog").await.unwrap();
        assert!(!slug.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let port = free_port();
        let fx = fixture(port, "");
        let archive = queue_slug(&fx, "def456", "web: sleep 60\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(None));

        let err = deployer.deploy("blog").await.unwrap_err();

        assert!(matches!(err, DeployError::ReadinessTimeout { .. }), "{err}");
        let app = fx.registry.app("blog").unwrap();
        assert_eq!(app.this_slug(), None);
        assert_eq!(app.next_slug(), Some(archive.clone()));
        assert_eq!(app.origin().port, port);
        let slug = fx.registry.slug(&archive).unwrap();
        assert!(slug.workers().is_empty());
        assert!(!slug.is_running());
        assert_eq!(deployer.state("blog"), DeployState::Idle { serving: None });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_swap_keeps_serving_slug() {
        let port = free_port();
        let fx = fixture(port, "");
        let first = queue_slug(&fx, "abc123", "web: sleep 60\n");
        let ready = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(Some(1)));
        ready.deploy("blog").await.unwrap();

        queue_slug(&fx, "def456", "web: sleep 60\n");
        let never = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(None));
        let err = never.deploy("blog").await.unwrap_err();

        assert!(matches!(err, DeployError::ReadinessTimeout { .. }));
        let app = fx.registry.app("blog").unwrap();
        assert_eq!(app.this_slug(), Some(first.clone()));
        assert_eq!(app.origin().port, port);
        assert!(fx.registry.slug(&first).unwrap().is_running());
        assert!(fx.registry.reserved_ports().is_empty());

        ready.stop_app("blog").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_retires_old_slug() {
        let port = free_port();
        let fx = fixture(port, "");
        let first = queue_slug(&fx, "abc123", "web: sleep 60\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(Some(1)));
        deployer.deploy("blog").await.unwrap();
        let old = fx.registry.slug(&first).unwrap();

        let second = queue_slug(&fx, "fed789", "web: sleep 60\n");
        let outcome = deployer.deploy("blog").await.unwrap();

        assert_eq!(outcome.kind, DeployKind::Swap);
        assert_ne!(outcome.port, port);
        assert!(!old.is_running());
        assert!(!first.exists());
        let app = fx.registry.app("blog").unwrap();
        assert_eq!(app.this_slug(), Some(second));
        assert_eq!(app.origin().port, outcome.port);
        assert_eq!(fx.registry.port_owner(outcome.port).as_deref(), Some("blog"));
        assert_eq!(fx.registry.port_owner(port), None);

        deployer.stop_app("blog").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_keeps_old_archive_when_configured() {
        let port = free_port();
        let fx = fixture_with(port, "", true);
        let first = queue_slug(&fx, "abc123", "web: sleep 60\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(Some(1)));
        deployer.deploy("blog").await.unwrap();
        let old = fx.registry.slug(&first).unwrap();
        let old_workers = old.workers();
        assert_eq!(old_workers.len(), 1);

        let second = queue_slug(&fx, "fed789", "web: sleep 60\n");
        let outcome = deployer.deploy("blog").await.unwrap();

        assert_eq!(outcome.kind, DeployKind::Swap);
        assert!(!old.is_running());
        assert!(old.workers().is_empty());
        assert!(old_workers.iter().all(|w| !w.is_running()));
        assert!(first.exists());
        assert!(second.exists());
        assert_eq!(fx.registry.app("blog").unwrap().this_slug(), Some(second.clone()));

        // The kept archive can be served again
        fx.registry
            .app("blog")
            .unwrap()
            .update(|d| d.next_slug = Some(first.clone()))
            .unwrap();
        let back = deployer.deploy("blog").await.unwrap();
        assert_eq!(back.kind, DeployKind::Swap);
        assert_eq!(fx.registry.app("blog").unwrap().this_slug(), Some(first.clone()));
        assert!(second.exists());

        deployer.stop_app("blog").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_same_commit_restarts() {
        let fx = fixture(free_port(), "");
        let archive = queue_slug(&fx, "abc123", "web: sleep 60\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(Some(1)));
        let first = deployer.deploy("blog").await.unwrap();

        fx.registry
            .app("blog")
            .unwrap()
            .update(|d| d.next_slug = Some(archive.clone()))
            .unwrap();
        let second = deployer.deploy("blog").await.unwrap();

        assert_eq!(second.kind, DeployKind::Redeploy);
        assert_ne!(first.worker, second.worker);
        let slug = fx.registry.slug(&archive).unwrap();
        let hashes: Vec<String> = slug.workers().iter().map(|w| w.hash().to_string()).collect();
        assert_eq!(hashes, vec![second.worker.clone()]);
        assert!(archive.exists());

        deployer.stop_app("blog").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_deploys_queue() {
        let fx = fixture(free_port(), "");
        queue_slug(&fx, "abc123", "web: sleep 60\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(Some(2)));

        let a = deployer.spawn_deploy("blog");
        let b = deployer.spawn_deploy("blog");
        let mut kinds = vec![
            a.await.unwrap().unwrap().kind,
            b.await.unwrap().unwrap().kind,
        ];
        kinds.sort_by_key(|k| format!("{:?}", k));

        assert_eq!(kinds, vec![DeployKind::First, DeployKind::Restart]);
        deployer.stop_app("blog").await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_candidate_fails_fast() {
        let fx = fixture(
            free_port(),
            "[timeouts]\nslug_startup_secs = 30\nready_interval_ms = 50\n",
        );
        queue_slug(&fx, "abc123", "web: sh -c \"exit 1\"\n");
        let deployer = Deployer::with_check(fx.registry.clone(), None, CountingCheck::new(None));

        let started = std::time::Instant::now();
        let err = deployer.deploy("blog").await.unwrap_err();

        assert!(matches!(err, DeployError::ProcessExited { .. }), "{err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_nothing_to_deploy() {
        let fx = fixture(free_port(), "");
        let deployer = Deployer::new(fx.registry.clone(), None);

        assert!(matches!(
            deployer.deploy("blog").await,
            Err(DeployError::NoSlug(_))
        ));
        assert!(matches!(
            deployer.deploy("missing").await,
            Err(DeployError::UnknownApp(_))
        ));
        assert_eq!(deployer.stop_app("blog").await.unwrap(), StopOutcome::NotRunning);
    }
}
