//! Application registry: name, port and domain tables plus the shared slug
//! cache, port reservations and per-application deploy locks.

use crate::app::Application;
use crate::config::Config;
use crate::error::{ConfigError, DeployError};
use crate::git::{self, User};
use crate::ports;
use crate::slug::Slug;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One generation of lookup tables. Always replaced as a whole.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub apps: BTreeMap<String, Arc<Application>>,
    pub ports: HashMap<u16, String>,
    pub domains: HashMap<String, String>,
    pub users: Vec<User>,
}

impl Tables {
    /// Load every descriptor in the apps directory. Any failure or
    /// collision fails the whole load.
    pub fn load(config: &Config) -> Result<Self, ConfigError> {
        let mut tables = Tables::default();

        for source in list_toml_files(&config.paths.apps_dir())? {
            let app = Application::load(&source, &config.paths)?;
            tables.insert(Arc::new(app))?;
        }
        tables.users = git::load_users(&config.paths.users_dir())?;

        Ok(tables)
    }

    fn insert(&mut self, app: Arc<Application>) -> Result<(), ConfigError> {
        let name = app.name().to_string();
        if self.apps.contains_key(&name) {
            return Err(ConfigError::DuplicateName {
                name,
                path: app.source().to_path_buf(),
            });
        }

        let port = app.origin().port;
        if let Some(first) = self.ports.get(&port) {
            return Err(ConfigError::DuplicatePort {
                port,
                first: first.clone(),
                second: name,
            });
        }

        let domains = app.domains();
        for domain in &domains {
            if let Some(first) = self.domains.get(domain) {
                return Err(ConfigError::DuplicateDomain {
                    domain: domain.clone(),
                    first: first.clone(),
                    second: name,
                });
            }
        }

        self.ports.insert(port, name.clone());
        for domain in domains {
            self.domains.insert(domain, name.clone());
        }
        self.apps.insert(name, app);
        Ok(())
    }
}

fn list_toml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, ConfigError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();
    Ok(files)
}

/// Result of a registry reload
#[derive(Debug, Default, PartialEq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

/// Pointers replaced by a committed transition
#[derive(Debug, Clone, PartialEq)]
pub struct Superseded {
    pub slug: Option<std::path::PathBuf>,
    pub port: u16,
}

pub struct Registry {
    config: RwLock<Arc<Config>>,
    tables: RwLock<Arc<Tables>>,
    /// Serializes reloads against transitions
    reload_lock: Mutex<()>,
    reservations: Mutex<HashMap<u16, String>>,
    deploy_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    slugs: DashMap<String, Arc<Slug>>,
}

impl Registry {
    pub fn load(config: Config) -> Result<Arc<Self>, ConfigError> {
        let tables = Tables::load(&config)?;
        info!(
            apps = tables.apps.len(),
            domains = tables.domains.len(),
            users = tables.users.len(),
            "Loaded application registry"
        );
        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            tables: RwLock::new(Arc::new(tables)),
            reload_lock: Mutex::new(()),
            reservations: Mutex::new(HashMap::new()),
            deploy_locks: DashMap::new(),
            slugs: DashMap::new(),
        }))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Current generation of lookup tables
    pub fn snapshot(&self) -> Arc<Tables> {
        self.tables.read().clone()
    }

    /// Re-read every descriptor with the current configuration
    pub fn reload(&self) -> Result<ReloadResult, ConfigError> {
        self.reload_with(self.config())
    }

    /// Re-read every descriptor and swap the tables in one step. On failure
    /// the previous generation stays in place.
    pub fn reload_with(&self, config: Arc<Config>) -> Result<ReloadResult, ConfigError> {
        let _guard = self.reload_lock.lock();
        let next = Tables::load(&config)?;

        let mut tables = self.tables.write();
        let mut result = ReloadResult::default();
        for (name, app) in &next.apps {
            match tables.apps.get(name) {
                None => result.added.push(name.clone()),
                Some(old) if old.descriptor() != app.descriptor() => {
                    result.updated.push(name.clone())
                }
                Some(_) => {}
            }
        }
        for name in tables.apps.keys() {
            if !next.apps.contains_key(name) {
                result.removed.push(name.clone());
            }
        }

        *tables = Arc::new(next);
        *self.config.write() = config;
        drop(tables);

        info!(
            added = ?result.added,
            removed = ?result.removed,
            updated = ?result.updated,
            "Registry reloaded"
        );
        Ok(result)
    }

    pub fn app(&self, name: &str) -> Option<Arc<Application>> {
        self.tables.read().apps.get(name).cloned()
    }

    pub fn apps(&self) -> Vec<Arc<Application>> {
        self.tables.read().apps.values().cloned().collect()
    }

    pub fn app_for_domain(&self, domain: &str) -> Option<Arc<Application>> {
        let tables = self.tables.read();
        let name = tables.domains.get(domain)?;
        tables.apps.get(name).cloned()
    }

    pub fn port_owner(&self, port: u16) -> Option<String> {
        if let Some(owner) = self.tables.read().ports.get(&port) {
            return Some(owner.clone());
        }
        self.reservations.lock().get(&port).cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.tables.read().users.clone()
    }

    /// Lock serializing deployments of one application. Stable across
    /// reloads because it is keyed by name.
    pub fn deploy_lock(&self, app: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.deploy_locks
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Whether a deployment, start or stop of `app` currently holds its
    /// deploy lock
    pub fn is_deploying(&self, app: &str) -> bool {
        self.deploy_locks
            .get(app)
            .map_or(false, |lock| lock.try_lock().is_err())
    }

    /// Shared slug for an archive path. Two archives with the same name are
    /// the same slug.
    pub fn slug(&self, archive: &Path) -> Result<Arc<Slug>, DeployError> {
        let config = self.config();
        let slug = Slug::open(archive, &config.paths)?;
        let entry = self
            .slugs
            .entry(slug.name().to_string())
            .or_insert_with(|| {
                let adopted = slug.refresh_workers();
                if adopted > 0 {
                    debug!(slug = %slug.name(), workers = adopted, "Adopted running workers");
                }
                Arc::new(slug)
            });
        Ok(entry.clone())
    }

    /// Drop a destroyed slug from the cache
    pub fn forget_slug(&self, name: &str) {
        self.slugs.remove(name);
    }

    /// Reserve a random free port for a candidate worker of `app`. The
    /// reservation is released when the returned guard drops, unless a
    /// transition promoted the port first.
    pub async fn reserve_port(
        self: &Arc<Self>,
        app: &str,
        host: &str,
    ) -> Result<PortReservation, DeployError> {
        let config = self.config();
        let (start, end) = (config.server.app_port_start, config.server.app_port_end);
        let mut busy = HashSet::new();

        loop {
            let port = {
                let tables = self.snapshot();
                let mut reservations = self.reservations.lock();
                let port = ports::pick_port(start, end, |p| {
                    busy.contains(&p) || tables.ports.contains_key(&p) || reservations.contains_key(&p)
                })
                .ok_or(DeployError::NoFreePort { start, end })?;
                reservations.insert(port, app.to_string());
                port
            };

            if ports::is_port_open(host, port).await {
                debug!(app, port, "Port is open at the OS level, trying another");
                self.reservations.lock().remove(&port);
                busy.insert(port);
                continue;
            }

            debug!(app, port, "Reserved port");
            return Ok(PortReservation {
                registry: Arc::clone(self),
                port,
            });
        }
    }

    fn release_port(&self, port: u16) {
        self.reservations.lock().remove(&port);
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.reservations.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Promote a ready candidate: point the application at `slug` on
    /// `port`, persist the descriptor and move the port table entry.
    pub fn commit_transition(
        &self,
        name: &str,
        slug: &Path,
        port: u16,
    ) -> Result<Superseded, DeployError> {
        let _guard = self.reload_lock.lock();
        let app = self
            .app(name)
            .ok_or_else(|| DeployError::UnknownApp(name.to_string()))?;

        let previous = app.descriptor();
        app.update(|d| {
            d.this_slug = Some(slug.to_path_buf());
            d.next_slug = None;
            d.origin.port = port;
        })?;

        if previous.origin.port != port {
            let mut tables = self.tables.write();
            let mut next = (**tables).clone();
            if next.ports.get(&previous.origin.port).map(String::as_str) == Some(name) {
                next.ports.remove(&previous.origin.port);
            }
            next.ports.insert(port, name.to_string());
            *tables = Arc::new(next);
        }
        self.release_port(port);

        Ok(Superseded {
            slug: previous.this_slug,
            port: previous.origin.port,
        })
    }
}

/// A port held for a candidate worker
#[derive(Debug)]
pub struct PortReservation {
    registry: Arc<Registry>,
    port: u16,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.registry.release_port(self.port);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("Registry")
            .field("apps", &tables.apps.keys().collect::<Vec<_>>())
            .field("slugs", &self.slugs.len())
            .finish()
    }
}
