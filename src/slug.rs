//! Built slug archives and the workers running them

use crate::config::PathsConfig;
use crate::error::DeployError;
use crate::process::CleanupReport;
use crate::worker::Worker;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Length of a worker instance hash
pub const WORKER_HASH_LEN: usize = 10;

/// `<app>--<commit>.zip`, with a lowercase hex commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugName {
    pub app: String,
    pub commit: String,
}

impl SlugName {
    pub fn parse(archive: &Path) -> Result<Self, DeployError> {
        let invalid = || DeployError::InvalidSlugName(archive.display().to_string());
        let file_name = archive.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
        let stem = file_name.strip_suffix(".zip").ok_or_else(invalid)?;
        Self::from_stem(stem).ok_or_else(invalid)
    }

    fn from_stem(stem: &str) -> Option<Self> {
        let (app, commit) = stem.rsplit_once("--")?;
        if app.is_empty() || !is_lower_hex(commit) {
            return None;
        }
        Some(Self {
            app: app.to_string(),
            commit: commit.to_string(),
        })
    }

    /// `<app>--<commit>`
    pub fn slug(&self) -> String {
        format!("{}--{}", self.app, self.commit)
    }

    pub fn file_name(&self) -> String {
        format!("{}.zip", self.slug())
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Observed state of one worker
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStatus {
    pub hash: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub running: bool,
    pub ready: bool,
}

/// One built artifact. Workers are tracked in memory and rediscovered from
/// the run directory, where their PID and port files are the source of truth.
#[derive(Debug)]
pub struct Slug {
    name: String,
    app: String,
    commit: String,
    archive: PathBuf,
    run_dir: PathBuf,
    log_file: PathBuf,
    workers: RwLock<BTreeMap<String, Arc<Worker>>>,
    cursor: AtomicUsize,
}

impl Slug {
    pub fn open(archive: &Path, paths: &PathsConfig) -> Result<Self, DeployError> {
        let name = SlugName::parse(archive)?;
        Ok(Self {
            name: name.slug(),
            log_file: paths.logs_dir().join(format!("{}.log", name.app)),
            app: name.app,
            commit: name.commit,
            archive: archive.to_path_buf(),
            run_dir: paths.run_dir(),
            workers: RwLock::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Adopt workers left in the run directory by a previous daemon.
    /// Returns how many workers are now tracked.
    pub fn refresh_workers(&self) -> usize {
        let mut found = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.run_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if let Some(hash) = self.worker_hash_of(file_name) {
                    found.push(hash.to_string());
                }
            }
        }

        let mut workers = self.workers.write();
        for hash in found {
            workers
                .entry(hash)
                .or_insert_with_key(|hash| Arc::new(Worker::new(self, hash)));
        }
        workers.len()
    }

    /// `<slug>.<hash>`, `<slug>.<hash>.pid` or `<slug>.<hash>.port`
    fn worker_hash_of<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let rest = file_name.strip_prefix(self.name.as_str())?.strip_prefix('.')?;
        let hash = rest
            .strip_suffix(".pid")
            .or_else(|| rest.strip_suffix(".port"))
            .unwrap_or(rest);
        (hash.len() == WORKER_HASH_LEN && is_lower_hex(hash)).then_some(hash)
    }

    /// Create and track a worker with a fresh instance hash
    pub fn new_worker(&self) -> Arc<Worker> {
        let mut workers = self.workers.write();
        loop {
            let hash = hex::encode(rand::random::<[u8; WORKER_HASH_LEN / 2]>());
            if workers.contains_key(&hash) {
                continue;
            }
            let worker = Arc::new(Worker::new(self, &hash));
            workers.insert(hash, Arc::clone(&worker));
            return worker;
        }
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().values().cloned().collect()
    }

    pub fn worker(&self, hash: &str) -> Option<Arc<Worker>> {
        self.workers.read().get(hash).cloned()
    }

    /// True if any worker's PID file names a live process
    pub fn is_running(&self) -> bool {
        self.workers().iter().any(|w| w.is_running())
    }

    /// Slug-level `(running, ready)`. A worker that is both wins; otherwise
    /// each fact is reported independently so callers can spot a worker
    /// that died while its port is still held.
    pub async fn is_running_ready(&self, host: &str) -> (bool, bool) {
        let (mut running, mut ready) = (false, false);
        for worker in self.workers() {
            let (r, p) = worker.is_running_ready(host).await;
            if r && p {
                return (true, true);
            }
            running |= r;
            ready |= p;
        }
        (running, ready)
    }

    /// Port of a running, ready worker, rotating across them
    pub async fn live_port(&self, host: &str) -> Option<u16> {
        let mut live = Vec::new();
        for worker in self.workers() {
            if let (true, true) = worker.is_running_ready(host).await {
                if let Some(port) = worker.port() {
                    live.push(port);
                }
            }
        }
        if live.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live[index])
    }

    pub async fn status(&self, host: &str) -> Vec<WorkerStatus> {
        let mut statuses = Vec::new();
        for worker in self.workers() {
            let (running, ready) = worker.is_running_ready(host).await;
            statuses.push(WorkerStatus {
                hash: worker.hash().to_string(),
                pid: worker.pid(),
                port: worker.port(),
                running,
                ready,
            });
        }
        statuses
    }

    /// Stop one worker and stop tracking it
    pub fn stop_worker(&self, hash: &str) -> CleanupReport {
        let worker = self.workers.write().remove(hash);
        match worker {
            Some(worker) => worker.stop(),
            None => CleanupReport::new(),
        }
    }

    /// Stop every worker. Returns how many were stopped.
    pub fn stop_all(&self) -> (usize, CleanupReport) {
        self.stop_where(|_| true)
    }

    /// Stop every worker but `keep`, used when a slug restarts itself
    pub fn stop_all_except(&self, keep: &str) -> (usize, CleanupReport) {
        self.stop_where(|hash| hash != keep)
    }

    fn stop_where(&self, mut select: impl FnMut(&str) -> bool) -> (usize, CleanupReport) {
        let stopping: Vec<Arc<Worker>> = {
            let mut workers = self.workers.write();
            let hashes: Vec<String> = workers.keys().filter(|h| select(h)).cloned().collect();
            hashes.iter().filter_map(|h| workers.remove(h)).collect()
        };

        let mut report = CleanupReport::new();
        for worker in &stopping {
            report.merge(worker.stop());
        }
        if !stopping.is_empty() {
            info!(slug = %self.name, workers = stopping.len(), "Stopped workers");
        }
        (stopping.len(), report)
    }

    /// Stop everything and delete the archive
    pub fn destroy(&self) -> CleanupReport {
        let (_, mut report) = self.stop_all();
        report.remove_file(&self.archive);
        debug!(slug = %self.name, archive = %self.archive.display(), "Destroyed slug");
        report
    }
}
