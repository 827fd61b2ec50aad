//! A single worker process running an unpacked slug

use crate::app::Application;
use crate::error::{DeployError, ProcessError};
use crate::ports;
use crate::process::{self, CleanupReport, RunAs, Signal};
use crate::slug::Slug;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Process manifest inside a slug
pub const PROCFILE: &str = "Procfile";

const SELF_BOUND: &str = "this worker is already ready on it";

/// Everything a worker needs from its application to launch
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Host the worker's port is checked on
    pub host: String,
    /// Settings exported as environment variables
    pub env: Vec<(String, String)>,
    /// Binary started when the slug has no Procfile
    pub bin_name: Option<String>,
    pub run_as: Option<RunAs>,
}

impl LaunchSpec {
    pub fn for_app(app: &Application, run_as: Option<RunAs>) -> Self {
        Self {
            host: app.origin().host,
            env: app.environment(),
            bin_name: app.bin_name(),
            run_as,
        }
    }
}

/// Resolved command line for a worker
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Handle on a worker started in the background
#[derive(Debug)]
pub struct StartedWorker {
    pub pid: u32,
    /// Fires with a description of the exit status when the process ends
    pub exited: oneshot::Receiver<String>,
}

/// One instance of a slug. Never reused: a restart creates a new hash.
#[derive(Debug)]
pub struct Worker {
    name: String,
    hash: String,
    slug: String,
    archive: PathBuf,
    run_path: PathBuf,
    pid_file: PathBuf,
    port_file: PathBuf,
    log_file: PathBuf,
}

impl Worker {
    pub fn new(slug: &Slug, hash: &str) -> Self {
        let name = format!("{}.{}", slug.name(), hash);
        let run_dir = slug.run_dir();
        Self {
            run_path: run_dir.join(&name),
            pid_file: run_dir.join(format!("{}.pid", name)),
            port_file: run_dir.join(format!("{}.port", name)),
            log_file: slug.log_file().to_path_buf(),
            archive: slug.archive().to_path_buf(),
            slug: slug.name().to_string(),
            hash: hash.to_string(),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn port_file(&self) -> &Path {
        &self.port_file
    }

    /// Live PID, re-read from the PID file
    pub fn pid(&self) -> Option<u32> {
        process::live_pid(&self.pid_file)
    }

    /// Port named by the port file
    pub fn port(&self) -> Option<u16> {
        match process::read_number_file(&self.port_file) {
            Ok(Some(port)) => u16::try_from(port).ok().filter(|p| *p > 0),
            Ok(None) => None,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Unreadable port file");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// The port file names a port and something accepts connections on it
    pub async fn is_ready(&self, host: &str) -> bool {
        match self.port() {
            Some(port) => ports::is_port_open(host, port).await,
            None => false,
        }
    }

    pub async fn is_running_ready(&self, host: &str) -> (bool, bool) {
        (self.is_running(), self.is_ready(host).await)
    }

    /// Extract the archive into the run directory. Returns false when the
    /// run directory already exists.
    pub async fn unpack(&self) -> Result<bool, DeployError> {
        if self.run_path.is_dir() {
            debug!(worker = %self.name, "Slug already unpacked");
            return Ok(false);
        }
        if !self.archive.is_file() {
            return Err(DeployError::ArchiveMissing(self.archive.clone()));
        }

        let archive = self.archive.clone();
        let run_path = self.run_path.clone();
        info!(worker = %self.name, archive = %archive.display(), "Unpacking slug");
        let result = tokio::task::spawn_blocking(move || extract(&archive, &run_path))
            .await
            .map_err(|e| DeployError::Unpack {
                archive: self.archive.clone(),
                reason: e.to_string(),
            })?;

        if let Err(reason) = result {
            let mut report = CleanupReport::new();
            report.remove_dir_all(&self.run_path);
            return Err(DeployError::Unpack {
                archive: self.archive.clone(),
                reason,
            });
        }
        Ok(true)
    }

    /// Command line from the Procfile's `web:` entry. Without a Procfile the
    /// application binary is run, falling back to `make start`.
    pub fn read_procfile(&self, bin_name: Option<&str>) -> Result<Vec<String>, DeployError> {
        let path = self.run_path.join(PROCFILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fallback = match bin_name {
                    Some(bin) => vec![format!("./{}", bin)],
                    None => vec!["make".to_string(), "start".to_string()],
                };
                debug!(worker = %self.name, command = ?fallback, "No Procfile, using fallback");
                return Ok(fallback);
            }
            Err(e) => return Err(e.into()),
        };

        let manifest_error = |reason: String| DeployError::Manifest {
            slug: self.slug.clone(),
            reason,
        };
        let web = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(role, _)| role.trim() == "web")
            .map(|(_, command)| command.trim())
            .ok_or_else(|| manifest_error("missing web entry".to_string()))?;

        let argv = shell_words::split(web).map_err(|e| manifest_error(e.to_string()))?;
        if argv.is_empty() {
            return Err(manifest_error("empty web command".to_string()));
        }
        Ok(argv)
    }

    /// Unpack, check the port and record it, then resolve the command line
    pub async fn prepare_start(
        &self,
        port: u16,
        launch: &LaunchSpec,
    ) -> Result<PreparedCommand, DeployError> {
        self.unpack().await?;

        if self.port() == Some(port) && self.is_ready(&launch.host).await {
            return Err(DeployError::AlreadyBound {
                port,
                reason: SELF_BOUND,
            });
        }
        if ports::is_port_open(&launch.host, port).await {
            return Err(DeployError::AlreadyBound {
                port,
                reason: "open by another process",
            });
        }
        process::write_number_file(&self.port_file, port as u32)?;

        let mut argv = self.read_procfile(launch.bin_name.as_deref())?.into_iter();
        let program = argv.next().map(PathBuf::from).unwrap_or_default();
        let program = if program.is_relative() && program.components().count() > 1 {
            self.run_path.join(program)
        } else {
            program
        };

        let mut env = launch.env.clone();
        env.push(("PORT".to_string(), port.to_string()));

        info!(worker = %self.name, port, program = %program.display(), "Prepared worker");
        Ok(PreparedCommand {
            program,
            args: argv.collect(),
            env,
        })
    }

    fn spawn(&self, prepared: &PreparedCommand, launch: &LaunchSpec) -> Result<Child, DeployError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.args)
            .envs(prepared.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.run_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(run_as) = launch.run_as {
            cmd.uid(run_as.uid).gid(run_as.gid);
        }

        let mut child = cmd.spawn().map_err(|source| DeployError::Spawn {
            command: prepared.program.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or_default();
        if let Err(e) = process::write_number_file(&self.pid_file, pid) {
            let _ = child.start_kill();
            return Err(e.into());
        }
        Ok(child)
    }

    /// Start in the background. Returns once the PID file is written.
    pub async fn start(&self, port: u16, launch: &LaunchSpec) -> Result<StartedWorker, DeployError> {
        let prepared = self.prepare_start(port, launch).await?;
        let mut child = self.spawn(&prepared, launch)?;
        let pid = child.id().unwrap_or_default();
        info!(worker = %self.name, pid, port, "Started worker");

        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        tokio::spawn(async move {
            let description = match child.wait().await {
                Ok(status) => {
                    info!(worker = %name, pid, %status, "Worker exited");
                    status.to_string()
                }
                Err(e) => {
                    error!(worker = %name, pid, error = %e, "Failed to wait for worker");
                    e.to_string()
                }
            };
            let _ = tx.send(description);
        });

        Ok(StartedWorker { pid, exited: rx })
    }

    /// Run until the process exits. Termination by SIGTERM is a clean exit.
    pub async fn start_foreground(&self, port: u16, launch: &LaunchSpec) -> Result<(), DeployError> {
        let prepared = match self.prepare_start(port, launch).await {
            Ok(prepared) => prepared,
            Err(DeployError::AlreadyBound {
                reason: SELF_BOUND, ..
            }) => {
                info!(worker = %self.name, port, "Worker is already running");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut child = self.spawn(&prepared, launch)?;
        info!(worker = %self.name, pid = child.id(), port, "Running worker in the foreground");
        let status = child.wait().await?;

        let mut report = CleanupReport::new();
        report.remove_file(&self.pid_file);
        report.remove_file(&self.port_file);

        if is_clean_exit(&status) {
            Ok(())
        } else {
            Err(DeployError::ExitFailure {
                slug: self.slug.clone(),
                status: status.to_string(),
            })
        }
    }

    /// SIGTERM the process and remove its files. Every step runs even if an
    /// earlier one failed.
    pub fn stop(&self) -> CleanupReport {
        let mut report = CleanupReport::new();
        match process::signal_pid_file(&self.pid_file, Signal::Terminate) {
            Ok(Some(pid)) => info!(worker = %self.name, pid, "Sent SIGTERM to worker"),
            Ok(None) => debug!(worker = %self.name, "No PID file"),
            Err(ProcessError::NotRunning { pid }) => {
                debug!(worker = %self.name, pid, "Worker was not running")
            }
            Err(e) => report.record("signal worker", Err(e)),
        }
        report.remove_file(&self.pid_file);
        report.remove_file(&self.port_file);
        report.remove_dir_all(&self.run_path);
        report
    }
}

fn is_clean_exit(status: &ExitStatus) -> bool {
    status.success() || status.signal() == Some(libc::SIGTERM)
}

fn extract(archive: &Path, run_path: &Path) -> Result<(), String> {
    let file = std::fs::File::open(archive).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    std::fs::create_dir_all(run_path).map_err(|e| e.to_string())?;
    zip.extract(run_path).map_err(|e| e.to_string())
}
