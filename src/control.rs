//! Control socket: one command line in, one reply out, then close.
//!
//! Replies are `OK`, `ERR: <message>` or command output, each ending in a
//! newline. Batch commands answer one line per application and never stop
//! at the first failure.

use crate::deploy::{StartOutcome, StopOutcome};
use crate::git;
use crate::service::Service;
use anyhow::Context;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest accepted command line
pub const MAX_LINE: usize = 64 * 1024;

/// How long a client may take to send its command
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Split a line with shell quoting rules. The command name is lowercased
    /// and must look like `app-start` or `proxy-limits`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = shell_words::split(line.trim()).map_err(|e| format!("invalid quoting: {}", e))?;
        if words.is_empty() {
            return Err("empty command".to_string());
        }
        let name = words.remove(0).to_lowercase();
        let valid = name.starts_with(|c: char| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if !valid {
            return Err(format!("invalid command name: {}", name));
        }
        Ok(Self { name, args: words })
    }
}

pub struct ControlServer {
    path: PathBuf,
    service: Arc<Service>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(path: &Path, service: Arc<Service>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            path: path.to_path_buf(),
            service,
            shutdown_rx,
        }
    }

    /// Bind the socket, replacing a stale one, and owner-only permissions
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("bind control socket {}", self.path.display()))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict permissions on {}", self.path.display()))?;
        Ok(listener)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    pub async fn serve(mut self, listener: UnixListener) -> anyhow::Result<()> {
        info!(path = %self.path.display(), "Control socket listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, service).await {
                                    debug!(error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept control connection"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
        }
        info!("Control socket closed");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<Service>) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read).take(MAX_LINE as u64 + 1);
    let mut line = String::new();

    let reply = match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Err(_) => "ERR: timed out waiting for a command\n".to_string(),
        Ok(Err(e)) => format!("ERR: {}\n", e),
        Ok(Ok(_)) if line.len() > MAX_LINE => "ERR: command line too long\n".to_string(),
        Ok(Ok(_)) => dispatch(&service, &line).await,
    };

    write.write_all(reply.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

/// Run one command line and render its reply
pub async fn dispatch(service: &Arc<Service>, line: &str) -> String {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => return format!("ERR: {}\n", e),
    };
    debug!(command = %command.name, args = ?command.args, "Control command");

    match execute(service, &command).await {
        Ok(output) if output.is_empty() => "OK\n".to_string(),
        Ok(output) => format!("{}\n", output.trim_end_matches('\n')),
        Err(e) => {
            warn!(command = %command.name, error = %e, "Control command failed");
            let message = format!("{:#}", e).replace('\n', " ");
            format!("ERR: {}\n", message)
        }
    }
}

async fn execute(service: &Arc<Service>, command: &Command) -> anyhow::Result<String> {
    let args = &command.args;
    match command.name.as_str() {
        "nop" => Ok(String::new()),
        "proxy-limits" => Ok(service.stats_report()),
        "status" => {
            let statuses = service.status(args).await?;
            Ok(statuses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"))
        }
        "reload" => {
            let result = service.reload()?;
            Ok(format!(
                "added={} removed={} updated={}",
                result.added.join(","),
                result.removed.join(","),
                result.updated.join(",")
            ))
        }
        "app-start" => {
            let mut lines = Vec::new();
            for name in targets(service, args)? {
                let line = match service.deployer().start_app(&name).await {
                    Ok(StartOutcome::Started(outcome)) => {
                        format!("{}: started {} on port {}", name, outcome.slug, outcome.port)
                    }
                    Ok(StartOutcome::AlreadyRunning { slug }) => {
                        format!("{}: already running {}", name, slug)
                    }
                    Err(e) => format!("{}: ERR: {}", name, e),
                };
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
        "app-stop" => {
            let mut lines = Vec::new();
            for name in targets(service, args)? {
                let line = match service.deployer().stop_app(&name).await {
                    Ok(StopOutcome::Stopped { slug, workers }) => {
                        format!("{}: stopped {} ({} workers)", name, slug, workers)
                    }
                    Ok(StopOutcome::NotRunning) => format!("{}: not running", name),
                    Err(e) => format!("{}: ERR: {}", name, e),
                };
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
        "app-restart" => {
            let mut lines = Vec::new();
            for name in targets(service, args)? {
                let line = match service.deployer().restart_app(&name).await {
                    Ok(outcome) => {
                        format!("{}: restarted {} on port {}", name, outcome.slug, outcome.port)
                    }
                    Err(e) => format!("{}: ERR: {}", name, e),
                };
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
        "deploy-slug" => {
            let [archive] = args.as_slice() else {
                anyhow::bail!("usage: deploy-slug <archive>");
            };
            let registered = git::register_built_slug(service.registry(), Path::new(archive))?;
            let app = registered.app.clone();
            let handle = service.deployer().spawn_deploy(&app);
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(outcome)) => info!(app = %outcome.app, slug = %outcome.slug, port = outcome.port, "Deployed"),
                    Ok(Err(e)) => error!(app, error = %e, "Deployment failed"),
                    Err(e) => error!(app, error = %e, "Deployment task panicked"),
                }
            });
            Ok(format!("{}: deploying {}", registered.app, registered.archive.display()))
        }
        "authorize-key" => {
            let [repo, key] = args.as_slice() else {
                anyhow::bail!("usage: authorize-key <repo> <key>");
            };
            match git::authorize_key(service.registry(), repo, key) {
                Some(auth) => Ok(format!("{} {} {}", auth.user, auth.app, auth.fingerprint)),
                None => anyhow::bail!("key not authorized for {}", repo),
            }
        }
        other => anyhow::bail!("unknown command: {}", other),
    }
}

/// `--all` or an explicit list of application names
fn targets(service: &Service, args: &[String]) -> anyhow::Result<Vec<String>> {
    match args {
        [] => anyhow::bail!("expected --all or application names"),
        [flag] if flag == "--all" => Ok(service
            .registry()
            .apps()
            .iter()
            .map(|app| app.name().to_string())
            .collect()),
        names => Ok(names.to_vec()),
    }
}

/// Send one command line to a control socket and return the reply
pub async fn send_command(path: &Path, line: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connect to {}", path.display()))?;
    stream.write_all(line.trim_end().as_bytes()).await?;
    stream.write_all(b"\n").await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}
