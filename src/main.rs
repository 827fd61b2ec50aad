use anyhow::Context;
use slugway::config::Config;
use slugway::control::ControlServer;
use slugway::process::{self, PidLock};
use slugway::proxy::ProxyServer;
use slugway::registry::Registry;
use slugway::service::Service;
use slugway::worker::LaunchSpec;
use slugway::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "/etc/slugway/slugway.toml";

const USAGE: &str = "usage: slugway [config] | slugway run <config> <app>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slugway=debug".parse().context("valid log directive")?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, config, app] if cmd == "run" => run_foreground(Path::new(config), app).await,
        [cmd, ..] if cmd == "run" => anyhow::bail!(USAGE),
        [flag] if flag == "--help" || flag == "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        [] => serve(Path::new(DEFAULT_CONFIG)).await,
        [config] => serve(Path::new(config)).await,
        _ => anyhow::bail!(USAGE),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    print_startup_banner(&config);

    config
        .paths
        .prepare()
        .context("Failed to create data directories")?;

    let pid_lock = PidLock::acquire(&config.paths.pid_file())?;
    info!(path = %pid_lock.path().display(), "PID file written and locked");

    let service = Service::new(config_path, config.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.server.http_enabled() {
        let addr = bind_addr(&config.server.bind, config.server.http_port)?;
        let server = ProxyServer::new(addr, Arc::clone(service.proxy()), shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    if let Some(certs) = service.certs() {
        let addr = bind_addr(&config.server.bind, config.server.https_port)?;
        let server = ProxyServer::new(addr, Arc::clone(service.proxy()), shutdown_rx.clone())
            .with_tls(certs.acceptor()?);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));
    }

    let control = ControlServer::new(
        &config.paths.control_socket(),
        Arc::clone(&service),
        shutdown_rx.clone(),
    );
    let control_listener = control.bind()?;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = control.serve(control_listener).await {
            error!(error = %e, "Control socket error");
        }
    }));

    tasks.push(service.spawn_sweeper(shutdown_rx.clone()));

    let boot = Arc::clone(&service);
    tokio::spawn(async move { boot.start_on_boot().await });

    wait_for_signals(&service).await?;

    let _ = shutdown_tx.send(true);
    service.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    let report = pid_lock.release();
    if !report.is_clean() {
        warn!(failures = report.failures().len(), "Shutdown cleanup incomplete");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM, handling SIGHUP and SIGUSR1 meanwhile
async fn wait_for_signals(service: &Arc<Service>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %service.config_path().display(), "Received SIGHUP, reloading configuration...");
                match service.reload() {
                    Ok(result) => info!(
                        added = result.added.len(),
                        removed = result.removed.len(),
                        updated = result.updated.len(),
                        "Configuration reloaded successfully"
                    ),
                    Err(e) => error!(error = %format!("{:#}", e), "Failed to reload configuration"),
                }
            }
            _ = sigusr1.recv() => {
                for line in service.stats_report().lines() {
                    info!(target: "slugway::stats", "{}", line);
                }
            }
        }
    }
}

/// Run one application's serving slug in the foreground on its origin port
async fn run_foreground(config_path: &Path, name: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config
        .paths
        .prepare()
        .context("Failed to create data directories")?;
    let run_as = process::resolve_run_as(&config.run_as)?;

    let registry = Registry::load(config)?;
    let app = registry
        .app(name)
        .with_context(|| format!("unknown application: {}", name))?;
    let archive = app
        .this_slug()
        .with_context(|| format!("{} has no serving slug", name))?;

    let slug = registry.slug(&archive)?;
    let worker = slug.new_worker();
    let launch = LaunchSpec::for_app(&app, run_as);
    worker.start_foreground(app.origin().port, &launch).await?;
    info!(app = name, worker = %worker.name(), "Worker finished");
    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting slugway");
    let server = &config.server;
    let http_port = server.http_enabled().then_some(server.http_port);
    let https_port = server.https_enabled().then_some(server.https_port);
    info!(
        bind = %server.bind,
        http_port = ?http_port,
        https_port = ?https_port,
        app_ports = %format!("{}..{}", server.app_port_start, server.app_port_end),
        "Server configuration"
    );
    info!(
        pool_max_idle = server.pool_max_idle_per_host,
        pool_idle_timeout_secs = server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        slug_startup_secs = config.timeouts.slug_startup_secs,
        ready_interval_ms = config.timeouts.ready_interval_ms,
        origin_request_secs = config.timeouts.origin_request_secs,
        "Timeouts"
    );
    info!(
        max = config.proxy_limit.max,
        burst = config.proxy_limit.effective_burst(),
        max_delay_ms = config.proxy_limit.max_delay_ms,
        "Rate limits"
    );
    info!(
        etc = %config.paths.etc.display(),
        var = %config.paths.var.display(),
        tmp = %config.paths.tmp.display(),
        keep_slugs = config.keep_slugs,
        start_on_boot = config.include_slugs.on_start,
        stop_on_shutdown = config.include_slugs.on_stop,
        "Paths and slug policy"
    );
}
