//! End-to-end tests: real worker processes behind the proxy and control socket
//!
//! Workers are this test binary re-executed with `fixture_worker` selected.
//! The fixture answers every request with the name of its working
//! directory, which embeds the slug's commit.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slugway::config::Config;
use slugway::control::{send_command, ControlServer};
use slugway::deploy::DeployOutcome;
use slugway::error::DeployError;
use slugway::git;
use slugway::proxy::ProxyServer;
use slugway::service::Service;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use zip::write::SimpleFileOptions;

const FIXTURE_ENV: &str = "SLUGWAY_FIXTURE";

/// Not a test: the HTTP worker started from slug Procfiles
#[test]
fn fixture_worker() {
    if std::env::var_os(FIXTURE_ENV).is_none() {
        return;
    }
    let port: u16 = std::env::var("PORT").unwrap().parse().unwrap();
    let body = std::env::current_dir()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let body = body.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        });
    }
}

fn fixture_procfile() -> String {
    let exe = std::env::current_exe().unwrap();
    format!(
        "web: {} fixture_worker --exact --nocapture\n",
        shell_words::quote(&exe.to_string_lossy())
    )
}

/// Stops every worker the service knows about, even when a test fails
struct StopWorkers(Arc<Service>);

impl Drop for StopWorkers {
    fn drop(&mut self) {
        let registry = self.0.registry();
        for app in registry.apps() {
            for archive in [app.this_slug(), app.next_slug()].into_iter().flatten() {
                if let Ok(slug) = registry.slug(&archive) {
                    slug.stop_all();
                }
            }
        }
    }
}

struct Platform {
    dir: tempfile::TempDir,
    service: Arc<Service>,
    proxy_addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

impl Platform {
    /// Service with its proxy on an ephemeral port. `ports` is the start of a
    /// private range: the first port is the app's origin port, the next ones
    /// are reserved for candidates.
    async fn start(ports: u16, app_extra: &str, config_extra: &str) -> (Self, StopWorkers) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let config_path = root.join("slugway.toml");
        std::fs::write(
            &config_path,
            format!(
                "[server]\nhttp_port = 0\napp_port_start = {}\napp_port_end = {}\n\n\
                 [paths]\netc = \"{}\"\nvar = \"{}\"\ntmp = \"{}\"\n\n\
                 [timeouts]\nslug_startup_secs = 10\nready_interval_ms = 50\n{}",
                ports + 1,
                ports + 20,
                root.join("etc").display(),
                root.join("var").display(),
                root.join("tmp").display(),
                config_extra
            ),
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        config.paths.prepare().unwrap();
        std::fs::write(
            config.paths.apps_dir().join("blog.toml"),
            format!(
                "domains = [\"blog.test\"]\n{}\n\n[settings]\nslugway_fixture = \"1\"\n\n\
                 [origin]\nscheme = \"http\"\nhost = \"127.0.0.1\"\nport = {}\n",
                app_extra, ports
            ),
        )
        .unwrap();

        let service = Service::new(&config_path, config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(proxy_addr, Arc::clone(service.proxy()), shutdown_rx);
        tokio::spawn(server.serve(listener));

        let guard = StopWorkers(Arc::clone(&service));
        (
            Self {
                dir,
                service,
                proxy_addr,
                _shutdown: shutdown,
            },
            guard,
        )
    }

    /// Build `blog--<commit>.zip` outside the slugs directory
    fn build_slug(&self, commit: &str, procfile: &str) -> PathBuf {
        let path = self.dir.path().join(format!("blog--{}.zip", commit));
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("Procfile", SimpleFileOptions::default()).unwrap();
        zip.write_all(procfile.as_bytes()).unwrap();
        zip.finish().unwrap();
        path
    }

    async fn push(&self, commit: &str, procfile: &str) -> Result<DeployOutcome, DeployError> {
        let archive = self.build_slug(commit, procfile);
        git::register_built_slug(self.service.registry(), &archive)?;
        self.service.deployer().deploy("blog").await
    }

    fn serving(&self) -> Option<PathBuf> {
        self.service.registry().app("blog").unwrap().this_slug()
    }

    async fn get(&self, host: &str, path: &str) -> (u16, String) {
        http_get(self.proxy_addr, host, path).await.unwrap()
    }
}

async fn http_get(addr: SocketAddr, host: &str, path: &str) -> std::io::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

#[tokio::test]
async fn test_first_deploy_serves_through_proxy() {
    let (platform, _workers) = Platform::start(44310, "", "").await;

    let outcome = platform.push("abc123", &fixture_procfile()).await.unwrap();
    assert_eq!(outcome.slug, "blog--abc123");
    assert_eq!(outcome.port, 44310);
    assert!(platform.serving().unwrap().ends_with("blog--abc123.zip"));

    let (status, body) = platform.get("blog.test", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("blog--abc123."), "unexpected body: {}", body);

    let (status, _) = platform.get("Blog.Test:8080", "/anything").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_candidate_that_never_opens_port_is_rolled_back() {
    let (platform, _workers) = Platform::start(
        44410,
        "\n[timeouts]\nslug_startup_secs = 2\nready_interval_ms = 50",
        "",
    )
    .await;
    platform.push("abc123", &fixture_procfile()).await.unwrap();

    let err = platform.push("def456", "web: sleep 60\n").await.unwrap_err();
    assert!(
        matches!(err, DeployError::ReadinessTimeout { .. }),
        "unexpected error: {}",
        err
    );

    assert!(platform.serving().unwrap().ends_with("blog--abc123.zip"));
    let candidate = platform
        .service
        .registry()
        .slug(&platform.service.config().paths.slugs_dir().join("blog--def456.zip"))
        .unwrap();
    assert!(!candidate.is_running());

    let status = platform.service.status(&["blog".to_string()]).await.unwrap();
    assert_eq!(status[0].live_workers(), 1);

    let (code, body) = platform.get("blog.test", "/").await;
    assert_eq!(code, 200);
    assert!(body.starts_with("blog--abc123."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swap_drops_no_requests() {
    let (platform, _workers) =
        Platform::start(44510, "", "\n[proxy_limit]\nmax = 100000.0\n").await;
    platform.push("abc123", &fixture_procfile()).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut clients = Vec::new();
    for _ in 0..2 {
        let stop = Arc::clone(&stop);
        let addr = platform.proxy_addr;
        clients.push(tokio::spawn(async move {
            let mut failures = Vec::new();
            let mut served = 0usize;
            while !stop.load(Ordering::SeqCst) {
                match http_get(addr, "blog.test", "/").await {
                    Ok((200, _)) => served += 1,
                    Ok((status, body)) => failures.push(format!("{} {}", status, body)),
                    Err(e) => failures.push(e.to_string()),
                }
            }
            (served, failures)
        }));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = platform.push("def456", &fixture_procfile()).await.unwrap();
    assert_ne!(outcome.port, 44510);
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.store(true, Ordering::SeqCst);

    for client in clients {
        let (served, failures) = client.await.unwrap();
        assert!(served > 0);
        assert!(failures.is_empty(), "dropped requests: {:?}", failures);
    }

    let (status, body) = platform.get("blog.test", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("blog--def456."));
    let slugs = platform.service.config().paths.slugs_dir();
    assert!(!slugs.join("blog--abc123.zip").exists());
}

#[tokio::test]
async fn test_routing_errors() {
    let (platform, _workers) = Platform::start(
        44610,
        "maintenance = true",
        "\n[proxy_limit]\nmax = 0.01\nburst = 1\nmax_delay_ms = 0\n",
    )
    .await;

    let (status, body) = platform.get("blog.test", "/").await;
    assert_eq!(status, 503);
    assert!(body.contains("Service is under maintenance"), "unexpected body: {}", body);

    let (status, _) = platform.get("blog.test", "/").await;
    assert_eq!(status, 429);

    let (status, _) = platform.get("nope.test", "/").await;
    assert_eq!(status, 404);

    let report = platform.service.stats_report();
    assert!(report.contains("totals.limited=1"), "unexpected report: {}", report);
}

#[tokio::test]
async fn test_control_socket_drives_deploys() {
    let (platform, _workers) = Platform::start(44710, "", "").await;
    let socket = platform.dir.path().join("control.sock");
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let control = ControlServer::new(&socket, Arc::clone(&platform.service), shutdown_rx);
    let listener = control.bind().unwrap();
    tokio::spawn(control.serve(listener));

    assert_eq!(send_command(&socket, "nop").await.unwrap(), "OK\n");
    assert_eq!(
        send_command(&socket, "frobnicate").await.unwrap(),
        "ERR: unknown command: frobnicate\n"
    );
    let status = send_command(&socket, "status blog").await.unwrap();
    assert!(status.starts_with("blog idle port=44710"), "unexpected status: {}", status);

    let archive = platform.build_slug("abc123", &fixture_procfile());
    let line = shell_words::join([
        "deploy-slug".to_string(),
        archive.to_string_lossy().into_owned(),
    ]);
    let reply = send_command(&socket, &line).await.unwrap();
    assert!(reply.starts_with("blog: deploying"), "unexpected reply: {}", reply);

    let mut status = String::new();
    for _ in 0..200 {
        status = send_command(&socket, "status blog").await.unwrap();
        if status.contains("transitioned(blog--abc123)") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(status.contains("live=1/1"), "unexpected status: {}", status);

    let (code, body) = platform.get("blog.test", "/").await;
    assert_eq!(code, 200);
    assert!(body.starts_with("blog--abc123."));
}
