//! slugctl - operator client for a running slugway daemon
//!
//! Usage:
//!   slugctl [--socket <path> | --config <path>] <command> [args...]
//!
//! Commands are sent verbatim over the control socket; see `slugctl help`.

use anyhow::{Context, Result};
use slugway::config::{Config, PathsConfig};
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Longest we wait for the daemon to answer; deploys answer immediately,
/// app-start waits for readiness
const REPLY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Options {
    socket: PathBuf,
    words: Vec<String>,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns false when the daemon answered with an error
fn run() -> Result<bool> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(options) = parse_args(&args)? else {
        print_help();
        return Ok(true);
    };

    let reply = send(&options)?;
    print!("{}", reply);
    Ok(!reply.starts_with("ERR:"))
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut socket = None;
    let mut rest = args;

    loop {
        match rest {
            [flag, path, tail @ ..] if flag == "--socket" => {
                socket = Some(PathBuf::from(path));
                rest = tail;
            }
            [flag, path, tail @ ..] if flag == "--config" => {
                let config = Config::load(path).with_context(|| format!("Failed to load {}", path))?;
                socket = Some(config.paths.control_socket());
                rest = tail;
            }
            [flag] if flag == "--socket" || flag == "--config" => {
                anyhow::bail!("{} needs a path", flag);
            }
            _ => break,
        }
    }

    match rest {
        [] => Ok(None),
        [help] if help == "help" || help == "--help" || help == "-h" => Ok(None),
        words => Ok(Some(Options {
            socket: socket.unwrap_or_else(|| PathsConfig::default().control_socket()),
            words: words.to_vec(),
        })),
    }
}

fn send(options: &Options) -> Result<String> {
    let mut stream = UnixStream::connect(&options.socket)
        .with_context(|| format!("Is slugway running? Cannot connect to {}", options.socket.display()))?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

    let line = shell_words::join(&options.words);
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;

    let mut reply = String::new();
    stream
        .read_to_string(&mut reply)
        .context("Failed to read reply")?;
    Ok(reply)
}

fn print_help() {
    println!(
        r#"
slugctl - control a running slugway daemon

USAGE:
    slugctl [--socket <path> | --config <path>] <command> [args...]

COMMANDS:
    nop                              Check that the daemon answers
    status [app...]                  Deploy state and workers per app
    proxy-limits                     Request gauges and rate-limit totals
    reload                           Re-read configuration and descriptors

    app-start (--all | app...)       Start serving slugs
    app-stop (--all | app...)        Stop serving slugs
    app-restart (--all | app...)     Restart with a fresh worker

    deploy-slug <archive>            Register a built slug and deploy it
    authorize-key <repo> <key>       Check whether a key may push to a repo
"#
    );
}
