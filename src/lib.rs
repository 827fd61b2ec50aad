//! Slugway - a single-host push-to-deploy platform
//!
//! This library provides the core of a small PaaS that:
//! - Loads per-application descriptors into an atomically swapped registry
//! - Unpacks built slug archives and supervises them as worker processes
//! - Transitions an application from its serving slug to a new one once the
//!   candidate opens its port, rolling back when it does not
//! - Fronts every application with a Host-routing reverse proxy that gates on
//!   readiness and rate-limits by client address
//! - Accepts operator commands over a local Unix control socket

pub mod app;
pub mod config;
pub mod control;
pub mod deploy;
pub mod error;
pub mod git;
pub mod limiter;
pub mod pool;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod service;
pub mod slug;
pub mod tls;
pub mod tracking;
pub mod worker;

/// Crate version reported in the startup banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
