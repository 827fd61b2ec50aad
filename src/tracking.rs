//! In-flight request gauges and limiter outcome totals

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Gauge key counting every request in flight
pub const TOTAL_KEY: &str = "__total__";

/// Gauge key counting every request currently held by the limiter
pub const DELAY_KEY: &str = "__delay__";

/// How long a finished request keeps counting in the gauges
pub const STAT_LIFETIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Delayed,
    Limited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub passed: u64,
    pub delayed: u64,
    pub limited: u64,
}

impl Totals {
    pub fn seen(&self) -> u64 {
        self.passed + self.delayed + self.limited
    }
}

/// Live gauges keyed by `__total__`, `host,<host>`, `addr,<addr>`,
/// `port,<port>` and their `delay,` variants, plus monotonic totals of
/// limiter outcomes. Nothing here survives a restart.
#[derive(Debug)]
pub struct Tracking {
    gauges: Mutex<BTreeMap<String, i64>>,
    passed: AtomicU64,
    delayed: AtomicU64,
    limited: AtomicU64,
    lifetime: Duration,
}

impl Default for Tracking {
    fn default() -> Self {
        Self::with_lifetime(STAT_LIFETIME)
    }
}

impl Tracking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            gauges: Mutex::new(BTreeMap::new()),
            passed: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            limited: AtomicU64::new(0),
            lifetime,
        }
    }

    pub fn increment<S: AsRef<str>>(&self, keys: &[S]) {
        let mut gauges = self.gauges.lock();
        for key in keys {
            *gauges.entry(key.as_ref().to_string()).or_insert(0) += 1;
        }
    }

    /// Lower each gauge, dropping it once nothing is in flight under it
    pub fn decrement<S: AsRef<str>>(&self, keys: &[S]) {
        let mut gauges = self.gauges.lock();
        for key in keys {
            let key = key.as_ref();
            match gauges.get_mut(key) {
                Some(value) if *value > 1 => *value -= 1,
                Some(_) => {
                    gauges.remove(key);
                }
                None => {}
            }
        }
    }

    /// Number of gauges currently held
    pub fn gauge_count(&self) -> usize {
        self.gauges.lock().len()
    }

    /// Current gauge value, or -1 for a key with nothing in flight
    pub fn get(&self, key: &str) -> i64 {
        self.gauges.lock().get(key).copied().unwrap_or(-1)
    }

    /// Increment `keys` now and decrement them one stat lifetime after the
    /// guard drops
    pub fn hold(self: &Arc<Self>, keys: Vec<String>) -> TrackingGuard {
        self.increment(&keys);
        TrackingGuard {
            tracking: Arc::clone(self),
            keys,
        }
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Passed => &self.passed,
            Outcome::Delayed => &self.delayed,
            Outcome::Limited => &self.limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> Totals {
        Totals {
            passed: self.passed.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            limited: self.limited.load(Ordering::Relaxed),
        }
    }

    /// `__total__` first, then every positive gauge in key order, then the
    /// outcome totals
    pub fn render(&self) -> String {
        let gauges = self.gauges.lock();
        let mut out = String::new();
        let _ = writeln!(out, "{}={}", TOTAL_KEY, gauges.get(TOTAL_KEY).copied().unwrap_or(0));
        for (key, value) in gauges.iter() {
            if key == TOTAL_KEY || *value <= 0 {
                continue;
            }
            let _ = writeln!(out, "{}={}", key, value);
        }
        drop(gauges);

        let totals = self.totals();
        let _ = writeln!(out, "totals.passed={}", totals.passed);
        let _ = writeln!(out, "totals.delayed={}", totals.delayed);
        let _ = write!(out, "totals.limited={}", totals.limited);
        out
    }
}

/// Keeps a set of gauges raised for the lifetime of a request
#[derive(Debug)]
pub struct TrackingGuard {
    tracking: Arc<Tracking>,
    keys: Vec<String>,
}

impl TrackingGuard {
    /// Raise more gauges under this guard
    pub fn extend(&mut self, keys: Vec<String>) {
        self.tracking.increment(&keys);
        self.keys.extend(keys);
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let tracking = Arc::clone(&self.tracking);
        let keys = std::mem::take(&mut self.keys);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(tracking.lifetime).await;
                    tracking.decrement(&keys);
                });
            }
            Err(_) => tracking.decrement(&keys),
        }
    }
}
