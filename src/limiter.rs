//! Token-bucket rate limiter keyed by request host and client address.
//!
//! A request takes one token from every one of its keys, or from none of
//! them. Over-budget requests are re-checked `delay_scale` times across
//! `max_delay` before being rejected.

use crate::config::RateLimitConfig;
use crate::error::LimiterError;
use crate::tracking::{Outcome, Tracking, DELAY_KEY};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What happened to one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Passed,
    /// Allowed after waiting this long
    Delayed(Duration),
    /// Rejected after waiting this long
    Limited(Duration),
}

impl Decision {
    pub fn allowed(&self) -> bool {
        !matches!(self, Decision::Limited(_))
    }
}

/// Refill sums accumulate float error; a bucket this close to a whole token
/// counts as having it
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    buckets: Mutex<HashMap<String, Bucket>>,
    tracking: Arc<Tracking>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, tracking: Arc<Tracking>) -> Self {
        Self {
            config: RwLock::new(config),
            buckets: Mutex::new(HashMap::new()),
            tracking,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }

    /// Apply new limits; existing buckets keep their tokens
    pub fn reconfigure(&self, config: RateLimitConfig) {
        info!(max = config.max, burst = config.effective_burst(), "Rate limits updated");
        *self.config.write() = config;
    }

    pub fn tracking(&self) -> &Arc<Tracking> {
        &self.tracking
    }

    /// Take one token from every key, or none if any key is empty
    pub fn try_acquire<S: AsRef<str>>(&self, keys: &[S]) -> Result<bool, LimiterError> {
        if keys.is_empty() {
            return Err(LimiterError::NoKeys);
        }
        let config = self.config.read();
        if !(config.max.is_finite() && config.max > 0.0) {
            return Err(LimiterError::InvalidConfig(format!("max = {}", config.max)));
        }
        let burst = config.effective_burst();
        let rate = config.max;
        drop(config);

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        for key in keys {
            let bucket = buckets.entry(key.as_ref().to_string()).or_insert(Bucket {
                tokens: burst,
                refilled: now,
            });
            let elapsed = now.saturating_duration_since(bucket.refilled).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
            bucket.refilled = now;
        }

        let available = keys
            .iter()
            .all(|key| buckets.get(key.as_ref()).is_some_and(|b| b.tokens >= 1.0 - TOKEN_EPSILON));
        if available {
            for key in keys {
                if let Some(bucket) = buckets.get_mut(key.as_ref()) {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                }
            }
        }
        Ok(available)
    }

    /// Admit a request for `host` from `addr`, holding it while the budget
    /// recovers. `request_id` only appears in decision logs.
    pub async fn admit(&self, host: &str, addr: &str, request_id: &str) -> Result<Decision, LimiterError> {
        let keys = [format!("host,{}", host), format!("addr,{}", addr)];
        let config = self.config();

        if self.try_acquire(&keys)? {
            self.tracking.record(Outcome::Passed);
            return Ok(Decision::Passed);
        }

        let _held = self.tracking.hold(vec![
            DELAY_KEY.to_string(),
            format!("delay,host,{}", host),
            format!("delay,addr,{}", addr),
        ]);

        let step = config.step_delay();
        for attempt in 1..=config.delay_scale {
            tokio::time::sleep(step).await;
            let waited = step * attempt;
            if self.try_acquire(&keys)? {
                self.tracking.record(Outcome::Delayed);
                if config.log_allowed {
                    info!(request_id, addr, host, ?waited, "[rate] allowed");
                }
                return Ok(Decision::Delayed(waited));
            }
            if config.log_delayed {
                info!(request_id, addr, host, ?waited, "[rate] delayed");
            }
        }

        self.tracking.record(Outcome::Limited);
        if config.log_limited {
            info!(request_id, addr, host, "[rate] limited");
        }
        Ok(Decision::Limited(step * config.delay_scale))
    }

    /// Drop buckets untouched for longer than the configured TTL
    pub fn sweep(&self) -> usize {
        let ttl = self.config.read().ttl();
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.refilled) < ttl);
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, remaining = buckets.len(), "Purged idle rate-limit buckets");
        }
        purged
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: f64, burst: u32) -> RateLimiter {
        let config = RateLimitConfig {
            max,
            burst,
            max_delay_ms: 1000,
            delay_scale: 10,
            ttl_secs: 60,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(config, Tracking::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = limiter(2.0, 3);
        let keys = ["addr,10.0.0.1"];

        for _ in 0..3 {
            assert!(limiter.try_acquire(&keys).unwrap());
        }
        assert!(!limiter.try_acquire(&keys).unwrap());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire(&keys).unwrap());
        assert!(!limiter.try_acquire(&keys).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_all_or_nothing() {
        let limiter = limiter(1.0, 1);

        assert!(limiter.try_acquire(&["host,a", "addr,x"]).unwrap());
        // addr,x is empty, so host,b must keep its token
        assert!(!limiter.try_acquire(&["host,b", "addr,x"]).unwrap());
        assert!(limiter.try_acquire(&["host,b", "addr,y"]).unwrap());
    }

    #[test]
    fn test_errors_fail_open_upstream() {
        let limiter = limiter(1.0, 1);
        let none: [&str; 0] = [];
        assert!(matches!(limiter.try_acquire(&none), Err(LimiterError::NoKeys)));

        limiter.reconfigure(RateLimitConfig {
            max: 0.0,
            ..RateLimitConfig::default()
        });
        assert!(matches!(
            limiter.try_acquire(&["addr,x"]),
            Err(LimiterError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_request_passes_when_budget_recovers() {
        let limiter = limiter(5.0, 1);

        assert_eq!(limiter.admit("blog.test", "10.0.0.1", "r1").await.unwrap(), Decision::Passed);
        let decision = limiter.admit("blog.test", "10.0.0.1", "r2").await.unwrap();

        // One token every 200ms, re-checked every 100ms
        assert_eq!(decision, Decision::Delayed(Duration::from_millis(200)));
        assert_eq!(limiter.tracking().totals().delayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conservation() {
        // 1 req/s, burst 2, requests held at most 1s
        let limiter = Arc::new(limiter(1.0, 2));
        let n = 20;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter
                        .admit("blog.test", "10.0.0.1", &format!("r{}", i))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut passed = 0;
        let mut delayed = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Decision::Passed => passed += 1,
                Decision::Delayed(_) => delayed += 1,
                Decision::Limited(_) => limited += 1,
            }
        }

        let totals = limiter.tracking().totals();
        assert_eq!(passed + delayed + limited, n);
        assert_eq!(totals.seen(), n as u64);
        assert_eq!(totals.passed, passed as u64);
        assert_eq!(totals.delayed, delayed as u64);
        assert_eq!(totals.limited, limited as u64);
        // burst + rate * window
        assert!(passed <= 2);
        assert!(passed + delayed <= 2 + 1 + 1);
        assert!(limited > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_do_not_block_each_other() {
        let limiter = Arc::new(limiter(2.0, 1));
        limiter.admit("a.test", "10.0.0.1", "a0").await.unwrap();
        limiter.admit("b.test", "10.0.0.2", "b0").await.unwrap();

        let started = Instant::now();
        let a = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.admit("a.test", "10.0.0.1", "a1").await.unwrap() }
        });
        let b = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.admit("b.test", "10.0.0.2", "b1").await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        // Both are held concurrently, so the pair finishes well inside one max delay
        assert!(matches!(a, Decision::Delayed(_)));
        assert!(matches!(b, Decision::Delayed(_)));
        assert!(Instant::now() - started < Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_buckets() {
        let limiter = limiter(1.0, 1);
        limiter.try_acquire(&["addr,old"]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.try_acquire(&["addr,new"]).unwrap();

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
