//! Rate Limiter: per-client token bucket admission control (spec §4.7).

use crate::sync_ext::MutexExt;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: 10.0,
            refill_rate_per_sec: 1.0, // 60 requests/minute default (spec §6.3)
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckResult {
    pub allowed: bool,
    pub retry_after_seconds: f64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically refill based on elapsed time, then deduct `cost` if
    /// enough tokens remain (spec §4.7 `check`).
    pub fn check(&self, client_id: &str, cost: f64) -> CheckResult {
        let mut guard = self.buckets.lock_unpoisoned();
        let now = Utc::now();
        let bucket = guard.entry(client_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.capacity,
            last_refill_at: now,
        });

        let elapsed = (now - bucket.last_refill_at).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_rate_per_sec)
            .min(self.config.capacity);
        bucket.last_refill_at = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            CheckResult {
                allowed: true,
                retry_after_seconds: 0.0,
            }
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after = deficit / self.config.refill_rate_per_sec;
            CheckResult {
                allowed: false,
                retry_after_seconds: retry_after,
            }
        }
    }
}
