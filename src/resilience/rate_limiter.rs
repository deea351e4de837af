use crate::config::SharedConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Tokens per second.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl BucketConfig {
    /// `None` disables limiting. The burst is one minute's allowance, so a
    /// user may send `rpm` messages back to back and then one every `60/rpm` s.
    pub fn from_per_minute(rpm: u32) -> Option<Self> {
        if rpm == 0 {
            return None;
        }
        Some(Self {
            rps: rpm as f64 / 60.0,
            burst: (rpm as f64).max(1.0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self, cfg: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * cfg.rps).min(cfg.burst);
            self.last = now;
        }
    }
}

/// Token bucket per user id.
///
/// - Disabled while `user_rate_limit_per_minute` is 0
/// - Never sleeps; callers get a `retry_after` hint instead
pub struct UserRateLimiter {
    config: SharedConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl UserRateLimiter {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `user_id` if available.
    pub fn check(&self, user_id: &str) -> RateLimitDecision {
        let Some(cfg) = BucketConfig::from_per_minute(self.config.load().user_rate_limit_per_minute)
        else {
            return RateLimitDecision::Allowed;
        };
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            tokens: cfg.burst,
            last: now,
        });
        bucket.refill(&cfg, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateLimitDecision::Allowed;
        }
        let missing = 1.0 - bucket.tokens;
        RateLimitDecision::Limited {
            retry_after: Duration::from_secs_f64(missing / cfg.rps),
        }
    }

    /// Forget users whose bucket has been untouched for `idle`. Returns how
    /// many were dropped.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last) < idle);
        before - buckets.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
