//! Resilience configuration.
//!
//! Every knob has a documented default, and invalid values never fail startup:
//! [`ResilienceConfig::sanitized`] swaps them for the default and logs a warning.
//! The active configuration is shared through [`SharedConfig`] so a reload is
//! picked up by every component on its next read.

use crate::Result;
use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Dependency name of the generative-language API.
pub const LANGUAGE_MODEL: &str = "language-model";
/// Dependency name of the chat-platform gateway.
pub const GATEWAY: &str = "gateway";

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_MAX_QUEUE_AGE_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_ERROR_RATE_THRESHOLD_PERCENT: f64 = 10.0;
pub const DEFAULT_RESPONSE_TIME_P95_THRESHOLD_MS: u64 = 5_000;
pub const DEFAULT_QUEUE_PRESSURE_RATIO: f64 = 0.8;
pub const DEFAULT_QUEUE_PROCESS_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_SAMPLE_TIMEOUT_MS: u64 = 2_000;

/// Active configuration, swappable at runtime.
pub type SharedConfig = Arc<ArcSwap<ResilienceConfig>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Failures in closed state before a breaker opens.
    pub failure_threshold: u32,
    /// Time an open breaker waits before letting a probation call through.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes needed to close a breaker.
    pub success_threshold: u32,
    pub max_queue_size: usize,
    pub max_queue_age_ms: u64,
    /// Delivery retries before a queued message is given up on. Zero is allowed.
    pub max_retries: u32,
    pub memory_threshold_bytes: u64,
    pub error_rate_threshold_percent: f64,
    pub response_time_p95_threshold_ms: u64,
    /// Queue occupancy ratio above which the queue counts as under pressure.
    pub queue_pressure_ratio: f64,
    pub queue_process_interval_ms: u64,
    pub recovery_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_sample_timeout_ms: u64,
    /// Per-user messages per minute; 0 disables user rate limiting.
    pub user_rate_limit_per_minute: u32,
    /// Dependencies always reported in status, in degradation priority order.
    pub canonical_dependencies: Vec<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_queue_age_ms: DEFAULT_MAX_QUEUE_AGE_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            error_rate_threshold_percent: DEFAULT_ERROR_RATE_THRESHOLD_PERCENT,
            response_time_p95_threshold_ms: DEFAULT_RESPONSE_TIME_P95_THRESHOLD_MS,
            queue_pressure_ratio: DEFAULT_QUEUE_PRESSURE_RATIO,
            queue_process_interval_ms: DEFAULT_QUEUE_PROCESS_INTERVAL_MS,
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            health_sample_timeout_ms: DEFAULT_HEALTH_SAMPLE_TIMEOUT_MS,
            user_rate_limit_per_minute: 0,
            canonical_dependencies: default_dependencies(),
        }
    }
}

fn default_dependencies() -> Vec<String> {
    vec![LANGUAGE_MODEL.to_string(), GATEWAY.to_string()]
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn yaml_field<T: DeserializeOwned>(map: &serde_yaml::Mapping, key: &str, fallback: T) -> T {
    match map.get(key) {
        None => fallback,
        Some(v) => match serde_yaml::from_value::<T>(v.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key, error = %e, "invalid configuration value, using default");
                fallback
            }
        },
    }
}

impl ResilienceConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `BOT_RESILIENCE_*` environment variables on top of the defaults.
    ///
    /// - `BOT_RESILIENCE_FAILURE_THRESHOLD` (default 5)
    /// - `BOT_RESILIENCE_RESET_TIMEOUT_MS` (default 60000)
    /// - `BOT_RESILIENCE_SUCCESS_THRESHOLD` (default 3)
    /// - `BOT_RESILIENCE_MAX_QUEUE_SIZE` (default 100)
    /// - `BOT_RESILIENCE_MAX_QUEUE_AGE_MS` (default 300000)
    /// - `BOT_RESILIENCE_MAX_RETRIES` (default 3)
    /// - `BOT_RESILIENCE_MEMORY_THRESHOLD_BYTES`
    /// - `BOT_RESILIENCE_ERROR_RATE_THRESHOLD`
    /// - `BOT_RESILIENCE_P95_THRESHOLD_MS`
    /// - `BOT_RESILIENCE_USER_RPM` (default 0, disabled)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            failure_threshold: env_parse("BOT_RESILIENCE_FAILURE_THRESHOLD")
                .unwrap_or(d.failure_threshold),
            reset_timeout_ms: env_parse("BOT_RESILIENCE_RESET_TIMEOUT_MS")
                .unwrap_or(d.reset_timeout_ms),
            success_threshold: env_parse("BOT_RESILIENCE_SUCCESS_THRESHOLD")
                .unwrap_or(d.success_threshold),
            max_queue_size: env_parse("BOT_RESILIENCE_MAX_QUEUE_SIZE").unwrap_or(d.max_queue_size),
            max_queue_age_ms: env_parse("BOT_RESILIENCE_MAX_QUEUE_AGE_MS")
                .unwrap_or(d.max_queue_age_ms),
            max_retries: env_parse("BOT_RESILIENCE_MAX_RETRIES").unwrap_or(d.max_retries),
            memory_threshold_bytes: env_parse("BOT_RESILIENCE_MEMORY_THRESHOLD_BYTES")
                .unwrap_or(d.memory_threshold_bytes),
            error_rate_threshold_percent: env_parse("BOT_RESILIENCE_ERROR_RATE_THRESHOLD")
                .unwrap_or(d.error_rate_threshold_percent),
            response_time_p95_threshold_ms: env_parse("BOT_RESILIENCE_P95_THRESHOLD_MS")
                .unwrap_or(d.response_time_p95_threshold_ms),
            user_rate_limit_per_minute: env_parse("BOT_RESILIENCE_USER_RPM")
                .unwrap_or(d.user_rate_limit_per_minute),
            ..d
        }
        .sanitized()
    }

    /// Parse a YAML document supplied by the configuration collaborator.
    ///
    /// Only a malformed document is an error. Unknown keys are ignored and
    /// individually invalid values fall back to their defaults.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(s)?;
        let map = match value {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            other => {
                warn!(kind = ?other, "configuration document is not a mapping, using defaults");
                serde_yaml::Mapping::new()
            }
        };
        let d = Self::default();
        Ok(Self {
            failure_threshold: yaml_field(&map, "failure_threshold", d.failure_threshold),
            reset_timeout_ms: yaml_field(&map, "reset_timeout_ms", d.reset_timeout_ms),
            success_threshold: yaml_field(&map, "success_threshold", d.success_threshold),
            max_queue_size: yaml_field(&map, "max_queue_size", d.max_queue_size),
            max_queue_age_ms: yaml_field(&map, "max_queue_age_ms", d.max_queue_age_ms),
            max_retries: yaml_field(&map, "max_retries", d.max_retries),
            memory_threshold_bytes: yaml_field(
                &map,
                "memory_threshold_bytes",
                d.memory_threshold_bytes,
            ),
            error_rate_threshold_percent: yaml_field(
                &map,
                "error_rate_threshold_percent",
                d.error_rate_threshold_percent,
            ),
            response_time_p95_threshold_ms: yaml_field(
                &map,
                "response_time_p95_threshold_ms",
                d.response_time_p95_threshold_ms,
            ),
            queue_pressure_ratio: yaml_field(&map, "queue_pressure_ratio", d.queue_pressure_ratio),
            queue_process_interval_ms: yaml_field(
                &map,
                "queue_process_interval_ms",
                d.queue_process_interval_ms,
            ),
            recovery_interval_ms: yaml_field(&map, "recovery_interval_ms", d.recovery_interval_ms),
            health_check_interval_ms: yaml_field(
                &map,
                "health_check_interval_ms",
                d.health_check_interval_ms,
            ),
            health_sample_timeout_ms: yaml_field(
                &map,
                "health_sample_timeout_ms",
                d.health_sample_timeout_ms,
            ),
            user_rate_limit_per_minute: yaml_field(
                &map,
                "user_rate_limit_per_minute",
                d.user_rate_limit_per_minute,
            ),
            canonical_dependencies: yaml_field(
                &map,
                "canonical_dependencies",
                d.canonical_dependencies,
            ),
        }
        .sanitized())
    }

    /// Replace invalid values with their documented defaults.
    pub fn sanitized(mut self) -> Self {
        macro_rules! ensure {
            ($field:ident, |$v:ident| $invalid:expr, $default:expr) => {{
                let $v = self.$field;
                if $invalid {
                    warn!(
                        field = stringify!($field),
                        value = ?$v,
                        default = ?$default,
                        "invalid configuration value, using default"
                    );
                    self.$field = $default;
                }
            }};
        }

        ensure!(failure_threshold, |v| v == 0, DEFAULT_FAILURE_THRESHOLD);
        ensure!(reset_timeout_ms, |v| v == 0, DEFAULT_RESET_TIMEOUT_MS);
        ensure!(success_threshold, |v| v == 0, DEFAULT_SUCCESS_THRESHOLD);
        ensure!(max_queue_size, |v| v == 0, DEFAULT_MAX_QUEUE_SIZE);
        ensure!(max_queue_age_ms, |v| v == 0, DEFAULT_MAX_QUEUE_AGE_MS);
        ensure!(memory_threshold_bytes, |v| v == 0, DEFAULT_MEMORY_THRESHOLD_BYTES);
        ensure!(
            error_rate_threshold_percent,
            |v| !v.is_finite() || v <= 0.0 || v > 100.0,
            DEFAULT_ERROR_RATE_THRESHOLD_PERCENT
        );
        ensure!(
            response_time_p95_threshold_ms,
            |v| v == 0,
            DEFAULT_RESPONSE_TIME_P95_THRESHOLD_MS
        );
        ensure!(
            queue_pressure_ratio,
            |v| !v.is_finite() || v <= 0.0 || v > 1.0,
            DEFAULT_QUEUE_PRESSURE_RATIO
        );
        ensure!(queue_process_interval_ms, |v| v == 0, DEFAULT_QUEUE_PROCESS_INTERVAL_MS);
        ensure!(recovery_interval_ms, |v| v == 0, DEFAULT_RECOVERY_INTERVAL_MS);
        ensure!(health_check_interval_ms, |v| v == 0, DEFAULT_HEALTH_CHECK_INTERVAL_MS);
        ensure!(health_sample_timeout_ms, |v| v == 0, DEFAULT_HEALTH_SAMPLE_TIMEOUT_MS);

        let mut seen = std::collections::HashSet::new();
        self.canonical_dependencies
            .retain(|d| !d.trim().is_empty() && seen.insert(d.clone()));
        if self.canonical_dependencies.is_empty() {
            warn!("no canonical dependencies configured, using defaults");
            self.canonical_dependencies = default_dependencies();
        }
        self
    }

    /// Wrap into a swappable handle.
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self.sanitized()))
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_queue_age(mut self, age: Duration) -> Self {
        self.max_queue_age_ms = age.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_memory_threshold_bytes(mut self, bytes: u64) -> Self {
        self.memory_threshold_bytes = bytes;
        self
    }

    pub fn with_error_rate_threshold(mut self, percent: f64) -> Self {
        self.error_rate_threshold_percent = percent;
        self
    }

    pub fn with_response_time_p95_threshold(mut self, threshold: Duration) -> Self {
        self.response_time_p95_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_user_rate_limit_per_minute(mut self, rpm: u32) -> Self {
        self.user_rate_limit_per_minute = rpm;
        self
    }

    pub fn with_canonical_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.canonical_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn max_queue_age(&self) -> Duration {
        Duration::from_millis(self.max_queue_age_ms)
    }

    pub fn queue_process_interval(&self) -> Duration {
        Duration::from_millis(self.queue_process_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_sample_timeout(&self) -> Duration {
        Duration::from_millis(self.health_sample_timeout_ms)
    }

    /// The dependency whose outage is treated as most severe.
    pub fn primary_dependency(&self) -> &str {
        self.canonical_dependencies
            .first()
            .map(|s| s.as_str())
            .unwrap_or(LANGUAGE_MODEL)
    }
}
