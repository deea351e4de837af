//! 健康采样模块：从外部健康上报方获取进程与依赖的即时健康快照。
//!
//! Health sampling.
//!
//! The sampler pulls a point-in-time [`HealthSnapshot`] from an external
//! [`HealthReporter`]. It holds no state of its own besides that reference, and
//! it never fails: an absent, failing, panicking or slow reporter yields a
//! best-effort snapshot with zeroed metrics and every canonical dependency
//! marked [`DependencyHealth::Unknown`].

use crate::config::SharedConfig;
use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimePercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyHealth {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub memory_usage_bytes: u64,
    pub error_rate_percent: f64,
    pub response_time: ResponseTimePercentiles,
    pub dependencies: BTreeMap<String, DependencyHealth>,
    /// False when this is a fallback produced because the reporter was
    /// unavailable.
    #[serde(default)]
    pub collected: bool,
}

impl HealthSnapshot {
    /// A healthy, collected snapshot with no metrics recorded.
    pub fn new() -> Self {
        Self {
            collected: true,
            ..Self::default()
        }
    }

    pub fn with_memory_usage(mut self, bytes: u64) -> Self {
        self.memory_usage_bytes = bytes;
        self
    }

    pub fn with_error_rate(mut self, percent: f64) -> Self {
        self.error_rate_percent = percent;
        self
    }

    pub fn with_response_times(mut self, p50_ms: u64, p95_ms: u64, p99_ms: u64) -> Self {
        self.response_time = ResponseTimePercentiles {
            p50_ms,
            p95_ms,
            p99_ms,
        };
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, up: bool) -> Self {
        let health = if up {
            DependencyHealth::Up
        } else {
            DependencyHealth::Down
        };
        self.dependencies.insert(name.into(), health);
        self
    }

    /// Zeroed snapshot with each named dependency marked unknown.
    pub fn unavailable<I, S>(dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependencies: dependencies
                .into_iter()
                .map(|d| (d.into(), DependencyHealth::Unknown))
                .collect(),
            collected: false,
            ..Self::default()
        }
    }

    /// Dependencies explicitly reported down. Unknown does not count.
    pub fn unhealthy_dependencies(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|(_, h)| **h == DependencyHealth::Down)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// External health-reporting collaborator.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn current_metrics(&self) -> Result<HealthSnapshot>;
}

/// Stateless adapter over an optional [`HealthReporter`].
pub struct HealthSampler {
    reporter: Option<Arc<dyn HealthReporter>>,
    config: SharedConfig,
}

impl HealthSampler {
    pub fn new(reporter: Option<Arc<dyn HealthReporter>>, config: SharedConfig) -> Self {
        Self { reporter, config }
    }

    pub fn has_reporter(&self) -> bool {
        self.reporter.is_some()
    }

    pub async fn sample(&self) -> HealthSnapshot {
        let cfg = self.config.load_full();
        let fallback = || HealthSnapshot::unavailable(cfg.canonical_dependencies.iter().cloned());

        let Some(reporter) = &self.reporter else {
            debug!("no health reporter configured");
            return fallback();
        };

        let call = AssertUnwindSafe(reporter.current_metrics()).catch_unwind();
        match tokio::time::timeout(cfg.health_sample_timeout(), call).await {
            Ok(Ok(Ok(mut snapshot))) => {
                snapshot.collected = true;
                snapshot
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "health reporter failed, using fallback snapshot");
                fallback()
            }
            Ok(Err(_panic)) => {
                warn!("health reporter panicked, using fallback snapshot");
                fallback()
            }
            Err(_) => {
                warn!(
                    timeout_ms = cfg.health_sample_timeout_ms,
                    "health reporter timed out, using fallback snapshot"
                );
                fallback()
            }
        }
    }
}

/// In-memory reporter for tests and simulations.
///
/// Returns whatever snapshot was last set; can be switched into a failing or
/// slow mode to exercise the sampler's fallback path.
pub struct StaticHealthReporter {
    snapshot: RwLock<HealthSnapshot>,
    failing: RwLock<bool>,
    delay: RwLock<Option<Duration>>,
}

impl StaticHealthReporter {
    pub fn new(snapshot: HealthSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            failing: RwLock::new(false),
            delay: RwLock::new(None),
        }
    }

    pub fn set_snapshot(&self, snapshot: HealthSnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().unwrap_or_else(|e| e.into_inner()) = delay;
    }
}

impl Default for StaticHealthReporter {
    fn default() -> Self {
        Self::new(HealthSnapshot::new())
    }
}

#[async_trait]
impl HealthReporter for StaticHealthReporter {
    async fn current_metrics(&self) -> Result<HealthSnapshot> {
        let delay = *self.delay.read().unwrap_or_else(|e| e.into_inner());
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if *self.failing.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(crate::Error::runtime_with_context(
                "health metrics unavailable",
                crate::ErrorContext::new().with_source("static_health_reporter"),
            ));
        }
        Ok(self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, GATEWAY, LANGUAGE_MODEL};

    fn sampler(reporter: Option<Arc<dyn HealthReporter>>) -> HealthSampler {
        HealthSampler::new(reporter, ResilienceConfig::default().into_shared())
    }

    fn assert_fallback(s: &HealthSnapshot) {
        assert!(!s.collected);
        assert_eq!(s.memory_usage_bytes, 0);
        assert_eq!(s.error_rate_percent, 0.0);
        assert_eq!(s.dependencies[LANGUAGE_MODEL], DependencyHealth::Unknown);
        assert_eq!(s.dependencies[GATEWAY], DependencyHealth::Unknown);
        assert!(s.unhealthy_dependencies().is_empty());
    }

    #[tokio::test]
    async fn test_missing_reporter_yields_fallback() {
        let s = sampler(None);
        assert!(!s.has_reporter());
        assert_fallback(&s.sample().await);
    }

    #[tokio::test]
    async fn test_reporter_snapshot_is_returned() {
        let reporter = Arc::new(StaticHealthReporter::new(
            HealthSnapshot::new()
                .with_memory_usage(1024)
                .with_error_rate(2.5)
                .with_response_times(100, 400, 900)
                .with_dependency(GATEWAY, false),
        ));
        let snap = sampler(Some(reporter)).sample().await;
        assert!(snap.collected);
        assert_eq!(snap.memory_usage_bytes, 1024);
        assert_eq!(snap.response_time.p95_ms, 400);
        assert_eq!(snap.unhealthy_dependencies(), vec![GATEWAY]);
    }

    #[tokio::test]
    async fn test_failing_reporter_is_absorbed() {
        let reporter = Arc::new(StaticHealthReporter::default());
        reporter.set_failing(true);
        assert_fallback(&sampler(Some(reporter)).sample().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reporter_times_out() {
        let reporter = Arc::new(StaticHealthReporter::default());
        reporter.set_delay(Some(Duration::from_secs(60)));
        assert_fallback(&sampler(Some(reporter)).sample().await);
    }

    #[tokio::test]
    async fn test_panicking_reporter_is_absorbed() {
        struct Panics;
        #[async_trait]
        impl HealthReporter for Panics {
            async fn current_metrics(&self) -> Result<HealthSnapshot> {
                panic!("metrics backend exploded");
            }
        }
        assert_fallback(&sampler(Some(Arc::new(Panics))).sample().await);
    }
}
