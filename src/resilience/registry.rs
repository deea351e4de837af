//! Per-dependency circuit breakers.

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitStateKind, Transition,
};
use crate::config::SharedConfig;
use crate::error::CircuitOpenError;
use crate::events::{EventBus, ResilienceEvent};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Read-only view of every tracked breaker, keyed by dependency name.
pub type CircuitStatus = BTreeMap<String, CircuitBreakerSnapshot>;

/// Owns one [`CircuitBreaker`] per dependency name.
///
/// Breakers are created lazily on first reference and live as long as the
/// registry. Thresholds are read from the shared configuration on every call,
/// so a config reload applies to existing breakers too.
pub struct CircuitBreakerRegistry {
    config: SharedConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: SharedConfig, events: EventBus) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(self.config.load().as_ref())
    }

    /// Get or create the breaker for `dependency`.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
        {
            return b.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(dependency.to_string())
            .or_insert_with(|| {
                debug!(dependency, "tracking new dependency");
                Arc::new(CircuitBreaker::new(dependency))
            })
            .clone()
    }

    /// Run `operation` under the breaker for `dependency`.
    ///
    /// The operation's own error is returned unchanged and counted as a
    /// failure. When the breaker is open and the reset timeout has not elapsed,
    /// the operation is not invoked and a [`CircuitOpenError`] is returned.
    pub async fn execute<T, E, F, Fut>(&self, dependency: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let breaker = self.breaker(dependency);
        let cfg = self.breaker_config();
        match breaker.acquire(&cfg, Instant::now()) {
            Ok(transition) => self.announce(dependency, transition),
            Err(open) => {
                debug!(dependency, "circuit open, failing fast");
                return Err(open.into());
            }
        }

        let outcome = operation().await;

        // Re-read thresholds: the config may have been reloaded while the
        // operation was suspended.
        let cfg = self.breaker_config();
        let transition = match &outcome {
            Ok(_) => breaker.on_success(&cfg),
            Err(_) => breaker.on_failure(&cfg, Instant::now()),
        };
        self.announce(dependency, transition);
        outcome
    }

    /// Apply the lazy open → half-open move without running anything.
    ///
    /// Returns false while the reset timeout is still running. No outcome is
    /// recorded, so the next real call decides whether the breaker closes.
    pub fn try_half_open(&self, dependency: &str) -> bool {
        match self
            .breaker(dependency)
            .acquire(&self.breaker_config(), Instant::now())
        {
            Ok(transition) => {
                self.announce(dependency, transition);
                true
            }
            Err(_) => false,
        }
    }

    fn announce(&self, dependency: &str, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        match to {
            CircuitStateKind::Open => warn!(dependency, %from, %to, "circuit breaker opened"),
            CircuitStateKind::HalfOpen => info!(dependency, %from, %to, "circuit breaker probing"),
            CircuitStateKind::Closed => info!(dependency, %from, %to, "circuit breaker closed"),
        }
        self.events.publish(ResilienceEvent::CircuitStateChanged {
            dependency: dependency.to_string(),
            from,
            to,
        });
    }

    /// Force a dependency into a given state.
    ///
    /// This is the supported way for tests (and operator tooling) to reproduce
    /// a circuit state without driving real failures. Forcing `Open` starts the
    /// reset timeout from now.
    pub fn force_state(&self, dependency: &str, state: CircuitStateKind) {
        let transition =
            self.breaker(dependency)
                .force_state(&self.breaker_config(), state, Instant::now());
        self.announce(dependency, transition);
    }

    pub fn state_of(&self, dependency: &str) -> CircuitStateKind {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
            .map(|b| b.state())
            .unwrap_or(CircuitStateKind::Closed)
    }

    pub fn is_open(&self, dependency: &str) -> bool {
        self.state_of(dependency) == CircuitStateKind::Open
    }

    /// Tracked dependency names: canonical ones first, in priority order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut names = self.config.load().canonical_dependencies.clone();
        let mut extra: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| !names.contains(k))
            .cloned()
            .collect();
        extra.sort();
        names.extend(extra);
        names
    }

    /// Dependencies whose breaker is currently open, in priority order.
    pub fn open_dependencies(&self) -> Vec<String> {
        self.dependencies()
            .into_iter()
            .filter(|d| self.is_open(d))
            .collect()
    }

    /// Snapshot of every tracked breaker. Canonical dependencies are always
    /// present, reported as closed with zero counts if never exercised.
    pub fn status(&self) -> CircuitStatus {
        let cfg = self.breaker_config();
        let now = Instant::now();
        let names = self.dependencies();
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        names
            .into_iter()
            .map(|name| {
                let snap = match breakers.get(&name) {
                    Some(b) => b.snapshot(&cfg, now),
                    None => CircuitBreaker::new(name.clone()).snapshot(&cfg, now),
                };
                (name, snap)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, GATEWAY, LANGUAGE_MODEL};
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(cfg: ResilienceConfig) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(cfg.into_shared(), EventBus::new())
    }

    async fn fail(reg: &CircuitBreakerRegistry, dep: &str) -> crate::Result<()> {
        reg.execute(dep, || async { Err::<(), _>(Error::upstream("boom")) })
            .await
    }

    #[tokio::test]
    async fn test_status_includes_canonical_dependencies() {
        let reg = registry(ResilienceConfig::default());
        let status = reg.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[LANGUAGE_MODEL].state, CircuitStateKind::Closed);
        assert_eq!(status[GATEWAY].failure_count, 0);
    }

    #[tokio::test]
    async fn test_success_passes_value_through() {
        let reg = registry(ResilienceConfig::default());
        let v: crate::Result<u32> = reg.execute("gemini", || async { Ok(7) }).await;
        assert_eq!(v.unwrap(), 7);
        assert!(reg.status().contains_key("gemini"));
    }

    #[tokio::test]
    async fn test_upstream_error_is_not_wrapped() {
        let reg = registry(ResilienceConfig::default());
        let err = fail(&reg, "gemini").await.unwrap_err();
        assert_eq!(err.to_string(), "Upstream error: boom");
    }

    #[tokio::test]
    async fn test_custom_error_type() {
        #[derive(Debug, PartialEq)]
        enum MyErr {
            Open(String),
            Http(u16),
        }
        impl From<CircuitOpenError> for MyErr {
            fn from(e: CircuitOpenError) -> Self {
                MyErr::Open(e.dependency)
            }
        }
        let reg = registry(ResilienceConfig::new().with_failure_threshold(1));
        let r: Result<(), MyErr> = reg.execute("x", || async { Err(MyErr::Http(503)) }).await;
        assert_eq!(r, Err(MyErr::Http(503)));
        let r: Result<(), MyErr> = reg.execute("x", || async { Ok(()) }).await;
        assert_eq!(r, Err(MyErr::Open("x".into())));
    }

    #[tokio::test]
    async fn test_open_transition_is_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reg = CircuitBreakerRegistry::new(
            ResilienceConfig::new().with_failure_threshold(2).into_shared(),
            bus,
        );
        let _ = fail(&reg, "gemini").await;
        let _ = fail(&reg, "gemini").await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ResilienceEvent::CircuitStateChanged {
                dependency: "gemini".into(),
                from: CircuitStateKind::Closed,
                to: CircuitStateKind::Open,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_applies_to_existing_breakers() {
        let shared = ResilienceConfig::default().into_shared();
        let reg = CircuitBreakerRegistry::new(shared.clone(), EventBus::new());
        let _ = fail(&reg, "gemini").await;
        shared.store(Arc::new(ResilienceConfig::new().with_failure_threshold(2)));
        let _ = fail(&reg, "gemini").await;
        assert!(reg.is_open("gemini"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_dependencies_in_priority_order() {
        let reg = registry(ResilienceConfig::default());
        reg.force_state(GATEWAY, CircuitStateKind::Open);
        reg.force_state("zeta", CircuitStateKind::Open);
        reg.force_state(LANGUAGE_MODEL, CircuitStateKind::Open);
        assert_eq!(
            reg.open_dependencies(),
            vec![LANGUAGE_MODEL.to_string(), GATEWAY.to_string(), "zeta".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_not_invoked_while_open() {
        let reg = registry(
            ResilienceConfig::new().with_reset_timeout(Duration::from_secs(10)),
        );
        reg.force_state("gemini", CircuitStateKind::Open);
        let calls = AtomicUsize::new(0);
        let r: crate::Result<()> = reg
            .execute("gemini", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(r.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let r: crate::Result<()> = reg
            .execute("gemini", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(r.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state_of("gemini"), CircuitStateKind::HalfOpen);
    }
}
