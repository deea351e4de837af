use crate::error::CircuitOpenError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub dependency: String,
    pub state: CircuitStateKind,
    pub failure_count: u32,
    pub consecutive_success_count: u32,
    /// Milliseconds since the last recorded failure, if any.
    pub last_failure_ms_ago: Option<u64>,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

impl From<&crate::config::ResilienceConfig> for CircuitBreakerConfig {
    fn from(cfg: &crate::config::ResilienceConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            reset_timeout: cfg.reset_timeout(),
            success_threshold: cfg.success_threshold.max(1),
        }
    }
}

/// A state change produced by a call or an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitStateKind,
    pub to: CircuitStateKind,
}

#[derive(Debug)]
struct State {
    kind: CircuitStateKind,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl State {
    fn closed() -> Self {
        Self {
            kind: CircuitStateKind::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            last_failure: None,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn move_to(&mut self, to: CircuitStateKind) -> Option<Transition> {
        if self.kind == to {
            return None;
        }
        let from = self.kind;
        self.kind = to;
        Some(Transition { from, to })
    }
}

/// Circuit breaker for a single dependency.
///
/// - Closed: calls pass, failures are counted
/// - Open: calls fail fast until the reset timeout has elapsed
/// - Half-open: calls pass on probation; one failure re-opens,
///   `success_threshold` consecutive successes close
///
/// The open → half-open move happens lazily inside [`CircuitBreaker::acquire`].
/// Outcomes are reported separately so no lock is held while the guarded
/// operation runs.
pub struct CircuitBreaker {
    dependency: String,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            state: Mutex::new(State::closed()),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a call may proceed right now.
    pub fn acquire(
        &self,
        cfg: &CircuitBreakerConfig,
        now: Instant,
    ) -> Result<Option<Transition>, CircuitOpenError> {
        let mut st = self.lock();
        if st.kind != CircuitStateKind::Open {
            return Ok(None);
        }
        let elapsed = st
            .last_failure
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(cfg.reset_timeout);
        if elapsed < cfg.reset_timeout {
            st.total_rejections = st.total_rejections.saturating_add(1);
            return Err(CircuitOpenError::new(self.dependency.clone()));
        }
        st.consecutive_successes = 0;
        Ok(st.move_to(CircuitStateKind::HalfOpen))
    }

    pub fn on_success(&self, cfg: &CircuitBreakerConfig) -> Option<Transition> {
        let mut st = self.lock();
        st.total_successes = st.total_successes.saturating_add(1);
        match st.kind {
            CircuitStateKind::HalfOpen => {
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);
                if st.consecutive_successes >= cfg.success_threshold {
                    st.failure_count = 0;
                    st.consecutive_successes = 0;
                    return st.move_to(CircuitStateKind::Closed);
                }
                None
            }
            // A success in closed state leaves the failure count alone; a late
            // success from a call admitted before the breaker opened is ignored.
            CircuitStateKind::Closed | CircuitStateKind::Open => None,
        }
    }

    pub fn on_failure(&self, cfg: &CircuitBreakerConfig, now: Instant) -> Option<Transition> {
        let mut st = self.lock();
        st.total_failures = st.total_failures.saturating_add(1);
        match st.kind {
            CircuitStateKind::Closed => {
                st.failure_count = st.failure_count.saturating_add(1);
                st.last_failure = Some(now);
                if st.failure_count >= cfg.failure_threshold {
                    return st.move_to(CircuitStateKind::Open);
                }
                None
            }
            CircuitStateKind::HalfOpen => {
                st.failure_count = st.failure_count.saturating_add(1);
                st.consecutive_successes = 0;
                st.last_failure = Some(now);
                st.move_to(CircuitStateKind::Open)
            }
            // Late failure from a call admitted before the breaker opened:
            // it must not extend the open window.
            CircuitStateKind::Open => None,
        }
    }

    /// Overwrite the breaker state. Intended for tests and operator tooling.
    ///
    /// - `Open` records a failure at `now`, so the reset timeout starts afresh
    /// - `HalfOpen` clears the probation success count
    /// - `Closed` clears both counters
    pub fn force_state(
        &self,
        cfg: &CircuitBreakerConfig,
        kind: CircuitStateKind,
        now: Instant,
    ) -> Option<Transition> {
        let mut st = self.lock();
        match kind {
            CircuitStateKind::Open => {
                st.failure_count = st.failure_count.max(cfg.failure_threshold);
                st.last_failure = Some(now);
            }
            CircuitStateKind::HalfOpen => st.consecutive_successes = 0,
            CircuitStateKind::Closed => {
                st.failure_count = 0;
                st.consecutive_successes = 0;
            }
        }
        st.move_to(kind)
    }

    pub fn state(&self) -> CircuitStateKind {
        self.lock().kind
    }

    pub fn snapshot(&self, cfg: &CircuitBreakerConfig, now: Instant) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let last_failure_ms_ago = st
            .last_failure
            .map(|t| now.saturating_duration_since(t).as_millis() as u64);
        let open_remaining_ms = match (st.kind, st.last_failure) {
            (CircuitStateKind::Open, Some(t)) => {
                let until = t + cfg.reset_timeout;
                if until > now {
                    Some((until - now).as_millis() as u64)
                } else {
                    Some(0)
                }
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            dependency: self.dependency.clone(),
            state: st.kind,
            failure_count: st.failure_count,
            consecutive_success_count: st.consecutive_successes,
            last_failure_ms_ago,
            open_remaining_ms,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            total_rejections: st.total_rejections,
        }
    }
}
