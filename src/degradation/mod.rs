//! 降级控制模块：综合熔断状态、健康快照与队列压力，给出系统级降级判定。
//!
//! # Degradation Control Module
//!
//! Combines circuit states, a fresh health snapshot and queue occupancy into a
//! [`DegradationVerdict`] (should the caller degrade, why, how badly) and a
//! coarse [`DegradationMode`]. Nothing is cached between calls except the last
//! published mode, which is only used to detect mode changes.
//!
//! Rules are evaluated in a fixed order and the first match names the reason:
//!
//! 1. An open circuit, primary dependency first
//! 2. Health thresholds (memory, error rate, p95 latency, dependencies down)
//! 3. Queue occupancy above the pressure ratio
//! 4. Otherwise operational

pub mod rules;

use crate::config::SharedConfig;
use crate::events::{EventBus, ResilienceEvent};
use crate::health::{HealthSampler, HealthSnapshot};
use crate::queue::PriorityMessageQueue;
use crate::resilience::CircuitBreakerRegistry;
use rules::HealthSignal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradationVerdict {
    pub should_degrade: bool,
    pub reason: String,
    pub severity: Severity,
}

impl DegradationVerdict {
    pub fn degraded(reason: impl Into<String>, severity: Severity) -> Self {
        Self {
            should_degrade: true,
            reason: reason.into(),
            severity,
        }
    }

    pub fn operational() -> Self {
        Self {
            should_degrade: false,
            reason: rules::REASON_OPERATIONAL.to_string(),
            severity: Severity::Low,
        }
    }
}

/// Ordered from least to most degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    #[default]
    Normal,
    Partial,
    Severe,
    Maintenance,
}

impl std::fmt::Display for DegradationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradationMode::Normal => write!(f, "normal"),
            DegradationMode::Partial => write!(f, "partial"),
            DegradationMode::Severe => write!(f, "severe"),
            DegradationMode::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Everything one evaluation looked at, plus its result.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub verdict: DegradationVerdict,
    pub mode: DegradationMode,
    pub open_circuits: Vec<String>,
    pub health_signals: Vec<HealthSignal>,
    pub health: HealthSnapshot,
    pub queue_len: usize,
    pub maintenance: bool,
}

impl Assessment {
    /// High severity, or a severe (or maintenance) mode even when the first
    /// matched rule is only medium. Queue passes are skipped and new messages
    /// get a fallback instead of being queued.
    pub fn is_severe(&self) -> bool {
        self.verdict.severity == Severity::High || self.mode >= DegradationMode::Severe
    }
}

pub struct DegradationController {
    config: SharedConfig,
    registry: Arc<CircuitBreakerRegistry>,
    sampler: HealthSampler,
    queue: Arc<PriorityMessageQueue>,
    events: EventBus,
    maintenance: AtomicBool,
    last_mode: Mutex<DegradationMode>,
}

impl DegradationController {
    pub fn new(
        config: SharedConfig,
        registry: Arc<CircuitBreakerRegistry>,
        sampler: HealthSampler,
        queue: Arc<PriorityMessageQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            sampler,
            queue,
            events,
            maintenance: AtomicBool::new(false),
            last_mode: Mutex::new(DegradationMode::Normal),
        }
    }

    /// Sample health and evaluate every rule.
    pub async fn assess(&self) -> Assessment {
        let health = self.sampler.sample().await;
        let cfg = self.config.load_full();
        let open_circuits = self.registry.open_dependencies();
        let health_signals = rules::health_signals(&health, &cfg);
        let queue_len = self.queue.len();
        let maintenance = self.is_maintenance();

        let verdict = rules::evaluate(&open_circuits, &health_signals, queue_len, &cfg);
        let mode = rules::mode_for(&verdict, &open_circuits, &health_signals, maintenance, &cfg);
        Assessment {
            verdict,
            mode,
            open_circuits,
            health_signals,
            health,
            queue_len,
            maintenance,
        }
    }

    pub async fn should_degrade(&self) -> DegradationVerdict {
        self.assess().await.verdict
    }

    /// Re-assess and publish `ModeChanged` if the coarse mode moved since the
    /// last refresh.
    pub async fn refresh_mode(&self) -> Assessment {
        let assessment = self.assess().await;
        let previous = {
            let mut last = self.last_mode.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *last, assessment.mode)
        };
        if previous != assessment.mode {
            let reason = assessment.verdict.reason.clone();
            if assessment.mode > previous {
                warn!(from = %previous, to = %assessment.mode, %reason, "degradation mode changed");
            } else {
                info!(from = %previous, to = %assessment.mode, %reason, "degradation mode changed");
            }
            self.events.publish(ResilienceEvent::ModeChanged {
                from: previous,
                to: assessment.mode,
                reason,
            });
        }
        assessment
    }

    /// Mode published by the last [`refresh_mode`](Self::refresh_mode).
    pub fn last_mode(&self) -> DegradationMode {
        *self.last_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enter_maintenance_mode(&self) {
        if !self.maintenance.swap(true, Ordering::AcqRel) {
            info!("entering maintenance mode");
            self.events
                .publish(ResilienceEvent::MaintenanceChanged { enabled: true });
        }
    }

    pub fn exit_maintenance_mode(&self) {
        if self.maintenance.swap(false, Ordering::AcqRel) {
            info!("leaving maintenance mode");
            self.events
                .publish(ResilienceEvent::MaintenanceChanged { enabled: false });
        }
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, LANGUAGE_MODEL};
    use crate::health::{HealthReporter, StaticHealthReporter};
    use crate::resilience::CircuitStateKind;

    struct Fixture {
        controller: DegradationController,
        registry: Arc<CircuitBreakerRegistry>,
        reporter: Arc<StaticHealthReporter>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let config = ResilienceConfig::default().into_shared();
        let events = EventBus::new();
        let registry = Arc::new(CircuitBreakerRegistry::new(config.clone(), events.clone()));
        let reporter = Arc::new(StaticHealthReporter::default());
        let sampler = HealthSampler::new(
            Some(reporter.clone() as Arc<dyn HealthReporter>),
            config.clone(),
        );
        let queue = Arc::new(PriorityMessageQueue::new(config.clone()));
        let controller = DegradationController::new(
            config,
            registry.clone(),
            sampler,
            queue,
            events.clone(),
        );
        Fixture {
            controller,
            registry,
            reporter,
            events,
        }
    }

    #[tokio::test]
    async fn test_healthy_system_is_operational() {
        let f = fixture();
        let v = f.controller.should_degrade().await;
        assert!(!v.should_degrade);
        assert_eq!(v.reason, "All systems operational");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_reported_before_memory() {
        let f = fixture();
        f.registry.force_state(LANGUAGE_MODEL, CircuitStateKind::Open);
        f.reporter
            .set_snapshot(HealthSnapshot::new().with_memory_usage(u64::MAX));
        let a = f.controller.assess().await;
        assert!(a.verdict.reason.contains("Circuit breaker open for language-model"));
        assert_eq!(a.verdict.severity, Severity::High);
        assert_eq!(a.mode, DegradationMode::Severe);
    }

    #[tokio::test]
    async fn test_two_signals_are_severe_despite_medium_reason() {
        let f = fixture();
        f.reporter.set_snapshot(
            HealthSnapshot::new()
                .with_response_times(10, 9_000, 9_500)
                .with_dependency("gateway", false),
        );
        let a = f.controller.assess().await;
        assert_eq!(a.verdict.reason, "Slow response times");
        assert_eq!(a.verdict.severity, Severity::Medium);
        assert_eq!(a.mode, DegradationMode::Severe);
        assert!(a.is_severe());

        f.reporter
            .set_snapshot(HealthSnapshot::new().with_response_times(10, 9_000, 9_500));
        assert!(!f.controller.assess().await.is_severe());
    }

    #[tokio::test]
    async fn test_maintenance_toggle_publishes_once() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.controller.enter_maintenance_mode();
        f.controller.enter_maintenance_mode();
        assert!(f.controller.is_maintenance());
        assert_eq!(f.controller.assess().await.mode, DegradationMode::Maintenance);
        f.controller.exit_maintenance_mode();

        assert_eq!(
            rx.try_recv().unwrap(),
            ResilienceEvent::MaintenanceChanged { enabled: true }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ResilienceEvent::MaintenanceChanged { enabled: false }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_publishes_mode_changes_only() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.controller.refresh_mode().await;
        assert!(rx.try_recv().is_err());

        f.reporter
            .set_snapshot(HealthSnapshot::new().with_response_times(10, 9_000, 9_500));
        f.controller.refresh_mode().await;
        f.controller.refresh_mode().await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ResilienceEvent::ModeChanged {
                from: DegradationMode::Normal,
                to: DegradationMode::Partial,
                reason: "Slow response times".into(),
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(f.controller.last_mode(), DegradationMode::Partial);
    }
}
