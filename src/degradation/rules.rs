//! Degradation rules.
//!
//! Pure functions over already-collected inputs so the rule order can be
//! tested without a registry, sampler or queue.

use super::{DegradationMode, DegradationVerdict, Severity};
use crate::config::ResilienceConfig;
use crate::health::HealthSnapshot;
use serde::Serialize;

pub const REASON_HIGH_MEMORY: &str = "High memory usage";
pub const REASON_HIGH_ERROR_RATE: &str = "High error rate";
pub const REASON_SLOW_RESPONSES: &str = "Slow response times";
pub const REASON_UNHEALTHY_SERVICES: &str = "Unhealthy services";
pub const REASON_QUEUE_PRESSURE: &str = "Message queue pressure";
pub const REASON_OPERATIONAL: &str = "All systems operational";

/// Independent health categories. Two or more at once make the mode severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    HighMemory,
    HighErrorRate,
    SlowResponses,
    UnhealthyServices,
}

impl HealthSignal {
    pub fn reason(self) -> &'static str {
        match self {
            HealthSignal::HighMemory => REASON_HIGH_MEMORY,
            HealthSignal::HighErrorRate => REASON_HIGH_ERROR_RATE,
            HealthSignal::SlowResponses => REASON_SLOW_RESPONSES,
            HealthSignal::UnhealthyServices => REASON_UNHEALTHY_SERVICES,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            HealthSignal::SlowResponses => Severity::Medium,
            _ => Severity::High,
        }
    }
}

/// Health categories that fire for `health`, in rule order.
pub fn health_signals(health: &HealthSnapshot, cfg: &ResilienceConfig) -> Vec<HealthSignal> {
    let mut signals = Vec::new();
    if health.memory_usage_bytes > cfg.memory_threshold_bytes {
        signals.push(HealthSignal::HighMemory);
    }
    if health.error_rate_percent > cfg.error_rate_threshold_percent {
        signals.push(HealthSignal::HighErrorRate);
    }
    if health.response_time.p95_ms > cfg.response_time_p95_threshold_ms {
        signals.push(HealthSignal::SlowResponses);
    }
    if !health.unhealthy_dependencies().is_empty() {
        signals.push(HealthSignal::UnhealthyServices);
    }
    signals
}

pub fn queue_under_pressure(queue_len: usize, cfg: &ResilienceConfig) -> bool {
    queue_len as f64 > cfg.queue_pressure_ratio * cfg.max_queue_size as f64
}

/// First matching rule wins.
///
/// `open_circuits` must already be in dependency-priority order.
pub fn evaluate(
    open_circuits: &[String],
    signals: &[HealthSignal],
    queue_len: usize,
    cfg: &ResilienceConfig,
) -> DegradationVerdict {
    if let Some(dep) = open_circuits.first() {
        let severity = if dep == cfg.primary_dependency() {
            Severity::High
        } else {
            Severity::Medium
        };
        return DegradationVerdict::degraded(format!("Circuit breaker open for {}", dep), severity);
    }
    if let Some(signal) = signals.first() {
        return DegradationVerdict::degraded(signal.reason(), signal.severity());
    }
    if queue_under_pressure(queue_len, cfg) {
        return DegradationVerdict::degraded(REASON_QUEUE_PRESSURE, Severity::Medium);
    }
    DegradationVerdict::operational()
}

/// Coarse operating mode for the same inputs.
pub fn mode_for(
    verdict: &DegradationVerdict,
    open_circuits: &[String],
    signals: &[HealthSignal],
    maintenance: bool,
    cfg: &ResilienceConfig,
) -> DegradationMode {
    if maintenance {
        return DegradationMode::Maintenance;
    }
    let primary_open = open_circuits
        .iter()
        .any(|d| d == cfg.primary_dependency());
    if primary_open || signals.len() >= 2 {
        DegradationMode::Severe
    } else if verdict.should_degrade {
        DegradationMode::Partial
    } else {
        DegradationMode::Normal
    }
}
