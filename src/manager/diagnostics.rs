use crate::config::ResilienceConfig;
use crate::degradation::rules::HealthSignal;
use crate::degradation::{DegradationMode, DegradationVerdict};
use crate::health::HealthSnapshot;
use crate::queue::QueueSnapshot;
use crate::resilience::{CircuitStatus, RecoveryRecord};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// Point-in-time view of the whole subsystem for operators.
///
/// Facts only: nothing here is used to make decisions.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub circuits: CircuitStatus,
    pub queue: QueueSnapshot,
    pub recovery: BTreeMap<String, RecoveryRecord>,
    pub verdict: DegradationVerdict,
    pub mode: DegradationMode,
    pub health_signals: Vec<HealthSignal>,
    pub health: HealthSnapshot,
    pub maintenance: bool,
    pub rate_limited_users: usize,
    pub config: ResilienceConfig,
}

impl Diagnostics {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let open: Vec<&str> = self
            .circuits
            .iter()
            .filter(|(_, s)| s.state == crate::resilience::CircuitStateKind::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        format!(
            "mode={} reason=\"{}\" open=[{}] queue={}/{}",
            self.mode,
            self.verdict.reason,
            open.join(","),
            self.queue.size,
            self.queue.capacity
        )
    }
}
