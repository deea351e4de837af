//! Out-of-band recovery probes for open circuits.

use super::registry::CircuitBreakerRegistry;
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

/// Lightweight health call against one dependency.
///
/// Runs through the registry, so a probe that succeeds while half-open counts
/// toward closing the breaker.
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    async fn probe(&self, dependency: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub attempts: u64,
    pub last_attempt_ms_ago: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Succeeded,
    Failed { error: String },
    /// Breaker still inside its reset timeout; the probe was not sent.
    StillOpen,
    /// No probe configured: the breaker moved to half-open and live traffic
    /// decides whether it closes.
    HalfOpened,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub dependency: String,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

struct Attempts {
    count: u64,
    last: Instant,
}

pub struct RecoveryScheduler {
    registry: Arc<CircuitBreakerRegistry>,
    probe: Option<Arc<dyn RecoveryProbe>>,
    records: Mutex<HashMap<String, Attempts>>,
}

impl RecoveryScheduler {
    /// Without a probe, an idle open breaker is only moved to half-open once
    /// its reset timeout has elapsed; nothing is counted as a success.
    pub fn new(
        registry: Arc<CircuitBreakerRegistry>,
        probe: Option<Arc<dyn RecoveryProbe>>,
    ) -> Self {
        Self {
            registry,
            probe,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Probe open dependencies: all of them, or only `dependency` if given.
    ///
    /// A named dependency that is not open is left alone. Every probed
    /// dependency gets an attempt recorded whatever the outcome.
    pub async fn trigger_recovery(&self, dependency: Option<&str>) -> Vec<ProbeResult> {
        let targets: Vec<String> = match dependency {
            Some(name) if self.registry.is_open(name) => vec![name.to_string()],
            Some(name) => {
                debug!(dependency = name, "recovery requested for a closed circuit, skipping");
                Vec::new()
            }
            None => self.registry.open_dependencies(),
        };
        if targets.is_empty() {
            return Vec::new();
        }

        let results = join_all(targets.iter().map(|d| self.probe_one(d))).await;

        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for r in &results {
            let entry = records.entry(r.dependency.clone()).or_insert(Attempts {
                count: 0,
                last: now,
            });
            entry.count += 1;
            entry.last = now;
        }
        results
    }

    async fn probe_one(&self, dependency: &str) -> ProbeResult {
        let Some(probe) = self.probe.clone() else {
            let outcome = if self.registry.try_half_open(dependency) {
                debug!(dependency, "no recovery probe, circuit left half-open");
                ProbeOutcome::HalfOpened
            } else {
                ProbeOutcome::StillOpen
            };
            return ProbeResult {
                dependency: dependency.to_string(),
                outcome,
            };
        };
        let outcome = match self
            .registry
            .execute(dependency, || async move { probe.probe(dependency).await })
            .await
        {
            Ok(()) => {
                info!(dependency, "recovery probe succeeded");
                ProbeOutcome::Succeeded
            }
            Err(e) if e.is_circuit_open() => ProbeOutcome::StillOpen,
            Err(e) => {
                info!(dependency, error = %e, "recovery probe failed");
                ProbeOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        ProbeResult {
            dependency: dependency.to_string(),
            outcome,
        }
    }

    pub fn records(&self) -> BTreeMap<String, RecoveryRecord> {
        let now = Instant::now();
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, a)| {
                (
                    name.clone(),
                    RecoveryRecord {
                        attempts: a.count,
                        last_attempt_ms_ago: Some(
                            now.saturating_duration_since(a.last).as_millis() as u64,
                        ),
                    },
                )
            })
            .collect()
    }
}
