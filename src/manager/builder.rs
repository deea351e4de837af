use super::core::{Inner, Lifecycle, MessageProcessor, ResilienceManager};
use crate::config::ResilienceConfig;
use crate::degradation::DegradationController;
use crate::events::EventBus;
use crate::fallback::FallbackResponder;
use crate::health::{HealthReporter, HealthSampler};
use crate::queue::PriorityMessageQueue;
use crate::resilience::{
    CircuitBreakerRegistry, RecoveryProbe, RecoveryScheduler, UserRateLimiter,
};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;

/// Builder for [`ResilienceManager`].
///
/// Collaborators are injected here and nowhere else. Building has no side
/// effects; background loops only start in [`ResilienceManager::initialize`].
pub struct ResilienceManagerBuilder {
    config: ResilienceConfig,
    health_reporter: Option<Arc<dyn HealthReporter>>,
    processor: Option<Arc<dyn MessageProcessor>>,
    recovery_probe: Option<Arc<dyn RecoveryProbe>>,
    event_capacity: Option<usize>,
}

impl ResilienceManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            health_reporter: None,
            processor: None,
            recovery_probe: None,
            event_capacity: None,
        }
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Health collaborator. Optional; without one every sample is the
    /// "unknown" fallback snapshot.
    pub fn health_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.health_reporter = Some(reporter);
        self
    }

    /// What actually answers a message (normally the language-model call).
    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Probe used by the recovery loop. Without one, the loop only moves
    /// open breakers to half-open once their reset timeout has elapsed.
    pub fn recovery_probe(mut self, probe: Arc<dyn RecoveryProbe>) -> Self {
        self.recovery_probe = Some(probe);
        self
    }

    /// Buffer size of the event broadcast channel.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity.max(1));
        self
    }

    pub fn build(self) -> Result<ResilienceManager> {
        let processor = self.processor.ok_or_else(|| {
            Error::configuration_with_context(
                "a message processor is required",
                ErrorContext::new()
                    .with_field_path("processor")
                    .with_source("resilience_manager_builder"),
            )
        })?;

        let config = self.config.into_shared();
        let events = match self.event_capacity {
            Some(n) => EventBus::with_capacity(n),
            None => EventBus::new(),
        };
        let registry = Arc::new(CircuitBreakerRegistry::new(config.clone(), events.clone()));
        let queue = Arc::new(PriorityMessageQueue::new(config.clone()));
        let sampler = HealthSampler::new(self.health_reporter, config.clone());
        let controller = DegradationController::new(
            config.clone(),
            registry.clone(),
            sampler,
            queue.clone(),
            events.clone(),
        );
        let recovery = RecoveryScheduler::new(registry.clone(), self.recovery_probe);
        let rate_limiter = UserRateLimiter::new(config.clone());

        Ok(ResilienceManager {
            inner: Arc::new(Inner {
                config,
                events,
                registry,
                queue,
                controller,
                recovery,
                rate_limiter,
                fallback: FallbackResponder::new(),
                processor,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        })
    }
}

impl Default for ResilienceManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
