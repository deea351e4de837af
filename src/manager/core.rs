use super::builder::ResilienceManagerBuilder;
use super::diagnostics::Diagnostics;
use crate::config::{ResilienceConfig, SharedConfig};
use crate::degradation::{DegradationController, DegradationVerdict};
use crate::error::CircuitOpenError;
use crate::events::{EventBus, ResilienceEvent};
use crate::fallback::{FallbackContext, FallbackResponder};
use crate::queue::{
    InboundMessage, Priority, PriorityMessageQueue, ProcessReport, Responder, ResponseNotice,
};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitStatus, ProbeResult, RateLimitDecision, RecoveryScheduler,
    UserRateLimiter,
};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces the reply to a message. Runs under the primary dependency's
/// circuit breaker.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &InboundMessage) -> Result<String>;
}

/// Adapter for async closures.
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F, Fut> MessageProcessor for FnProcessor<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn process(&self, message: &InboundMessage) -> Result<String> {
        (self.0)(message.clone()).await
    }
}

/// Result of [`ResilienceManager::handle_message`].
///
/// `handled` means the sender already received its terminal notice during the
/// call; `queued` means the message is waiting in the queue and will be
/// answered later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOutcome {
    pub handled: bool,
    pub queued: bool,
}

impl HandleOutcome {
    fn answered() -> Self {
        Self {
            handled: true,
            queued: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCycle {
    /// Severity was high or the mode severe; the queue was left untouched.
    Skipped { reason: String },
    Ran(ProcessReport),
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    pub(crate) started: bool,
    pub(crate) stopped: bool,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub(crate) struct Inner {
    pub(crate) config: SharedConfig,
    pub(crate) events: EventBus,
    pub(crate) registry: Arc<CircuitBreakerRegistry>,
    pub(crate) queue: Arc<PriorityMessageQueue>,
    pub(crate) controller: DegradationController,
    pub(crate) recovery: RecoveryScheduler,
    pub(crate) rate_limiter: UserRateLimiter,
    pub(crate) fallback: FallbackResponder,
    pub(crate) processor: Arc<dyn MessageProcessor>,
    pub(crate) lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// Entry point for inbound chat messages.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ResilienceManager {
    pub(crate) inner: Arc<Inner>,
}

impl ResilienceManager {
    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new()
    }

    /// Start the queue, recovery and health-monitor loops. Idempotent.
    ///
    /// Fails only when called after [`shutdown`](Self::shutdown).
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.stopped {
            return Err(Error::runtime_with_context(
                "cannot initialize after shutdown",
                ErrorContext::new().with_source("resilience_manager"),
            ));
        }
        if lifecycle.started {
            debug!("resilience manager already initialized");
            return Ok(());
        }
        let cancel = lifecycle.cancel.clone();
        lifecycle.tasks = super::tasks::spawn_all(&self.inner, cancel);
        lifecycle.started = true;
        info!(tasks = lifecycle.tasks.len(), "resilience manager initialized");
        Ok(())
    }

    /// Stop the background loops, then answer every queued message with a
    /// shutdown notice. Idempotent; returns once all notices are sent.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            lifecycle.cancel.cancel();
            std::mem::take(&mut lifecycle.tasks)
        };
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "background task ended abnormally");
            }
        }
        let drained = self.inner.queue.drain_for_shutdown().await;
        info!(drained, "resilience manager shut down");
    }

    pub async fn is_running(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.started && !lifecycle.stopped
    }

    /// Decide what to do with one inbound message.
    ///
    /// In order: maintenance mode answers with a fallback; a rate-limited user
    /// is told to wait; a healthy system processes right away under the
    /// primary circuit (queueing for retry if that fails); high severity or a
    /// severe mode answers with a fallback; anything else is queued.
    pub async fn handle_message(
        &self,
        user_id: &str,
        server_id: &str,
        payload: &str,
        responder: Arc<dyn Responder>,
        priority: Priority,
    ) -> HandleOutcome {
        let inner = &self.inner;
        let message = InboundMessage::new(user_id, server_id, payload, priority);

        if inner.queue.is_closed() {
            responder
                .respond(ResponseNotice::ShuttingDown { message_id: None })
                .await;
            return HandleOutcome::answered();
        }

        if inner.controller.is_maintenance() {
            let text = self.fallback_text(&message, DegradationVerdict::operational());
            responder.respond(ResponseNotice::Fallback { text }).await;
            return HandleOutcome::answered();
        }

        if let RateLimitDecision::Limited { retry_after } = inner.rate_limiter.check(user_id) {
            debug!(user_id, retry_after_ms = retry_after.as_millis() as u64, "user rate limited");
            responder
                .respond(ResponseNotice::RateLimited {
                    retry_after_ms: retry_after.as_millis() as u64,
                })
                .await;
            return HandleOutcome::answered();
        }

        let assessment = inner.controller.assess().await;
        let severe = assessment.is_severe();
        let verdict = assessment.verdict;
        if !verdict.should_degrade {
            match self.deliver(message.clone()).await {
                Ok(reply) => {
                    responder.respond(ResponseNotice::Delivered { reply }).await;
                    return HandleOutcome::answered();
                }
                Err(e) => {
                    warn!(user_id, server_id, error = %e, "processing failed, queueing for retry");
                }
            }
        } else if severe {
            info!(user_id, reason = %verdict.reason, "severe degradation, answering with fallback");
            let text = self.fallback_text(&message, verdict);
            responder.respond(ResponseNotice::Fallback { text }).await;
            return HandleOutcome::answered();
        }

        let outcome = inner.queue.enqueue(message, responder).await;
        HandleOutcome {
            handled: !outcome.is_queued(),
            queued: outcome.is_queued(),
        }
    }

    /// Run the message processor under the primary dependency's breaker.
    async fn deliver(&self, message: InboundMessage) -> Result<String> {
        let primary = self.inner.config.load().primary_dependency().to_string();
        let processor = self.inner.processor.clone();
        self.inner
            .registry
            .execute(&primary, || async move { processor.process(&message).await })
            .await
    }

    fn fallback_text(&self, message: &InboundMessage, verdict: DegradationVerdict) -> String {
        let ctx = FallbackContext::new(verdict)
            .with_maintenance(self.inner.controller.is_maintenance())
            .with_queue_size(self.inner.queue.len());
        self.inner.fallback.generate_fallback_response(
            &message.payload,
            &message.user_id,
            &message.server_id,
            &ctx,
        )
    }

    /// One queue pass, skipped entirely while severity is high or the mode is
    /// severe or maintenance.
    pub async fn process_queue(&self) -> QueueCycle {
        let assessment = self.inner.controller.assess().await;
        if assessment.is_severe() {
            let reason = if assessment.maintenance {
                "Maintenance mode".to_string()
            } else {
                assessment.verdict.reason
            };
            debug!(%reason, mode = %assessment.mode, "skipping queue processing");
            return QueueCycle::Skipped { reason };
        }
        let report = self
            .inner
            .queue
            .process(|message| {
                let this = self.clone();
                async move { this.deliver(message).await }
            })
            .await;
        if report.delivered + report.expired + report.gave_up > 0 {
            info!(
                delivered = report.delivered,
                expired = report.expired,
                requeued = report.requeued,
                gave_up = report.gave_up,
                remaining = self.inner.queue.len(),
                "processed message queue"
            );
        }
        QueueCycle::Ran(report)
    }

    /// Run `operation` under the breaker for `dependency`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.inner.registry.execute(dependency, operation).await
    }

    pub async fn trigger_recovery(&self, dependency: Option<&str>) -> Vec<ProbeResult> {
        self.inner.recovery.trigger_recovery(dependency).await
    }

    pub async fn should_degrade(&self) -> DegradationVerdict {
        self.inner.controller.should_degrade().await
    }

    /// Fallback text for the current state, whatever it is.
    pub async fn generate_fallback_response(
        &self,
        input: &str,
        user_id: &str,
        server_id: &str,
    ) -> String {
        let verdict = self.inner.controller.should_degrade().await;
        let message = InboundMessage::new(user_id, server_id, input, Priority::default());
        self.fallback_text(&message, verdict)
    }

    pub fn enter_maintenance_mode(&self) {
        self.inner.controller.enter_maintenance_mode();
    }

    pub fn exit_maintenance_mode(&self) {
        self.inner.controller.exit_maintenance_mode();
    }

    pub fn is_maintenance(&self) -> bool {
        self.inner.controller.is_maintenance()
    }

    pub fn status(&self) -> CircuitStatus {
        self.inner.registry.status()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let assessment = self.inner.controller.assess().await;
        Diagnostics {
            circuits: self.inner.registry.status(),
            queue: self.inner.queue.snapshot(),
            recovery: self.inner.recovery.records(),
            verdict: assessment.verdict,
            mode: assessment.mode,
            health_signals: assessment.health_signals,
            health: assessment.health,
            maintenance: assessment.maintenance,
            rate_limited_users: self.inner.rate_limiter.tracked_users(),
            config: (*self.config()).clone(),
        }
    }

    /// Swap in a new configuration. Invalid values are replaced by defaults.
    pub fn reload_config(&self, config: ResilienceConfig) {
        self.inner.config.store(Arc::new(config.sanitized()));
        info!("resilience configuration reloaded");
        self.inner.events.publish(ResilienceEvent::ConfigReloaded);
    }

    pub fn config(&self) -> Arc<ResilienceConfig> {
        self.inner.config.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &PriorityMessageQueue {
        &self.inner.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LANGUAGE_MODEL;
    use crate::resilience::CircuitStateKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    fn manager(cfg: ResilienceConfig, healthy: Arc<AtomicBool>) -> ResilienceManager {
        ResilienceManager::builder()
            .config(cfg)
            .processor(Arc::new(FnProcessor(move |m: InboundMessage| {
                let ok = healthy.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(format!("echo: {}", m.payload))
                    } else {
                        Err(Error::upstream("model unavailable"))
                    }
                }
            })))
            .build()
            .unwrap()
    }

    fn channel() -> (Arc<dyn Responder>, mpsc::UnboundedReceiver<ResponseNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    #[tokio::test]
    async fn test_healthy_message_is_delivered() {
        let m = manager(ResilienceConfig::default(), Arc::new(AtomicBool::new(true)));
        let (r, mut rx) = channel();
        let outcome = m.handle_message("u", "s", "hi", r, Priority::Medium).await;
        assert_eq!(outcome, HandleOutcome { handled: true, queued: false });
        assert_eq!(
            rx.recv().await,
            Some(ResponseNotice::Delivered { reply: "echo: hi".into() })
        );
    }

    #[tokio::test]
    async fn test_failed_processing_is_queued() {
        let healthy = Arc::new(AtomicBool::new(false));
        let m = manager(ResilienceConfig::default(), healthy.clone());
        let (r, mut rx) = channel();
        let outcome = m.handle_message("u", "s", "hi", r, Priority::Medium).await;
        assert_eq!(outcome, HandleOutcome { handled: false, queued: true });
        assert!(matches!(rx.recv().await, Some(ResponseNotice::Queued { .. })));

        healthy.store(true, Ordering::SeqCst);
        assert!(matches!(m.process_queue().await, QueueCycle::Ran(ProcessReport { delivered: 1, .. })));
        assert_eq!(
            rx.recv().await,
            Some(ResponseNotice::Delivered { reply: "echo: hi".into() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_open_falls_back_and_skips_queue() {
        let m = manager(ResilienceConfig::default(), Arc::new(AtomicBool::new(true)));
        m.registry().force_state(LANGUAGE_MODEL, CircuitStateKind::Open);
        let (r, mut rx) = channel();
        let outcome = m.handle_message("u", "s", "hi", r, Priority::High).await;
        assert_eq!(outcome, HandleOutcome { handled: true, queued: false });
        match rx.recv().await {
            Some(ResponseNotice::Fallback { text }) => {
                assert!(text.contains("Circuit breaker open for language-model"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(m.process_queue().await, QueueCycle::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_maintenance_answers_with_fallback() {
        let m = manager(ResilienceConfig::default(), Arc::new(AtomicBool::new(true)));
        m.enter_maintenance_mode();
        let (r, mut rx) = channel();
        m.handle_message("u", "s", "hi", r, Priority::High).await;
        match rx.recv().await {
            Some(ResponseNotice::Fallback { text }) => assert!(text.contains("under maintenance")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_user() {
        let m = manager(
            ResilienceConfig::new().with_user_rate_limit_per_minute(1),
            Arc::new(AtomicBool::new(true)),
        );
        let (r, mut rx) = channel();
        m.handle_message("u", "s", "one", r.clone(), Priority::Low).await;
        m.handle_message("u", "s", "two", r, Priority::Low).await;
        assert!(matches!(rx.recv().await, Some(ResponseNotice::Delivered { .. })));
        assert!(matches!(rx.recv().await, Some(ResponseNotice::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_reload_publishes_event() {
        let m = manager(ResilienceConfig::default(), Arc::new(AtomicBool::new(true)));
        let mut events = m.subscribe();
        m.reload_config(ResilienceConfig::new().with_max_queue_size(5));
        assert_eq!(m.config().max_queue_size, 5);
        assert_eq!(events.recv().await.unwrap(), ResilienceEvent::ConfigReloaded);
    }

    #[tokio::test]
    async fn test_initialize_after_shutdown_fails() {
        let m = manager(ResilienceConfig::default(), Arc::new(AtomicBool::new(true)));
        m.initialize().await.unwrap();
        m.initialize().await.unwrap();
        assert!(m.is_running().await);
        m.shutdown().await;
        m.shutdown().await;
        assert!(!m.is_running().await);
        assert!(m.initialize().await.is_err());
    }
}
