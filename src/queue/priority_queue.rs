//! Bounded priority queue.

use super::message::{InboundMessage, Priority, QueuedMessage, Responder, ResponseNotice};
use crate::config::SharedConfig;
use crate::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Assumed per-message processing time until one has been measured.
const INITIAL_PROCESSING_ESTIMATE: Duration = Duration::from_secs(2);
/// Weight of the newest sample in the moving average.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    /// Stored after evicting an older, lower-priority message.
    QueuedAfterEviction { position: usize, evicted: Uuid },
    Rejected,
    /// The queue has been drained for shutdown and accepts nothing.
    Closed,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Queued { .. } | EnqueueOutcome::QueuedAfterEviction { .. }
        )
    }
}

/// Result of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Another pass was already running; nothing was done.
    pub skipped_busy: bool,
    pub delivered: usize,
    pub expired: usize,
    pub requeued: usize,
    pub gave_up: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub expired: u64,
    pub retries_exhausted: u64,
    pub failed_attempts: u64,
    pub shutdown_notified: u64,
}

struct AtomicStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    retries_exhausted: AtomicU64,
    failed_attempts: AtomicU64,
    shutdown_notified: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            shutdown_notified: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn to_stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            shutdown_notified: self.shutdown_notified.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub size: usize,
    pub capacity: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub oldest_age_ms: Option<u64>,
    pub avg_processing_ms: u64,
    pub stats: QueueStats,
}

/// One FIFO per priority tier, highest tier first.
#[derive(Default)]
struct Tiers([VecDeque<QueuedMessage>; 3]);

impl Tiers {
    fn len(&self) -> usize {
        self.0.iter().map(VecDeque::len).sum()
    }

    fn push_back(&mut self, msg: QueuedMessage) -> usize {
        let tier = msg.priority().tier();
        self.0[tier].push_back(msg);
        // 1-based position: everything in higher tiers plus this tier
        self.0[..=tier].iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<QueuedMessage> {
        self.0.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Oldest message of the lowest non-empty tier strictly below `incoming`.
    fn evict_below(&mut self, incoming: Priority) -> Option<QueuedMessage> {
        self.0
            .iter_mut()
            .rev()
            .take_while(|q| q.front().map_or(true, |m| m.priority() < incoming))
            .find_map(VecDeque::pop_front)
    }

    /// Drop oldest-of-lowest-tier until at most `max` remain. Only does work
    /// after the capacity was lowered by a config reload.
    fn trim_to(&mut self, max: usize) -> Vec<QueuedMessage> {
        let mut trimmed = Vec::new();
        while self.len() > max {
            match self.0.iter_mut().rev().find_map(VecDeque::pop_front) {
                Some(msg) => trimmed.push(msg),
                None => break,
            }
        }
        trimmed
    }

    fn drain_all(&mut self) -> Vec<QueuedMessage> {
        self.0.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}

/// Bounded holding area for messages that cannot be processed right now.
///
/// Ordering is priority-major, FIFO within a tier. Every stored message
/// eventually receives exactly one terminal [`ResponseNotice`].
pub struct PriorityMessageQueue {
    config: SharedConfig,
    tiers: Mutex<Tiers>,
    processing: tokio::sync::Mutex<()>,
    avg_processing: Mutex<Option<Duration>>,
    closed: AtomicBool,
    stats: AtomicStats,
}

impl PriorityMessageQueue {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            tiers: Mutex::new(Tiers::default()),
            processing: tokio::sync::Mutex::new(()),
            avg_processing: Mutex::new(None),
            closed: AtomicBool::new(false),
            stats: AtomicStats::new(),
        }
    }

    fn tiers(&self) -> std::sync::MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.tiers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.load().max_queue_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Moving average of successful delivery time.
    pub fn average_processing_time(&self) -> Duration {
        self.avg_processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(INITIAL_PROCESSING_ESTIMATE)
    }

    fn record_processing_time(&self, sample: Duration) {
        let mut avg = self.avg_processing.lock().unwrap_or_else(|e| e.into_inner());
        *avg = Some(match *avg {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - EWMA_ALPHA) + sample.mul_f64(EWMA_ALPHA),
        });
    }

    pub fn estimated_wait(&self, position: usize) -> Duration {
        self.average_processing_time()
            .saturating_mul(position.min(u32::MAX as usize) as u32)
    }

    /// Store a message, evicting a lower-priority one if the queue is full.
    ///
    /// The sender is told the outcome right away: a `Queued` acknowledgement
    /// with an estimated wait, or a terminal `Rejected` / `ShuttingDown`.
    pub async fn enqueue(
        &self,
        message: InboundMessage,
        responder: Arc<dyn Responder>,
    ) -> EnqueueOutcome {
        self.enqueue_message(QueuedMessage::new(message, responder)).await
    }

    pub async fn enqueue_message(&self, msg: QueuedMessage) -> EnqueueOutcome {
        let max = self.capacity();
        let id = msg.id;
        let priority = msg.priority();
        let responder = msg.responder();

        enum Placement {
            Stored(usize, Option<QueuedMessage>),
            Refused(QueuedMessage),
            Closed(QueuedMessage),
        }

        let (placement, trimmed) = {
            let mut tiers = self.tiers();
            if self.is_closed() {
                (Placement::Closed(msg), Vec::new())
            } else {
                let trimmed = tiers.trim_to(max);
                let placement = if tiers.len() < max {
                    Placement::Stored(tiers.push_back(msg), None)
                } else if let Some(evicted) = tiers.evict_below(priority) {
                    Placement::Stored(tiers.push_back(msg), Some(evicted))
                } else {
                    Placement::Refused(msg)
                };
                (placement, trimmed)
            }
        };
        self.notify_dropped(trimmed, max).await;

        match placement {
            Placement::Closed(msg) => {
                msg.finish(ResponseNotice::ShuttingDown { message_id: None })
                    .await;
                EnqueueOutcome::Closed
            }
            Placement::Refused(msg) => {
                AtomicStats::bump(&self.stats.rejected);
                warn!(%priority, capacity = max, "message queue full, rejecting message");
                msg.finish(ResponseNotice::Rejected).await;
                EnqueueOutcome::Rejected
            }
            Placement::Stored(position, evicted) => {
                AtomicStats::bump(&self.stats.enqueued);
                let outcome = match evicted {
                    Some(old) => {
                        AtomicStats::bump(&self.stats.evicted);
                        let evicted_id = old.id;
                        warn!(
                            evicted = %evicted_id,
                            evicted_priority = %old.priority(),
                            incoming_priority = %priority,
                            "message queue full, evicted lower-priority message"
                        );
                        old.finish(ResponseNotice::Dropped {
                            message_id: evicted_id,
                        })
                        .await;
                        EnqueueOutcome::QueuedAfterEviction {
                            position,
                            evicted: evicted_id,
                        }
                    }
                    None => EnqueueOutcome::Queued { position },
                };
                debug!(message_id = %id, %priority, position, "message queued");
                responder
                    .respond(ResponseNotice::Queued {
                        message_id: id,
                        position,
                        estimated_wait_ms: self.estimated_wait(position).as_millis() as u64,
                    })
                    .await;
                outcome
            }
        }
    }

    async fn notify_dropped(&self, messages: Vec<QueuedMessage>, capacity: usize) {
        if messages.is_empty() {
            return;
        }
        warn!(
            dropped = messages.len(),
            capacity, "message queue above capacity, dropped lowest-priority messages"
        );
        for msg in messages {
            AtomicStats::bump(&self.stats.evicted);
            let message_id = msg.id;
            msg.finish(ResponseNotice::Dropped { message_id }).await;
        }
    }

    /// Run one processing pass.
    ///
    /// Only messages present when the pass starts are visited, each at most
    /// once. Expired messages are dropped; failed deliveries are retried on a
    /// later pass from the front of their tier until `max_retries` is
    /// exceeded. Concurrent passes do not overlap: a second caller returns
    /// immediately with `skipped_busy`.
    pub async fn process<F, Fut>(&self, mut deliver: F) -> ProcessReport
    where
        F: FnMut(InboundMessage) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let Ok(_guard) = self.processing.try_lock() else {
            debug!("queue processing already in progress, skipping");
            return ProcessReport {
                skipped_busy: true,
                ..ProcessReport::default()
            };
        };

        let cfg = self.config.load_full();
        let mut report = ProcessReport::default();
        let mut retry: Vec<QueuedMessage> = Vec::new();
        let budget = self.len();

        for _ in 0..budget {
            if self.is_closed() {
                break;
            }
            let Some(mut msg) = self.tiers().pop_next() else {
                break;
            };

            let age = msg.age(Instant::now());
            if age > cfg.max_queue_age() {
                AtomicStats::bump(&self.stats.expired);
                report.expired += 1;
                info!(message_id = %msg.id, age_ms = age.as_millis() as u64, "queued message expired");
                let message_id = msg.id;
                msg.finish(ResponseNotice::Expired {
                    message_id,
                    age_ms: age.as_millis() as u64,
                })
                .await;
                continue;
            }

            let started = Instant::now();
            match deliver(msg.message.clone()).await {
                Ok(reply) => {
                    self.record_processing_time(started.elapsed());
                    AtomicStats::bump(&self.stats.delivered);
                    report.delivered += 1;
                    msg.finish(ResponseNotice::Delivered { reply }).await;
                }
                Err(e) => {
                    AtomicStats::bump(&self.stats.failed_attempts);
                    msg.retry_count = msg.retry_count.saturating_add(1);
                    if msg.retry_count > cfg.max_retries {
                        AtomicStats::bump(&self.stats.retries_exhausted);
                        report.gave_up += 1;
                        info!(
                            message_id = %msg.id,
                            attempts = msg.retry_count,
                            error = %e,
                            "giving up on queued message"
                        );
                        let (message_id, attempts) = (msg.id, msg.retry_count);
                        msg.finish(ResponseNotice::RetriesExhausted {
                            message_id,
                            attempts,
                            last_error: e.to_string(),
                        })
                        .await;
                    } else {
                        debug!(message_id = %msg.id, retry = msg.retry_count, error = %e, "delivery failed, will retry");
                        retry.push(msg);
                    }
                }
            }
        }

        report.requeued = retry.len();
        self.requeue_front(retry).await;
        report
    }

    /// Put failed messages back at the front of their tiers, keeping their
    /// relative order.
    async fn requeue_front(&self, retry: Vec<QueuedMessage>) {
        if retry.is_empty() {
            return;
        }
        let max = self.capacity();
        let (leftover, trimmed) = {
            let mut tiers = self.tiers();
            if self.is_closed() {
                (retry, Vec::new())
            } else {
                for msg in retry.into_iter().rev() {
                    let tier = msg.priority().tier();
                    tiers.0[tier].push_front(msg);
                }
                (Vec::new(), tiers.trim_to(max))
            }
        };
        // Shutdown started while we were delivering.
        self.notify_shutdown(leftover).await;
        self.notify_dropped(trimmed, max).await;
    }

    /// Close the queue and answer every pending message with a shutdown
    /// notice. Returns how many were notified.
    ///
    /// A processing pass already in flight is waited for; it stops before its
    /// next message and hands failed deliveries to the shutdown notice, so
    /// every notice has been sent when this returns.
    pub async fn drain_for_shutdown(&self) -> usize {
        {
            let _tiers = self.tiers();
            self.closed.store(true, Ordering::Release);
        }
        let _pass = self.processing.lock().await;
        let pending = self.tiers().drain_all();
        let n = pending.len();
        if n > 0 {
            info!(pending = n, "draining message queue for shutdown");
        }
        self.notify_shutdown(pending).await;
        n
    }

    async fn notify_shutdown(&self, messages: Vec<QueuedMessage>) {
        for msg in messages {
            AtomicStats::bump(&self.stats.shutdown_notified);
            let message_id = Some(msg.id);
            msg.finish(ResponseNotice::ShuttingDown { message_id }).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.to_stats()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let now = Instant::now();
        let (high, medium, low, oldest) = {
            let tiers = self.tiers();
            let oldest = tiers
                .0
                .iter()
                .flatten()
                .map(|m| m.enqueued_at)
                .min()
                .map(|t| now.saturating_duration_since(t).as_millis() as u64);
            (tiers.0[0].len(), tiers.0[1].len(), tiers.0[2].len(), oldest)
        };
        QueueSnapshot {
            size: high + medium + low,
            capacity: self.capacity(),
            high,
            medium,
            low,
            oldest_age_ms: oldest,
            avg_processing_ms: self.average_processing_time().as_millis() as u64,
            stats: self.stats(),
        }
    }
}
