//! Background loops.
//!
//! Each loop holds only a weak reference to the manager, re-reads its period
//! from the shared config every round, and logs (never propagates) a panic in
//! its body.

use super::core::{Inner, QueueCycle, ResilienceManager};
use crate::config::ResilienceConfig;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Rate-limit buckets untouched for this long are forgotten.
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(600);

pub(crate) fn spawn_all(
    inner: &Arc<Inner>,
    cancel: CancellationToken,
) -> Vec<(&'static str, JoinHandle<()>)> {
    vec![
        (
            "queue",
            spawn_loop(
                "queue",
                inner,
                cancel.clone(),
                ResilienceConfig::queue_process_interval,
                |m| async move {
                    if let QueueCycle::Skipped { reason } = m.process_queue().await {
                        trace!(%reason, "queue cycle skipped");
                    }
                },
            ),
        ),
        (
            "recovery",
            spawn_loop(
                "recovery",
                inner,
                cancel.clone(),
                ResilienceConfig::recovery_interval,
                |m| async move {
                    let probed = m.trigger_recovery(None).await;
                    let pruned = m.inner.rate_limiter.prune_idle(RATE_LIMIT_IDLE);
                    if !probed.is_empty() || pruned > 0 {
                        debug!(probed = probed.len(), pruned, "recovery round finished");
                    }
                },
            ),
        ),
        (
            "health",
            spawn_loop(
                "health",
                inner,
                cancel,
                ResilienceConfig::health_check_interval,
                |m| async move {
                    m.inner.controller.refresh_mode().await;
                },
            ),
        ),
    ]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    inner: &Arc<Inner>,
    cancel: CancellationToken,
    period: fn(&ResilienceConfig) -> Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(ResilienceManager) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let wait = match weak.upgrade() {
                Some(inner) => period(&inner.config.load()),
                None => break,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let round = tick(ResilienceManager { inner });
            if AssertUnwindSafe(round).catch_unwind().await.is_err() {
                error!(task = name, "background task panicked, continuing");
            }
        }
        debug!(task = name, "background task stopped");
    })
}
