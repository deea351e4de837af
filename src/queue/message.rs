//! Queued message and the notices delivered back to its sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn tier(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// What the caller handed to `handle_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub server_id: String,
    pub payload: String,
    pub priority: Priority,
}

impl InboundMessage {
    pub fn new(
        user_id: impl Into<String>,
        server_id: impl Into<String>,
        payload: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            server_id: server_id.into(),
            payload: payload.into(),
            priority,
        }
    }
}

/// Everything a sender can be told about its message.
///
/// `Queued` is an acknowledgement; every other variant is terminal and is sent
/// at most once per message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseNotice {
    Queued {
        message_id: Uuid,
        position: usize,
        estimated_wait_ms: u64,
    },
    Delivered {
        reply: String,
    },
    Fallback {
        text: String,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    /// Evicted to make room for a higher-priority message.
    Dropped {
        message_id: Uuid,
    },
    /// Queue full, never stored.
    Rejected,
    Expired {
        message_id: Uuid,
        age_ms: u64,
    },
    RetriesExhausted {
        message_id: Uuid,
        attempts: u32,
        last_error: String,
    },
    ShuttingDown {
        message_id: Option<Uuid>,
    },
}

fn secs_rounded_up(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

impl ResponseNotice {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseNotice::Queued { .. })
    }

    /// User-facing text.
    pub fn text(&self) -> String {
        match self {
            ResponseNotice::Queued {
                position,
                estimated_wait_ms,
                ..
            } => format!(
                "Your message has been queued (position {}). Estimated wait: ~{}s.",
                position,
                secs_rounded_up(*estimated_wait_ms)
            ),
            ResponseNotice::Delivered { reply } => reply.clone(),
            ResponseNotice::Fallback { text } => text.clone(),
            ResponseNotice::RateLimited { retry_after_ms } => format!(
                "You're sending messages too quickly. Please wait {}s and try again.",
                secs_rounded_up(*retry_after_ms)
            ),
            ResponseNotice::Dropped { .. } => "The system is overloaded and your message was dropped \
                 to make room for higher-priority requests. Please try again later."
                .to_string(),
            ResponseNotice::Rejected => "The system is overloaded and cannot accept your message \
                 right now. Please try again later."
                .to_string(),
            ResponseNotice::Expired { age_ms, .. } => format!(
                "Your message expired after waiting {}s in the queue. Please try again.",
                age_ms / 1000
            ),
            ResponseNotice::RetriesExhausted { attempts, .. } => format!(
                "Your message could not be processed after {} attempts. Please try again later.",
                attempts
            ),
            ResponseNotice::ShuttingDown { .. } => "The system is shutting down and your message \
                 could not be processed. Please try again shortly."
                .to_string(),
        }
    }
}

impl std::fmt::Display for ResponseNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text())
    }
}

/// Continuation back to whoever sent a message.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, notice: ResponseNotice);
}

#[async_trait]
impl Responder for mpsc::UnboundedSender<ResponseNotice> {
    async fn respond(&self, notice: ResponseNotice) {
        if self.send(notice).is_err() {
            debug!("responder channel closed, notice discarded");
        }
    }
}

/// Adapter for plain closures.
pub struct FnResponder<F>(pub F);

#[async_trait]
impl<F> Responder for FnResponder<F>
where
    F: Fn(ResponseNotice) + Send + Sync,
{
    async fn respond(&self, notice: ResponseNotice) {
        (self.0)(notice)
    }
}

/// A message waiting in the priority queue.
///
/// The terminal notice is sent through [`QueuedMessage::finish`], which
/// consumes the message, so a message cannot be answered twice.
pub struct QueuedMessage {
    pub id: Uuid,
    pub message: InboundMessage,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    responder: Arc<dyn Responder>,
}

impl QueuedMessage {
    pub fn new(message: InboundMessage, responder: Arc<dyn Responder>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            enqueued_at: Instant::now(),
            retry_count: 0,
            responder,
        }
    }

    pub fn priority(&self) -> Priority {
        self.message.priority
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub(crate) fn responder(&self) -> Arc<dyn Responder> {
        self.responder.clone()
    }

    pub(crate) async fn finish(self, notice: ResponseNotice) {
        debug_assert!(notice.is_terminal());
        self.responder.respond(notice).await;
    }
}

impl std::fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("id", &self.id)
            .field("user_id", &self.message.user_id)
            .field("server_id", &self.message.server_id)
            .field("priority", &self.message.priority)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
