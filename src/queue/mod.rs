//! 消息队列模块：在依赖不可用时暂存入站消息，按优先级延后投递。
//!
//! # Message Queue Module
//!
//! Holds inbound work that cannot be processed right now and delivers it later,
//! high priority first. Every message that enters the queue is answered exactly
//! once with a terminal [`ResponseNotice`]: delivered, dropped, rejected,
//! expired, retries exhausted, or shutting down.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`message`] | Message envelope, notices and the [`Responder`] continuation |
//! | [`priority_queue`] | Bounded tiered queue with eviction, expiry and retry |

pub mod message;
pub mod priority_queue;

pub use message::{
    FnResponder, InboundMessage, Priority, QueuedMessage, Responder, ResponseNotice,
};
pub use priority_queue::{
    EnqueueOutcome, PriorityMessageQueue, ProcessReport, QueueSnapshot, QueueStats,
};
