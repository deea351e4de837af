//! # bot-resilience
//!
//! 为基于生成式语言 API 的聊天机器人提供优雅降级能力：熔断、健康降级判定与优先级消息队列。
//!
//! Graceful degradation runtime for a chat bot that sits on top of a
//! third-party generative-language API.
//!
//! ## Overview
//!
//! When an upstream dependency (the language model, the chat-platform gateway)
//! starts failing, or the process itself is under pressure, the bot keeps
//! answering with reduced functionality instead of hanging users:
//!
//! - every unreliable call runs under a per-dependency **circuit breaker**
//! - a **degradation controller** turns circuit states, a health snapshot and
//!   queue occupancy into a verdict with a reason and severity
//! - messages that cannot be handled now wait in a bounded **priority queue**
//!   and are delivered, expired, or given up on later
//! - a **recovery scheduler** probes open circuits in the background
//! - users get a **fallback** reply describing what is going on
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bot_resilience::{FnProcessor, InboundMessage, Priority, ResilienceManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bot_resilience::Result<()> {
//!     let manager = ResilienceManager::builder()
//!         .processor(Arc::new(FnProcessor(|m: InboundMessage| async move {
//!             Ok::<_, bot_resilience::Error>(format!("you said: {}", m.payload))
//!         })))
//!         .build()?;
//!     manager.initialize().await?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     manager
//!         .handle_message("user-1", "server-1", "hello", Arc::new(tx), Priority::Medium)
//!         .await;
//!     println!("{}", rx.recv().await.unwrap());
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Thresholds, defaults, env / YAML loading, hot reload |
//! | [`resilience`] | Circuit breakers, per-user rate limiting, recovery probes |
//! | [`health`] | Health snapshots from an external reporter |
//! | [`degradation`] | Verdict and mode evaluation, maintenance override |
//! | [`queue`] | Bounded priority queue and sender notices |
//! | [`fallback`] | User-facing degraded replies |
//! | [`manager`] | Inbound message handling and background loops |
//! | [`events`] | Broadcast of state changes |

pub mod config;
pub mod degradation;
pub mod events;
pub mod fallback;
pub mod health;
pub mod manager;
pub mod queue;
pub mod resilience;

/// Error type for the library
pub mod error;
pub use error::{CircuitOpenError, Error, ErrorContext};

// Re-export main types for convenience
pub use config::{ResilienceConfig, SharedConfig};
pub use degradation::{DegradationController, DegradationMode, DegradationVerdict, Severity};
pub use events::{EventBus, ResilienceEvent};
pub use fallback::{FallbackContext, FallbackResponder};
pub use health::{HealthReporter, HealthSampler, HealthSnapshot, StaticHealthReporter};
pub use manager::{
    Diagnostics, FnProcessor, HandleOutcome, MessageProcessor, QueueCycle, ResilienceManager,
    ResilienceManagerBuilder,
};
pub use queue::{InboundMessage, Priority, PriorityMessageQueue, Responder, ResponseNotice};
pub use resilience::{CircuitBreakerRegistry, CircuitStateKind, RecoveryProbe};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
