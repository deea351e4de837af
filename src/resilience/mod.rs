//! 弹性模式模块：熔断器注册表、按用户限流与恢复探测。
//!
//! # Resilience Primitives Module
//!
//! Guards every call to an unreliable external dependency (the generative-language
//! API, the chat-platform gateway) so that a failing dependency is isolated
//! instead of piling up timeouts.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Single-dependency closed / open / half-open state machine |
//! | [`registry`] | Lazily created breaker per dependency name |
//! | [`rate_limiter`] | Per-user token buckets |
//! | [`recovery`] | Periodic probes of open breakers, or a plain move to half-open without one |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: Normal operation, failures are counted
//! - **Open**: Failure threshold reached, calls fail fast with [`crate::CircuitOpenError`]
//! - **Half-Open**: After the reset timeout the next call is let through on probation
//!
//! ```rust
//! use bot_resilience::config::ResilienceConfig;
//! use bot_resilience::events::EventBus;
//! use bot_resilience::resilience::CircuitBreakerRegistry;
//!
//! # async fn demo() -> bot_resilience::Result<()> {
//! let registry = CircuitBreakerRegistry::new(ResilienceConfig::default().into_shared(), EventBus::new());
//! let reply: String = registry
//!     .execute("language-model", || async {
//!         Ok::<_, bot_resilience::Error>("hello".to_string())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod recovery;
pub mod registry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitStateKind,
};
pub use rate_limiter::{RateLimitDecision, UserRateLimiter};
pub use recovery::{ProbeOutcome, ProbeResult, RecoveryProbe, RecoveryRecord, RecoveryScheduler};
pub use registry::{CircuitBreakerRegistry, CircuitStatus};
