//! Inbound message handling on top of the resilience primitives.
//!
//! [`ResilienceManager`] is the one object the bot talks to: it decides per
//! message whether to process now, queue, or answer with a fallback, and owns
//! the background loops. Implementation is split into submodules under
//! `src/manager/`.

pub mod builder;
pub mod core;
pub mod diagnostics;
mod tasks;

pub use builder::ResilienceManagerBuilder;
pub use core::{FnProcessor, HandleOutcome, MessageProcessor, QueueCycle, ResilienceManager};
pub use diagnostics::Diagnostics;
