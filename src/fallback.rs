//! User-facing placeholder replies for degraded operation.

use crate::degradation::{DegradationVerdict, Severity};
use tracing::debug;

/// What the responder needs to know about the current state.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub verdict: DegradationVerdict,
    pub maintenance: bool,
    pub queue_size: usize,
}

impl FallbackContext {
    pub fn new(verdict: DegradationVerdict) -> Self {
        Self {
            verdict,
            maintenance: false,
            queue_size: 0,
        }
    }

    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
}

/// Builds fallback text. Infallible and never returns an empty string.
#[derive(Debug, Clone, Default)]
pub struct FallbackResponder;

impl FallbackResponder {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_fallback_response(
        &self,
        input: &str,
        user_id: &str,
        server_id: &str,
        ctx: &FallbackContext,
    ) -> String {
        debug!(
            user_id,
            server_id,
            input_len = input.len(),
            maintenance = ctx.maintenance,
            reason = %ctx.verdict.reason,
            "generating fallback response"
        );

        let mut parts: Vec<String> = Vec::with_capacity(3);
        if ctx.maintenance {
            parts.push(
                "The bot is currently under maintenance and can't answer right now. \
                 Please check back soon."
                    .to_string(),
            );
        } else {
            parts.push(
                "I'm experiencing technical difficulties and can't give you a full answer \
                 right now."
                    .to_string(),
            );
            if ctx.verdict.should_degrade && ctx.verdict.severity >= Severity::Medium {
                parts.push(format!("Reason: {}.", ctx.verdict.reason));
            }
        }
        if ctx.queue_size > 0 {
            parts.push(format!(
                "There {} {} message{} waiting to be processed.",
                if ctx.queue_size == 1 { "is" } else { "are" },
                ctx.queue_size,
                if ctx.queue_size == 1 { "" } else { "s" },
            ));
        }
        parts.push("Please try again in a few minutes.".to_string());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(ctx: &FallbackContext) -> String {
        FallbackResponder::new().generate_fallback_response("hello?", "u1", "s1", ctx)
    }

    #[test]
    fn test_generic_framing_without_reason_when_low() {
        let text = respond(&FallbackContext::new(DegradationVerdict::operational()));
        assert!(text.contains("experiencing technical difficulties"));
        assert!(!text.contains("Reason"));
        assert!(!text.contains("waiting"));
    }

    #[test]
    fn test_reason_and_queue_size() {
        let ctx = FallbackContext::new(DegradationVerdict::degraded(
            "Circuit breaker open for gateway",
            Severity::Medium,
        ))
        .with_queue_size(7);
        let text = respond(&ctx);
        assert!(text.contains("Reason: Circuit breaker open for gateway."));
        assert!(text.contains("7 messages waiting"));
    }

    #[test]
    fn test_maintenance_framing() {
        let ctx = FallbackContext::new(DegradationVerdict::operational()).with_maintenance(true);
        let text = respond(&ctx);
        assert!(text.contains("under maintenance"));
        assert!(!text.contains("technical difficulties"));
    }
}
