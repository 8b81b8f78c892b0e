//! Channel sender — one transport wrapped with rate limiting, a per-attempt
//! timeout and the retry policy.

use std::sync::Arc;
use std::time::Duration;

use unveil_core::traits::Transport;
use unveil_core::types::{ChannelKind, ErrorClass, OutboundPayload, Outcome, SendError, SendErrorKind};

use crate::limiter::ChannelLimiter;
use crate::mask_target;
use crate::retry::RetryPolicy;

/// Sends to one target with retries. Cheap to clone; every target's retry
/// sequence runs in the caller's own future, so one exhausted target never
/// holds up another.
#[derive(Clone)]
pub struct ChannelSender {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    timeout: Duration,
    limiter: Arc<ChannelLimiter>,
}

impl ChannelSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        timeout: Duration,
        limiter: Arc<ChannelLimiter>,
    ) -> Self {
        Self {
            transport,
            policy,
            timeout,
            limiter,
        }
    }

    pub fn channel(&self) -> ChannelKind {
        self.transport.channel()
    }

    /// Deliver `payload` to `target`, retrying Retryable failures per policy.
    pub async fn send(&self, target: &str, payload: &OutboundPayload) -> Outcome {
        let channel = self.channel();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let result = match tokio::time::timeout(self.timeout, self.transport.deliver(target, payload)).await {
                Ok(result) => result,
                Err(_) => Err(SendError::new(
                    SendErrorKind::Timeout,
                    format!("no response within {}ms", self.timeout.as_millis()),
                )),
            };

            let err = match result {
                Ok(provider_id) => {
                    tracing::debug!(
                        "✅ {channel} delivered to {} (attempt {attempt})",
                        mask_target(target)
                    );
                    return Outcome::Delivered { provider_id, attempts: attempt };
                }
                Err(err) => err,
            };

            let class = err.class();
            if class == ErrorClass::Permanent || !self.policy.should_retry(attempt) {
                tracing::warn!(
                    "⚠️ {channel} to {} failed after {attempt} attempt(s) [{class:?}]: {err}",
                    mask_target(target)
                );
                return Outcome::Failed {
                    class,
                    kind: err.kind,
                    reason: err.detail,
                    attempts: attempt,
                };
            }

            let delay = self.policy.delay_after(attempt);
            tracing::debug!(
                "🔁 {channel} to {} attempt {attempt} failed ({err}); retrying in {}ms",
                mask_target(target),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}
