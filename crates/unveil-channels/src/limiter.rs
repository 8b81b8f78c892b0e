//! Per-batch rate limiter for a gateway.
//!
//! Constructed fresh for every batch invocation and handed to the channel
//! senders of that batch; there is no process-wide counter.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token-bucket limiter shared by every send on one channel within a batch.
pub struct ChannelLimiter {
    inner: Option<DirectLimiter>,
    per_second: u32,
}

impl ChannelLimiter {
    /// Allow `per_second` sends per second with an equal burst.
    /// Zero disables limiting.
    pub fn per_second(per_second: u32) -> Self {
        let inner = NonZeroU32::new(per_second).map(|n| RateLimiter::direct(Quota::per_second(n)));
        Self { inner, per_second }
    }

    pub fn unlimited() -> Self {
        Self {
            inner: None,
            per_second: 0,
        }
    }

    /// Wait until one send is permitted.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }

    pub fn rate(&self) -> Option<u32> {
        self.inner.as_ref().map(|_| self.per_second)
    }
}

impl std::fmt::Debug for ChannelLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLimiter")
            .field("per_second", &self.rate())
            .finish()
    }
}
