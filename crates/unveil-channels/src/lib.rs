//! # Unveil Channels
//!
//! Channel senders for the dispatch engine.
//!
//! ```text
//! ChannelSender::send(target, payload)
//!   ├── ChannelLimiter  (per-batch rate limit, shared by all recipients)
//!   ├── per-attempt timeout → Retryable(Timeout)
//!   ├── Transport::deliver  (one provider call)
//!   │     ├── HttpPushTransport  (JSON push gateway)
//!   │     ├── HttpSmsTransport   (form-encoded SMS gateway)
//!   │     └── LogTransport       (local runs)
//!   └── RetryPolicy  (Retryable only: 1s, 2s, 5s; Permanent short-circuits)
//! ```

pub mod classify;
pub mod limiter;
pub mod log;
pub mod push;
pub mod retry;
pub mod sender;
pub mod sms;
#[cfg(any(test, feature = "test-util"))]
pub mod stub;

use std::sync::Arc;

use unveil_core::config::{ProviderKind, UnveilConfig};
use unveil_core::traits::Transport;
use unveil_core::types::ChannelKind;

pub use limiter::ChannelLimiter;
pub use retry::RetryPolicy;
pub use sender::ChannelSender;

/// Push and SMS transports built from config.
#[derive(Clone)]
pub struct Transports {
    pub push: Arc<dyn Transport>,
    pub sms: Arc<dyn Transport>,
}

impl Transports {
    pub fn new(push: Arc<dyn Transport>, sms: Arc<dyn Transport>) -> Self {
        Self { push, sms }
    }

    /// Build the configured transports. Called once at startup.
    pub fn from_config(config: &UnveilConfig) -> Self {
        let push: Arc<dyn Transport> = match config.push.provider {
            ProviderKind::Http => Arc::new(push::HttpPushTransport::new(config.push.clone())),
            ProviderKind::Log => Arc::new(log::LogTransport::new(ChannelKind::Push)),
        };
        let sms: Arc<dyn Transport> = match config.sms.provider {
            ProviderKind::Http => Arc::new(sms::HttpSmsTransport::new(config.sms.clone())),
            ProviderKind::Log => Arc::new(log::LogTransport::new(ChannelKind::Sms)),
        };
        tracing::info!(
            "📡 Channel transports ready: push={}, sms={}",
            push.name(),
            sms.name()
        );
        Self { push, sms }
    }
}

/// Mask a device token or phone number for logs, keeping the last 4 chars.
pub fn mask_target(target: &str) -> String {
    let chars: Vec<char> = target.chars().collect();
    if chars.len() <= 4 {
        return "****".into();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_target() {
        assert_eq!(mask_target("+15551234567"), "…4567");
        assert_eq!(mask_target("abc"), "****");
    }

    #[test]
    fn test_from_config_defaults_to_log() {
        let transports = Transports::from_config(&UnveilConfig::default());
        assert_eq!(transports.push.name(), "log-push");
        assert_eq!(transports.sms.name(), "log-sms");
        assert_eq!(transports.push.channel(), ChannelKind::Push);
        assert_eq!(transports.sms.channel(), ChannelKind::Sms);
    }
}
