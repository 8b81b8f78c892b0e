//! Trait seams: the read-only recipient store and the per-channel transport.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AudienceSpec, ChannelKind, DeviceToken, GuestRecord, OutboundPayload, SendError};

/// Read-only access to guest records and their device tokens.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Candidate guests of `event_id` matching the audience filter.
    ///
    /// Implementations may return the same guest more than once (tag joins);
    /// callers deduplicate.
    async fn list_guests(&self, event_id: &str, filter: &AudienceSpec) -> Result<Vec<GuestRecord>>;

    /// Active device tokens for the given guests.
    async fn list_active_device_tokens(&self, guest_ids: &[String]) -> Result<Vec<DeviceToken>>;
}

/// A single-attempt sender for one channel.
///
/// Provider-specific payload shapes stay behind this boundary; retries,
/// timeouts and rate limiting are layered on top by the channel sender.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> ChannelKind;

    /// Attempt one delivery to `target` (a device token or an E.164 number).
    /// Returns the provider's message id on success.
    async fn deliver(&self, target: &str, payload: &OutboundPayload) -> std::result::Result<Option<String>, SendError>;
}
