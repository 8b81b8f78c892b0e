//! Log-only transport for local runs. Every delivery succeeds.

use async_trait::async_trait;

use unveil_core::traits::Transport;
use unveil_core::types::{ChannelKind, OutboundPayload, SendError};

use crate::mask_target;

pub struct LogTransport {
    channel: ChannelKind,
    name: String,
}

impl LogTransport {
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            name: format!("log-{channel}"),
        }
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> ChannelKind {
        self.channel
    }

    async fn deliver(&self, target: &str, payload: &OutboundPayload) -> Result<Option<String>, SendError> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "📨 [{}] {} ← {:?} ({id})",
            self.name,
            mask_target(target),
            payload.body.chars().take(60).collect::<String>()
        );
        Ok(Some(id))
    }
}
