//! Push gateway transport — JSON POST with a bearer key.
//!
//! Request: `{ "to", "title", "body", "data", "sound" }`.
//! Response: `{ "data": { "status": "ok", "id": "…" } }` or a ticket with
//! `status: "error"` and `details.error` naming the cause.

use async_trait::async_trait;
use serde_json::Value;

use unveil_core::config::PushConfig;
use unveil_core::traits::Transport;
use unveil_core::types::{ChannelKind, OutboundPayload, SendError, SendErrorKind};

use crate::classify::{classify_request_error, error_from_response};

/// Ticket error codes that mean the token is dead.
const DEAD_TOKEN_ERRORS: &[&str] = &["DeviceNotRegistered", "InvalidCredentials"];

pub struct HttpPushTransport {
    config: PushConfig,
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(config: PushConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }
}

#[async_trait]
impl Transport for HttpPushTransport {
    fn name(&self) -> &str {
        "http-push"
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(&self, target: &str, payload: &OutboundPayload) -> Result<Option<String>, SendError> {
        let mut req = self.client.post(&self.config.endpoint).json(&serde_json::json!({
            "to": target,
            "title": payload.title,
            "body": payload.body,
            "data": payload.data,
            "sound": "default",
        }));
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let resp = req.send().await.map_err(|e| classify_request_error(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_response("Push gateway", status, &body));
        }

        let text = resp.text().await.unwrap_or_default();
        parse_accepted(&text)
    }
}

/// Interpret the body of a 2xx reply. The gateway has already taken the
/// send, so an unreadable body is a delivery without a provider id.
pub fn parse_accepted(text: &str) -> Result<Option<String>, SendError> {
    match serde_json::from_str::<Value>(text) {
        Ok(body) => parse_ticket(&body),
        Err(e) => {
            tracing::debug!("Unreadable push ticket, treating as accepted: {e}");
            Ok(None)
        }
    }
}

/// Interpret a push ticket returned with a 2xx status.
pub fn parse_ticket(body: &Value) -> Result<Option<String>, SendError> {
    let ticket = match body.get("data") {
        // Batch endpoints answer with an array; we always send one.
        Some(Value::Array(items)) => match items.first() {
            Some(first) => first,
            None => return Ok(None),
        },
        Some(data) => data,
        None => body,
    };

    if ticket.get("status").and_then(Value::as_str) == Some("error") {
        let code = ticket
            .pointer("/details/error")
            .and_then(Value::as_str)
            .unwrap_or("");
        let message = ticket
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("push ticket error");
        let kind = if DEAD_TOKEN_ERRORS.contains(&code) {
            SendErrorKind::InvalidAddress
        } else if code == "MessageRateExceeded" {
            SendErrorKind::RateLimited
        } else {
            SendErrorKind::ClientError
        };
        return Err(SendError::new(kind, format!("{code}: {message}")));
    }

    Ok(ticket
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string))
}
