//! SMS gateway transport — form-encoded POST with basic auth.
//!
//! `POST {endpoint}/Accounts/{sid}/Messages.json` with `To`, `From`, `Body`.
//! Success returns the message `sid`; failures carry a numeric `code`.

use async_trait::async_trait;
use serde::Deserialize;

use unveil_core::config::SmsConfig;
use unveil_core::traits::Transport;
use unveil_core::types::{ChannelKind, OutboundPayload, SendError, SendErrorKind};

use crate::classify::{classify_request_error, classify_status};

pub struct HttpSmsTransport {
    config: SmsConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    sid: Option<String>,
    code: Option<i64>,
    message: Option<String>,
}

impl HttpSmsTransport {
    pub fn new(config: SmsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.endpoint.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl Transport for HttpSmsTransport {
    fn name(&self) -> &str {
        "http-sms"
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn deliver(&self, target: &str, payload: &OutboundPayload) -> Result<Option<String>, SendError> {
        let form = [
            ("To", target),
            ("From", self.config.from_number.as_str()),
            ("Body", payload.body.as_str()),
        ];
        let resp = self
            .client
            .post(self.url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let reply: Option<GatewayReply> = serde_json::from_str(&text).ok();

        if status.is_success() {
            return Ok(reply.and_then(|r| r.sid));
        }

        let (code, message) = reply
            .map(|r| (r.code, r.message.unwrap_or_default()))
            .unwrap_or((None, text.chars().take(200).collect()));
        let kind = match code {
            Some(code) => classify_code(code).unwrap_or_else(|| classify_status(status)),
            None => classify_status(status),
        };
        Err(SendError::new(
            kind,
            format!("SMS gateway error {status} (code {}): {message}", code.unwrap_or_default()),
        ))
    }
}

/// Gateway error codes that override the HTTP status class.
fn classify_code(code: i64) -> Option<SendErrorKind> {
    match code {
        // Not a valid or SMS-capable number.
        21211 | 21614 => Some(SendErrorKind::InvalidAddress),
        // Recipient replied STOP.
        21610 => Some(SendErrorKind::ClientError),
        20429 => Some(SendErrorKind::RateLimited),
        _ => None,
    }
}
