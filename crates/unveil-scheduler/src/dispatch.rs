//! Delivery Dispatcher — push first, SMS as fallback, one ledger row per
//! recipient.
//!
//! ```text
//! recipient
//!   ├── has tokens? ── push every token concurrently
//!   │                    └── any success ⇒ push=sent, sms=not_applicable ✓
//!   ├── SMS allowed? ── push=failed|not_applicable, sms=sent|failed
//!   └── otherwise     ⇒ failure, nothing further attempted
//! ```
//!
//! Recipient failures never escape: every outcome becomes a ledger write and
//! a success/failure tally.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream;

use unveil_channels::{ChannelSender, mask_target};
use unveil_core::types::{
    DeliveryRecord, DeliveryStatus, DeviceToken, DispatchReport, Message, OutboundPayload, Outcome,
    Recipient, SendErrorKind,
};

use crate::persistence::SchedulerDb;

pub struct Dispatcher {
    db: Arc<SchedulerDb>,
    push: ChannelSender,
    sms: ChannelSender,
    title: String,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        db: Arc<SchedulerDb>,
        push: ChannelSender,
        sms: ChannelSender,
        title: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            push,
            sms,
            title: title.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Deliver `message` to every recipient with bounded concurrency.
    ///
    /// `success_count + failure_count == recipients.len()` always holds.
    pub async fn dispatch(&self, message: &Message, recipients: &[Recipient]) -> DispatchReport {
        let payload = OutboundPayload {
            title: self.title.clone(),
            body: message.content.clone(),
            data: serde_json::json!({
                "messageId": message.id,
                "eventId": message.event_id,
            }),
        };

        // Collected first: a borrowing closure inside the stream makes the
        // batch future non-Send.
        let pending: Vec<_> = recipients
            .iter()
            .map(|recipient| self.deliver(message, &payload, recipient))
            .collect();
        let delivered: Vec<bool> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let success_count = delivered.iter().filter(|ok| **ok).count() as u32;
        let report = DispatchReport {
            success_count,
            failure_count: delivered.len() as u32 - success_count,
        };
        tracing::info!(
            "📬 Message {}: {} delivered, {} failed",
            message.id,
            report.success_count,
            report.failure_count
        );
        report
    }

    /// Run one recipient through push and SMS. Returns whether it was reached.
    async fn deliver(&self, message: &Message, payload: &OutboundPayload, recipient: &Recipient) -> bool {
        let now = Utc::now();
        let mut record = match self.db.get_delivery(&message.id, &recipient.guest_id) {
            Ok(Some(existing)) if existing.is_settled() => {
                // Replay after a crash: this recipient was finished last run.
                tracing::debug!(
                    "Recipient {} already settled for message {}, skipping",
                    recipient.guest_id,
                    message.id
                );
                return existing.is_delivered();
            }
            Ok(Some(existing)) => existing,
            Ok(None) => DeliveryRecord::new(&message.id, &recipient.guest_id, now),
            Err(e) => {
                // Without the ledger row a replay could reach this guest twice.
                tracing::error!(
                    "❌ Ledger read failed for recipient {} of message {}, not sending: {e}",
                    recipient.guest_id,
                    message.id
                );
                return false;
            }
        };

        record.push_status = if recipient.has_push() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::NotApplicable
        };
        record.sms_status = if !recipient.has_push() && recipient.can_sms() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::NotApplicable
        };
        record.push_provider_message_id = None;
        record.push_error = None;
        record.sms_provider_message_id = None;
        record.sms_error = None;
        self.save(&mut record);

        if recipient.has_push() {
            match self.send_push(recipient, payload).await {
                Ok(provider_id) => {
                    record.push_status = DeliveryStatus::Sent;
                    record.push_provider_message_id = provider_id;
                    record.sms_status = DeliveryStatus::NotApplicable;
                    self.save(&mut record);
                    return true;
                }
                Err(reason) => {
                    record.push_status = DeliveryStatus::Failed;
                    record.push_error = Some(reason);
                }
            }
        }

        let phone = match recipient.phone_number.as_deref() {
            Some(phone) if recipient.can_sms() => phone,
            _ => {
                tracing::debug!(
                    "No deliverable channel left for recipient {} (sms opt-out: {})",
                    recipient.guest_id,
                    recipient.sms_opt_out
                );
                record.sms_status = DeliveryStatus::NotApplicable;
                self.save(&mut record);
                return false;
            }
        };

        if recipient.has_push() {
            // push=failed and sms=pending land together
            record.sms_status = DeliveryStatus::Pending;
            self.save(&mut record);
        }

        let outcome = self.sms.send(phone, payload).await;
        let delivered = outcome.is_ok();
        match outcome {
            Outcome::Delivered { provider_id, .. } => {
                record.sms_status = DeliveryStatus::Sent;
                record.sms_provider_message_id = provider_id;
            }
            Outcome::Failed { reason, .. } => {
                record.sms_status = DeliveryStatus::Failed;
                record.sms_error = Some(reason);
            }
        }
        self.save(&mut record);
        delivered
    }

    /// Push to every token at once. `Ok` with the first succeeding token's
    /// provider id, or `Err` with the combined failure reasons.
    async fn send_push(&self, recipient: &Recipient, payload: &OutboundPayload) -> Result<Option<String>, String> {
        let attempts = recipient.device_tokens.iter().map(|token| async move {
            let outcome = self.push.send(&token.token, payload).await;
            (token, outcome)
        });
        let results: Vec<(&DeviceToken, Outcome)> = join_all(attempts).await;

        for (token, outcome) in &results {
            if let Outcome::Failed {
                kind: SendErrorKind::InvalidAddress,
                ..
            } = outcome
            {
                tracing::warn!(
                    "🧹 Dead {} push token {} for guest {}",
                    token.platform.as_str(),
                    mask_target(&token.token),
                    recipient.guest_id
                );
            }
        }

        if let Some((_, winner)) = results.iter().find(|(_, o)| o.is_ok()) {
            return Ok(winner.provider_id().map(str::to_string));
        }

        let reasons: Vec<String> = results
            .iter()
            .map(|(token, o)| format!("{}: {}", mask_target(&token.token), o.reason().unwrap_or("failed")))
            .collect();
        Err(reasons.join("; "))
    }

    fn save(&self, record: &mut DeliveryRecord) {
        record.updated_at = Utc::now();
        if let Err(e) = self.db.upsert_delivery(record) {
            tracing::error!(
                "❌ Ledger write failed for message {} recipient {}: {e}",
                record.message_id,
                record.recipient_guest_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use unveil_channels::stub::{ScriptedTransport, Step};
    use unveil_channels::{ChannelLimiter, RetryPolicy};
    use unveil_core::types::{ChannelKind, Platform};

    struct Harness {
        db: Arc<SchedulerDb>,
        push: Arc<ScriptedTransport>,
        sms: Arc<ScriptedTransport>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let push = Arc::new(ScriptedTransport::new(ChannelKind::Push));
        let sms = Arc::new(ScriptedTransport::new(ChannelKind::Sms));
        let sender = |t: Arc<ScriptedTransport>| {
            ChannelSender::new(
                t,
                RetryPolicy::default(),
                Duration::from_secs(10),
                Arc::new(ChannelLimiter::unlimited()),
            )
        };
        let dispatcher = Dispatcher::new(db.clone(), sender(push.clone()), sender(sms.clone()), "Update", 4);
        Harness { db, push, sms, dispatcher }
    }

    fn message(db: &SchedulerDb) -> Message {
        db.insert_adhoc_message("evt-1", "Dinner moved to 8pm", Utc::now()).unwrap()
    }

    fn recipient(id: &str, tokens: &[&str], phone: Option<&str>) -> Recipient {
        Recipient {
            guest_id: id.into(),
            phone_number: phone.map(str::to_string),
            device_tokens: tokens
                .iter()
                .map(|t| DeviceToken {
                    guest_id: id.into(),
                    token: t.to_string(),
                    platform: Platform::Ios,
                    is_active: true,
                })
                .collect(),
            sms_opt_out: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tokens_falls_back_to_sms() {
        let h = harness();
        let msg = message(&h.db);
        let report = h
            .dispatcher
            .dispatch(&msg, &[recipient("g1", &[], Some("+15550001111"))])
            .await;

        assert_eq!((report.success_count, report.failure_count), (1, 0));
        let rec = h.db.get_delivery(&msg.id, "g1").unwrap().unwrap();
        assert_eq!(rec.push_status, DeliveryStatus::NotApplicable);
        assert_eq!(rec.sms_status, DeliveryStatus::Sent);
        assert!(rec.sms_provider_message_id.is_some());
        assert_eq!(h.push.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_good_token_is_enough() {
        let h = harness();
        h.push.script("tok-stale", vec![Step::Fail(SendErrorKind::InvalidAddress)]);
        h.push.script("tok-live", vec![Step::Ok]);
        let msg = message(&h.db);

        let report = h
            .dispatcher
            .dispatch(&msg, &[recipient("g1", &["tok-stale", "tok-live"], Some("+15550001111"))])
            .await;

        assert_eq!(report.success_count, 1);
        let rec = h.db.get_delivery(&msg.id, "g1").unwrap().unwrap();
        assert_eq!(rec.push_status, DeliveryStatus::Sent);
        assert!(rec.push_provider_message_id.is_some());
        assert_eq!(rec.sms_status, DeliveryStatus::NotApplicable);
        assert_eq!(h.sms.total_calls(), 0);
        assert_eq!(h.push.calls("tok-stale"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tokens_fail_then_sms() {
        let h = harness();
        h.push.set_default(Step::Fail(SendErrorKind::ClientError));
        let msg = message(&h.db);

        let report = h
            .dispatcher
            .dispatch(&msg, &[recipient("g1", &["t1", "t2"], Some("+15550001111"))])
            .await;

        assert_eq!(report.success_count, 1);
        let rec = h.db.get_delivery(&msg.id, "g1").unwrap().unwrap();
        assert_eq!(rec.push_status, DeliveryStatus::Failed);
        assert!(rec.push_error.as_deref().unwrap().contains("ClientError"));
        assert_eq!(rec.sms_status, DeliveryStatus::Sent);
        assert_eq!(h.sms.calls("+15550001111"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_channel_failing_counts_once() {
        let h = harness();
        h.push.set_default(Step::Fail(SendErrorKind::InvalidAddress));
        h.sms.set_default(Step::Fail(SendErrorKind::ServerError));
        let msg = message(&h.db);

        let report = h
            .dispatcher
            .dispatch(&msg, &[recipient("g1", &["t1"], Some("+15550001111"))])
            .await;

        assert_eq!((report.success_count, report.failure_count), (0, 1));
        let rec = h.db.get_delivery(&msg.id, "g1").unwrap().unwrap();
        assert_eq!(rec.push_status, DeliveryStatus::Failed);
        assert_eq!(rec.sms_status, DeliveryStatus::Failed);
        // retryable SMS used its full schedule
        assert_eq!(h.sms.calls("+15550001111"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sms_opt_out_skips_fallback() {
        let h = harness();
        h.push.set_default(Step::Fail(SendErrorKind::ClientError));
        let msg = message(&h.db);
        let mut with_push = recipient("g1", &["t1"], Some("+15550001111"));
        with_push.sms_opt_out = true;
        let mut phone_only = recipient("g2", &[], Some("+15550002222"));
        phone_only.sms_opt_out = true;

        let report = h.dispatcher.dispatch(&msg, &[with_push, phone_only]).await;

        assert_eq!((report.success_count, report.failure_count), (0, 2));
        assert_eq!(h.sms.total_calls(), 0);
        let g2 = h.db.get_delivery(&msg.id, "g2").unwrap().unwrap();
        assert_eq!(g2.push_status, DeliveryStatus::NotApplicable);
        assert_eq!(g2.sms_status, DeliveryStatus::NotApplicable);
        assert!(g2.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sum_invariant_and_one_row_each() {
        let h = harness();
        for dead in ["bad-b", "bad-d", "bad-e"] {
            h.push.script(dead, vec![Step::Fail(SendErrorKind::InvalidAddress)]);
        }
        h.sms.script("+15550000002", vec![Step::Fail(SendErrorKind::ClientError)]);
        let msg = message(&h.db);
        let recipients = vec![
            recipient("a", &["good"], None),
            recipient("b", &["bad-b"], Some("+15550000002")),
            recipient("c", &[], Some("+15550000003")),
            recipient("d", &["bad-d"], None),
            recipient("e", &["good2", "bad-e"], Some("+15550000005")),
        ];

        let report = h.dispatcher.dispatch(&msg, &recipients).await;

        assert_eq!(report.attempted() as usize, recipients.len());
        assert_eq!((report.success_count, report.failure_count), (3, 2));
        assert_eq!(h.db.list_deliveries(&msg.id).unwrap().len(), recipients.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_ledger_does_not_send() {
        let h = harness();
        let msg = message(&h.db);
        h.db.execute_raw("DROP TABLE delivery_records").unwrap();

        let report = h
            .dispatcher
            .dispatch(
                &msg,
                &[
                    recipient("a", &["t-a"], None),
                    recipient("b", &[], Some("+15550000002")),
                ],
            )
            .await;

        assert_eq!((report.success_count, report.failure_count), (0, 2));
        assert_eq!(h.push.total_calls() + h.sms.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_skips_settled_recipients() {
        let h = harness();
        let msg = message(&h.db);
        let recipients = vec![
            recipient("a", &["t-a"], None),
            recipient("b", &[], Some("+15550000002")),
        ];

        let first = h.dispatcher.dispatch(&msg, &recipients).await;
        let second = h.dispatcher.dispatch(&msg, &recipients).await;

        assert_eq!(first, second);
        assert_eq!(h.push.calls("t-a"), 1);
        assert_eq!(h.sms.calls("+15550000002"), 1);
        assert_eq!(h.db.list_deliveries(&msg.id).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_resends_unsettled_recipient() {
        let h = harness();
        let msg = message(&h.db);
        // a crash left sms in flight
        let mut stuck = DeliveryRecord::new(&msg.id, "b", Utc::now());
        stuck.sms_status = DeliveryStatus::Pending;
        h.db.upsert_delivery(&stuck).unwrap();

        let report = h
            .dispatcher
            .dispatch(&msg, &[recipient("b", &[], Some("+15550000002"))])
            .await;

        assert_eq!(report.success_count, 1);
        let rec = h.db.get_delivery(&msg.id, "b").unwrap().unwrap();
        assert_eq!(rec.id, stuck.id);
        assert_eq!(rec.sms_status, DeliveryStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_recipient_list() {
        let h = harness();
        let msg = message(&h.db);
        let report = h.dispatcher.dispatch(&msg, &[]).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_carries_message_content() {
        let h = harness();
        let msg = message(&h.db);
        h.dispatcher
            .dispatch(&msg, &[recipient("a", &["t-a"], None)])
            .await;
        assert_eq!(
            h.push.sent_bodies(),
            vec![("t-a".to_string(), "Dinner moved to 8pm".to_string())]
        );
    }
}
