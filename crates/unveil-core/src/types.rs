//! Domain model — scheduled jobs, messages, the delivery ledger, guests and
//! channel outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::UnveilError;

// ─── Scheduled jobs ──────────────────────────────────────

/// Lifecycle of a scheduled job.
///
/// `Scheduled → Sending → {Sent, Failed}`; `Canceled` only from `Scheduled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Scheduled, JobStatus::Sending)
                | (JobStatus::Scheduled, JobStatus::Canceled)
                | (JobStatus::Sending, JobStatus::Sent)
                | (JobStatus::Sending, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnveilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "sending" => Ok(JobStatus::Sending),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(UnveilError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

/// Which guests a job targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum AudienceSpec {
    /// Every non-removed guest of the event.
    All,
    /// Guests whose RSVP state is in the set.
    ByStatus(BTreeSet<RsvpStatus>),
    /// Guests carrying any of the tags.
    ByTags(BTreeSet<String>),
    /// Exactly these guest ids.
    ByIds(BTreeSet<String>),
}

impl AudienceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            AudienceSpec::All => "all",
            AudienceSpec::ByStatus(_) => "by_status",
            AudienceSpec::ByTags(_) => "by_tags",
            AudienceSpec::ByIds(_) => "by_ids",
        }
    }
}

/// A message authored once and sent at `send_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub event_id: String,
    pub owner_id: String,
    pub audience: AudienceSpec,
    pub template_content: String,
    pub send_at: DateTime<Utc>,
    pub status: JobStatus,
    pub success_count: u32,
    pub failure_count: u32,
    pub created_message_id: Option<String>,
    /// Modification counter, bumped on every status transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Input for creating a job upstream of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub event_id: String,
    pub owner_id: String,
    pub audience: AudienceSpec,
    pub template_content: String,
    pub send_at: DateTime<Utc>,
}

// ─── Messages ──────────────────────────────────────

/// The canonical, immutable message a job (or ad-hoc send) produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub event_id: String,
    /// `None` for an ad-hoc immediate send.
    pub origin_job_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ─── Guests ──────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RsvpStatus {
    Pending,
    Attending,
    Maybe,
    Declined,
}

impl RsvpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpStatus::Pending => "pending",
            RsvpStatus::Attending => "attending",
            RsvpStatus::Maybe => "maybe",
            RsvpStatus::Declined => "declined",
        }
    }
}

impl FromStr for RsvpStatus {
    type Err = UnveilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RsvpStatus::Pending),
            "attending" => Ok(RsvpStatus::Attending),
            "maybe" => Ok(RsvpStatus::Maybe),
            "declined" => Ok(RsvpStatus::Declined),
            other => Err(UnveilError::Storage(format!("unknown rsvp status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuestRole {
    Host,
    Guest,
}

impl GuestRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestRole::Host => "host",
            GuestRole::Guest => "guest",
        }
    }
}

impl FromStr for GuestRole {
    type Err = UnveilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(GuestRole::Host),
            "guest" => Ok(GuestRole::Guest),
            other => Err(UnveilError::Storage(format!("unknown guest role '{other}'"))),
        }
    }
}

/// A guest row as the recipient store returns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuestRecord {
    pub id: String,
    pub event_id: String,
    pub display_name: String,
    pub role: GuestRole,
    pub rsvp_status: RsvpStatus,
    pub tags: Vec<String>,
    /// Opted out of all host messaging.
    pub opted_out: bool,
    /// Opted out of SMS only; push still allowed.
    pub sms_opt_out: bool,
    /// E.164 phone number.
    pub phone_number: Option<String>,
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

impl FromStr for Platform {
    type Err = UnveilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "web" => Ok(Platform::Web),
            other => Err(UnveilError::Storage(format!("unknown platform '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub guest_id: String,
    pub token: String,
    pub platform: Platform,
    pub is_active: bool,
}

/// A resolved, deliverable recipient. Derived per run, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub guest_id: String,
    pub phone_number: Option<String>,
    /// Active tokens, first-seen order, no duplicates.
    pub device_tokens: Vec<DeviceToken>,
    pub sms_opt_out: bool,
}

impl Recipient {
    pub fn has_push(&self) -> bool {
        !self.device_tokens.is_empty()
    }

    pub fn can_sms(&self) -> bool {
        self.phone_number.is_some() && !self.sms_opt_out
    }
}

// ─── Delivery ledger ──────────────────────────────────────

/// Per-channel state of one delivery record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    NotApplicable,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::NotApplicable => "not_applicable",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnveilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "not_applicable" => Ok(DeliveryStatus::NotApplicable),
            other => Err(UnveilError::Storage(format!("unknown delivery status '{other}'"))),
        }
    }
}

/// One row per (message, recipient); writes are upserts on that pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub message_id: String,
    pub recipient_guest_id: String,
    pub push_status: DeliveryStatus,
    pub push_provider_message_id: Option<String>,
    pub push_error: Option<String>,
    pub sms_status: DeliveryStatus,
    pub sms_provider_message_id: Option<String>,
    pub sms_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Fresh record for a recipient about to be attempted.
    pub fn new(message_id: &str, guest_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            recipient_guest_id: guest_id.to_string(),
            push_status: DeliveryStatus::NotApplicable,
            push_provider_message_id: None,
            push_error: None,
            sms_status: DeliveryStatus::NotApplicable,
            sms_provider_message_id: None,
            sms_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reached the recipient on at least one channel.
    pub fn is_delivered(&self) -> bool {
        self.push_status == DeliveryStatus::Sent || self.sms_status == DeliveryStatus::Sent
    }

    /// No channel is still in flight; the record is final for this run.
    pub fn is_settled(&self) -> bool {
        self.push_status != DeliveryStatus::Pending && self.sms_status != DeliveryStatus::Pending
    }
}

/// Aggregate view of a message's ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySummary {
    pub total: u32,
    pub delivered: u32,
    pub push_sent: u32,
    pub sms_sent: u32,
    pub failed: u32,
    pub pending: u32,
}

// ─── Channel outcomes ──────────────────────────────────────

/// Delivery channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Sms,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Push => write!(f, "push"),
            ChannelKind::Sms => write!(f, "sms"),
        }
    }
}

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Server error, timeout, rate-limited.
    Retryable,
    /// Client error other than rate-limit, invalid address.
    Permanent,
}

/// Finer cause of a failed attempt; determines its [`ErrorClass`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    ServerError,
    Timeout,
    RateLimited,
    Network,
    ClientError,
    InvalidAddress,
}

impl SendErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            SendErrorKind::ServerError
            | SendErrorKind::Timeout
            | SendErrorKind::RateLimited
            | SendErrorKind::Network => ErrorClass::Retryable,
            SendErrorKind::ClientError | SendErrorKind::InvalidAddress => ErrorClass::Permanent,
        }
    }
}

/// A single failed attempt as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub detail: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// What a channel sender reports after its retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered {
        provider_id: Option<String>,
        attempts: u32,
    },
    Failed {
        class: ErrorClass,
        kind: SendErrorKind,
        reason: String,
        attempts: u32,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Delivered { .. })
    }

    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Outcome::Delivered { provider_id, .. } => provider_id.as_deref(),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Outcome::Delivered { .. } => None,
            Outcome::Failed { class, .. } => Some(*class),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Delivered { attempts, .. } | Outcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Delivered { .. } => None,
            Outcome::Failed { reason, .. } => Some(reason),
        }
    }
}

/// Provider-neutral content handed to a transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundPayload {
    pub title: String,
    pub body: String,
    /// Opaque key/value data for push (message id, event id).
    pub data: serde_json::Value,
}

// ─── Run reports ──────────────────────────────────────

/// Result of fanning a message out to its recipients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub success_count: u32,
    pub failure_count: u32,
}

impl DispatchReport {
    pub fn attempted(&self) -> u32 {
        self.success_count + self.failure_count
    }
}

/// Totals returned to the timer for one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub jobs_processed: u32,
    pub messages_created: u32,
    pub recipients_attempted: u32,
    pub success_count: u32,
    pub failure_count: u32,
}

impl BatchSummary {
    pub fn absorb(&mut self, other: &BatchSummary) {
        self.jobs_processed += other.jobs_processed;
        self.messages_created += other.messages_created;
        self.recipients_attempted += other.recipients_attempted;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
    }
}
