//! SQLite-backed persistence for scheduled jobs, messages and the delivery
//! ledger, plus the guest tables the recipient store reads from.
//!
//! All job status transitions are conditional updates: the `WHERE` clause
//! names the state the caller expects, and zero affected rows means someone
//! else moved the job first.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use unveil_core::error::{Result, UnveilError};
use unveil_core::traits::RecipientStore;
use unveil_core::types::{
    AudienceSpec, DeliveryRecord, DeliveryStatus, DeliverySummary, DeviceToken, GuestRecord, JobStatus, Message,
    NewJob, ScheduledJob,
};

/// Max bound parameters per `IN (...)` query.
const IN_CHUNK: usize = 500;

const JOB_COLUMNS: &str = "id, event_id, owner_id, audience, template_content, send_at, status,
     success_count, failure_count, created_message_id, version, created_at, claimed_at,
     completed_at, error_message";

const DELIVERY_COLUMNS: &str = "id, message_id, recipient_guest_id, push_status,
     push_provider_message_id, push_error, sms_status, sms_provider_message_id, sms_error,
     created_at, updated_at";

/// Persistent store for the dispatch engine.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

// ─── Row helpers ──────────────────────────────────────

/// UTC, millisecond precision, `Z` suffix; sorts lexically in time order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

fn get_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn get_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnveilError>,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e: UnveilError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<ScheduledJob> {
    let audience_json: String = row.get(3)?;
    let audience: AudienceSpec = serde_json::from_str(&audience_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        event_id: row.get(1)?,
        owner_id: row.get(2)?,
        audience,
        template_content: row.get(4)?,
        send_at: get_ts(row, 5)?,
        status: get_enum(row, 6)?,
        success_count: row.get(7)?,
        failure_count: row.get(8)?,
        created_message_id: row.get(9)?,
        version: row.get(10)?,
        created_at: get_ts(row, 11)?,
        claimed_at: get_opt_ts(row, 12)?,
        completed_at: get_opt_ts(row, 13)?,
        error_message: row.get(14)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        event_id: row.get(1)?,
        origin_job_id: row.get(2)?,
        content: row.get(3)?,
        created_at: get_ts(row, 4)?,
    })
}

fn row_to_delivery(row: &rusqlite::Row) -> rusqlite::Result<DeliveryRecord> {
    Ok(DeliveryRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        recipient_guest_id: row.get(2)?,
        push_status: get_enum(row, 3)?,
        push_provider_message_id: row.get(4)?,
        push_error: row.get(5)?,
        sms_status: get_enum(row, 6)?,
        sms_provider_message_id: row.get(7)?,
        sms_error: row.get(8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn row_to_guest(row: &rusqlite::Row) -> rusqlite::Result<GuestRecord> {
    let tags_json: String = row.get(9)?;
    Ok(GuestRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        display_name: row.get(2)?,
        role: get_enum(row, 3)?,
        rsvp_status: get_enum(row, 4)?,
        opted_out: row.get::<_, i32>(5)? != 0,
        sms_opt_out: row.get::<_, i32>(6)? != 0,
        phone_number: row.get(7)?,
        removed_at: get_opt_ts(row, 8)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn storage(context: &'static str) -> impl Fn(rusqlite::Error) -> UnveilError {
    move |e| UnveilError::Storage(format!("{context}: {e}"))
}

fn placeholders(n: usize, offset: usize) -> String {
    (0..n)
        .map(|i| format!("?{}", i + offset + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SchedulerDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage("DB open"))?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(storage("DB pragma"))?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage("DB open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| UnveilError::Storage(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                audience TEXT NOT NULL,              -- JSON AudienceSpec
                template_content TEXT NOT NULL,
                send_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                created_message_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                claimed_at TEXT,
                completed_at TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(status, send_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                origin_job_id TEXT,                  -- NULL for ad-hoc sends
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_origin
                ON messages(origin_job_id) WHERE origin_job_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS delivery_records (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                recipient_guest_id TEXT NOT NULL,
                push_status TEXT NOT NULL DEFAULT 'not_applicable',
                push_provider_message_id TEXT,
                push_error TEXT,
                sms_status TEXT NOT NULL DEFAULT 'not_applicable',
                sms_provider_message_id TEXT,
                sms_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(message_id, recipient_guest_id)
            );

            -- Recipient store (read-only to the engine)
            CREATE TABLE IF NOT EXISTS guests (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'guest',  -- 'host', 'guest'
                rsvp_status TEXT NOT NULL DEFAULT 'pending',
                opted_out INTEGER NOT NULL DEFAULT 0,
                sms_opt_out INTEGER NOT NULL DEFAULT 0,
                phone_number TEXT,
                removed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_guests_event ON guests(event_id);

            CREATE TABLE IF NOT EXISTS guest_tags (
                guest_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (guest_id, tag)
            );

            CREATE TABLE IF NOT EXISTS device_tokens (
                guest_id TEXT NOT NULL,
                token TEXT NOT NULL,
                platform TEXT NOT NULL,              -- 'ios', 'android', 'web'
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (guest_id, token)
            );
            ",
        )
        .map_err(storage("Migration"))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).map_err(storage("Raw SQL"))
    }

    // ─── Scheduled jobs ──────────────────────────────────────

    fn load_job(conn: &Connection, id: &str) -> Result<ScheduledJob> {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()
        .map_err(storage("Load job"))?
        .ok_or_else(|| UnveilError::NotFound(format!("job {id}")))
    }

    /// Insert a new job in `Scheduled`.
    pub fn create_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<ScheduledJob> {
        let id = uuid::Uuid::new_v4().to_string();
        let audience = serde_json::to_string(&new.audience)
            .map_err(|e| UnveilError::Storage(format!("Encode audience: {e}")))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduled_jobs
             (id, event_id, owner_id, audience, template_content, send_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7)",
            params![
                id,
                new.event_id,
                new.owner_id,
                audience,
                new.template_content,
                ts(&new.send_at),
                ts(&now),
            ],
        )
        .map_err(storage("Create job"))?;
        Self::load_job(&conn, &id)
    }

    pub fn get_job(&self, id: &str) -> Result<ScheduledJob> {
        let conn = self.conn()?;
        Self::load_job(&conn, id)
    }

    /// All jobs, optionally filtered by status, ordered by send time.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                 WHERE (?1 IS NULL OR status = ?1) ORDER BY send_at, id"
            ))
            .map_err(storage("List jobs"))?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], row_to_job)
            .map_err(storage("List jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage("List jobs"))
    }

    /// Ids of `Scheduled` jobs whose send time has passed, oldest first.
    pub fn due_job_ids(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM scheduled_jobs
                 WHERE status = 'scheduled' AND send_at <= ?1
                 ORDER BY send_at, id LIMIT ?2",
            )
            .map_err(storage("Due jobs"))?;
        let rows = stmt
            .query_map(params![ts(&now), limit as i64], |r| r.get(0))
            .map_err(storage("Due jobs"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(storage("Due jobs"))
    }

    /// `Scheduled → Sending` for one job. `None` when another runner won.
    pub fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<ScheduledJob>> {
        let conn = self.conn()?;
        let now_s = ts(&now);
        let changed = conn
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'sending', claimed_at = ?1, version = version + 1
                 WHERE id = ?2 AND status = 'scheduled' AND send_at <= ?1",
                params![now_s, id],
            )
            .map_err(storage("Claim job"))?;
        if changed == 0 {
            return Ok(None);
        }
        Self::load_job(&conn, id).map(Some)
    }

    /// `Sending` jobs claimed at or before `cutoff`.
    pub fn stale_sending_jobs(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                 WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at <= ?1)
                 ORDER BY claimed_at, id LIMIT ?2"
            ))
            .map_err(storage("Stale jobs"))?;
        let rows = stmt
            .query_map(params![ts(&cutoff), limit as i64], row_to_job)
            .map_err(storage("Stale jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage("Stale jobs"))
    }

    /// Take over a stale `Sending` job, keyed on the claim stamp it was seen with.
    pub fn try_reclaim(
        &self,
        id: &str,
        seen_claimed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_jobs
                 SET claimed_at = ?1, version = version + 1
                 WHERE id = ?2 AND status = 'sending' AND claimed_at IS ?3",
                params![ts(&now), id, seen_claimed_at.map(|t| ts(&t))],
            )
            .map_err(storage("Reclaim job"))?;
        if changed == 0 {
            return Ok(None);
        }
        Self::load_job(&conn, id).map(Some)
    }

    /// `Sending → Sent | Failed`, guarded by the version the caller claimed.
    /// Returns `false` when the job moved on without us.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_job(
        &self,
        id: &str,
        expected_version: i64,
        status: JobStatus,
        success_count: u32,
        failure_count: u32,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !JobStatus::Sending.can_transition_to(status) {
            return Err(UnveilError::InvalidState(format!(
                "cannot finalize job {id} as {status}"
            )));
        }
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_jobs
                 SET status = ?1, success_count = ?2, failure_count = ?3, error_message = ?4,
                     completed_at = ?5, version = version + 1
                 WHERE id = ?6 AND status = 'sending' AND version = ?7",
                params![
                    status.as_str(),
                    success_count,
                    failure_count,
                    error_message,
                    ts(&now),
                    id,
                    expected_version,
                ],
            )
            .map_err(storage("Finalize job"))?;
        Ok(changed > 0)
    }

    /// `Scheduled → Canceled`. Any other state is rejected.
    pub fn cancel_job(&self, id: &str, now: DateTime<Utc>) -> Result<ScheduledJob> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'canceled', completed_at = ?1, version = version + 1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![ts(&now), id],
            )
            .map_err(storage("Cancel job"))?;
        let job = Self::load_job(&conn, id)?;
        if changed == 0 {
            return Err(UnveilError::InvalidState(format!(
                "job {id} is {} and can no longer be canceled",
                job.status
            )));
        }
        Ok(job)
    }

    /// Move a job's send time. Only allowed while it is still `Scheduled`.
    pub fn reschedule_job(&self, id: &str, send_at: DateTime<Utc>) -> Result<ScheduledJob> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_jobs SET send_at = ?1, version = version + 1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![ts(&send_at), id],
            )
            .map_err(storage("Reschedule job"))?;
        let job = Self::load_job(&conn, id)?;
        if changed == 0 {
            return Err(UnveilError::InvalidState(format!(
                "job {id} is {}; send time is fixed",
                job.status
            )));
        }
        Ok(job)
    }

    // ─── Messages ──────────────────────────────────────

    fn load_message(conn: &Connection, id: &str) -> Result<Message> {
        conn.query_row(
            "SELECT id, event_id, origin_job_id, content, created_at FROM messages WHERE id = ?1",
            [id],
            row_to_message,
        )
        .optional()
        .map_err(storage("Load message"))?
        .ok_or_else(|| UnveilError::NotFound(format!("message {id}")))
    }

    pub fn get_message(&self, id: &str) -> Result<Message> {
        let conn = self.conn()?;
        Self::load_message(&conn, id)
    }

    /// The job's message, creating and linking it on first call.
    ///
    /// Runs in one transaction: the job row is re-read so a message linked by
    /// an earlier (crashed) run is reused. Returns `(message, created)`.
    pub fn materialize_message(&self, job_id: &str, now: DateTime<Utc>) -> Result<(Message, bool)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin materialize"))?;

        let (event_id, content, existing): (String, String, Option<String>) = tx
            .query_row(
                "SELECT event_id, template_content, created_message_id
                 FROM scheduled_jobs WHERE id = ?1",
                [job_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(storage("Materialize"))?
            .ok_or_else(|| UnveilError::NotFound(format!("job {job_id}")))?;

        if let Some(message_id) = existing {
            let message = Self::load_message(&tx, &message_id)?;
            tx.commit().map_err(storage("Commit materialize"))?;
            return Ok((message, false));
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            event_id,
            origin_job_id: Some(job_id.to_string()),
            content,
            created_at: now,
        };
        tx.execute(
            "INSERT INTO messages (id, event_id, origin_job_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.event_id,
                message.origin_job_id,
                message.content,
                ts(&message.created_at),
            ],
        )
        .map_err(storage("Insert message"))?;
        tx.execute(
            "UPDATE scheduled_jobs SET created_message_id = ?1
             WHERE id = ?2 AND created_message_id IS NULL",
            params![message.id, job_id],
        )
        .map_err(storage("Link message"))?;
        tx.commit().map_err(storage("Commit materialize"))?;
        Ok((message, true))
    }

    /// Standalone message with no originating job.
    pub fn insert_adhoc_message(&self, event_id: &str, content: &str, now: DateTime<Utc>) -> Result<Message> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            origin_job_id: None,
            content: content.to_string(),
            created_at: now,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (id, event_id, origin_job_id, content, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4)",
            params![message.id, message.event_id, message.content, ts(&message.created_at)],
        )
        .map_err(storage("Insert message"))?;
        Ok(message)
    }

    pub fn count_messages_for_job(&self, job_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE origin_job_id = ?1",
            [job_id],
            |r| r.get(0),
        )
        .map_err(storage("Count messages"))
    }

    // ─── Delivery ledger ──────────────────────────────────────

    /// Insert or update the record for `(message_id, recipient_guest_id)`.
    /// The original row id and `created_at` survive updates.
    pub fn upsert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO delivery_records ({DELIVERY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(message_id, recipient_guest_id) DO UPDATE SET
                    push_status = excluded.push_status,
                    push_provider_message_id = excluded.push_provider_message_id,
                    push_error = excluded.push_error,
                    sms_status = excluded.sms_status,
                    sms_provider_message_id = excluded.sms_provider_message_id,
                    sms_error = excluded.sms_error,
                    updated_at = excluded.updated_at"
            ),
            params![
                record.id,
                record.message_id,
                record.recipient_guest_id,
                record.push_status.as_str(),
                record.push_provider_message_id,
                record.push_error,
                record.sms_status.as_str(),
                record.sms_provider_message_id,
                record.sms_error,
                ts(&record.created_at),
                ts(&record.updated_at),
            ],
        )
        .map_err(storage("Upsert delivery"))?;
        Ok(())
    }

    pub fn get_delivery(&self, message_id: &str, guest_id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {DELIVERY_COLUMNS} FROM delivery_records
                 WHERE message_id = ?1 AND recipient_guest_id = ?2"
            ),
            [message_id, guest_id],
            row_to_delivery,
        )
        .optional()
        .map_err(storage("Get delivery"))
    }

    pub fn list_deliveries(&self, message_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM delivery_records
                 WHERE message_id = ?1 ORDER BY created_at, recipient_guest_id"
            ))
            .map_err(storage("List deliveries"))?;
        let rows = stmt
            .query_map([message_id], row_to_delivery)
            .map_err(storage("List deliveries"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage("List deliveries"))
    }

    pub fn delivery_summary(&self, message_id: &str) -> Result<DeliverySummary> {
        let records = self.list_deliveries(message_id)?;
        let mut summary = DeliverySummary::default();
        for r in &records {
            summary.total += 1;
            if r.is_delivered() {
                summary.delivered += 1;
            } else if r.is_settled() {
                summary.failed += 1;
            } else {
                summary.pending += 1;
            }
            if r.push_status == DeliveryStatus::Sent {
                summary.push_sent += 1;
            }
            if r.sms_status == DeliveryStatus::Sent {
                summary.sms_sent += 1;
            }
        }
        Ok(summary)
    }

    // ─── Guests & device tokens ──────────────────────────────────────

    /// Insert or replace a guest and its tag set.
    pub fn upsert_guest(&self, guest: &GuestRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin guest"))?;
        tx.execute(
            "INSERT INTO guests
             (id, event_id, display_name, role, rsvp_status, opted_out, sms_opt_out, phone_number, removed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                event_id = excluded.event_id,
                display_name = excluded.display_name,
                role = excluded.role,
                rsvp_status = excluded.rsvp_status,
                opted_out = excluded.opted_out,
                sms_opt_out = excluded.sms_opt_out,
                phone_number = excluded.phone_number,
                removed_at = excluded.removed_at",
            params![
                guest.id,
                guest.event_id,
                guest.display_name,
                guest.role.as_str(),
                guest.rsvp_status.as_str(),
                guest.opted_out as i32,
                guest.sms_opt_out as i32,
                guest.phone_number,
                guest.removed_at.map(|t| ts(&t)),
            ],
        )
        .map_err(storage("Upsert guest"))?;
        tx.execute("DELETE FROM guest_tags WHERE guest_id = ?1", [&guest.id])
            .map_err(storage("Clear tags"))?;
        for tag in &guest.tags {
            tx.execute(
                "INSERT OR IGNORE INTO guest_tags (guest_id, tag) VALUES (?1, ?2)",
                params![guest.id, tag],
            )
            .map_err(storage("Insert tag"))?;
        }
        tx.commit().map_err(storage("Commit guest"))?;
        Ok(())
    }

    pub fn upsert_device_token(&self, token: &DeviceToken) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO device_tokens (guest_id, token, platform, is_active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(guest_id, token) DO UPDATE SET
                platform = excluded.platform, is_active = excluded.is_active",
            params![
                token.guest_id,
                token.token,
                token.platform.as_str(),
                token.is_active as i32
            ],
        )
        .map_err(storage("Upsert device token"))?;
        Ok(())
    }

    /// Non-removed guests of `event_id` matching the filter's kind.
    ///
    /// Tag queries join through `guest_tags` and can return a guest once per
    /// matching tag. Id and tag lists are queried in chunks of `IN_CHUNK`.
    pub fn query_guests(&self, event_id: &str, filter: &AudienceSpec) -> Result<Vec<GuestRecord>> {
        let (join, column, values): (&str, &str, Vec<String>) = match filter {
            AudienceSpec::All => ("", "", Vec::new()),
            AudienceSpec::ByStatus(statuses) => (
                "",
                "g.rsvp_status",
                statuses.iter().map(|s| s.as_str().to_string()).collect(),
            ),
            AudienceSpec::ByTags(tags) => (
                "JOIN guest_tags t ON t.guest_id = g.id",
                "t.tag",
                tags.iter().cloned().collect(),
            ),
            AudienceSpec::ByIds(ids) => ("", "g.id", ids.iter().cloned().collect()),
        };
        let base = format!(
            "SELECT g.id, g.event_id, g.display_name, g.role, g.rsvp_status, g.opted_out,
                g.sms_opt_out, g.phone_number, g.removed_at,
                (SELECT json_group_array(t2.tag) FROM guest_tags t2 WHERE t2.guest_id = g.id)
             FROM guests g {join}
             WHERE g.event_id = ?1 AND g.removed_at IS NULL"
        );

        let conn = self.conn()?;
        if matches!(filter, AudienceSpec::All) {
            return Self::fetch_guests(&conn, &format!("{base} ORDER BY g.rowid"), event_id, &[]);
        }

        let mut guests = Vec::new();
        for chunk in values.chunks(IN_CHUNK) {
            let sql = format!(
                "{base} AND {column} IN ({}) ORDER BY g.rowid",
                placeholders(chunk.len(), 1)
            );
            guests.extend(Self::fetch_guests(&conn, &sql, event_id, chunk)?);
        }
        Ok(guests)
    }

    fn fetch_guests(
        conn: &Connection,
        sql: &str,
        event_id: &str,
        values: &[String],
    ) -> Result<Vec<GuestRecord>> {
        let mut stmt = conn.prepare(sql).map_err(storage("Query guests"))?;
        let args = std::iter::once(event_id).chain(values.iter().map(String::as_str));
        let rows = stmt
            .query_map(params_from_iter(args), row_to_guest)
            .map_err(storage("Query guests"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage("Query guests"))
    }

    /// Active tokens for the guests, in insertion order.
    pub fn query_active_tokens(&self, guest_ids: &[String]) -> Result<Vec<DeviceToken>> {
        let conn = self.conn()?;
        let mut tokens = Vec::new();
        for chunk in guest_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT guest_id, token, platform, is_active FROM device_tokens
                 WHERE is_active = 1 AND guest_id IN ({}) ORDER BY rowid",
                placeholders(chunk.len(), 0)
            );
            let mut stmt = conn.prepare(&sql).map_err(storage("Query tokens"))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(DeviceToken {
                        guest_id: row.get(0)?,
                        token: row.get(1)?,
                        platform: get_enum(row, 2)?,
                        is_active: row.get::<_, i32>(3)? != 0,
                    })
                })
                .map_err(storage("Query tokens"))?;
            for token in rows {
                tokens.push(token.map_err(storage("Query tokens"))?);
            }
        }
        Ok(tokens)
    }
}

#[async_trait]
impl RecipientStore for SchedulerDb {
    async fn list_guests(&self, event_id: &str, filter: &AudienceSpec) -> Result<Vec<GuestRecord>> {
        self.query_guests(event_id, filter)
    }

    async fn list_active_device_tokens(&self, guest_ids: &[String]) -> Result<Vec<DeviceToken>> {
        self.query_active_tokens(guest_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use unveil_core::types::{GuestRole, Platform, RsvpStatus};

    fn temp_db() -> SchedulerDb {
        SchedulerDb::open_in_memory().unwrap()
    }

    fn new_job(send_at: DateTime<Utc>) -> NewJob {
        NewJob {
            event_id: "evt-1".into(),
            owner_id: "host-1".into(),
            audience: AudienceSpec::All,
            template_content: "See you at 7!".into(),
            send_at,
        }
    }

    fn guest(id: &str, rsvp: RsvpStatus, tags: &[&str]) -> GuestRecord {
        GuestRecord {
            id: id.into(),
            event_id: "evt-1".into(),
            display_name: id.to_uppercase(),
            role: GuestRole::Guest,
            rsvp_status: rsvp,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            opted_out: false,
            sms_opt_out: false,
            phone_number: Some(format!("+1555000{id}")),
            removed_at: None,
        }
    }

    #[test]
    fn test_timestamp_format() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T18:30:00.123456+02:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ts(&t), "2026-03-01T16:30:00.123Z");
    }

    #[test]
    fn test_create_and_get_job() {
        let db = temp_db();
        let now = Utc::now();
        let job = db.create_job(&new_job(now), now).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.version, 0);
        assert!(job.created_message_id.is_none());

        let loaded = db.get_job(&job.id).unwrap();
        assert_eq!(loaded.audience, AudienceSpec::All);
        assert_eq!(loaded.template_content, "See you at 7!");
        assert!(matches!(db.get_job("missing"), Err(UnveilError::NotFound(_))));
    }

    #[test]
    fn test_due_and_claim() {
        let db = temp_db();
        let now = Utc::now();
        let due = db.create_job(&new_job(now - Duration::minutes(5)), now).unwrap();
        let future = db.create_job(&new_job(now + Duration::hours(1)), now).unwrap();

        let ids = db.due_job_ids(now, 10).unwrap();
        assert_eq!(ids, vec![due.id.clone()]);

        let claimed = db.try_claim(&due.id, now).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Sending);
        assert_eq!(claimed.version, 1);
        assert!(claimed.claimed_at.is_some());

        // second claim loses
        assert!(db.try_claim(&due.id, now).unwrap().is_none());
        // not yet due
        assert!(db.try_claim(&future.id, now).unwrap().is_none());
    }

    #[test]
    fn test_finalize_requires_current_version() {
        let db = temp_db();
        let now = Utc::now();
        let job = db.create_job(&new_job(now), now).unwrap();
        let claimed = db.try_claim(&job.id, now).unwrap().unwrap();

        assert!(!db
            .finalize_job(&job.id, claimed.version - 1, JobStatus::Sent, 1, 0, None, now)
            .unwrap());
        assert!(db
            .finalize_job(&job.id, claimed.version, JobStatus::Sent, 3, 1, None, now)
            .unwrap());

        let done = db.get_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Sent);
        assert_eq!((done.success_count, done.failure_count), (3, 1));
        assert!(done.completed_at.is_some());

        // terminal: cannot finalize again
        assert!(!db
            .finalize_job(&job.id, done.version, JobStatus::Failed, 0, 0, None, now)
            .unwrap());
        assert!(db
            .finalize_job(&job.id, done.version, JobStatus::Canceled, 0, 0, None, now)
            .is_err());
    }

    #[test]
    fn test_cancel_only_from_scheduled() {
        let db = temp_db();
        let now = Utc::now();
        let a = db.create_job(&new_job(now), now).unwrap();
        let b = db.create_job(&new_job(now), now).unwrap();

        let canceled = db.cancel_job(&a.id, now).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(db.try_claim(&a.id, now).unwrap().is_none());

        db.try_claim(&b.id, now).unwrap().unwrap();
        assert!(matches!(db.cancel_job(&b.id, now), Err(UnveilError::InvalidState(_))));
        assert!(matches!(db.cancel_job("nope", now), Err(UnveilError::NotFound(_))));
    }

    #[test]
    fn test_reschedule_only_while_scheduled() {
        let db = temp_db();
        let now = Utc::now();
        let job = db.create_job(&new_job(now + Duration::hours(1)), now).unwrap();
        let later = now + Duration::hours(2);
        let moved = db.reschedule_job(&job.id, later).unwrap();
        assert_eq!(ts(&moved.send_at), ts(&later));

        let soon = db.reschedule_job(&job.id, now).unwrap();
        db.try_claim(&soon.id, now).unwrap().unwrap();
        assert!(matches!(
            db.reschedule_job(&job.id, later),
            Err(UnveilError::InvalidState(_))
        ));
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let db = temp_db();
        let now = Utc::now();
        let job = db.create_job(&new_job(now), now).unwrap();

        let (first, created) = db.materialize_message(&job.id, now).unwrap();
        assert!(created);
        let (second, created_again) = db.materialize_message(&job.id, now).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(db.count_messages_for_job(&job.id).unwrap(), 1);
        assert_eq!(
            db.get_job(&job.id).unwrap().created_message_id,
            Some(first.id.clone())
        );
        assert_eq!(first.origin_job_id.as_deref(), Some(job.id.as_str()));
    }

    #[test]
    fn test_delivery_upsert_keeps_one_row() {
        let db = temp_db();
        let now = Utc::now();
        let mut rec = DeliveryRecord::new("m1", "g1", now);
        rec.push_status = DeliveryStatus::Pending;
        db.upsert_delivery(&rec).unwrap();

        let mut replay = DeliveryRecord::new("m1", "g1", now + Duration::seconds(5));
        replay.push_status = DeliveryStatus::Sent;
        replay.push_provider_message_id = Some("p-1".into());
        db.upsert_delivery(&replay).unwrap();

        let rows = db.list_deliveries("m1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, rec.id);
        assert_eq!(rows[0].push_status, DeliveryStatus::Sent);
        assert_eq!(rows[0].push_provider_message_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn test_delivery_summary() {
        let db = temp_db();
        let now = Utc::now();
        let mut a = DeliveryRecord::new("m1", "a", now);
        a.push_status = DeliveryStatus::Sent;
        let mut b = DeliveryRecord::new("m1", "b", now);
        b.push_status = DeliveryStatus::Failed;
        b.sms_status = DeliveryStatus::Sent;
        let mut c = DeliveryRecord::new("m1", "c", now);
        c.sms_status = DeliveryStatus::Failed;
        let mut d = DeliveryRecord::new("m1", "d", now);
        d.sms_status = DeliveryStatus::Pending;
        for r in [&a, &b, &c, &d] {
            db.upsert_delivery(r).unwrap();
        }

        let s = db.delivery_summary("m1").unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.delivered, 2);
        assert_eq!(s.push_sent, 1);
        assert_eq!(s.sms_sent, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.pending, 1);
    }

    #[test]
    fn test_query_guests_by_kind() {
        let db = temp_db();
        db.upsert_guest(&guest("1", RsvpStatus::Pending, &["vip", "family"])).unwrap();
        db.upsert_guest(&guest("2", RsvpStatus::Attending, &["family"])).unwrap();
        let mut removed = guest("3", RsvpStatus::Pending, &["vip"]);
        removed.removed_at = Some(Utc::now());
        db.upsert_guest(&removed).unwrap();
        let mut other_event = guest("4", RsvpStatus::Pending, &[]);
        other_event.event_id = "evt-2".into();
        db.upsert_guest(&other_event).unwrap();

        let all = db.query_guests("evt-1", &AudienceSpec::All).unwrap();
        assert_eq!(all.len(), 2);

        let pending = db
            .query_guests("evt-1", &AudienceSpec::ByStatus([RsvpStatus::Pending].into()))
            .unwrap();
        assert_eq!(pending.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(), vec!["1"]);

        // join can repeat a guest once per matching tag
        let tagged = db
            .query_guests(
                "evt-1",
                &AudienceSpec::ByTags(["vip".to_string(), "family".to_string()].into()),
            )
            .unwrap();
        assert_eq!(tagged.iter().filter(|g| g.id == "1").count(), 2);
        assert_eq!(tagged.iter().filter(|g| g.id == "2").count(), 1);
        let mut tags = tagged[0].tags.clone();
        tags.sort();
        assert_eq!(tags, vec!["family", "vip"]);

        let by_ids = db
            .query_guests("evt-1", &AudienceSpec::ByIds(["2".to_string(), "3".to_string()].into()))
            .unwrap();
        assert_eq!(by_ids.len(), 1);

        let empty = db
            .query_guests("evt-1", &AudienceSpec::ByTags(Default::default()))
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_query_guests_large_id_list() {
        let db = temp_db();
        for id in ["a-first", "m-middle", "z-last"] {
            db.upsert_guest(&guest(id, RsvpStatus::Attending, &[])).unwrap();
        }
        // more ids than SQLite allows as bound variables in one statement
        let mut ids: std::collections::BTreeSet<String> =
            (0..33_000).map(|i| format!("n-{i:05}")).collect();
        ids.extend(["a-first", "m-middle", "z-last"].map(String::from));

        let found = db.query_guests("evt-1", &AudienceSpec::ByIds(ids)).unwrap();
        let mut found: Vec<_> = found.into_iter().map(|g| g.id).collect();
        found.sort();
        assert_eq!(found, vec!["a-first", "m-middle", "z-last"]);
    }

    #[test]
    fn test_active_tokens_only() {
        let db = temp_db();
        for (token, active) in [("t1", true), ("t2", false), ("t3", true)] {
            db.upsert_device_token(&DeviceToken {
                guest_id: "g1".into(),
                token: token.into(),
                platform: Platform::Ios,
                is_active: active,
            })
            .unwrap();
        }
        let tokens = db.query_active_tokens(&["g1".to_string(), "g2".to_string()]).unwrap();
        assert_eq!(
            tokens.iter().map(|t| t.token.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t3"]
        );
        assert!(db.query_active_tokens(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_stale_and_reclaim() {
        let db = temp_db();
        let t0 = Utc::now() - Duration::hours(1);
        let job = db.create_job(&new_job(t0), t0).unwrap();
        let claimed = db.try_claim(&job.id, t0).unwrap().unwrap();

        let now = Utc::now();
        let stale = db.stale_sending_jobs(now - Duration::minutes(15), 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert!(db.stale_sending_jobs(t0 - Duration::minutes(1), 10).unwrap().is_empty());

        let taken = db.try_reclaim(&job.id, claimed.claimed_at, now).unwrap().unwrap();
        assert_eq!(taken.status, JobStatus::Sending);
        assert_eq!(taken.version, claimed.version + 1);
        // the stamp moved, so a second sweeper holding the old one loses
        assert!(db.try_reclaim(&job.id, claimed.claimed_at, now).unwrap().is_none());
        // and the original runner can no longer finalize
        assert!(!db
            .finalize_job(&job.id, claimed.version, JobStatus::Sent, 0, 0, None, now)
            .unwrap());
    }
}
