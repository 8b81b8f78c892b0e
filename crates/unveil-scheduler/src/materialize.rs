//! Message Materializer — one canonical message per job.

use chrono::{DateTime, Utc};

use unveil_core::error::{Result, UnveilError};
use unveil_core::types::{Message, ScheduledJob};

use crate::persistence::SchedulerDb;

/// Create (or reuse) the message for a claimed job.
///
/// Safe to call again after a crash: the job's `created_message_id` is
/// re-checked inside the same transaction that would create the row.
/// Returns `(message, created)`.
pub fn materialize(db: &SchedulerDb, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(Message, bool)> {
    let (message, created) = db.materialize_message(&job.id, now).map_err(|e| match e {
        UnveilError::NotFound(what) => UnveilError::Materialization(format!("{what} vanished")),
        other => UnveilError::Materialization(format!("job {}: {other}", job.id)),
    })?;

    if created {
        tracing::info!("📝 Message {} created for job {}", message.id, job.id);
    } else {
        tracing::info!("♻️ Reusing message {} for job {}", message.id, job.id);
    }
    Ok((message, created))
}
