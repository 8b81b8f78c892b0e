//! Job Selector — claims due jobs with a compare-and-swap on their status.

use chrono::{DateTime, Utc};

use unveil_core::error::Result;
use unveil_core::types::ScheduledJob;

use crate::persistence::SchedulerDb;

/// Claim up to `limit` jobs due at `now`.
///
/// Returns only the jobs this call moved to `Sending`. A job another runner
/// claimed between the read and the update is skipped silently.
pub fn claim_due_jobs(db: &SchedulerDb, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
    let candidates = db.due_job_ids(now, limit)?;
    let mut claimed = Vec::with_capacity(candidates.len());

    for id in candidates {
        match db.try_claim(&id, now)? {
            Some(job) => {
                tracing::info!(
                    "📌 Claimed job {} (event {}, audience {})",
                    job.id,
                    job.event_id,
                    job.audience.kind()
                );
                claimed.push(job);
            }
            None => tracing::debug!("Job {id} already claimed elsewhere, skipping"),
        }
    }

    Ok(claimed)
}
