//! Reconciliation sweep for jobs stuck in `Sending`.
//!
//! A runner that dies after claiming leaves its jobs in `Sending`, which the
//! normal claim never looks at. Once a job's claim is older than the grace
//! window it is re-claimed here and run through the pipeline again; replay
//! reuses the job's message and skips recipients already settled in the
//! ledger.

use chrono::{DateTime, Duration, Utc};

use unveil_core::error::Result;
use unveil_core::types::ScheduledJob;

use crate::persistence::SchedulerDb;

/// Take over up to `limit` jobs claimed longer than `grace` ago.
pub fn reclaim_stale(
    db: &SchedulerDb,
    now: DateTime<Utc>,
    grace: Duration,
    limit: usize,
) -> Result<Vec<ScheduledJob>> {
    let stale = db.stale_sending_jobs(now - grace, limit)?;
    let mut reclaimed = Vec::with_capacity(stale.len());

    for job in stale {
        match db.try_reclaim(&job.id, job.claimed_at, now)? {
            Some(taken) => {
                tracing::warn!(
                    "♻️ Resuming stale job {} (claimed at {}, message {})",
                    taken.id,
                    job.claimed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                    taken.created_message_id.as_deref().unwrap_or("not yet created")
                );
                reclaimed.push(taken);
            }
            None => tracing::debug!("Stale job {} taken by another sweeper", job.id),
        }
    }

    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unveil_core::types::{AudienceSpec, JobStatus, NewJob};

    fn claimed_at(db: &SchedulerDb, at: DateTime<Utc>) -> ScheduledJob {
        let job = db
            .create_job(
                &NewJob {
                    event_id: "evt-1".into(),
                    owner_id: "host-1".into(),
                    audience: AudienceSpec::All,
                    template_content: "hi".into(),
                    send_at: at,
                },
                at,
            )
            .unwrap();
        db.try_claim(&job.id, at).unwrap().unwrap()
    }

    #[test]
    fn test_only_past_grace_window() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        let old = claimed_at(&db, now - Duration::minutes(30));
        let fresh = claimed_at(&db, now - Duration::minutes(2));

        let taken = reclaim_stale(&db, now, Duration::minutes(15), 10).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, old.id);
        assert_eq!(taken[0].status, JobStatus::Sending);
        assert!(taken[0].version > old.version);

        // freshly reclaimed job is not stale any more
        assert!(reclaim_stale(&db, now, Duration::minutes(15), 10).unwrap().is_empty());
        assert_eq!(db.get_job(&fresh.id).unwrap().version, fresh.version);
    }

    #[test]
    fn test_terminal_jobs_ignored() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        let job = claimed_at(&db, now - Duration::hours(2));
        db.finalize_job(&job.id, job.version, JobStatus::Sent, 1, 0, None, now)
            .unwrap();

        assert!(reclaim_stale(&db, now, Duration::minutes(15), 10).unwrap().is_empty());
    }
}
