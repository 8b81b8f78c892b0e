//! Status Aggregator — stamps a claimed job with its terminal status.

use chrono::{DateTime, Utc};

use unveil_core::error::{Result, UnveilError};
use unveil_core::types::{DispatchReport, JobStatus, ScheduledJob};

use crate::persistence::SchedulerDb;

/// How a claimed job's pipeline ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// Dispatch ran to completion, whatever the per-recipient results.
    Dispatched(DispatchReport),
    /// Resolution or materialization failed before any delivery attempt.
    Aborted(UnveilError),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Dispatched(_) => JobStatus::Sent,
            JobOutcome::Aborted(_) => JobStatus::Failed,
        }
    }
}

/// Persist the terminal status, counts and completion time.
///
/// Guarded by the version the job was claimed with; `Ok(None)` means the job
/// changed hands (a sweep took it over) and nothing was written.
pub fn finalize(
    db: &SchedulerDb,
    job: &ScheduledJob,
    outcome: &JobOutcome,
    now: DateTime<Utc>,
) -> Result<Option<JobStatus>> {
    let status = outcome.status();
    let (success, failure, error) = match outcome {
        JobOutcome::Dispatched(report) => (report.success_count, report.failure_count, None),
        JobOutcome::Aborted(err) => (0, 0, Some(err.to_string())),
    };

    let stamped = db.finalize_job(
        &job.id,
        job.version,
        status,
        success,
        failure,
        error.as_deref(),
        now,
    )?;
    Ok(stamped.then_some(status))
}
