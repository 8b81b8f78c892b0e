//! Dispatch Engine — one short-lived batch per timer invocation.
//!
//! Claims due jobs, runs each through resolve → materialize → dispatch →
//! finalize with small job-level concurrency, and returns the batch totals.
//! Rate limiters are built fresh for every batch and shared by its senders.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;

use unveil_channels::{ChannelLimiter, ChannelSender, RetryPolicy, Transports};
use unveil_core::config::UnveilConfig;
use unveil_core::error::{Result, UnveilError};
use unveil_core::traits::RecipientStore;
use unveil_core::types::{AudienceSpec, BatchSummary, Message, ScheduledJob};

use crate::aggregate::{self, JobOutcome};
use crate::dispatch::Dispatcher;
use crate::materialize::materialize;
use crate::persistence::SchedulerDb;
use crate::reconcile;
use crate::resolver::RecipientResolver;
use crate::selector;

/// Result of an ad-hoc immediate send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateSend {
    pub message: Message,
    pub summary: BatchSummary,
}

pub struct DispatchEngine {
    db: Arc<SchedulerDb>,
    store: Arc<dyn RecipientStore>,
    transports: Transports,
    config: UnveilConfig,
}

impl DispatchEngine {
    pub fn new(
        db: Arc<SchedulerDb>,
        store: Arc<dyn RecipientStore>,
        transports: Transports,
        config: UnveilConfig,
    ) -> Self {
        Self {
            db,
            store,
            transports,
            config,
        }
    }

    /// Open the configured database (which also serves as the recipient
    /// store) and build the configured transports.
    pub fn from_config(config: UnveilConfig) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(SchedulerDb::open(&config.database_path())?);
        let transports = Transports::from_config(&config);
        Ok(Self::new(db.clone(), db, transports, config))
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn config(&self) -> &UnveilConfig {
        &self.config
    }

    /// Senders and limiters for one batch.
    fn dispatcher(&self) -> Dispatcher {
        let policy = RetryPolicy::from_config(&self.config.retry);
        let push = ChannelSender::new(
            self.transports.push.clone(),
            policy.clone(),
            self.config.push.timeout(),
            Arc::new(ChannelLimiter::per_second(self.config.push.rate_per_second)),
        );
        let sms = ChannelSender::new(
            self.transports.sms.clone(),
            policy,
            self.config.sms.timeout(),
            Arc::new(ChannelLimiter::per_second(self.config.sms.rate_per_second)),
        );
        Dispatcher::new(
            self.db.clone(),
            push,
            sms,
            self.config.push.title.clone(),
            self.config.batch.recipient_concurrency,
        )
    }

    /// One timer invocation: optional stale sweep, then claim and process
    /// every due job.
    ///
    /// Errors only when the job store itself cannot be read; per-job
    /// failures are stamped on the job and never abort the batch.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<BatchSummary> {
        let dispatcher = self.dispatcher();
        let mut summary = BatchSummary::default();

        if self.config.batch.sweep_on_run {
            let resumed = self.resume_stale(&dispatcher, now).await?;
            summary.absorb(&resumed);
        }

        let jobs = selector::claim_due_jobs(&self.db, now, self.config.batch.claim_limit)?;
        if jobs.is_empty() && summary.jobs_processed == 0 {
            tracing::debug!("No due jobs at {now}");
            return Ok(summary);
        }

        let processed = self.process_all(jobs, &dispatcher).await;
        summary.absorb(&processed);

        tracing::info!(
            "✅ Batch done: {} job(s), {} message(s), {} recipient(s) → {} ok / {} failed",
            summary.jobs_processed,
            summary.messages_created,
            summary.recipients_attempted,
            summary.success_count,
            summary.failure_count
        );
        Ok(summary)
    }

    /// Only the reconciliation sweep.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<BatchSummary> {
        let dispatcher = self.dispatcher();
        self.resume_stale(&dispatcher, now).await
    }

    async fn resume_stale(&self, dispatcher: &Dispatcher, now: DateTime<Utc>) -> Result<BatchSummary> {
        let jobs = reconcile::reclaim_stale(
            &self.db,
            now,
            self.config.batch.stale_after(),
            self.config.batch.claim_limit,
        )?;
        Ok(self.process_all(jobs, dispatcher).await)
    }

    async fn process_all(&self, jobs: Vec<ScheduledJob>, dispatcher: &Dispatcher) -> BatchSummary {
        let pending: Vec<_> = jobs
            .into_iter()
            .map(|job| self.process_job(job, dispatcher))
            .collect();
        let results: Vec<BatchSummary> = stream::iter(pending)
            .buffer_unordered(self.config.batch.job_concurrency.max(1))
            .collect()
            .await;

        let mut total = BatchSummary::default();
        for r in &results {
            total.absorb(r);
        }
        total
    }

    /// Run one claimed job to a terminal status.
    async fn process_job(&self, job: ScheduledJob, dispatcher: &Dispatcher) -> BatchSummary {
        let mut summary = BatchSummary {
            jobs_processed: 1,
            ..Default::default()
        };

        let resolver = RecipientResolver::new(self.store.clone());
        let prepared = async {
            let recipients = resolver.resolve(&job.audience, &job.event_id).await?;
            let (message, created) = materialize(&self.db, &job, Utc::now())?;
            Ok::<_, UnveilError>((recipients, message, created))
        }
        .await;

        let outcome = match prepared {
            Ok((recipients, message, created)) => {
                summary.messages_created = u32::from(created);
                let report = dispatcher.dispatch(&message, &recipients).await;
                summary.recipients_attempted = report.attempted();
                summary.success_count = report.success_count;
                summary.failure_count = report.failure_count;
                JobOutcome::Dispatched(report)
            }
            Err(e) => {
                tracing::error!("❌ Job {} failed before delivery: {e}", job.id);
                JobOutcome::Aborted(e)
            }
        };

        match aggregate::finalize(&self.db, &job, &outcome, Utc::now()) {
            Ok(Some(status)) => tracing::info!(
                "🏁 Job {} → {status} ({} ok / {} failed)",
                job.id,
                summary.success_count,
                summary.failure_count
            ),
            Ok(None) => tracing::warn!(
                "⚠️ Job {} changed hands before it could be finalized",
                job.id
            ),
            Err(e) => tracing::error!("❌ Failed to finalize job {}: {e}", job.id),
        }
        summary
    }

    /// Resolve and deliver a message right now, without a scheduled job.
    pub async fn send_immediate(
        &self,
        event_id: &str,
        content: &str,
        audience: &AudienceSpec,
    ) -> Result<ImmediateSend> {
        if content.trim().is_empty() {
            return Err(UnveilError::InvalidState("message content is empty".into()));
        }
        let recipients = RecipientResolver::new(self.store.clone())
            .resolve(audience, event_id)
            .await?;
        let message = self
            .db
            .insert_adhoc_message(event_id, content, Utc::now())
            .map_err(|e| UnveilError::Materialization(e.to_string()))?;
        tracing::info!(
            "⚡ Immediate send {} to {} recipient(s) of event {event_id}",
            message.id,
            recipients.len()
        );

        let report = self.dispatcher().dispatch(&message, &recipients).await;
        Ok(ImmediateSend {
            message,
            summary: BatchSummary {
                jobs_processed: 0,
                messages_created: 1,
                recipients_attempted: report.attempted(),
                success_count: report.success_count,
                failure_count: report.failure_count,
            },
        })
    }

    /// Cancel a job that has not started sending.
    pub fn cancel_job(&self, id: &str) -> Result<ScheduledJob> {
        let job = self.db.cancel_job(id, Utc::now())?;
        tracing::info!("🛑 Job {id} canceled");
        Ok(job)
    }
}
