//! Worker loop over the durable job queue.
//!
//! One loop per named queue. Handlers return a [`JobOutcome`] verdict and
//! never crash the loop: store hiccups are logged and retried on the next
//! poll, bad jobs end up parked through the queue's bounded-attempt policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::queue_store::{JobQueue, JobRecord, JobStatus, DEFAULT_LEASE_MS};

/// Verdict a handler returns for one delivery. `Retry` routes through the
/// queue's backoff-and-park policy; `Fatal` parks immediately because
/// redelivery cannot change the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retry(String),
    Fatal(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> JobOutcome;
}

/// Public struct `QueueWorkerOptions` used across Iris components.
#[derive(Debug, Clone)]
pub struct QueueWorkerOptions {
    pub queue_name: String,
    pub poll_interval_ms: u64,
    pub lease_ms: u64,
}

impl QueueWorkerOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            poll_interval_ms: 250,
            lease_ms: DEFAULT_LEASE_MS,
        }
    }
}

/// Runs the claim/handle/resolve loop for one queue until `shutdown` turns
/// true. Idle polls sleep `poll_interval_ms`; expired leases are swept on
/// every pass so a crashed sibling's jobs come back without operator help.
pub async fn run_queue_worker(
    queue: Arc<JobQueue>,
    options: QueueWorkerOptions,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(queue = %options.queue_name, "queue worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(error) = queue.release_expired_leases(&options.queue_name) {
            tracing::warn!(
                queue = %options.queue_name,
                "failed to release expired leases: {error:#}"
            );
        }
        let claimed = match queue.claim_next(&options.queue_name, options.lease_ms) {
            Ok(claimed) => claimed,
            Err(error) => {
                tracing::warn!(queue = %options.queue_name, "failed to claim job: {error:#}");
                None
            }
        };
        match claimed {
            Some(job) => {
                let outcome = handler.handle(&job).await;
                if let Err(error) = resolve_job_outcome(&queue, &job, outcome) {
                    tracing::warn!(job_id = job.id, "failed to record job outcome: {error:#}");
                }
            }
            None => {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(options.poll_interval_ms)) => {}
                }
            }
        }
    }
    tracing::info!(queue = %options.queue_name, "queue worker stopped");
    Ok(())
}

/// Drains `queue_name` in the current task, collapsing redelivery delays so
/// retries run back-to-back. Returns the number of deliveries made. Used by
/// tests and one-shot maintenance runs; the serving path uses
/// [`run_queue_worker`].
pub async fn run_queue_until_idle(
    queue: &JobQueue,
    queue_name: &str,
    handler: &dyn JobHandler,
) -> Result<u64> {
    let mut deliveries = 0_u64;
    loop {
        queue.release_expired_leases(queue_name)?;
        queue.promote_available(queue_name)?;
        let Some(job) = queue.claim_next(queue_name, DEFAULT_LEASE_MS)? else {
            return Ok(deliveries);
        };
        let outcome = handler.handle(&job).await;
        resolve_job_outcome(queue, &job, outcome)?;
        deliveries = deliveries.saturating_add(1);
    }
}

fn resolve_job_outcome(queue: &JobQueue, job: &JobRecord, outcome: JobOutcome) -> Result<()> {
    match outcome {
        JobOutcome::Completed => {
            queue.complete(job.id)?;
        }
        JobOutcome::Retry(error) => {
            let status = queue.fail(job.id, &error)?;
            if status == JobStatus::Parked {
                tracing::warn!(
                    job_id = job.id,
                    queue = %job.queue,
                    "job parked after exhausting attempts: {error}"
                );
            } else {
                tracing::info!(
                    job_id = job.id,
                    queue = %job.queue,
                    attempts = job.attempts,
                    "job failed, redelivery scheduled: {error}"
                );
            }
        }
        JobOutcome::Fatal(error) => {
            tracing::warn!(
                job_id = job.id,
                queue = %job.queue,
                "job parked on permanent failure: {error}"
            );
            queue.park(job.id, &error)?;
        }
    }
    Ok(())
}
