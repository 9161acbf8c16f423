//! Durable job queue for the Iris pipeline.
//!
//! SQLite-backed, at-least-once. Claims take a lease; expired leases are
//! requeued; failures retry with exponential backoff and bounded attempts;
//! exhausted jobs park in a dead-letter state that operators can inspect
//! and retry. Handlers must tolerate redelivery.

pub mod queue_runtime;
pub mod queue_store;

pub use queue_runtime::{
    run_queue_until_idle, run_queue_worker, JobHandler, JobOutcome, QueueWorkerOptions,
};
pub use queue_store::{
    parse_job_status, retry_delay_ms, JobQueue, JobRecord, JobStatus, QueueCounts,
    BASE_RETRY_DELAY_MS, DEFAULT_LEASE_MS, DEFAULT_MAX_ATTEMPTS,
};
