//! Durable job records over SQLite.
//!
//! Delivery is at-least-once: a claim flips a job to ACTIVE under an
//! IMMEDIATE transaction and stamps a lease deadline. Workers that die keep
//! their lease until it expires, after which the job is requeued (or parked
//! when its attempt budget is spent). Completion is a status flip, never a
//! delete, so the jobs table doubles as an audit trail.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_LEASE_MS: u64 = 60_000;

/// Enumerates supported `JobStatus` values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Parked,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Parked => "parked",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub fn parse_job_status(raw: &str) -> Result<JobStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "queued" => Ok(JobStatus::Queued),
        "active" => Ok(JobStatus::Active),
        "completed" => Ok(JobStatus::Completed),
        "parked" => Ok(JobStatus::Parked),
        other => bail!("unsupported job status: {other}"),
    }
}

/// Public struct `JobRecord` used across Iris components.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub kind: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at_unix_ms: i64,
    pub lease_deadline_unix_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// Public struct `QueueCounts` used across Iris components.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub parked: u64,
}

/// Exponential backoff with bounded jitter in [50%, 100%] of the step.
/// The jitter mixes (job id, attempt) so every redelivery of the same job
/// computes the same schedule.
pub fn retry_delay_ms(job_id: i64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(6);
    let base = BASE_RETRY_DELAY_MS.saturating_mul(1_u64 << shift);
    if base <= 1 {
        return base;
    }
    let low = base / 2;
    let width = base.saturating_sub(low);
    let mixed = (job_id as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(u64::from(attempt))
        .rotate_left(17)
        ^ 0xA24B_AED4_963E_E407;
    let jitter = if width == 0 {
        0
    } else {
        mixed % width.saturating_add(1)
    };
    low.saturating_add(jitter)
}

/// Public struct `JobQueue` used across Iris components.
pub struct JobQueue {
    db_path: PathBuf,
}

impl JobQueue {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create queue directory {}", parent.display())
                })?;
            }
        }
        let connection = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open job queue {}", self.db_path.display()))?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        initialize_jobs_schema(&connection)?;
        Ok(connection)
    }

    pub fn enqueue(&self, queue: &str, kind: &str, payload: &Value) -> Result<JobRecord> {
        self.enqueue_at(queue, kind, payload, now_unix_ms())
    }

    /// Enqueues a job that becomes claimable at `available_at_unix_ms`.
    /// Used for delayed redelivery (retry backoff, campaign batch pacing).
    pub fn enqueue_at(
        &self,
        queue: &str,
        kind: &str,
        payload: &Value,
        available_at_unix_ms: i64,
    ) -> Result<JobRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let payload_text = serde_json::to_string(payload)?;
        connection
            .execute(
                "INSERT INTO jobs (queue, kind, payload, status, attempts, max_attempts, \
                 available_at_unix_ms, created_at_unix_ms, updated_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)",
                params![
                    queue,
                    kind,
                    payload_text,
                    JobStatus::Queued.as_str(),
                    DEFAULT_MAX_ATTEMPTS,
                    available_at_unix_ms,
                    now
                ],
            )
            .context("failed to enqueue job")?;
        Ok(JobRecord {
            id: connection.last_insert_rowid(),
            queue: queue.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at_unix_ms,
            lease_deadline_unix_ms: None,
            last_error: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        })
    }

    /// Claims the oldest claimable job on `queue`, flipping it QUEUED →
    /// ACTIVE with a lease deadline `lease_ms` from now. The flip runs in an
    /// IMMEDIATE transaction so two workers can never claim the same job.
    pub fn claim_next(&self, queue: &str, lease_ms: u64) -> Result<Option<JobRecord>> {
        let mut connection = self.open_connection()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin claim transaction")?;
        let now = now_unix_ms();
        let candidate: Option<i64> = transaction
            .query_row(
                "SELECT id FROM jobs WHERE queue = ?1 AND status = ?2 \
                 AND available_at_unix_ms <= ?3 \
                 ORDER BY available_at_unix_ms, id LIMIT 1",
                params![queue, JobStatus::Queued.as_str(), now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };
        transaction.execute(
            "UPDATE jobs SET status = ?2, attempts = attempts + 1, \
             lease_deadline_unix_ms = ?3, updated_at_unix_ms = ?4 WHERE id = ?1",
            params![
                job_id,
                JobStatus::Active.as_str(),
                now.saturating_add(lease_ms as i64),
                now
            ],
        )?;
        let record = transaction.query_row(
            JOB_SELECT_BY_ID,
            params![job_id],
            job_from_row,
        )?;
        transaction.commit()?;
        Ok(Some(record))
    }

    /// Marks an active job done. A job whose lease already expired may have
    /// been requeued and claimed elsewhere; the completion is then skipped,
    /// which is the at-least-once trade.
    pub fn complete(&self, job_id: i64) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE jobs SET status = ?2, lease_deadline_unix_ms = NULL, \
             updated_at_unix_ms = ?3 WHERE id = ?1 AND status = ?4",
            params![
                job_id,
                JobStatus::Completed.as_str(),
                now_unix_ms(),
                JobStatus::Active.as_str()
            ],
        )?;
        if changed == 0 {
            tracing::warn!(job_id, "completion reported for a job that is no longer active");
        }
        Ok(())
    }

    /// Records a failed delivery. While attempts remain the job is requeued
    /// with a backoff delay; once the budget is spent it is parked. Returns
    /// the status the job ended up in.
    pub fn fail(&self, job_id: i64, error: &str) -> Result<JobStatus> {
        let mut connection = self.open_connection()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin failure transaction")?;
        let now = now_unix_ms();
        let attempts_row: Option<(u32, u32)> = transaction
            .query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1 AND status = ?2",
                params![job_id, JobStatus::Active.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((attempts, max_attempts)) = attempts_row else {
            let status_raw: Option<String> = transaction
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            drop(transaction);
            return match status_raw {
                Some(raw) => {
                    tracing::warn!(job_id, "failure reported for a job that is no longer active");
                    parse_job_status(&raw)
                }
                None => bail!("job {job_id} does not exist"),
            };
        };
        let next_status = if attempts >= max_attempts {
            transaction.execute(
                "UPDATE jobs SET status = ?2, last_error = ?3, \
                 lease_deadline_unix_ms = NULL, updated_at_unix_ms = ?4 WHERE id = ?1",
                params![job_id, JobStatus::Parked.as_str(), error, now],
            )?;
            JobStatus::Parked
        } else {
            let delay = retry_delay_ms(job_id, attempts);
            transaction.execute(
                "UPDATE jobs SET status = ?2, last_error = ?3, \
                 available_at_unix_ms = ?4, lease_deadline_unix_ms = NULL, \
                 updated_at_unix_ms = ?5 WHERE id = ?1",
                params![
                    job_id,
                    JobStatus::Queued.as_str(),
                    error,
                    now.saturating_add(delay as i64),
                    now
                ],
            )?;
            JobStatus::Queued
        };
        transaction.commit()?;
        Ok(next_status)
    }

    /// Parks an active job immediately, bypassing remaining attempts. Used
    /// for permanent failures where redelivery cannot help.
    pub fn park(&self, job_id: i64, error: &str) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE jobs SET status = ?2, last_error = ?3, \
             lease_deadline_unix_ms = NULL, updated_at_unix_ms = ?4 \
             WHERE id = ?1 AND status = ?5",
            params![
                job_id,
                JobStatus::Parked.as_str(),
                error,
                now_unix_ms(),
                JobStatus::Active.as_str()
            ],
        )?;
        if changed == 0 {
            tracing::warn!(job_id, "park requested for a job that is no longer active");
        }
        Ok(())
    }

    /// Recovers jobs whose worker died mid-delivery: expired leases are
    /// requeued for another attempt, or parked outright when the attempt
    /// budget is already spent. Returns how many jobs were touched.
    pub fn release_expired_leases(&self, queue: &str) -> Result<u64> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let parked = connection.execute(
            "UPDATE jobs SET status = ?2, last_error = ?3, \
             lease_deadline_unix_ms = NULL, updated_at_unix_ms = ?4 \
             WHERE queue = ?1 AND status = ?5 AND lease_deadline_unix_ms <= ?4 \
             AND attempts >= max_attempts",
            params![
                queue,
                JobStatus::Parked.as_str(),
                "lease expired with no attempts remaining",
                now,
                JobStatus::Active.as_str()
            ],
        )?;
        let requeued = connection.execute(
            "UPDATE jobs SET status = ?2, available_at_unix_ms = ?3, \
             lease_deadline_unix_ms = NULL, updated_at_unix_ms = ?3 \
             WHERE queue = ?1 AND status = ?4 AND lease_deadline_unix_ms <= ?3",
            params![
                queue,
                JobStatus::Queued.as_str(),
                now,
                JobStatus::Active.as_str()
            ],
        )?;
        if parked > 0 {
            tracing::warn!(queue, parked, "parked jobs with expired leases and spent attempts");
        }
        if requeued > 0 {
            tracing::warn!(queue, requeued, "requeued jobs with expired leases");
        }
        Ok((parked + requeued) as u64)
    }

    /// Collapses pending delays on `queue`, making every queued job
    /// claimable now. Operator kick for backoff waits and batch pacing.
    pub fn promote_available(&self, queue: &str) -> Result<u64> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let changed = connection.execute(
            "UPDATE jobs SET available_at_unix_ms = ?2, updated_at_unix_ms = ?2 \
             WHERE queue = ?1 AND status = ?3 AND available_at_unix_ms > ?2",
            params![queue, now, JobStatus::Queued.as_str()],
        )?;
        Ok(changed as u64)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let connection = self.open_connection()?;
        let record = connection
            .query_row(JOB_SELECT_BY_ID, params![job_id], job_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT status, COUNT(1) FROM jobs WHERE queue = ?1 GROUP BY status",
        )?;
        let rows = statement.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status_raw, count) = row?;
            apply_status_count(&mut counts, &status_raw, count)?;
        }
        Ok(counts)
    }

    pub fn counts_by_queue(&self) -> Result<BTreeMap<String, QueueCounts>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT queue, status, COUNT(1) FROM jobs GROUP BY queue, status",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
            ))
        })?;
        let mut by_queue: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for row in rows {
            let (queue, status_raw, count) = row?;
            let counts = by_queue.entry(queue).or_default();
            apply_status_count(counts, &status_raw, count)?;
        }
        Ok(by_queue)
    }

    pub fn list_parked(&self, limit: u32) -> Result<Vec<JobRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, queue, kind, payload, status, attempts, max_attempts, \
             available_at_unix_ms, lease_deadline_unix_ms, last_error, \
             created_at_unix_ms, updated_at_unix_ms FROM jobs \
             WHERE status = ?1 ORDER BY updated_at_unix_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = statement.query_map(
            params![JobStatus::Parked.as_str(), limit],
            job_from_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Returns a parked job to QUEUED with a fresh attempt budget. Operator
    /// action behind `iris queue retry <id>`.
    pub fn retry_parked(&self, job_id: i64) -> Result<JobRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let changed = connection.execute(
            "UPDATE jobs SET status = ?2, attempts = 0, available_at_unix_ms = ?3, \
             lease_deadline_unix_ms = NULL, updated_at_unix_ms = ?3 \
             WHERE id = ?1 AND status = ?4",
            params![
                job_id,
                JobStatus::Queued.as_str(),
                now,
                JobStatus::Parked.as_str()
            ],
        )?;
        if changed == 0 {
            bail!("job {job_id} is not parked");
        }
        let record = connection.query_row(JOB_SELECT_BY_ID, params![job_id], job_from_row)?;
        Ok(record)
    }
}

const JOB_SELECT_BY_ID: &str = "SELECT id, queue, kind, payload, status, attempts, \
    max_attempts, available_at_unix_ms, lease_deadline_unix_ms, last_error, \
    created_at_unix_ms, updated_at_unix_ms FROM jobs WHERE id = ?1";

fn initialize_jobs_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            available_at_unix_ms INTEGER NOT NULL,
            lease_deadline_unix_ms INTEGER NULL,
            last_error TEXT NULL,
            created_at_unix_ms INTEGER NOT NULL,
            updated_at_unix_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(queue, status, available_at_unix_ms);
        "#,
    )?;
    Ok(())
}

fn now_unix_ms() -> i64 {
    iris_core::current_unix_timestamp_ms() as i64
}

fn apply_status_count(counts: &mut QueueCounts, status_raw: &str, count: u64) -> Result<()> {
    match parse_job_status(status_raw)? {
        JobStatus::Queued => counts.queued = count,
        JobStatus::Active => counts.active = count,
        JobStatus::Completed => counts.completed = count,
        JobStatus::Parked => counts.parked = count,
    }
    Ok(())
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let payload_raw: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(error))
    })?;
    let status_raw: String = row.get(4)?;
    let status = parse_job_status(&status_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, error.into())
    })?;
    Ok(JobRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind: row.get(2)?,
        payload,
        status,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        available_at_unix_ms: row.get(7)?,
        lease_deadline_unix_ms: row.get(8)?,
        last_error: row.get(9)?,
        created_at_unix_ms: row.get(10)?,
        updated_at_unix_ms: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn scratch_queue() -> (TempDir, JobQueue) {
        let dir = TempDir::new().expect("temp dir");
        let queue = JobQueue::new(dir.path().join("jobs.sqlite3"));
        (dir, queue)
    }

    #[test]
    fn unit_enqueue_then_claim_sets_lease_and_attempt() {
        let (_dir, queue) = scratch_queue();
        let job = queue
            .enqueue("inbound", "inbound_message", &json!({ "channel_id": 1 }))
            .expect("enqueue");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let claimed = queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("claim")
            .expect("job available");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.lease_deadline_unix_ms.is_some());

        // The claimed job is invisible to a second claimer.
        assert!(queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("second claim")
            .is_none());
    }

    #[test]
    fn unit_claim_respects_queue_name_and_availability() {
        let (_dir, queue) = scratch_queue();
        queue
            .enqueue_at("campaigns", "campaign_batch", &json!({}), now_unix_ms() + 60_000)
            .expect("delayed");
        assert!(queue
            .claim_next("campaigns", DEFAULT_LEASE_MS)
            .expect("claim delayed")
            .is_none());
        assert!(queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("claim other queue")
            .is_none());

        assert_eq!(queue.promote_available("campaigns").expect("promote"), 1);
        assert!(queue
            .claim_next("campaigns", DEFAULT_LEASE_MS)
            .expect("claim promoted")
            .is_some());
    }

    #[test]
    fn unit_complete_flips_status_and_keeps_the_row() {
        let (_dir, queue) = scratch_queue();
        let job = queue.enqueue("inbound", "k", &json!({})).expect("enqueue");
        queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("claim")
            .expect("job");
        queue.complete(job.id).expect("complete");

        let stored = queue.get_job(job.id).expect("get").expect("row kept");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.lease_deadline_unix_ms, None);
    }

    #[test]
    fn functional_fail_requeues_with_delay_then_parks_after_budget() {
        let (_dir, queue) = scratch_queue();
        let job = queue.enqueue("outbound", "k", &json!({})).expect("enqueue");

        for attempt in 1..DEFAULT_MAX_ATTEMPTS {
            queue.promote_available("outbound").expect("promote");
            let claimed = queue
                .claim_next("outbound", DEFAULT_LEASE_MS)
                .expect("claim")
                .expect("job");
            assert_eq!(claimed.attempts, attempt);
            let before = now_unix_ms();
            let status = queue.fail(job.id, "provider 500").expect("fail");
            assert_eq!(status, JobStatus::Queued);
            let stored = queue.get_job(job.id).expect("get").expect("row");
            // The redelivery delay is the deterministic per-attempt backoff.
            let delay = retry_delay_ms(job.id, attempt);
            assert!(stored.available_at_unix_ms >= before + delay as i64);
            assert_eq!(stored.last_error.as_deref(), Some("provider 500"));
        }

        queue.promote_available("outbound").expect("promote");
        queue
            .claim_next("outbound", DEFAULT_LEASE_MS)
            .expect("claim")
            .expect("final attempt");
        let status = queue.fail(job.id, "provider 500").expect("final fail");
        assert_eq!(status, JobStatus::Parked);

        let parked = queue.list_parked(10).expect("parked");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, job.id);
    }

    #[test]
    fn unit_park_is_immediate_and_retry_parked_resets_budget() {
        let (_dir, queue) = scratch_queue();
        let job = queue.enqueue("inbound", "k", &json!({})).expect("enqueue");
        queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("claim")
            .expect("job");
        queue.park(job.id, "channel 9 does not exist").expect("park");

        let stored = queue.get_job(job.id).expect("get").expect("row");
        assert_eq!(stored.status, JobStatus::Parked);
        assert_eq!(stored.last_error.as_deref(), Some("channel 9 does not exist"));

        let retried = queue.retry_parked(job.id).expect("retry");
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.attempts, 0);

        let error = queue.retry_parked(job.id).expect_err("not parked anymore");
        assert!(error.to_string().contains("not parked"));
    }

    #[test]
    fn functional_release_expired_leases_requeues_or_parks() {
        let (_dir, queue) = scratch_queue();
        let fresh = queue.enqueue("inbound", "k", &json!({"n": 1})).expect("enqueue");
        // Zero-length lease expires immediately.
        queue.claim_next("inbound", 0).expect("claim").expect("job");

        let touched = queue.release_expired_leases("inbound").expect("release");
        assert_eq!(touched, 1);
        let stored = queue.get_job(fresh.id).expect("get").expect("row");
        assert_eq!(stored.status, JobStatus::Queued);

        // Keep losing the lease: each expiry requeues until the attempt
        // budget is spent, then the job parks instead of looping forever.
        let mut last_attempts = 1;
        loop {
            queue.promote_available("inbound").expect("promote");
            let Some(claimed) = queue.claim_next("inbound", 0).expect("claim") else {
                break;
            };
            last_attempts = claimed.attempts;
            queue.release_expired_leases("inbound").expect("release");
        }
        assert_eq!(last_attempts, DEFAULT_MAX_ATTEMPTS);
        let stored = queue.get_job(fresh.id).expect("get").expect("row");
        assert_eq!(stored.status, JobStatus::Parked);
    }

    #[test]
    fn unit_counts_group_by_queue_and_status() {
        let (_dir, queue) = scratch_queue();
        queue.enqueue("inbound", "k", &json!({})).expect("a");
        queue.enqueue("inbound", "k", &json!({})).expect("b");
        queue.enqueue("outbound", "k", &json!({})).expect("c");
        let claimed = queue
            .claim_next("inbound", DEFAULT_LEASE_MS)
            .expect("claim")
            .expect("job");
        queue.complete(claimed.id).expect("complete");

        let inbound = queue.counts("inbound").expect("inbound counts");
        assert_eq!(inbound.queued, 1);
        assert_eq!(inbound.completed, 1);
        assert_eq!(inbound.active, 0);

        let by_queue = queue.counts_by_queue().expect("all counts");
        assert_eq!(by_queue.len(), 2);
        assert_eq!(by_queue["outbound"].queued, 1);
    }

    #[test]
    fn unit_retry_delay_is_deterministic_and_bounded() {
        for attempt in 1..=6_u32 {
            let step = BASE_RETRY_DELAY_MS * (1 << (attempt - 1).min(6));
            let delay = retry_delay_ms(42, attempt);
            assert!(delay >= step / 2, "attempt {attempt}: {delay} >= {}", step / 2);
            assert!(delay <= step, "attempt {attempt}: {delay} <= {step}");
            assert_eq!(delay, retry_delay_ms(42, attempt));
        }
        // Attempt growth dominates jitter: the ceiling doubles each step.
        assert!(retry_delay_ms(42, 4) > retry_delay_ms(42, 1));
    }
}
