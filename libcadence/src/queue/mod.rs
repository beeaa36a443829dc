//! Scheduled execution queue
//!
//! Jobs live in the `jobs` table and move through
//!
//! ```text
//! pending -> running -> succeeded
//!    ^          |
//!    +----------+ (retry with backoff)
//!               |
//!               v
//!             dead        pending -> cancelled
//! ```
//!
//! A worker that dies mid-job leaves its job `running`. The sweeper hands such
//! jobs back through [`JobQueue::reclaim_stale`] once they are older than the
//! hold TTL, which no live attempt can outlast.
//!
//! Every transition is a conditional `UPDATE` on the current state, so two
//! workers can never both own a job. [`JobQueue`] is the store,
//! [`executor::Executor`] runs one job and [`pool::WorkerPool`] fans jobs out
//! to a fixed set of workers.

pub mod backoff;
pub mod executor;
pub mod pool;

pub use backoff::RetryPolicy;
pub use executor::{Executor, JobOutcome};
pub use pool::{Dispatcher, Submission, WorkerPool};

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{corrupt, post_record_from_row, Database, TOUCH_CAMPAIGN};
use crate::decision::CandidateAction;
use crate::error::{DbError, QueueError, Result};
use crate::platforms::Published;
use crate::types::{Job, JobState, PostRecord};

pub const DEAD_CAMPAIGN_NOT_FOUND: &str = "campaign_not_found";
pub const DEAD_INSUFFICIENT_CREDIT: &str = "insufficient_credit";
pub const DEAD_RETRIES_EXHAUSTED: &str = "retries_exhausted";
pub const DEAD_CAMPAIGN_INACTIVE: &str = "campaign_inactive";
pub const DEAD_PLATFORM_REMOVED: &str = "platform_removed";
pub const DEAD_STALE_CLAIM: &str = "stale_claim";
/// Published, but the job never reached `succeeded`; needs an operator
pub const DEAD_UNRECONCILED: &str = "unreconciled";

const JOB_COLUMNS: &str = r#"
    id, campaign_id, account_id, platform, content, prompt, estimated_cost, dedupe_key,
    state, attempts, max_attempts, next_run_at, hold_id, last_error, dead_reason,
    created_at, updated_at
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Created(String),
    /// A job with the same dedupe key already exists
    Duplicate(String),
}

impl Enqueued {
    pub fn job_id(&self) -> &str {
        match self {
            Enqueued::Created(id) | Enqueued::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dead: i64,
    pub cancelled: i64,
    /// Earliest `next_run_at` among pending jobs
    pub next_due_at: Option<i64>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.succeeded + self.failed + self.dead + self.cancelled
    }
}

/// What one pass over stale `running` jobs did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Back to pending with the lost attempt counted
    pub requeued: usize,
    /// Out of attempts, dead as `stale_claim`
    pub exhausted: usize,
    /// Already published, dead as `unreconciled`
    pub unreconciled: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.exhausted + self.unreconciled
    }
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a pending job for the candidate, due at `now`
    ///
    /// Idempotent on the candidate's dedupe key: a second enqueue of the same
    /// key returns the existing job id as [`Enqueued::Duplicate`].
    pub async fn enqueue(&self, candidate: &CandidateAction, now: i64) -> Result<Enqueued> {
        let job_id = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, campaign_id, account_id, platform, content, prompt, estimated_cost,
                 dedupe_key, state, attempts, max_attempts, next_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            ON CONFLICT(dedupe_key) DO NOTHING
            "#,
        )
        .bind(&job_id)
        .bind(&candidate.campaign_id)
        .bind(&candidate.account_id)
        .bind(&candidate.platform)
        .bind(&candidate.content)
        .bind(&candidate.prompt)
        .bind(candidate.estimated_cost)
        .bind(&candidate.dedupe_key)
        .bind(self.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if inserted.rows_affected() == 1 {
            debug!(%job_id, dedupe_key = %candidate.dedupe_key, "Enqueued job");
            return Ok(Enqueued::Created(job_id));
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM jobs WHERE dedupe_key = ?")
            .bind(&candidate.dedupe_key)
            .fetch_one(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        debug!(job_id = %existing, dedupe_key = %candidate.dedupe_key, "Duplicate enqueue");
        Ok(Enqueued::Duplicate(existing))
    }

    /// Claim the oldest due pending job
    ///
    /// Selection and the pending -> running transition happen in one
    /// statement, so concurrent claimants always get different jobs.
    pub async fn claim_next(&self, now: i64) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'running', updated_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending' AND next_run_at <= ?1
                ORDER BY next_run_at ASC, created_at ASC, id ASC
                LIMIT 1
            ) AND state = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Move a specific job from pending to running. False if someone else got it first.
    pub async fn claim(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Remember which hold pays for the running attempt
    pub async fn attach_hold(&self, job_id: &str, hold_id: &str, now: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET hold_id = ?, updated_at = ? WHERE id = ? AND state = 'running'",
        )
        .bind(hold_id)
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        self.expect_running(job_id, result.rows_affected(), JobState::Running)
            .await
    }

    /// Create the job's post record, or reset it to `queued` for a new attempt
    pub async fn upsert_post_record(&self, job: &Job, now: i64) -> Result<PostRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO post_records (id, job_id, campaign_id, platform, content, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?)
            ON CONFLICT(job_id) DO UPDATE SET status = 'queued', error = NULL
            RETURNING id, job_id, campaign_id, platform, content, status, external_post_id,
                      posted_at, error, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&job.id)
        .bind(&job.campaign_id)
        .bind(&job.platform)
        .bind(&job.content)
        .bind(now)
        .fetch_one(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        post_record_from_row(&row)
    }

    /// Record a successful publish
    ///
    /// The post record, the job and the campaign's last action move together
    /// in one transaction.
    pub async fn complete(
        &self,
        job: &Job,
        published: &Published,
        content: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'succeeded', last_error = NULL, updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return self.expect_running(&job.id, 0, JobState::Succeeded).await;
        }

        write_publish(&mut tx, job, published, content).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(job_id = %job.id, platform = %job.platform, external_post_id = %published.external_post_id, "Job succeeded");
        Ok(())
    }

    /// Record a publish on the post record and campaign, leaving the job as is
    ///
    /// Used when the post went out but the job cannot be completed, so the
    /// campaign is not published again before its next window.
    pub async fn record_publish(
        &self,
        job: &Job,
        published: &Published,
        content: &str,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        write_publish(&mut tx, job, published, content).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Put a running job back to pending for another attempt
    pub async fn reschedule(
        &self,
        job_id: &str,
        attempts: u32,
        next_run_at: i64,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = ?, next_run_at = ?, last_error = ?, hold_id = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(attempts as i64)
        .bind(next_run_at)
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        self.expect_running(job_id, result.rows_affected(), JobState::Pending)
            .await
    }

    /// Park a job for operator attention; its post record (if any) becomes `failed`
    pub async fn mark_dead(
        &self,
        job_id: &str,
        attempts: u32,
        reason: &str,
        error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', attempts = ?, dead_reason = ?, last_error = COALESCE(?, last_error),
                hold_id = NULL, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'running')
            "#,
        )
        .bind(attempts as i64)
        .bind(reason)
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return self.expect_running(job_id, 0, JobState::Dead).await;
        }

        sqlx::query(
            "UPDATE post_records SET status = 'failed', error = ? WHERE job_id = ? AND status = 'queued'",
        )
        .bind(error.unwrap_or(reason))
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(%job_id, reason, attempts, "Job is dead");
        Ok(())
    }

    /// Note an error on a job without changing its state
    pub async fn record_error(&self, job_id: &str, error: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Cancel a pending job. False if it is not pending.
    pub async fn cancel(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'cancelled', updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Give a dead job a fresh set of attempts, due immediately
    pub async fn revive(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, dead_reason = NULL, next_run_at = ?, updated_at = ?
            WHERE id = ? AND state = 'dead'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Hand a `running` job back to pending, due now, keeping its attempt count.
    /// False if it is not running.
    pub async fn requeue(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', next_run_at = ?, hold_id = NULL, updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Recover `running` jobs untouched since `stale_before`
    ///
    /// A job whose post already went out (committed hold or posted record) is
    /// parked as `unreconciled` so it is never published twice. Any other
    /// stale job counts the lost attempt and goes back to pending, or dies as
    /// `stale_claim` once it is out of attempts. Holds are left to the expiry
    /// sweep.
    pub async fn reclaim_stale(&self, stale_before: i64, now: i64) -> Result<ReclaimReport> {
        let rows = sqlx::query(
            r#"
            SELECT j.id, j.attempts, j.max_attempts,
                   COALESCE(h.state, '') AS hold_state,
                   COALESCE(p.status, '') AS post_status
            FROM jobs j
            LEFT JOIN credit_holds h ON h.id = j.hold_id
            LEFT JOIN post_records p ON p.job_id = j.id
            WHERE j.state = 'running' AND j.updated_at <= ?
            ORDER BY j.updated_at ASC
            "#,
        )
        .bind(stale_before)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut report = ReclaimReport::default();
        for row in &rows {
            let job_id: String = row.get("id");
            let attempts = row.get::<i64, _>("attempts") as u32;
            let max_attempts = row.get::<i64, _>("max_attempts") as u32;
            let hold_state: String = row.get("hold_state");
            let post_status: String = row.get("post_status");

            if hold_state == "committed" || post_status == "posted" {
                let moved = self
                    .bury_stale(
                        &job_id,
                        attempts,
                        DEAD_UNRECONCILED,
                        "published but never completed",
                        stale_before,
                        now,
                    )
                    .await?;
                if moved {
                    warn!(%job_id, "Stale job was already published, parked for reconciliation");
                    report.unreconciled += 1;
                }
                continue;
            }

            let attempts = attempts + 1;
            if attempts < max_attempts {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'pending', attempts = ?, next_run_at = ?, hold_id = NULL,
                        last_error = 'claim went stale while running', updated_at = ?
                    WHERE id = ? AND state = 'running' AND updated_at <= ?
                    "#,
                )
                .bind(attempts as i64)
                .bind(now)
                .bind(now)
                .bind(&job_id)
                .bind(stale_before)
                .execute(self.db.pool())
                .await
                .map_err(DbError::SqlxError)?;

                if result.rows_affected() == 1 {
                    info!(%job_id, attempts, "Requeued stale job");
                    report.requeued += 1;
                }
            } else if self
                .bury_stale(
                    &job_id,
                    attempts,
                    DEAD_STALE_CLAIM,
                    "claim went stale while running",
                    stale_before,
                    now,
                )
                .await?
            {
                report.exhausted += 1;
            }
        }

        Ok(report)
    }

    /// `mark_dead` for a stale running job; false if it moved on meanwhile
    async fn bury_stale(
        &self,
        job_id: &str,
        attempts: u32,
        reason: &str,
        error: &str,
        stale_before: i64,
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', attempts = ?, dead_reason = ?, last_error = COALESCE(last_error, ?),
                hold_id = NULL, updated_at = ?
            WHERE id = ? AND state = 'running' AND updated_at <= ?
            "#,
        )
        .bind(attempts as i64)
        .bind(reason)
        .bind(error)
        .bind(now)
        .bind(job_id)
        .bind(stale_before)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE post_records SET status = 'failed', error = ? WHERE job_id = ? AND status = 'queued'",
        )
        .bind(error)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(%job_id, reason, attempts, "Stale job is dead");
        Ok(true)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs in due order, optionally filtered by state
    pub async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY next_run_at ASC, created_at ASC, id ASC
            LIMIT ?2
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match JobState::from_str(&state).map_err(|e| corrupt("jobs", e))? {
                JobState::Pending => stats.pending = n,
                JobState::Running => stats.running = n,
                JobState::Succeeded => stats.succeeded = n,
                JobState::Failed => stats.failed = n,
                JobState::Dead => stats.dead = n,
                JobState::Cancelled => stats.cancelled = n,
            }
        }

        stats.next_due_at =
            sqlx::query_scalar("SELECT MIN(next_run_at) FROM jobs WHERE state = 'pending'")
                .fetch_one(self.db.pool())
                .await
                .map_err(DbError::SqlxError)?;

        Ok(stats)
    }

    /// Campaigns with a pending or running job
    pub async fn open_jobs_for_campaigns(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT campaign_id FROM jobs WHERE state IN ('pending', 'running')",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(ids.into_iter().collect())
    }

    /// Map a zero-row conditional update to the right error
    async fn expect_running(&self, job_id: &str, rows: u64, target: JobState) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }
        match self.get(job_id).await? {
            None => Err(QueueError::JobNotFound(job_id.to_string()).into()),
            Some(job) => Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.state.to_string(),
                to: target.to_string(),
            }
            .into()),
        }
    }
}

async fn write_publish(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job: &Job,
    published: &Published,
    content: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE post_records
        SET status = 'posted', content = ?, external_post_id = ?, posted_at = ?, error = NULL
        WHERE job_id = ?
        "#,
    )
    .bind(content)
    .bind(&published.external_post_id)
    .bind(published.published_at)
    .bind(&job.id)
    .execute(&mut **tx)
    .await
    .map_err(DbError::SqlxError)?;

    sqlx::query(TOUCH_CAMPAIGN)
        .bind(published.published_at)
        .bind(&job.campaign_id)
        .execute(&mut **tx)
        .await
        .map_err(DbError::SqlxError)?;

    Ok(())
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let state: String = r.get("state");
    Ok(Job {
        id: r.get("id"),
        campaign_id: r.get("campaign_id"),
        account_id: r.get("account_id"),
        platform: r.get("platform"),
        content: r.get("content"),
        prompt: r.get("prompt"),
        estimated_cost: r.get("estimated_cost"),
        dedupe_key: r.get("dedupe_key"),
        state: JobState::from_str(&state).map_err(|e| corrupt("jobs", e))?,
        attempts: r.get::<i64, _>("attempts") as u32,
        max_attempts: r.get::<i64, _>("max_attempts") as u32,
        next_run_at: r.get("next_run_at"),
        hold_id: r.get("hold_id"),
        last_error: r.get("last_error"),
        dead_reason: r.get("dead_reason"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
