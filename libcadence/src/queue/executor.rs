//! Runs one claimed job end to end
//!
//! re-check campaign -> authorize credits -> record -> generate -> publish ->
//! commit, with the hold released on any failure before the publish succeeded.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::content::{resolve_content, ContentGenerator, GenerationContext};
use crate::db::Database;
use crate::error::{GenerationError, LedgerError, PlatformError, Result};
use crate::ledger::Ledger;
use crate::platforms::{Platform, PlatformRegistry, Published};
use crate::queue::{
    JobQueue, RetryPolicy, DEAD_CAMPAIGN_INACTIVE, DEAD_CAMPAIGN_NOT_FOUND,
    DEAD_INSUFFICIENT_CREDIT, DEAD_PLATFORM_REMOVED, DEAD_RETRIES_EXHAUSTED,
};
use crate::types::{unix_now, Campaign, Job};

/// How a single execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        external_post_id: String,
    },
    /// Back to pending, due at `next_run_at`
    Retrying {
        attempts: u32,
        next_run_at: i64,
        error: String,
    },
    Dead {
        reason: String,
    },
    /// Published but the charge could not be recorded; the job stays
    /// `running` until the stale sweep parks it as `unreconciled`
    Fatal {
        error: String,
    },
}

/// Why an attempt stopped before a successful publish
enum AttemptFailure {
    Failed(String),
    /// Shutdown interrupted content generation; not counted as an attempt
    Interrupted,
}

impl From<GenerationError> for AttemptFailure {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Cancelled => AttemptFailure::Interrupted,
            other => AttemptFailure::Failed(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    db: Database,
    ledger: Ledger,
    queue: JobQueue,
    platforms: PlatformRegistry,
    generator: Arc<dyn ContentGenerator>,
    retry: RetryPolicy,
    generation_timeout: Duration,
    publish_timeout: Duration,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        ledger: Ledger,
        queue: JobQueue,
        platforms: PlatformRegistry,
        generator: Arc<dyn ContentGenerator>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db: queue.database().clone(),
            ledger,
            queue,
            platforms,
            generator,
            retry: RetryPolicy::from_config(&config.queue),
            generation_timeout: Duration::from_secs(config.timeouts.generation_secs),
            publish_timeout: Duration::from_secs(config.timeouts.publish_secs),
            shutdown,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, generation: Duration, publish: Duration) -> Self {
        self.generation_timeout = generation;
        self.publish_timeout = publish;
        self
    }

    /// Execute a job that the caller has already claimed (state `running`)
    pub async fn execute(&self, job: Job) -> JobOutcome {
        let job_id = job.id.clone();
        match self.run(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%job_id, "Job bookkeeping failed: {}", e);
                if let Err(record_err) = self.queue.record_error(&job_id, &e.to_string(), unix_now()).await {
                    error!(%job_id, "Could not record job error: {}", record_err);
                }
                JobOutcome::Fatal {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run(&self, job: Job) -> Result<JobOutcome> {
        let Some(campaign) = self.db.get_campaign(&job.campaign_id).await? else {
            warn!(job_id = %job.id, campaign_id = %job.campaign_id, "Campaign no longer exists");
            return self.bury(&job, DEAD_CAMPAIGN_NOT_FOUND, None).await;
        };

        // The campaign may have changed since the job was queued
        if !campaign.active {
            info!(job_id = %job.id, campaign_id = %campaign.id, "Campaign was disabled, job will not run");
            return self.bury(&job, DEAD_CAMPAIGN_INACTIVE, None).await;
        }
        if !campaign.platforms.iter().any(|p| p == &job.platform) {
            info!(
                job_id = %job.id,
                campaign_id = %campaign.id,
                platform = %job.platform,
                "Platform no longer targeted by campaign, job will not run"
            );
            let detail = format!("campaign no longer targets {}", job.platform);
            return self.bury(&job, DEAD_PLATFORM_REMOVED, Some(&detail)).await;
        }

        let hold_id = match self
            .ledger
            .authorize(&job.account_id, job.estimated_cost, unix_now())
            .await
        {
            Ok(hold_id) => hold_id,
            Err(LedgerError::InsufficientCredit {
                spendable,
                required,
            }) => {
                info!(
                    job_id = %job.id,
                    account_id = %job.account_id,
                    spendable,
                    required,
                    "Not enough credit, job will not run"
                );
                let detail = format!("spendable {} < required {}", spendable, required);
                return self.bury(&job, DEAD_INSUFFICIENT_CREDIT, Some(&detail)).await;
            }
            Err(e) => {
                warn!(job_id = %job.id, "Credit authorization failed: {}", e);
                return self.fail_attempt(&job, None, &e.to_string()).await;
            }
        };

        let (published, content) = match self.attempt(&job, &campaign, &hold_id).await {
            Ok(attempt) => attempt,
            Err(AttemptFailure::Interrupted) => return self.interrupt(&job, &hold_id).await,
            Err(AttemptFailure::Failed(message)) => {
                return self.fail_attempt(&job, Some(&hold_id), &message).await
            }
        };

        if let Err(e) = self.ledger.commit(&hold_id, unix_now()).await {
            let message = format!(
                "published as {} but credit commit failed: {}",
                published.external_post_id, e
            );
            error!(
                job_id = %job.id,
                %hold_id,
                account_id = %job.account_id,
                "Ledger invariant violated, manual reconciliation required: {}",
                message
            );
            if let Err(record_err) = self.queue.record_publish(&job, &published, &content).await {
                error!(job_id = %job.id, "Could not record publish: {}", record_err);
            }
            self.queue.record_error(&job.id, &message, unix_now()).await?;
            return Ok(JobOutcome::Fatal { error: message });
        }

        self.queue
            .complete(&job, &published, &content, unix_now())
            .await?;

        Ok(JobOutcome::Succeeded {
            external_post_id: published.external_post_id,
        })
    }

    /// Everything between a successful authorize and a successful publish
    async fn attempt(
        &self,
        job: &Job,
        campaign: &Campaign,
        hold_id: &str,
    ) -> std::result::Result<(Published, String), AttemptFailure> {
        let now = unix_now();
        self.queue
            .attach_hold(&job.id, hold_id, now)
            .await
            .map_err(|e| AttemptFailure::Failed(e.to_string()))?;
        self.queue
            .upsert_post_record(job, now)
            .await
            .map_err(|e| AttemptFailure::Failed(e.to_string()))?;

        let platform: Arc<dyn Platform> = self.platforms.resolve(&job.platform).ok_or_else(|| {
            AttemptFailure::Failed(format!("platform {} is not available", job.platform))
        })?;

        let context = GenerationContext {
            campaign_id: campaign.id.clone(),
            campaign_name: campaign.name.clone(),
            platform: job.platform.clone(),
            character_limit: platform.character_limit(),
        };
        let content = resolve_content(
            job,
            self.generator.as_ref(),
            &context,
            self.generation_timeout,
            &self.shutdown,
        )
        .await?;

        platform
            .validate_content(&content)
            .map_err(|e| AttemptFailure::Failed(e.to_string()))?;

        // Not tied to the shutdown token: an in-flight publish always finishes
        let published = match tokio::time::timeout(self.publish_timeout, platform.publish(&content)).await {
            Ok(Ok(published)) => published,
            Ok(Err(e)) => return Err(AttemptFailure::Failed(describe_platform_error(&job.platform, &e))),
            Err(_) => {
                let e = PlatformError::Timeout(self.publish_timeout.as_secs());
                return Err(AttemptFailure::Failed(describe_platform_error(&job.platform, &e)));
            }
        };

        Ok((published, content))
    }

    /// Release the hold and either schedule a retry or give up
    async fn fail_attempt(&self, job: &Job, hold_id: Option<&str>, error: &str) -> Result<JobOutcome> {
        let now = unix_now();
        if let Some(hold_id) = hold_id {
            self.release(job, hold_id, now).await;
        }

        let attempts = job.attempts + 1;
        if attempts < job.max_attempts {
            let next_run_at = now + self.retry.delay(attempts);
            self.queue
                .reschedule(&job.id, attempts, next_run_at, error, now)
                .await?;
            warn!(
                job_id = %job.id,
                attempts,
                max_attempts = job.max_attempts,
                next_run_at,
                "Attempt failed, retrying: {}",
                error
            );
            return Ok(JobOutcome::Retrying {
                attempts,
                next_run_at,
                error: error.to_string(),
            });
        }

        self.queue
            .mark_dead(&job.id, attempts, DEAD_RETRIES_EXHAUSTED, Some(error), now)
            .await?;
        Ok(JobOutcome::Dead {
            reason: DEAD_RETRIES_EXHAUSTED.to_string(),
        })
    }

    /// Hand the job back untouched after shutdown cut generation short
    async fn interrupt(&self, job: &Job, hold_id: &str) -> Result<JobOutcome> {
        let now = unix_now();
        self.release(job, hold_id, now).await;
        self.queue
            .reschedule(&job.id, job.attempts, now, "interrupted by shutdown", now)
            .await?;
        info!(job_id = %job.id, "Generation interrupted by shutdown, job returned to queue");
        Ok(JobOutcome::Retrying {
            attempts: job.attempts,
            next_run_at: now,
            error: "interrupted by shutdown".to_string(),
        })
    }

    async fn bury(&self, job: &Job, reason: &str, error: Option<&str>) -> Result<JobOutcome> {
        self.queue
            .mark_dead(&job.id, job.attempts, reason, error, unix_now())
            .await?;
        Ok(JobOutcome::Dead {
            reason: reason.to_string(),
        })
    }

    async fn release(&self, job: &Job, hold_id: &str, now: i64) {
        // An unreleased hold is reclaimed by the expiry sweep
        if let Err(e) = self.ledger.release(hold_id, now).await {
            warn!(job_id = %job.id, %hold_id, "Failed to release credit hold: {}", e);
        }
    }
}

fn describe_platform_error(platform: &str, error: &PlatformError) -> String {
    if error.is_transient() {
        format!("{}: {}", platform, error)
    } else {
        format!("{}: {} (not expected to clear on retry)", platform, error)
    }
}
