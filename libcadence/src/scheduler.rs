//! Tick and manual-run entry points
//!
//! A tick turns the current campaign state into queued jobs; a manual run
//! queues one job for a campaign right away. Neither publishes anything
//! itself, that is the worker pool's job.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::decision::DecisionEngine;
use crate::error::{CadenceError, LedgerError, Result};
use crate::ledger::Ledger;
use crate::queue::{Enqueued, JobQueue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Candidates the decision engine produced
    pub candidates: usize,
    /// Newly enqueued jobs
    pub processed: usize,
    /// Candidates whose job already existed
    pub duplicates: usize,
    /// Campaigns or platforms the engine skipped
    pub skipped: usize,
    /// Candidates that could not be enqueued
    pub failed: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    engine: Arc<DecisionEngine>,
    queue: JobQueue,
    ledger: Ledger,
    lookback_secs: i64,
}

impl Scheduler {
    pub fn new(
        db: Database,
        engine: Arc<DecisionEngine>,
        queue: JobQueue,
        ledger: Ledger,
        lookback_secs: i64,
    ) -> Self {
        Self {
            db,
            engine,
            queue,
            ledger,
            lookback_secs,
        }
    }

    /// Enqueue every due (campaign, platform) pair in priority order
    pub async fn tick(&self, now: i64) -> Result<TickReport> {
        let open = self.queue.open_jobs_for_campaigns().await?;
        let campaigns: Vec<_> = self
            .db
            .list_campaigns(true)
            .await?
            .into_iter()
            .filter(|c| !open.contains(&c.id))
            .collect();
        let recent_posts = self.db.recent_posts(now - self.lookback_secs).await?;

        let decision = self.engine.decide(&campaigns, &recent_posts, now);

        let mut report = TickReport {
            candidates: decision.candidates.len(),
            skipped: decision.skipped.len(),
            ..Default::default()
        };

        for candidate in &decision.candidates {
            match self.queue.enqueue(candidate, now).await {
                Ok(Enqueued::Created(job_id)) => {
                    debug!(%job_id, campaign_id = %candidate.campaign_id, platform = %candidate.platform, score = candidate.score, "Queued");
                    report.processed += 1;
                }
                Ok(Enqueued::Duplicate(_)) => report.duplicates += 1,
                Err(e) => {
                    warn!(
                        campaign_id = %candidate.campaign_id,
                        platform = %candidate.platform,
                        "Failed to enqueue candidate: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            campaigns = campaigns.len(),
            candidates = report.candidates,
            processed = report.processed,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "Tick complete"
        );
        Ok(report)
    }

    /// Queue one action for a campaign now, ignoring its cadence
    ///
    /// `platform` defaults to the campaign's primary platform. Returns the new
    /// job id.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, `CampaignInactive`, `PlatformUnavailable`, or
    /// `Ledger(InsufficientCredit)` when the account cannot currently cover the
    /// cost. The worker authorizes again when it runs the job.
    pub async fn run_now(&self, campaign_id: &str, platform: Option<&str>, now: i64) -> Result<String> {
        let campaign = self
            .db
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| CadenceError::CampaignNotFound(campaign_id.to_string()))?;

        if !campaign.active {
            return Err(CadenceError::CampaignInactive(campaign_id.to_string()));
        }

        let platform = match platform {
            Some(p) if campaign.platforms.iter().any(|cp| cp == p) => p,
            Some(p) => {
                return Err(CadenceError::InvalidInput(format!(
                    "campaign {} does not target platform {}",
                    campaign_id, p
                )))
            }
            None => campaign.primary_platform().ok_or_else(|| {
                CadenceError::PlatformUnavailable(format!("campaign {} has no platforms", campaign_id))
            })?,
        };

        let candidate = self
            .engine
            .candidate_for(&campaign, platform, now)
            .ok_or_else(|| CadenceError::PlatformUnavailable(platform.to_string()))?;

        let spendable = match self.ledger.spendable(&campaign.account_id).await {
            Ok(spendable) => spendable,
            Err(LedgerError::AccountNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if spendable < candidate.estimated_cost {
            return Err(LedgerError::InsufficientCredit {
                spendable,
                required: candidate.estimated_cost,
            }
            .into());
        }

        let job_id = self.queue.enqueue(&candidate, now).await?.job_id().to_string();
        info!(%job_id, campaign_id, platform, "Manual run queued");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::decision::CostTable;
    use crate::types::{unix_now, Campaign, JobState};

    struct Harness {
        db: Database,
        queue: JobQueue,
        scheduler: Scheduler,
    }

    async fn harness(balance: i64) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let config = Config::default_config();
        let ledger = Ledger::new(db.clone(), &config.ledger);
        ledger.open_account("acct", balance, unix_now()).await.unwrap();

        let engine = DecisionEngine::new(
            CostTable::new(20),
            ["mastodon".to_string(), "nostr".to_string()].into_iter().collect(),
        );
        let queue = JobQueue::new(db.clone(), 3);
        let scheduler = Scheduler::new(db.clone(), Arc::new(engine), queue.clone(), ledger, 3600);

        Harness { db, queue, scheduler }
    }

    async fn add_campaign(h: &Harness, platforms: &[&str]) -> Campaign {
        let campaign = Campaign::new(
            "acct",
            "tick test",
            platforms.iter().map(|p| p.to_string()).collect(),
            600,
        )
        .with_content("hi");
        h.db.create_campaign(&campaign).await.unwrap();
        campaign
    }

    #[tokio::test]
    async fn test_tick_enqueues_due_campaigns_once() {
        let h = harness(100).await;
        add_campaign(&h, &["mastodon", "nostr"]).await;
        let now = unix_now();

        let report = h.scheduler.tick(now).await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.processed, 2);

        // Open jobs keep the campaign out of the next tick
        let report = h.scheduler.tick(now + 1).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(h.queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_tick_counts_skipped_platforms() {
        let h = harness(100).await;
        add_campaign(&h, &["bluesky"]).await;

        let report = h.scheduler.tick(unix_now()).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_run_now_queues_job_on_primary_platform() {
        let h = harness(100).await;
        let campaign = add_campaign(&h, &["nostr", "mastodon"]).await;

        let job_id = h.scheduler.run_now(&campaign.id, None, unix_now()).await.unwrap();
        let job = h.queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.platform, "nostr");
        assert_eq!(job.state, JobState::Pending);

        // Manual runs are not deduplicated against each other
        let second = h
            .scheduler
            .run_now(&campaign.id, Some("mastodon"), unix_now())
            .await
            .unwrap();
        assert_ne!(job_id, second);
    }

    #[tokio::test]
    async fn test_run_now_errors() {
        let h = harness(10).await;
        let campaign = add_campaign(&h, &["mastodon", "bluesky"]).await;

        assert!(matches!(
            h.scheduler.run_now("missing", None, unix_now()).await,
            Err(CadenceError::CampaignNotFound(_))
        ));

        let err = h.scheduler.run_now(&campaign.id, None, unix_now()).await.unwrap_err();
        assert!(err.is_insufficient_credit());

        assert!(matches!(
            h.scheduler.run_now(&campaign.id, Some("bluesky"), unix_now()).await,
            Err(CadenceError::PlatformUnavailable(_))
        ));
        assert!(matches!(
            h.scheduler.run_now(&campaign.id, Some("nostr"), unix_now()).await,
            Err(CadenceError::InvalidInput(_))
        ));

        h.db.set_campaign_active(&campaign.id, false).await.unwrap();
        assert!(matches!(
            h.scheduler.run_now(&campaign.id, None, unix_now()).await,
            Err(CadenceError::CampaignInactive(_))
        ));
    }
}
