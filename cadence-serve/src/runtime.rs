//! Background work hosted by the server: worker pool, dispatcher and sweeper
//!
//! Shutdown order matters. The token stops the dispatcher from claiming and
//! interrupts content generation; the pool is drained only after the
//! dispatcher has returned, so no claimed job is left without a worker.

use std::time::Duration;

use libcadence::queue::{ReclaimReport, WorkerPool};
use libcadence::types::{unix_now, unix_now_millis};
use libcadence::CadenceService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_holds: usize,
    pub reclaimed_jobs: ReclaimReport,
    pub pruned_admissions: u64,
}

/// Release expired holds, recover jobs orphaned in `running` and drop
/// admission entries older than the window
pub async fn sweep_once(service: &CadenceService) -> SweepReport {
    let mut report = SweepReport::default();
    let now = unix_now();

    match service.ledger().expire(now).await {
        Ok(released) => report.expired_holds = released,
        Err(e) => warn!("Hold expiry sweep failed: {}", e),
    }

    // No live attempt outlasts its hold, so anything older has lost its worker
    let stale_before = now - service.ledger().hold_ttl_secs();
    match service.queue().reclaim_stale(stale_before, now).await {
        Ok(reclaimed) => report.reclaimed_jobs = reclaimed,
        Err(e) => warn!("Stale job sweep failed: {}", e),
    }
    match service
        .admission()
        .prune(service.db(), unix_now_millis())
        .await
    {
        Ok(pruned) => report.pruned_admissions = pruned,
        Err(e) => warn!("Admission log prune failed: {}", e),
    }

    if report != SweepReport::default() {
        debug!(
            expired_holds = report.expired_holds,
            reclaimed_jobs = report.reclaimed_jobs.total(),
            pruned_admissions = report.pruned_admissions,
            "Sweep complete"
        );
    }
    report
}

pub struct Background {
    pool: WorkerPool,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    token: CancellationToken,
}

impl Background {
    /// Start workers, the dispatcher and the sweeper; all stop on `token`
    pub fn start(service: &CadenceService, token: CancellationToken) -> Self {
        let config = service.config();
        let workers = config.queue.workers;

        let pool = WorkerPool::spawn(service.executor(), workers, workers);
        let dispatcher = tokio::spawn(
            pool.dispatcher(
                service.queue().clone(),
                Duration::from_millis(config.queue.poll_interval_ms),
            )
            .run(token.clone()),
        );

        let sweep_interval = Duration::from_secs(config.ledger.sweep_interval_secs.max(1));
        let sweeper = tokio::spawn(run_sweeper(service.clone(), sweep_interval, token.clone()));

        info!(workers, "Background workers started");
        Self {
            pool,
            dispatcher,
            sweeper,
            token,
        }
    }

    /// Cancel, wait for the dispatcher, then drain the pool
    pub async fn shutdown(self) {
        self.token.cancel();

        if let Err(e) = self.dispatcher.await {
            warn!("Dispatcher task ended abnormally: {}", e);
        }
        self.pool.shutdown().await;
        if let Err(e) = self.sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
        info!("Background workers stopped");
    }
}

async fn run_sweeper(service: CadenceService, every: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                sweep_once(&service).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcadence::config::Config;
    use libcadence::content::TemplateGenerator;
    use libcadence::platforms::PlatformRegistry;
    use libcadence::types::{Campaign, JobState};
    use libcadence::Database;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_releases_expired_holds() {
        let db = Database::in_memory().await.unwrap();
        let service = CadenceService::with_database(
            db,
            Config::default_config(),
            PlatformRegistry::dry_run(&["mastodon"]),
            Arc::new(TemplateGenerator::new()),
            CancellationToken::new(),
        );
        let ledger = service.ledger();
        ledger.open_account("acct", 100, unix_now()).await.unwrap();

        // Authorized long enough ago that the hold has already expired
        let issued = unix_now() - ledger.hold_ttl_secs() - 1;
        ledger.authorize("acct", 30, issued).await.unwrap();
        assert_eq!(ledger.spendable("acct").await.unwrap(), 70);

        let report = sweep_once(&service).await;
        assert_eq!(report.expired_holds, 1);
        assert_eq!(ledger.spendable("acct").await.unwrap(), 100);
        assert_eq!(ledger.balance("acct").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_sweep_recovers_orphaned_claim() {
        let db = Database::in_memory().await.unwrap();
        let service = CadenceService::with_database(
            db.clone(),
            Config::default_config(),
            PlatformRegistry::dry_run(&["mastodon"]),
            Arc::new(TemplateGenerator::new()),
            CancellationToken::new(),
        );
        service.ledger().open_account("acct", 100, unix_now()).await.unwrap();
        let campaign = Campaign::new("acct", "launch", vec!["mastodon".to_string()], 3600)
            .with_content("hello");
        db.create_campaign(&campaign).await.unwrap();

        // A worker claimed the job a day ago, reserved credits and vanished
        let long_ago = unix_now() - 86_400;
        let job_id = service.scheduler().run_now(&campaign.id, None, long_ago).await.unwrap();
        let queue = service.queue();
        assert!(queue.claim(&job_id, long_ago).await.unwrap());
        let hold_id = service.ledger().authorize("acct", 20, long_ago).await.unwrap();
        queue.attach_hold(&job_id, &hold_id, long_ago).await.unwrap();

        let report = sweep_once(&service).await;
        assert_eq!(report.expired_holds, 1);
        assert_eq!(report.reclaimed_jobs.requeued, 1);

        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.hold_id.is_none());
        assert_eq!(service.ledger().spendable("acct").await.unwrap(), 100);

        // Back in the queue for the workers
        let claimed = queue.claim_next(unix_now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
    }

    #[tokio::test]
    async fn test_background_stops_on_shutdown() {
        let db = Database::in_memory().await.unwrap();
        let service = CadenceService::with_database(
            db,
            Config::default_config(),
            PlatformRegistry::dry_run(&["mastodon"]),
            Arc::new(TemplateGenerator::new()),
            CancellationToken::new(),
        );

        let background = Background::start(&service, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), background.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
