//! End-to-end flows through the service: tick -> queue -> worker -> ledger

use anyhow::Result;
use libcadence::config::Config;
use libcadence::content::TemplateGenerator;
use libcadence::platforms::mock::MockPlatform;
use libcadence::platforms::PlatformRegistry;
use libcadence::queue::{RetryPolicy, WorkerPool, DEAD_INSUFFICIENT_CREDIT, DEAD_RETRIES_EXHAUSTED};
use libcadence::types::{unix_now, Campaign, JobState, PostStatus, TransactionReason};
use libcadence::{CadenceService, Database, JobOutcome};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn service(temp_dir: &TempDir, platform: MockPlatform) -> Result<CadenceService> {
    let db_path = temp_dir.path().join("cadence.db");
    let mut config = Config::default_config();
    config.database.path = db_path.to_string_lossy().to_string();

    let db = Database::new(&config.database.path).await?;
    Ok(CadenceService::with_database(
        db,
        config,
        PlatformRegistry::new().with(Arc::new(platform)),
        Arc::new(TemplateGenerator::new()),
        CancellationToken::new(),
    ))
}

async fn campaign(service: &CadenceService, balance: i64) -> Result<Campaign> {
    service.ledger().open_account("acct-1", balance, unix_now()).await?;
    let campaign = Campaign::new("acct-1", "weekly", vec!["mastodon".to_string()], 3600)
        .with_content("Weekly update is live");
    service.db().create_campaign(&campaign).await?;
    Ok(campaign)
}

#[tokio::test]
async fn test_tick_to_published_post_charges_exactly_once() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let platform = MockPlatform::success("mastodon");
    let service = service(&temp_dir, platform.clone()).await?;
    let campaign = campaign(&service, 100).await?;

    let report = service.scheduler().tick(unix_now()).await?;
    assert_eq!(report.processed, 1);

    let job = service
        .queue()
        .claim_next(unix_now())
        .await?
        .expect("a due job");
    let outcome = service.executor().execute(job.clone()).await;
    assert!(matches!(outcome, JobOutcome::Succeeded { .. }));

    assert_eq!(service.ledger().balance("acct-1").await?, 80);
    assert_eq!(service.ledger().spendable("acct-1").await?, 80);

    let spends: Vec<_> = service
        .ledger()
        .transactions("acct-1", 50)
        .await?
        .into_iter()
        .filter(|t| t.reason == TransactionReason::Spend)
        .collect();
    assert_eq!(spends.len(), 1);
    assert_eq!(spends[0].delta, -20);

    let records = service.db().list_post_records(&campaign.id, 10).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PostStatus::Posted);
    assert_eq!(records[0].job_id, job.id);
    assert_eq!(platform.publish_calls(), 1);

    let stored = service.db().get_campaign(&campaign.id).await?.unwrap();
    assert!(stored.last_action_at.is_some());

    // Just acted: the next tick has nothing to do
    let report = service.scheduler().tick(unix_now()).await?;
    assert_eq!(report.processed, 0);

    assert!(service.ledger().reconcile("acct-1").await?.is_consistent());
    Ok(())
}

#[tokio::test]
async fn test_insufficient_credit_leaves_balance_and_no_record() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let platform = MockPlatform::success("mastodon");
    let service = service(&temp_dir, platform.clone()).await?;
    let campaign = campaign(&service, 5).await?;

    service.scheduler().tick(unix_now()).await?;
    let job = service.queue().claim_next(unix_now()).await?.unwrap();
    let outcome = service.executor().execute(job.clone()).await;

    assert_eq!(
        outcome,
        JobOutcome::Dead {
            reason: DEAD_INSUFFICIENT_CREDIT.to_string()
        }
    );
    assert_eq!(service.ledger().balance("acct-1").await?, 5);
    assert!(service.db().list_post_records(&campaign.id, 10).await?.is_empty());
    assert_eq!(platform.publish_calls(), 0);

    let stored = service.queue().get(&job.id).await?.unwrap();
    assert_eq!(stored.state, JobState::Dead);
    assert_eq!(stored.dead_reason.as_deref(), Some(DEAD_INSUFFICIENT_CREDIT));
    Ok(())
}

#[tokio::test]
async fn test_failures_back_off_then_die() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let service = service(&temp_dir, MockPlatform::failing("mastodon", "refused")).await?;
    campaign(&service, 100).await?;

    let executor = service.executor().as_ref().clone().with_retry_policy(RetryPolicy {
        base_secs: 30,
        max_secs: 3600,
        jitter_ratio: 0.5,
    });

    service.scheduler().tick(unix_now()).await?;
    let job = service.queue().claim_next(unix_now()).await?.unwrap();
    let job_id = job.id.clone();

    let mut delays = Vec::new();
    let mut current = job;
    loop {
        let started = unix_now();
        match executor.execute(current.clone()).await {
            JobOutcome::Retrying { next_run_at, .. } => {
                delays.push(next_run_at - started);
                // Skip the wait: take the job directly regardless of due time
                assert!(service.queue().claim(&job_id, unix_now()).await?);
                current = service.queue().get(&job_id).await?.unwrap();
            }
            JobOutcome::Dead { reason } => {
                assert_eq!(reason, DEAD_RETRIES_EXHAUSTED);
                break;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // max_attempts = 3: two retries, then dead
    assert_eq!(delays.len(), 2);
    assert!(delays[0] >= 30 && delays[0] < 46, "first delay {}", delays[0]);
    assert!(delays[1] >= 60, "second delay {}", delays[1]);
    assert!(delays[1] > delays[0]);

    let stored = service.queue().get(&job_id).await?.unwrap();
    assert_eq!(stored.state, JobState::Dead);
    assert_eq!(stored.attempts, 3);
    assert!(stored.last_error.unwrap().contains("refused"));

    let record = service.db().get_post_record_for_job(&job_id).await?.unwrap();
    assert_eq!(record.status, PostStatus::Failed);

    // Nothing was charged and nothing is still held
    assert_eq!(service.ledger().balance("acct-1").await?, 100);
    assert_eq!(service.ledger().spendable("acct-1").await?, 100);
    Ok(())
}

#[tokio::test]
async fn test_flaky_platform_succeeds_on_retry() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let platform = MockPlatform::flaky("mastodon", 1);
    let service = service(&temp_dir, platform.clone()).await?;
    campaign(&service, 100).await?;

    service.scheduler().tick(unix_now()).await?;
    let job = service.queue().claim_next(unix_now()).await?.unwrap();
    let job_id = job.id.clone();

    assert!(matches!(
        service.executor().execute(job).await,
        JobOutcome::Retrying { attempts: 1, .. }
    ));

    assert!(service.queue().claim(&job_id, unix_now()).await?);
    let job = service.queue().get(&job_id).await?.unwrap();
    assert!(matches!(
        service.executor().execute(job).await,
        JobOutcome::Succeeded { .. }
    ));

    assert_eq!(platform.publish_calls(), 2);
    assert_eq!(service.ledger().balance("acct-1").await?, 80);
    Ok(())
}

#[tokio::test]
async fn test_manual_run_through_worker_pool() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let platform = MockPlatform::success("mastodon");
    let service = service(&temp_dir, platform.clone()).await?;
    let campaign = campaign(&service, 100).await?;

    let job_id = service
        .scheduler()
        .run_now(&campaign.id, None, unix_now())
        .await?;

    let pool = WorkerPool::spawn(service.executor(), 2, 4);
    let token = CancellationToken::new();
    let dispatcher = tokio::spawn(
        pool.dispatcher(service.queue().clone(), Duration::from_millis(10))
            .run(token.clone()),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = service.queue().get(&job_id).await?.unwrap();
        if job.state.is_terminal() {
            assert_eq!(job.state, JobState::Succeeded);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    token.cancel();
    dispatcher.await?;
    pool.shutdown().await;

    assert_eq!(service.ledger().balance("acct-1").await?, 80);
    assert_eq!(platform.publish_calls(), 1);
    Ok(())
}
