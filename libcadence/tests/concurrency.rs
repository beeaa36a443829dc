//! Races against a shared file-backed database
//!
//! In-memory databases use a single connection, which would serialize these
//! tests; a temp file gives every task its own connection.

use anyhow::Result;
use futures::future::join_all;
use libcadence::config::{Config, LedgerConfig};
use libcadence::content::TemplateGenerator;
use libcadence::decision::CandidateAction;
use libcadence::error::LedgerError;
use libcadence::platforms::mock::MockPlatform;
use libcadence::platforms::PlatformRegistry;
use libcadence::queue::Executor;
use libcadence::types::{unix_now, Campaign, JobState, TransactionReason};
use libcadence::{Database, JobOutcome, JobQueue, Ledger};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

async fn file_db(temp_dir: &TempDir) -> Result<Database> {
    let path = temp_dir.path().join("race.db");
    Ok(Database::new(&path.to_string_lossy()).await?)
}

fn patient_ledger(db: &Database) -> Ledger {
    Ledger::new(
        db.clone(),
        &LedgerConfig {
            max_cas_attempts: 64,
            ..LedgerConfig::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_authorize_never_oversubscribes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db = file_db(&temp_dir).await?;
    let ledger = patient_ledger(&db);
    ledger.open_account("acct", 100, unix_now()).await?;

    let attempts = (0..25).map(|_| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.authorize("acct", 10, unix_now()).await })
    });

    let mut granted = 0;
    let mut refused = 0;
    for result in join_all(attempts).await {
        match result? {
            Ok(_) => granted += 1,
            Err(LedgerError::InsufficientCredit { .. }) => refused += 1,
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }

    assert_eq!(granted, 10);
    assert_eq!(refused, 15);
    assert_eq!(ledger.spendable("acct").await?, 0);
    assert_eq!(ledger.balance("acct").await?, 100);
    assert!(ledger.reconcile("acct").await?.is_consistent());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commit_and_release_resolve_each_hold_once() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db = file_db(&temp_dir).await?;
    let ledger = patient_ledger(&db);
    ledger.open_account("acct", 100, unix_now()).await?;

    let mut holds = Vec::new();
    for _ in 0..10 {
        holds.push(ledger.authorize("acct", 10, unix_now()).await?);
    }

    // Every hold gets two commits and a release racing each other
    let mut tasks = Vec::new();
    for hold_id in &holds {
        for action in ["commit", "commit", "release"] {
            let ledger = ledger.clone();
            let hold_id = hold_id.clone();
            tasks.push(tokio::spawn(async move {
                match action {
                    "commit" => ledger.commit(&hold_id, unix_now()).await.map(|_| ()),
                    _ => ledger.release(&hold_id, unix_now()).await,
                }
            }));
        }
    }
    for result in join_all(tasks).await {
        match result? {
            Ok(()) | Err(LedgerError::HoldAlreadyResolved { .. }) => {}
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }

    let spends = ledger
        .transactions("acct", 100)
        .await?
        .into_iter()
        .filter(|t| t.reason == TransactionReason::Spend)
        .count() as i64;

    let report = ledger.reconcile("acct").await?;
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(report.held, 0);
    assert_eq!(report.balance, 100 - 10 * spends);
    Ok(())
}

/// One task's share of a round: random grants, authorizations, commits and
/// releases, drawing holds from a pool every task can see
async fn random_ledger_ops(
    ledger: Ledger,
    holds: Arc<Mutex<Vec<String>>>,
    seed: u64,
    ops: usize,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..ops {
        let roll = rng.gen_range(0..10);
        let result = match roll {
            0..=4 => {
                let amount = rng.gen_range(1..=40);
                let authorized = ledger.authorize("acct", amount, unix_now()).await;
                if let Ok(hold_id) = &authorized {
                    holds.lock().await.push(hold_id.clone());
                }
                authorized.map(|_| ())
            }
            5..=8 => {
                // Another task may resolve the same hold concurrently
                let picked = {
                    let holds = holds.lock().await;
                    (!holds.is_empty()).then(|| holds[rng.gen_range(0..holds.len())].clone())
                };
                match picked {
                    Some(hold_id) if roll <= 6 => ledger.commit(&hold_id, unix_now()).await.map(|_| ()),
                    Some(hold_id) => ledger.release(&hold_id, unix_now()).await,
                    None => Ok(()),
                }
            }
            _ => {
                let amount = rng.gen_range(1..=20);
                ledger.grant("acct", amount, None, unix_now()).await.map(|_| ())
            }
        };

        match result {
            Ok(())
            | Err(LedgerError::InsufficientCredit { .. })
            | Err(LedgerError::HoldAlreadyResolved { .. })
            | Err(LedgerError::Contention { .. }) => {}
            Err(e) => panic!("unexpected ledger error (seed {}): {}", seed, e),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_interleavings_keep_ledger_consistent() -> Result<()> {
    const SEED: u64 = 0x00C4_DE11;
    const ROUNDS: u64 = 20;
    const TASKS: u64 = 6;
    const OPS_PER_TASK: usize = 15;

    let temp_dir = TempDir::new()?;
    let db = file_db(&temp_dir).await?;
    let ledger = patient_ledger(&db);
    ledger.open_account("acct", 200, unix_now()).await?;
    let holds = Arc::new(Mutex::new(Vec::new()));

    for round in 0..ROUNDS {
        let tasks = (0..TASKS).map(|task| {
            let seed = SEED ^ (round * TASKS + task);
            tokio::spawn(random_ledger_ops(
                ledger.clone(),
                Arc::clone(&holds),
                seed,
                OPS_PER_TASK,
            ))
        });
        for result in join_all(tasks).await {
            result??;
        }

        let report = ledger.reconcile("acct").await?;
        assert!(report.is_consistent(), "round {}: {:?}", round, report);
        assert!(report.held <= report.balance, "round {}: {:?}", round, report);
        assert!(report.balance >= 0, "round {}: {:?}", round, report);
    }

    // Releasing whatever is still open brings held back to zero
    for hold_id in holds.lock().await.iter() {
        match ledger.release(hold_id, unix_now()).await {
            Ok(()) | Err(LedgerError::HoldAlreadyResolved { .. }) => {}
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }
    let report = ledger.reconcile("acct").await?;
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(report.held, 0);
    assert_eq!(ledger.spendable("acct").await?, report.balance);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claimants_publish_each_job_once() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db = file_db(&temp_dir).await?;
    let config = Config::default_config();
    let ledger = patient_ledger(&db);
    ledger.open_account("acct", 1_000, unix_now()).await?;

    let campaign = Campaign::new("acct", "race", vec!["mastodon".to_string()], 60)
        .with_content("only once");
    db.create_campaign(&campaign).await?;

    let queue = JobQueue::new(db.clone(), 3);
    for i in 0..3 {
        let candidate = CandidateAction {
            campaign_id: campaign.id.clone(),
            account_id: "acct".to_string(),
            platform: "mastodon".to_string(),
            estimated_cost: 20,
            score: 1,
            content: campaign.content.clone(),
            prompt: None,
            occurrence: i,
            dedupe_key: format!("race-{}", i),
        };
        queue.enqueue(&candidate, unix_now()).await?;
    }

    let platform = MockPlatform::success("mastodon");
    let executor = Arc::new(Executor::new(
        ledger.clone(),
        queue.clone(),
        PlatformRegistry::new().with(Arc::new(platform.clone())),
        Arc::new(TemplateGenerator::new()),
        &config,
        CancellationToken::new(),
    ));

    // Eight claimants drain three jobs
    let claimants = (0..8).map(|_| {
        let queue = queue.clone();
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            while let Some(job) = queue.claim_next(unix_now()).await? {
                outcomes.push(executor.execute(job).await);
            }
            anyhow::Ok(outcomes)
        })
    });

    let mut succeeded = 0;
    for result in join_all(claimants).await {
        for outcome in result?? {
            assert!(matches!(outcome, JobOutcome::Succeeded { .. }), "{:?}", outcome);
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(platform.publish_calls(), 3);
    assert_eq!(queue.stats().await?.succeeded, 3);
    assert_eq!(ledger.balance("acct").await?, 1_000 - 3 * 20);

    for job in queue.list(None, 10).await? {
        assert_eq!(job.state, JobState::Succeeded);
    }
    Ok(())
}
