//! Worker pool and dispatcher
//!
//! The dispatcher is the only component that claims jobs. It waits for room
//! in the bounded submission channel before claiming, so a job is never moved
//! to `running` without a worker slot ready to take it. Workers share the
//! receiving end and each sends the job's outcome back on its own oneshot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::queue::{Executor, JobOutcome, JobQueue};
use crate::types::{unix_now, Job};

/// A claimed job on its way to a worker
#[derive(Debug)]
pub struct Submission {
    pub job: Job,
    pub reply: oneshot::Sender<JobOutcome>,
}

pub struct WorkerPool {
    sender: mpsc::Sender<Submission>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing one submission channel of `capacity` slots
    pub fn spawn(executor: Arc<Executor>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let executor = Arc::clone(&executor);
                tokio::spawn(worker_loop(worker_id, receiver, executor))
            })
            .collect();

        Self { sender, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hand a claimed job to the pool; the receiver resolves with its outcome
    pub async fn submit(&self, job: Job) -> Result<oneshot::Receiver<JobOutcome>, QueueError> {
        let (reply, outcome) = oneshot::channel();
        let job_id = job.id.clone();
        self.sender
            .send(Submission { job, reply })
            .await
            .map_err(|_| QueueError::PoolClosed(job_id))?;
        Ok(outcome)
    }

    pub fn dispatcher(&self, queue: JobQueue, poll_interval: Duration) -> Dispatcher {
        Dispatcher {
            queue,
            sender: self.sender.clone(),
            poll_interval,
        }
    }

    /// Stop accepting work and wait for every worker to finish what it holds
    pub async fn shutdown(self) {
        drop(self.sender);
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool drained");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Submission>>>,
    executor: Arc<Executor>,
) {
    debug!(worker_id, "Worker started");
    loop {
        let submission = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(Submission { job, reply }) = submission else {
            break;
        };

        let job_id = job.id.clone();
        let outcome = executor.execute(job).await;
        match &outcome {
            JobOutcome::Succeeded { external_post_id } => {
                info!(worker_id, %job_id, %external_post_id, "Job finished")
            }
            JobOutcome::Retrying { attempts, next_run_at, error } => {
                warn!(worker_id, %job_id, attempts, next_run_at, "Job will retry: {}", error)
            }
            JobOutcome::Dead { reason } => warn!(worker_id, %job_id, reason, "Job dead"),
            JobOutcome::Fatal { error } => error!(worker_id, %job_id, "Job needs attention: {}", error),
        }
        // Nobody may be waiting for the result
        let _ = reply.send(outcome);
    }
    debug!(worker_id, "Worker stopped");
}

/// Polls the queue and feeds due jobs to the pool
pub struct Dispatcher {
    queue: JobQueue,
    sender: mpsc::Sender<Submission>,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Run until `token` is cancelled. Jobs already submitted keep running.
    pub async fn run(self, token: CancellationToken) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Dispatcher started");

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.sender.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim_next(unix_now()).await {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, attempts = job.attempts, "Dispatching job");
                    let (reply, _outcome) = oneshot::channel();
                    permit.send(Submission { job, reply });
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to claim next job: {}", e),
            }
            drop(permit);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::content::TemplateGenerator;
    use crate::db::Database;
    use crate::decision::CandidateAction;
    use crate::ledger::Ledger;
    use crate::platforms::mock::MockPlatform;
    use crate::platforms::PlatformRegistry;
    use crate::types::{Campaign, JobState};

    async fn setup(platform: MockPlatform) -> (JobQueue, Arc<Executor>, Campaign) {
        let db = Database::in_memory().await.unwrap();
        let config = Config::default_config();
        let ledger = Ledger::new(db.clone(), &config.ledger);
        ledger.open_account("acct", 1_000, unix_now()).await.unwrap();

        let campaign = Campaign::new("acct", "pool", vec!["mastodon".to_string()], 60)
            .with_content("pooled");
        db.create_campaign(&campaign).await.unwrap();

        let queue = JobQueue::new(db, 3);
        let executor = Executor::new(
            ledger,
            queue.clone(),
            PlatformRegistry::new().with(Arc::new(platform)),
            Arc::new(TemplateGenerator::new()),
            &config,
            CancellationToken::new(),
        );
        (queue, Arc::new(executor), campaign)
    }

    fn candidate(campaign: &Campaign, key: &str) -> CandidateAction {
        CandidateAction {
            campaign_id: campaign.id.clone(),
            account_id: campaign.account_id.clone(),
            platform: "mastodon".to_string(),
            estimated_cost: 10,
            score: 1,
            content: campaign.content.clone(),
            prompt: None,
            occurrence: 0,
            dedupe_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_outcome() {
        let (queue, executor, campaign) = setup(MockPlatform::success("mastodon")).await;
        queue.enqueue(&candidate(&campaign, "k"), unix_now()).await.unwrap();
        let job = queue.claim_next(unix_now()).await.unwrap().unwrap();

        let pool = WorkerPool::spawn(executor, 2, 4);
        let outcome = pool.submit(job).await.unwrap().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatcher_drains_due_jobs() {
        let platform = MockPlatform::success("mastodon");
        let (queue, executor, campaign) = setup(platform.clone()).await;
        for key in ["a", "b", "c"] {
            queue.enqueue(&candidate(&campaign, key), unix_now()).await.unwrap();
        }

        let pool = WorkerPool::spawn(executor, 2, 2);
        let token = CancellationToken::new();
        let dispatcher = tokio::spawn(
            pool.dispatcher(queue.clone(), Duration::from_millis(10))
                .run(token.clone()),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().await.unwrap().succeeded < 3 {
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        dispatcher.await.unwrap();
        pool.shutdown().await;

        assert_eq!(platform.publish_calls(), 3);
        let jobs = queue.list(Some(JobState::Succeeded), 10).await.unwrap();
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_cancel_when_idle() {
        let (queue, executor, _) = setup(MockPlatform::success("mastodon")).await;
        let pool = WorkerPool::spawn(executor, 1, 1);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            pool.dispatcher(queue, Duration::from_secs(60))
                .run(token.clone()),
        );

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop promptly")
            .unwrap();
        pool.shutdown().await;
    }
}
