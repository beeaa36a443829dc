//! Service facade
//!
//! Wires the database, ledger, queue, decision engine and executor together
//! from one [`Config`], so binaries and tests build the whole core with a
//! single call and share the same instances.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcadence::config::Config;
//! use libcadence::content::TemplateGenerator;
//! use libcadence::platforms::PlatformRegistry;
//! use libcadence::service::CadenceService;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> libcadence::Result<()> {
//! let config = Config::load()?;
//! let platforms = PlatformRegistry::dry_run(&config.platforms.enabled);
//! let service = CadenceService::open(
//!     config,
//!     platforms,
//!     Arc::new(TemplateGenerator::new()),
//!     CancellationToken::new(),
//! )
//! .await?;
//!
//! let report = service.scheduler().tick(libcadence::types::unix_now()).await?;
//! println!("queued {} jobs", report.processed);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionLimiter;
use crate::config::Config;
use crate::content::ContentGenerator;
use crate::db::Database;
use crate::decision::{CostTable, DecisionEngine};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::platforms::PlatformRegistry;
use crate::queue::{Executor, JobQueue};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct CadenceService {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    queue: JobQueue,
    scheduler: Scheduler,
    executor: Arc<Executor>,
    admission: AdmissionLimiter,
    platforms: PlatformRegistry,
}

impl CadenceService {
    /// Open the configured database and build every component on top of it
    pub async fn open(
        config: Config,
        platforms: PlatformRegistry,
        generator: Arc<dyn ContentGenerator>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        Ok(Self::with_database(db, config, platforms, generator, shutdown))
    }

    pub fn with_database(
        db: Database,
        config: Config,
        platforms: PlatformRegistry,
        generator: Arc<dyn ContentGenerator>,
        shutdown: CancellationToken,
    ) -> Self {
        let ledger = Ledger::new(db.clone(), &config.ledger);
        let queue = JobQueue::new(db.clone(), config.queue.max_attempts);

        let engine = Arc::new(DecisionEngine::new(
            CostTable::from_config(&config.costs),
            platforms.available().into_iter().collect(),
        ));
        let scheduler = Scheduler::new(
            db.clone(),
            engine,
            queue.clone(),
            ledger.clone(),
            config.queue.lookback_secs,
        );
        let executor = Arc::new(Executor::new(
            ledger.clone(),
            queue.clone(),
            platforms.clone(),
            generator,
            &config,
            shutdown,
        ));

        Self {
            admission: AdmissionLimiter::from_config(&config.admission),
            config: Arc::new(config),
            db,
            ledger,
            queue,
            scheduler,
            executor,
            platforms,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> Arc<Executor> {
        Arc::clone(&self.executor)
    }

    pub fn admission(&self) -> &AdmissionLimiter {
        &self.admission
    }

    pub fn platforms(&self) -> &PlatformRegistry {
        &self.platforms
    }
}
