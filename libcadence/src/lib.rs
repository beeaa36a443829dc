//! Cadence - automated publishing core
//!
//! Decides which campaigns are due, queues one job per action, pays for each
//! publish out of a credit ledger and publishes through pluggable platform
//! adapters. Credits are reserved before a publish and charged only after it
//! succeeds, so a failed or abandoned attempt never costs anything.

pub mod admission;
pub mod config;
pub mod content;
pub mod db;
pub mod decision;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CadenceError, Result};
pub use ledger::Ledger;
pub use queue::{JobOutcome, JobQueue};
pub use scheduler::{Scheduler, TickReport};
pub use service::CadenceService;
pub use types::{Campaign, Job, JobState, PostRecord, PostStatus};
