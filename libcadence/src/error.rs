//! Error types for Cadence

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Content generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Campaign is disabled: {0}")]
    CampaignInactive(String),

    #[error("Platform unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_) | CadenceError::CampaignNotFound(_) => 3,
            CadenceError::Config(_) | CadenceError::Database(_) => 2,
            CadenceError::Ledger(LedgerError::Storage(_)) => 2,
            _ => 1,
        }
    }

    /// True when the failure is an ordinary "not enough credit" outcome
    pub fn is_insufficient_credit(&self) -> bool {
        matches!(
            self,
            CadenceError::Ledger(LedgerError::InsufficientCredit { .. })
        )
    }
}

impl From<sqlx::Error> for CadenceError {
    fn from(err: sqlx::Error) -> Self {
        CadenceError::Database(DbError::SqlxError(err))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Publish timed out after {0}s")]
    Timeout(u64),
}

impl PlatformError {
    /// Network hiccups, throttling and timeouts are expected to clear on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Network(_) | PlatformError::RateLimit(_) | PlatformError::Timeout(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient credit: spendable={spendable}, required={required}")]
    InsufficientCredit { spendable: i64, required: i64 },

    #[error("Credit account not found: {0}")]
    AccountNotFound(String),

    #[error("Hold not found: {0}")]
    HoldNotFound(String),

    #[error("Hold {hold_id} already resolved ({state})")]
    HoldAlreadyResolved { hold_id: String, state: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Gave up on account {account_id} after {attempts} conflicting updates")]
    Contention { account_id: String, attempts: u32 },

    #[error("Ledger storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Worker pool closed before job {0} could be submitted")]
    PoolClosed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generation timed out after {0}s")]
    Timeout(u64),

    #[error("generation cancelled")]
    Cancelled,
}
