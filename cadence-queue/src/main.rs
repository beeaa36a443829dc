//! cadence-queue - Inspect and manage publishing jobs
//!
//! Unix-style tool for operators working with the Cadence job queue.

use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::queue::QueueStats;
use libcadence::types::{unix_now, Job, JobState};
use libcadence::error::QueueError;
use libcadence::types::{HoldState, PostStatus};
use libcadence::{CadenceError, Config, Database, JobQueue, Ledger, Result};

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Inspect and manage publishing jobs")]
#[command(long_about = "\
cadence-queue - Inspect and manage publishing jobs

DESCRIPTION:
    cadence-queue is a Unix-style tool for operators of the Cadence job queue.
    Use it to list jobs, look at one job in detail, cancel a job before a
    worker picks it up, give a dead job a fresh set of attempts, hand back a
    job stuck in running, or view queue statistics.

COMMANDS:
    list        List jobs in due order
    show        Show one job
    cancel      Cancel a pending job
    revive      Requeue a dead job with fresh attempts
    requeue     Return a stuck running job to the queue
    stats       Show queue statistics

USAGE EXAMPLES:
    # List every job
    cadence-queue list

    # List dead jobs as JSON
    cadence-queue list --state dead --format json

    # Cancel a job that has not started yet
    cadence-queue cancel <JOB_ID>

    # Retry a job that ran out of attempts
    cadence-queue revive <JOB_ID>

    # Recover a job whose worker died
    cadence-queue requeue <JOB_ID>

    # View queue statistics
    cadence-queue stats

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (job not in the required state)
    2 - Database or configuration error
    3 - Invalid input (unknown job, bad state or format)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List jobs
    List {
        /// Only jobs in this state (pending, running, succeeded, failed, dead, cancelled)
        #[arg(short, long)]
        state: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one job
    Show {
        job_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a pending job
    Cancel { job_id: String },

    /// Requeue a dead job with fresh attempts
    Revive { job_id: String },

    /// Return a job stuck in running to the queue, releasing its hold
    Requeue { job_id: String },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, "error".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    tracing::debug!(path = %config.database.path, "Opened queue database");
    let queue = JobQueue::new(db.clone(), config.queue.max_attempts);

    match cli.command {
        Commands::List {
            state,
            limit,
            format,
        } => cmd_list(&queue, state.as_deref(), limit, &format).await,
        Commands::Show { job_id, format } => cmd_show(&queue, &job_id, &format).await,
        Commands::Cancel { job_id } => cmd_cancel(&queue, &job_id).await,
        Commands::Revive { job_id } => cmd_revive(&queue, &job_id).await,
        Commands::Requeue { job_id } => {
            let ledger = Ledger::new(db, &config.ledger);
            cmd_requeue(&queue, &ledger, &job_id).await
        }
        Commands::Stats { format } => cmd_stats(&queue, &format).await,
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CadenceError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CadenceError::InvalidInput(format!("cannot encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

async fn find_job(queue: &JobQueue, job_id: &str) -> Result<Job> {
    queue
        .get(job_id)
        .await?
        .ok_or_else(|| CadenceError::InvalidInput(format!("Job not found: {}", job_id)))
}

/// List jobs
async fn cmd_list(queue: &JobQueue, state: Option<&str>, limit: usize, format: &str) -> Result<()> {
    validate_format(format)?;
    let state = state
        .map(JobState::from_str)
        .transpose()
        .map_err(CadenceError::InvalidInput)?;

    let jobs = queue.list(state, limit).await?;

    if format == "json" {
        return print_json(&jobs);
    }

    let now = unix_now();
    for job in &jobs {
        println!(
            "{} | {} | {} | {} | {}/{} | {}",
            job.id,
            job.state,
            job.platform,
            job.campaign_id,
            job.attempts,
            job.max_attempts,
            describe_due(job, now)
        );
    }
    Ok(())
}

/// Show one job
async fn cmd_show(queue: &JobQueue, job_id: &str, format: &str) -> Result<()> {
    validate_format(format)?;
    let job = find_job(queue, job_id).await?;

    if format == "json" {
        return print_json(&job);
    }

    println!("Job:        {}", job.id);
    println!("State:      {}", job.state);
    println!("Campaign:   {}", job.campaign_id);
    println!("Account:    {}", job.account_id);
    println!("Platform:   {}", job.platform);
    println!("Cost:       {}", job.estimated_cost);
    println!("Attempts:   {}/{}", job.attempts, job.max_attempts);
    println!("Next run:   {}", describe_due(&job, unix_now()));
    println!("Created:    {}", format_timestamp(job.created_at));
    if let Some(hold_id) = &job.hold_id {
        println!("Hold:       {}", hold_id);
    }
    if let Some(error) = &job.last_error {
        println!("Last error: {}", error);
    }
    if let Some(reason) = &job.dead_reason {
        println!("Dead:       {}", reason);
    }
    Ok(())
}

/// Cancel a pending job
async fn cmd_cancel(queue: &JobQueue, job_id: &str) -> Result<()> {
    let job = find_job(queue, job_id).await?;

    if !queue.cancel(&job.id, unix_now()).await? {
        return Err(CadenceError::Queue(QueueError::InvalidTransition {
            job_id: job.id,
            from: job.state.to_string(),
            to: JobState::Cancelled.to_string(),
        }));
    }

    println!("Cancelled job {}", job.id);
    Ok(())
}

/// Requeue a dead job
async fn cmd_revive(queue: &JobQueue, job_id: &str) -> Result<()> {
    let job = find_job(queue, job_id).await?;

    if !queue.revive(&job.id, unix_now()).await? {
        return Err(CadenceError::Queue(QueueError::InvalidTransition {
            job_id: job.id,
            from: job.state.to_string(),
            to: JobState::Pending.to_string(),
        }));
    }

    println!("Revived job {}", job.id);
    Ok(())
}

/// Hand a stuck running job back to the workers
///
/// Refused once the post went out: running it again would publish twice.
async fn cmd_requeue(queue: &JobQueue, ledger: &Ledger, job_id: &str) -> Result<()> {
    let job = find_job(queue, job_id).await?;
    if job.state != JobState::Running {
        return Err(CadenceError::Queue(QueueError::InvalidTransition {
            job_id: job.id,
            from: job.state.to_string(),
            to: JobState::Pending.to_string(),
        }));
    }

    let published = queue
        .database()
        .get_post_record_for_job(&job.id)
        .await?
        .is_some_and(|record| record.status == PostStatus::Posted);
    if published {
        return Err(CadenceError::InvalidInput(format!(
            "Job {} was already published; reconcile it instead of requeueing",
            job.id
        )));
    }

    let now = unix_now();
    if let Some(hold_id) = &job.hold_id {
        match ledger.hold(hold_id).await? {
            Some(hold) if hold.state == HoldState::Committed => {
                return Err(CadenceError::InvalidInput(format!(
                    "Job {} was already charged (hold {}); reconcile it instead of requeueing",
                    job.id, hold_id
                )));
            }
            Some(hold) if hold.state == HoldState::Held => ledger.release(hold_id, now).await?,
            _ => {}
        }
    }

    if !queue.requeue(&job.id, now).await? {
        return Err(CadenceError::Queue(QueueError::InvalidTransition {
            job_id: job.id,
            from: JobState::Running.to_string(),
            to: JobState::Pending.to_string(),
        }));
    }

    println!("Requeued job {}", job.id);
    Ok(())
}

/// Show queue statistics
async fn cmd_stats(queue: &JobQueue, format: &str) -> Result<()> {
    validate_format(format)?;
    let stats = queue.stats().await?;

    if format == "json" {
        return print_json(&stats);
    }

    print_stats_text(&stats, unix_now());
    Ok(())
}

fn print_stats_text(stats: &QueueStats, now: i64) {
    println!("Queue Statistics");
    println!("================");
    println!("Pending:   {}", stats.pending);
    println!("Running:   {}", stats.running);
    println!("Succeeded: {}", stats.succeeded);
    println!("Failed:    {}", stats.failed);
    println!("Dead:      {}", stats.dead);
    println!("Cancelled: {}", stats.cancelled);
    println!("Total: {}", stats.total());

    if let Some(next) = stats.next_due_at {
        println!();
        println!("Next due: {}", format_time_until(now, next));
    }
}

fn describe_due(job: &Job, now: i64) -> String {
    match job.state {
        JobState::Pending => format_time_until(now, job.next_run_at),
        _ => "-".to_string(),
    }
}

/// Human-readable delay until `at`
fn format_time_until(now: i64, at: i64) -> String {
    let diff = at - now;
    if diff <= 0 {
        return "due now".to_string();
    }
    format!(
        "in {}",
        humantime::format_duration(Duration::from_secs(diff as u64))
    )
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
