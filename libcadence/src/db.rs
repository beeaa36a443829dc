//! Database operations for Cadence
//!
//! Owns the SQLite pool and the campaign / post-record tables. The ledger,
//! queue and admission modules run their own statements against the same
//! pool through [`Database::pool`].

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{Campaign, PostRecord, PostStatus};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database, for tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqlxError)?
            .foreign_keys(true);

        // One connection that never recycles, otherwise the data vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an already configured pool, running migrations on it
    pub(crate) async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a campaign
    pub async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
        let platforms = serde_json::to_string(&campaign.platforms).map_err(|e| DbError::Corrupt {
            table: "campaigns",
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO campaigns
                (id, account_id, name, platforms, cadence_secs, priority, prompt, content,
                 active, last_action_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&campaign.id)
        .bind(&campaign.account_id)
        .bind(&campaign.name)
        .bind(platforms)
        .bind(campaign.cadence_secs)
        .bind(campaign.priority)
        .bind(&campaign.prompt)
        .bind(&campaign.content)
        .bind(campaign.active)
        .bind(campaign.last_action_at)
        .bind(campaign.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a campaign by ID
    pub async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, name, platforms, cadence_secs, priority, prompt, content,
                   active, last_action_at, created_at
            FROM campaigns WHERE id = ?
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(campaign_from_row).transpose()
    }

    /// List campaigns ordered by id, optionally only the active ones
    pub async fn list_campaigns(&self, active_only: bool) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, name, platforms, cadence_secs, priority, prompt, content,
                   active, last_action_at, created_at
            FROM campaigns
            WHERE (? = 0 OR active = 1)
            ORDER BY id ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(campaign_from_row).collect()
    }

    /// Enable or soft-disable a campaign. Returns false if it does not exist.
    pub async fn set_campaign_active(&self, campaign_id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE campaigns SET active = ? WHERE id = ?")
            .bind(active)
            .bind(campaign_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move `last_action_at` forward; an older timestamp never overwrites a newer one
    pub async fn touch_campaign(&self, campaign_id: &str, at: i64) -> Result<()> {
        sqlx::query(TOUCH_CAMPAIGN)
            .bind(at)
            .bind(campaign_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Posted records with `posted_at >= since`, newest first
    pub async fn recent_posts(&self, since: i64) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, campaign_id, platform, content, status, external_post_id,
                   posted_at, error, created_at
            FROM post_records
            WHERE status = 'posted' AND posted_at >= ?
            ORDER BY posted_at DESC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_record_from_row).collect()
    }

    /// The post record created for a job, if the job ever reached publishing
    pub async fn get_post_record_for_job(&self, job_id: &str) -> Result<Option<PostRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, campaign_id, platform, content, status, external_post_id,
                   posted_at, error, created_at
            FROM post_records WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_record_from_row).transpose()
    }

    /// Post records of a campaign, newest first
    pub async fn list_post_records(&self, campaign_id: &str, limit: usize) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, campaign_id, platform, content, status, external_post_id,
                   posted_at, error, created_at
            FROM post_records
            WHERE campaign_id = ?
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(campaign_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_record_from_row).collect()
    }
}

pub(crate) const TOUCH_CAMPAIGN: &str = r#"
    UPDATE campaigns
    SET last_action_at = MAX(COALESCE(last_action_at, ?1), ?1)
    WHERE id = ?2
"#;

pub(crate) fn corrupt(table: &'static str, reason: impl ToString) -> DbError {
    DbError::Corrupt {
        table,
        reason: reason.to_string(),
    }
}

fn campaign_from_row(r: &SqliteRow) -> Result<Campaign> {
    let platforms: String = r.get("platforms");
    let platforms: Vec<String> =
        serde_json::from_str(&platforms).map_err(|e| corrupt("campaigns", e))?;

    Ok(Campaign {
        id: r.get("id"),
        account_id: r.get("account_id"),
        name: r.get("name"),
        platforms,
        cadence_secs: r.get("cadence_secs"),
        priority: r.get("priority"),
        prompt: r.get("prompt"),
        content: r.get("content"),
        active: r.get::<i64, _>("active") != 0,
        last_action_at: r.get("last_action_at"),
        created_at: r.get("created_at"),
    })
}

pub(crate) fn post_record_from_row(r: &SqliteRow) -> Result<PostRecord> {
    let status: String = r.get("status");
    Ok(PostRecord {
        id: r.get("id"),
        job_id: r.get("job_id"),
        campaign_id: r.get("campaign_id"),
        platform: r.get("platform"),
        content: r.get("content"),
        status: PostStatus::from_str(&status).map_err(|e| corrupt("post_records", e))?,
        external_post_id: r.get("external_post_id"),
        posted_at: r.get("posted_at"),
        error: r.get("error"),
        created_at: r.get("created_at"),
    })
}
