//! Admission control for the HTTP triggers
//!
//! Sliding-log limiter: each admitted request leaves a row in
//! `admission_events`, and a request is admitted only while fewer than
//! `limit` rows for its subject fall inside the trailing window. The check and
//! the insert are one statement, so concurrent callers cannot overshoot.
//!
//! The limiter fails open: if storage misbehaves the request is admitted and
//! the error is logged. Only an explicit limit hit rejects.

use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::db::Database;
use crate::error::{DbError, Result};

#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    limit: u32,
    window_ms: i64,
}

impl AdmissionLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as i64,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.limit, Duration::from_secs(config.window_secs))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms as u64)
    }

    /// Admit and record one request for `subject`, or reject it
    pub async fn allow(&self, db: &Database, subject: &str, now_ms: i64) -> bool {
        match self.try_admit(db, subject, now_ms).await {
            Ok(admitted) => {
                if !admitted {
                    debug!(subject, limit = self.limit, "Admission rejected");
                }
                admitted
            }
            Err(e) => {
                warn!(subject, "Admission check failed, admitting: {}", e);
                true
            }
        }
    }

    async fn try_admit(&self, db: &Database, subject: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO admission_events (subject, admitted_at_ms)
            SELECT ?1, ?2
            WHERE (
                SELECT COUNT(*) FROM admission_events
                WHERE subject = ?1 AND admitted_at_ms > ?2 - ?3 AND admitted_at_ms <= ?2
            ) < ?4
            "#,
        )
        .bind(subject)
        .bind(now_ms)
        .bind(self.window_ms)
        .bind(self.limit as i64)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop events that can no longer affect any decision; returns rows removed
    pub async fn prune(&self, db: &Database, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM admission_events WHERE admitted_at_ms <= ?")
            .bind(now_ms - self.window_ms)
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000;

    async fn setup() -> (Database, AdmissionLimiter) {
        let db = Database::in_memory().await.unwrap();
        (db, AdmissionLimiter::new(5, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_five_of_ten_in_one_second() {
        let (db, limiter) = setup().await;

        let mut admitted = 0;
        for i in 0..10 {
            if limiter.allow(&db, "tick:acct", NOW_MS + i * 100).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (db, limiter) = setup().await;

        for i in 0..5 {
            assert!(limiter.allow(&db, "s", NOW_MS + i * 1_000).await);
        }
        assert!(!limiter.allow(&db, "s", NOW_MS + 59_000).await);

        // First event (NOW_MS) leaves the window at NOW_MS + 60s
        assert!(limiter.allow(&db, "s", NOW_MS + 60_000).await);
        assert!(!limiter.allow(&db, "s", NOW_MS + 60_500).await);
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let (db, limiter) = setup().await;

        for _ in 0..5 {
            assert!(limiter.allow(&db, "tick:a", NOW_MS).await);
        }
        assert!(!limiter.allow(&db, "tick:a", NOW_MS).await);
        assert!(limiter.allow(&db, "tick:b", NOW_MS).await);
        assert!(limiter.allow(&db, "run:a", NOW_MS).await);
    }

    #[tokio::test]
    async fn test_concurrent_callers_cannot_overshoot() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("admission.db").to_str().unwrap())
            .await
            .unwrap();
        let limiter = AdmissionLimiter::new(5, Duration::from_secs(60));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let db = db.clone();
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow(&db, "tick:shared", NOW_MS).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired_events() {
        let (db, limiter) = setup().await;
        limiter.allow(&db, "s", NOW_MS).await;
        limiter.allow(&db, "s", NOW_MS + 30_000).await;

        let removed = limiter.prune(&db, NOW_MS + 61_000).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let (db, limiter) = setup().await;
        sqlx::query("DROP TABLE admission_events")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(limiter.allow(&db, "s", NOW_MS).await);
    }
}
