//! Credit ledger
//!
//! Every publish is paid for in two steps: `authorize` reserves the cost as a
//! hold, then exactly one of `commit` (charge it), `release` (give it back) or
//! the expiry sweep resolves the hold.
//!
//! The account row carries `held`, the sum of its open holds, so the
//! spendable amount is always `balance - held`. Reservations use an optimistic
//! version check on the account row: a writer that lost the race re-reads and
//! tries again, so two authorizations can never both succeed on the same
//! credits. `credit_transactions` is append-only and is what [`Ledger::reconcile`]
//! checks the balance against.

use rand::Rng;
use serde::Serialize;
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::Database;
use crate::error::LedgerError;
use crate::types::{CreditAccount, CreditHold, CreditTransaction, HoldState, TransactionReason};

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Result of checking an account against its transaction history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub account_id: String,
    pub balance: i64,
    /// Sum of every transaction delta
    pub ledger_sum: i64,
    pub held: i64,
    /// Sum of holds still in `held` state
    pub open_holds_sum: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum && self.held == self.open_holds_sum && self.held <= self.balance
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: Database,
    hold_ttl_secs: i64,
    max_attempts: u32,
}

impl Ledger {
    pub fn new(db: Database, config: &LedgerConfig) -> Self {
        Self {
            db,
            hold_ttl_secs: config.hold_ttl_secs,
            max_attempts: config.max_cas_attempts.max(1),
        }
    }

    pub fn hold_ttl_secs(&self) -> i64 {
        self.hold_ttl_secs
    }

    /// Create an account. An existing account is left untouched.
    pub async fn open_account(
        &self,
        account_id: &str,
        initial_balance: i64,
        now: i64,
    ) -> LedgerResult<CreditAccount> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidAmount(initial_balance));
        }

        let mut tx = self.db.pool().begin().await?;
        let created = sqlx::query(
            r#"
            INSERT INTO credit_accounts (account_id, balance, held, version, updated_at)
            VALUES (?, ?, 0, 0, ?)
            ON CONFLICT(account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(initial_balance)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if created && initial_balance > 0 {
            append_transaction(
                &mut tx,
                account_id,
                initial_balance,
                TransactionReason::Grant,
                None,
                initial_balance,
                Some("opening balance"),
                now,
            )
            .await?;
        }
        tx.commit().await?;

        if created {
            info!(account_id, initial_balance, "Opened credit account");
        }

        self.account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    /// Add credits to an account; returns the new balance
    pub async fn grant(
        &self,
        account_id: &str,
        amount: i64,
        memo: Option<&str>,
        now: i64,
    ) -> LedgerResult<i64> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.db.pool().begin().await?;
        let balance_after: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE credit_accounts
            SET balance = balance + ?1, version = version + 1, updated_at = ?2
            WHERE account_id = ?3
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let balance_after =
            balance_after.ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;

        append_transaction(
            &mut tx,
            account_id,
            amount,
            TransactionReason::Grant,
            None,
            balance_after,
            memo,
            now,
        )
        .await?;
        tx.commit().await?;

        info!(account_id, amount, balance_after, "Granted credits");
        Ok(balance_after)
    }

    /// Reserve `amount` credits and return the hold id
    ///
    /// # Errors
    ///
    /// `InsufficientCredit` when `balance - held < amount`; this is an ordinary
    /// outcome the caller is expected to handle. `Contention` when every
    /// optimistic attempt lost its race, `Storage` when the last one hit a
    /// busy database.
    pub async fn authorize(&self, account_id: &str, amount: i64, now: i64) -> LedgerResult<String> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut last_storage_error = None;
        for attempt in 1..=self.max_attempts {
            let account = match self.account(account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => return Err(LedgerError::AccountNotFound(account_id.to_string())),
                Err(LedgerError::Storage(e)) if is_transient_storage(&e) => {
                    warn!(account_id, attempt, "Transient storage error reading account: {}", e);
                    last_storage_error = Some(e);
                    pause_before_retry(attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if account.spendable() < amount {
                return Err(LedgerError::InsufficientCredit {
                    spendable: account.spendable(),
                    required: amount,
                });
            }

            match self.try_reserve(&account, amount, now).await {
                Ok(Some(hold_id)) => {
                    debug!(account_id, amount, %hold_id, attempt, "Authorized hold");
                    return Ok(hold_id);
                }
                Ok(None) => {
                    debug!(account_id, attempt, "Account version moved, retrying authorize");
                    last_storage_error = None;
                }
                Err(e) if is_transient_storage(&e) => {
                    warn!(account_id, attempt, "Transient storage error on authorize: {}", e);
                    last_storage_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
            pause_before_retry(attempt).await;
        }

        if let Some(e) = last_storage_error {
            return Err(LedgerError::Storage(e));
        }
        Err(LedgerError::Contention {
            account_id: account_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn try_reserve(
        &self,
        account: &CreditAccount,
        amount: i64,
        now: i64,
    ) -> std::result::Result<Option<String>, sqlx::Error> {
        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE credit_accounts
            SET held = held + ?1, version = version + 1, updated_at = ?2
            WHERE account_id = ?3 AND version = ?4 AND balance - held >= ?1
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(&account.account_id)
        .bind(account.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let hold_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO credit_holds (id, account_id, amount, state, created_at, expires_at)
            VALUES (?, ?, ?, 'held', ?, ?)
            "#,
        )
        .bind(&hold_id)
        .bind(&account.account_id)
        .bind(amount)
        .bind(now)
        .bind(now + self.hold_ttl_secs)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(hold_id))
    }

    /// Charge a hold: the balance drops by the held amount and a spend
    /// transaction is appended. Returns the balance after the charge.
    ///
    /// # Errors
    ///
    /// `HoldNotFound` for unknown ids; `HoldAlreadyResolved` when the hold was
    /// committed, released, or has expired (an expired hold is released on the
    /// way out and the caller must authorize again).
    pub async fn commit(&self, hold_id: &str, now: i64) -> LedgerResult<i64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit(hold_id, now).await {
                Err(LedgerError::Storage(e)) if is_transient_storage(&e) && attempt < self.max_attempts => {
                    warn!(hold_id, attempt, "Transient storage error on commit: {}", e);
                    pause_before_retry(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn try_commit(&self, hold_id: &str, now: i64) -> LedgerResult<i64> {
        let mut tx = self.db.pool().begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE credit_holds
            SET state = 'committed', resolved_at = ?1
            WHERE id = ?2 AND state = 'held' AND expires_at > ?1
            RETURNING account_id, amount
            "#,
        )
        .bind(now)
        .bind(hold_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            tx.rollback().await?;
            return Err(self.explain_unresolvable(hold_id, now).await);
        };

        let account_id: String = row.get("account_id");
        let amount: i64 = row.get("amount");

        let balance_after: i64 = sqlx::query_scalar(
            r#"
            UPDATE credit_accounts
            SET balance = balance - ?1, held = held - ?1, version = version + 1, updated_at = ?2
            WHERE account_id = ?3
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(&account_id)
        .fetch_one(&mut *tx)
        .await?;

        append_transaction(
            &mut tx,
            &account_id,
            -amount,
            TransactionReason::Spend,
            Some(hold_id),
            balance_after,
            None,
            now,
        )
        .await?;
        tx.commit().await?;

        debug!(hold_id, %account_id, amount, balance_after, "Committed hold");
        Ok(balance_after)
    }

    /// Work out why a hold could not be committed
    async fn explain_unresolvable(&self, hold_id: &str, now: i64) -> LedgerError {
        let hold = match self.hold(hold_id).await {
            Ok(hold) => hold,
            Err(e) => return e,
        };

        match hold {
            None => LedgerError::HoldNotFound(hold_id.to_string()),
            Some(hold) if hold.state == HoldState::Held => {
                // Still open but past expiry: give the credits back now
                if let Err(e) = self.release_hold(hold_id, now).await {
                    warn!(hold_id, "Failed to release expired hold: {}", e);
                }
                LedgerError::HoldAlreadyResolved {
                    hold_id: hold_id.to_string(),
                    state: "expired".to_string(),
                }
            }
            Some(hold) => LedgerError::HoldAlreadyResolved {
                hold_id: hold_id.to_string(),
                state: hold.state.to_string(),
            },
        }
    }

    /// Return a hold's credits to the spendable pool
    ///
    /// Releasing an already-released hold is a no-op. Releasing a committed
    /// hold fails with `HoldAlreadyResolved`.
    pub async fn release(&self, hold_id: &str, now: i64) -> LedgerResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.release_hold(hold_id, now).await {
                Ok(_) => return Ok(()),
                Err(LedgerError::Storage(e)) if is_transient_storage(&e) && attempt < self.max_attempts => {
                    warn!(hold_id, attempt, "Transient storage error on release: {}", e);
                    pause_before_retry(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns true when this call moved the hold out of `held`
    async fn release_hold(&self, hold_id: &str, now: i64) -> LedgerResult<bool> {
        let mut tx = self.db.pool().begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE credit_holds
            SET state = 'released', resolved_at = ?1
            WHERE id = ?2 AND state = 'held'
            RETURNING account_id, amount
            "#,
        )
        .bind(now)
        .bind(hold_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = released else {
            tx.rollback().await?;
            return match self.hold(hold_id).await? {
                None => Err(LedgerError::HoldNotFound(hold_id.to_string())),
                Some(hold) if hold.state == HoldState::Released => Ok(false),
                Some(hold) => Err(LedgerError::HoldAlreadyResolved {
                    hold_id: hold_id.to_string(),
                    state: hold.state.to_string(),
                }),
            };
        };

        let account_id: String = row.get("account_id");
        let amount: i64 = row.get("amount");

        sqlx::query(
            r#"
            UPDATE credit_accounts
            SET held = held - ?1, version = version + 1, updated_at = ?2
            WHERE account_id = ?3
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(&account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(hold_id, %account_id, amount, "Released hold");
        Ok(true)
    }

    /// Release every hold whose expiry has passed; returns how many were released
    pub async fn expire(&self, now: i64) -> LedgerResult<usize> {
        let expired: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM credit_holds WHERE state = 'held' AND expires_at <= ? ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        let mut released = 0;
        for hold_id in &expired {
            match self.release_hold(hold_id, now).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                // Resolved by its owner between the scan and now
                Err(LedgerError::HoldAlreadyResolved { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if released > 0 {
            info!(released, "Released expired credit holds");
        }
        Ok(released)
    }

    pub async fn account(&self, account_id: &str) -> LedgerResult<Option<CreditAccount>> {
        let row = sqlx::query(
            "SELECT account_id, balance, held, version, updated_at FROM credit_accounts WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| CreditAccount {
            account_id: r.get("account_id"),
            balance: r.get("balance"),
            held: r.get("held"),
            version: r.get("version"),
            updated_at: r.get("updated_at"),
        }))
    }

    pub async fn balance(&self, account_id: &str) -> LedgerResult<i64> {
        self.account(account_id)
            .await?
            .map(|a| a.balance)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn spendable(&self, account_id: &str) -> LedgerResult<i64> {
        self.account(account_id)
            .await?
            .map(|a| a.spendable())
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn hold(&self, hold_id: &str) -> LedgerResult<Option<CreditHold>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, state, created_at, expires_at, resolved_at
            FROM credit_holds WHERE id = ?
            "#,
        )
        .bind(hold_id)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let state: String = r.get("state");
        let state = HoldState::from_str(&state).map_err(decode_error)?;

        Ok(Some(CreditHold {
            id: r.get("id"),
            account_id: r.get("account_id"),
            amount: r.get("amount"),
            state,
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
            resolved_at: r.get("resolved_at"),
        }))
    }

    /// Most recent transactions first
    pub async fn transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, delta, reason, hold_id, balance_after, memo, created_at
            FROM credit_transactions
            WHERE account_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|r| {
                let reason: String = r.get("reason");
                let reason = TransactionReason::from_str(&reason).map_err(decode_error)?;
                Ok(CreditTransaction {
                    id: r.get("id"),
                    account_id: r.get("account_id"),
                    delta: r.get("delta"),
                    reason,
                    hold_id: r.get("hold_id"),
                    balance_after: r.get("balance_after"),
                    memo: r.get("memo"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    /// Compare the account row with the transaction log and open holds
    pub async fn reconcile(&self, account_id: &str) -> LedgerResult<Reconciliation> {
        let account = self
            .account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;

        let ledger_sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(delta), 0) FROM credit_transactions WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_one(self.db.pool())
        .await?;

        let open_holds_sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_holds WHERE account_id = ? AND state = 'held'",
        )
        .bind(account_id)
        .fetch_one(self.db.pool())
        .await?;

        let report = Reconciliation {
            account_id: account_id.to_string(),
            balance: account.balance,
            ledger_sum,
            held: account.held,
            open_holds_sum,
        };
        if !report.is_consistent() {
            warn!(?report, "Ledger reconciliation mismatch");
        }
        Ok(report)
    }
}

#[allow(clippy::too_many_arguments)]
async fn append_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    account_id: &str,
    delta: i64,
    reason: TransactionReason,
    hold_id: Option<&str>,
    balance_after: i64,
    memo: Option<&str>,
    now: i64,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO credit_transactions
            (account_id, delta, reason, hold_id, balance_after, memo, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(account_id)
    .bind(delta)
    .bind(reason.as_str())
    .bind(hold_id)
    .bind(balance_after)
    .bind(memo)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn decode_error(reason: String) -> LedgerError {
    LedgerError::Storage(sqlx::Error::Decode(reason.into()))
}

/// SQLITE_BUSY / SQLITE_LOCKED (any extended code) and pool exhaustion
pub(crate) fn is_transient_storage(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

async fn pause_before_retry(attempt: u32) {
    let spread = 2_u64.saturating_pow(attempt.min(6));
    let millis = rand::thread_rng().gen_range(1..=spread);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
