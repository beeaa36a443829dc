//! Credit balance and transaction history.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use libcadence::types::{CreditTransaction, TransactionReason};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub id: i64,
    pub delta: i64,
    pub reason: TransactionReason,
    pub hold_id: Option<String>,
    pub balance_after: i64,
    pub memo: Option<String>,
    pub created_at: i64,
}

impl From<CreditTransaction> for TransactionResponse {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            id: tx.id,
            delta: tx.delta,
            reason: tx.reason,
            hold_id: tx.hold_id,
            balance_after: tx.balance_after,
            memo: tx.memo,
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub account_id: String,
    pub balance: i64,
    pub held: i64,
    pub spendable: i64,
    /// Newest first
    pub transactions: Vec<TransactionResponse>,
}

/// Balance, open holds and recent transactions for one account.
pub async fn get_credits(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<CreditsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let ledger = state.service.ledger();

    let account = ledger
        .account(&account_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("credit account {account_id}")))?;
    let transactions = ledger.transactions(&account_id, limit).await?;

    Ok(Json(CreditsResponse {
        spendable: account.spendable(),
        account_id: account.account_id,
        balance: account.balance,
        held: account.held,
        transactions: transactions.into_iter().map(Into::into).collect(),
    }))
}
