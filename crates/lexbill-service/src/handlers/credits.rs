//! Credit balance and transaction handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use lexbill_core::{BalanceSnapshot, CreditTransaction, CreditType, PlanLabel, TransactionType};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Largest page the transaction list returns.
const MAX_PAGE: usize = 100;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Owner.
    pub user_id: String,
    /// Remaining chat credits.
    pub chat_credits: u64,
    /// Remaining quiz-generation credits.
    pub quiz_gen_credits: u64,
    /// Shared expiry (RFC 3339), if any.
    pub expires_at: Option<String>,
    /// Whether the credits have expired.
    pub expired: bool,
    /// Derived plan label.
    pub plan: PlanLabel,
}

impl From<BalanceSnapshot> for BalanceResponse {
    fn from(balance: BalanceSnapshot) -> Self {
        Self {
            user_id: balance.user_id.to_string(),
            chat_credits: balance.chat_credits,
            quiz_gen_credits: balance.quiz_gen_credits,
            expires_at: balance.expires_at.map(|t| t.to_rfc3339()),
            expired: balance.expired,
            plan: balance.plan,
        }
    }
}

/// Get current credit balance.
///
/// A first call provisions the balance with the welcome bonus.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.ledger.get_balance(&auth.user_id)?;
    Ok(Json(balance.into()))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Transaction type.
    pub transaction_type: TransactionType,
    /// Which balance moved.
    pub credit_type: CreditType,
    /// Signed amount (positive = credit, negative = debit).
    pub amount: i64,
    /// Balance of `credit_type` after this transaction.
    pub balance_after: u64,
    /// Description.
    pub description: String,
    /// Related reservation, order code or admin.
    pub reference: Option<String>,
    /// Timestamp.
    pub created_at: String,
}

impl From<&CreditTransaction> for TransactionResponse {
    fn from(tx: &CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            transaction_type: tx.transaction_type,
            credit_type: tx.credit_type,
            amount: tx.amount,
            balance_after: tx.balance_after,
            description: tx.description.clone(),
            reference: tx.reference.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    // Fetch one more than requested to determine has_more
    let limit = query.limit.min(MAX_PAGE);
    let transactions = state
        .ledger
        .list_transactions(&auth.user_id, limit + 1, query.offset)?;

    let has_more = transactions.len() > limit;
    let transactions: Vec<_> = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}
