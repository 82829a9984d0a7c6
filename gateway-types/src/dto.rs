//! Data Transfer Objects (DTOs) for requests, responses and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, Currency, Transaction, TransactionId, TransactionStatus};

// ─────────────────────────────────────────────────────────────────────────────
// Payment DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound payment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Client-supplied token; retries with the same key have at most one effect
    pub idempotency_key: String,
    /// Amount in smallest currency unit
    pub amount: i64,
    pub currency: Currency,
    pub source_account: AccountId,
    pub dest_account: AccountId,
}

/// Result of a payment operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
}

impl From<&Transaction> for PaymentResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            status: tx.status,
        }
    }
}

/// Externally visible view of a transaction. Account identifiers are masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub amount: i64,
    pub currency: Currency,
    pub source_account: String,
    pub dest_account: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionSummary {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            status: tx.status,
            amount: tx.amount.amount(),
            currency: tx.amount.currency(),
            source_account: tx.source_account.masked(),
            dest_account: tx.destination_account.masked(),
            version: tx.version,
            external_reference: tx.external_reference.clone(),
            failure_reason: tx.failure_reason.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciliation DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Settled balance reported by the external processor for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedBalance {
    pub account: AccountId,
    pub currency: Currency,
    pub settled_amount: i64,
}

/// Settlement report fetched from the external processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorReport {
    pub balances: Vec<ReportedBalance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Ledger balance differs from the processor's settled amount.
    BalanceMismatch,
    /// Transaction sat in a non-terminal state past the staleness threshold.
    StaleTransaction,
    /// Running balance disagrees with a full ledger replay.
    BalanceDrift,
}

/// One discrepancy found by reconciliation.
///
/// For `balance_mismatch`, `expected` is the processor amount and `actual` the
/// ledger balance. For `balance_drift`, `expected` is the replayed balance and
/// `actual` the running total. For `stale_transaction`, both are ages in
/// seconds: the threshold and the observed age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub transaction_id: Option<TransactionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,
    pub expected: i64,
    pub actual: i64,
    pub kind: MismatchKind,
}

/// Output of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub mismatches: Vec<Mismatch>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn count(&self, kind: MismatchKind) -> usize {
        self.mismatches.iter().filter(|m| m.kind == kind).count()
    }
}
