//! Error types for the payment gateway.
//!
//! Messages carry transaction identifiers and error kinds only. Account
//! identifiers and other payment data never appear in an error payload.

use crate::domain::{Currency, TransactionId, TransactionStatus};

/// Domain-level errors (business rule violations).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("Amount cannot be negative")]
    NegativeAmount,

    #[error("Currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: Currency, got: Currency },

    #[error("Invalid currency code")]
    InvalidCurrency,

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error(
        "Ledger imbalance for transaction {transaction_id} in {currency}: debits {debits}, credits {credits}"
    )]
    LedgerImbalance {
        transaction_id: TransactionId,
        currency: Currency,
        debits: i64,
        credits: i64,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Repository-level errors (data access failures).
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Entity not found")]
    NotFound,

    #[error("Version conflict on transaction {transaction_id}: expected version {expected}")]
    VersionConflict {
        transaction_id: TransactionId,
        expected: i64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Application-level errors, one variant per kind in the gateway error taxonomy.
///
/// Permanent kinds propagate to the caller unchanged; retryable kinds are
/// retried by the lowest layer that can do so safely.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Idempotency key reused with a different payload")]
    IdempotencyConflict,

    #[error("Version conflict on transaction {transaction_id}")]
    VersionConflict { transaction_id: TransactionId },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Ledger imbalance for transaction {transaction_id} in {currency}")]
    LedgerImbalance {
        transaction_id: TransactionId,
        currency: Currency,
    },

    #[error("Transient dependency failure: {0}")]
    TransientDependency(String),

    #[error("Settlement failed for transaction {transaction_id}")]
    SettlementFailed { transaction_id: TransactionId },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Stable machine-readable kind, safe for logs and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::IdempotencyConflict => "idempotency_conflict",
            AppError::VersionConflict { .. } => "version_conflict",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::LedgerImbalance { .. } => "ledger_imbalance",
            AppError::TransientDependency(_) => "transient_dependency",
            AppError::SettlementFailed { .. } => "settlement_failed",
            AppError::NotFound(_) => "not_found",
        }
    }

    /// Whether a caller may retry the same operation with a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::VersionConflict { .. } | AppError::TransientDependency(_)
        )
    }
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => AppError::InvalidTransition { from, to },
            DomainError::LedgerImbalance {
                transaction_id,
                currency,
                ..
            } => AppError::LedgerImbalance {
                transaction_id,
                currency,
            },
            DomainError::ValidationError(msg) => AppError::Validation(msg),
            e => AppError::Validation(e.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Domain(e) => e.into(),
            RepoError::NotFound => AppError::NotFound("Resource not found".into()),
            RepoError::Database(e) => AppError::TransientDependency(e),
            RepoError::Transaction(e) => AppError::TransientDependency(e),
            RepoError::VersionConflict { transaction_id, .. } => {
                AppError::VersionConflict { transaction_id }
            }
            RepoError::Conflict(_) => AppError::IdempotencyConflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_are_transient() {
        let err: AppError = RepoError::Database("connection reset".into()).into();
        assert_eq!(err.kind(), "transient_dependency");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_transition_is_permanent() {
        let err: AppError = RepoError::Domain(DomainError::InvalidTransition {
            from: TransactionStatus::Settled,
            to: TransactionStatus::Voided,
        })
        .into();
        assert_eq!(err.kind(), "invalid_transition");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid transition from settled to voided");
    }

    #[test]
    fn test_version_conflict_is_retryable() {
        let id = TransactionId::new();
        let err: AppError = RepoError::VersionConflict {
            transaction_id: id,
            expected: 3,
        }
        .into();
        assert!(matches!(err, AppError::VersionConflict { transaction_id } if transaction_id == id));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_imbalance_keeps_only_identifiers() {
        let id = TransactionId::new();
        let err: AppError = DomainError::LedgerImbalance {
            transaction_id: id,
            currency: Currency::USD,
            debits: 1000,
            credits: 900,
        }
        .into();
        assert_eq!(err.kind(), "ledger_imbalance");
        assert_eq!(
            err.to_string(),
            format!("Ledger imbalance for transaction {} in USD", id)
        );
    }
}
