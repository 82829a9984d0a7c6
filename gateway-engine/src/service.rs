//! Payment Application Service
//!
//! Orchestrates the idempotency guard, the state machine and the ledger
//! for inbound requests. Contains NO infrastructure logic.

use std::sync::Arc;

use gateway_types::{
    AccountId, AlertSink, AppError, Currency, Fingerprint, GatewayStore, LedgerEntry, Money,
    PaymentRequest, Transaction, TransactionId, TransactionStatus,
};

use crate::config::GatewayConfig;
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::ledger::Ledger;
use crate::state_machine::TransactionStateMachine;

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub transaction: Transaction,
    /// True when the key was seen before and no new transaction was created.
    pub duplicate: bool,
}

/// Application service for payment operations.
///
/// Generic over `S: GatewayStore` - the store adapter is injected at compile time.
pub struct PaymentEngine<S: GatewayStore> {
    store: Arc<S>,
    guard: IdempotencyGuard<S>,
    machine: TransactionStateMachine<S>,
    ledger: Ledger<S>,
}

impl<S: GatewayStore> PaymentEngine<S> {
    pub fn new(store: Arc<S>, config: &GatewayConfig, alerts: Arc<dyn AlertSink>) -> Self {
        let db_timeout = config.database.timeout;
        Self {
            guard: IdempotencyGuard::new(
                Arc::clone(&store),
                config.idempotency.clone(),
                db_timeout,
            ),
            machine: TransactionStateMachine::new(
                Arc::clone(&store),
                Arc::clone(&alerts),
                db_timeout,
                config.settlement.auto_capture,
            ),
            ledger: Ledger::new(Arc::clone(&store), alerts, db_timeout),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn machine(&self) -> &TransactionStateMachine<S> {
        &self.machine
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────────

    /// Submits a payment. Retries with the same key and payload resolve to
    /// the original transaction without repeating any side effect.
    #[tracing::instrument(skip(self, req), fields(amount = req.amount, currency = %req.currency))]
    pub async fn submit(&self, req: PaymentRequest) -> Result<Submitted, AppError> {
        let amount = Money::positive(req.amount, req.currency)?;
        let tx = Transaction::new(req.idempotency_key, amount, req.source_account, req.dest_account)?;
        let fingerprint = Fingerprint::of(&tx.amount, &tx.source_account, &tx.destination_account);

        match self.guard.admit(&tx.idempotency_key, &fingerprint).await? {
            Admission::New => {
                let key = tx.idempotency_key.clone();
                let created = match self.machine.create(tx).await {
                    Ok(created) => created,
                    Err(err) => {
                        if let Err(release_err) = self.guard.release(&key).await {
                            tracing::warn!(kind = release_err.kind(), "Could not release idempotency key");
                        }
                        if matches!(err, AppError::IdempotencyConflict) {
                            return self.resolve_stored_key(&key, &fingerprint).await;
                        }
                        return Err(err);
                    }
                };
                let transaction = self.drive_authorization(created).await?;
                Ok(Submitted {
                    transaction,
                    duplicate: false,
                })
            }
            Admission::Duplicate(id) => {
                let current = self.machine.get(id).await?;
                let transaction = if current.status == TransactionStatus::Pending {
                    self.drive_authorization(current).await?
                } else {
                    current
                };
                tracing::info!(transaction_id = %transaction.id, "Duplicate submission");
                Ok(Submitted {
                    transaction,
                    duplicate: true,
                })
            }
            Admission::Conflict => Err(AppError::IdempotencyConflict),
        }
    }

    /// The key record expired and was purged, but the transaction it created
    /// still owns the key. Same payload resolves to it; anything else conflicts.
    async fn resolve_stored_key(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Submitted, AppError> {
        match self.machine.find_by_idempotency_key(key).await? {
            Some(existing)
                if &Fingerprint::of(
                    &existing.amount,
                    &existing.source_account,
                    &existing.destination_account,
                ) == fingerprint =>
            {
                tracing::info!(transaction_id = %existing.id, "Resolved retry through stored transaction");
                Ok(Submitted {
                    transaction: existing,
                    duplicate: true,
                })
            }
            _ => Err(AppError::IdempotencyConflict),
        }
    }

    /// Authorizes a pending transaction. Losing the race to another caller
    /// that authorized it first is not an error.
    async fn drive_authorization(&self, tx: Transaction) -> Result<Transaction, AppError> {
        match self.machine.authorize(tx.id).await {
            Ok(authorized) => Ok(authorized),
            Err(AppError::InvalidTransition { .. }) => self.machine.get(tx.id).await,
            Err(err) => Err(err),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Lifecycle operations
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.machine.get(id).await
    }

    pub async fn capture(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.machine.capture(id, None).await
    }

    pub async fn void(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.machine.void(id).await
    }

    /// Queues a refund. The transaction moves to `refunded` once the
    /// processor confirms it.
    pub async fn refund(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.machine.request_refund(id).await
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Ledger and housekeeping
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn ledger_entries(&self, id: TransactionId) -> Result<Vec<LedgerEntry>, AppError> {
        self.ledger.entries_for_transaction(id).await
    }

    pub async fn balance(&self, account: &AccountId, currency: Currency) -> Result<i64, AppError> {
        self.ledger.balance(account, currency).await
    }

    pub async fn purge_expired_keys(&self) -> Result<u64, AppError> {
        self.guard.purge_expired().await
    }
}
