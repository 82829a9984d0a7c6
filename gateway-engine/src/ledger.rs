//! Ledger service.
//!
//! Transitions post their entries through the state machine's unit of work.
//! This service covers everything else: reads, replay, verification and
//! operator corrections.

use std::sync::Arc;
use std::time::Duration;

use gateway_types::domain::{ensure_balanced, fold_balance};
use gateway_types::{
    AccountId, Alert, AlertKind, AlertSink, AppError, Currency, Direction, DomainError,
    LedgerEntry, LedgerStore, Money, TransactionId, TransactionReader,
};

use crate::retry::bounded;

/// Running total next to a full replay for one account and currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    pub running: i64,
    pub replayed: i64,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.running == self.replayed
    }
}

pub struct Ledger<S> {
    store: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    db_timeout: Duration,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            alerts: Arc::clone(&self.alerts),
            db_timeout: self.db_timeout,
        }
    }
}

impl<S> Ledger<S>
where
    S: LedgerStore + TransactionReader,
{
    pub fn new(store: Arc<S>, alerts: Arc<dyn AlertSink>, db_timeout: Duration) -> Self {
        Self {
            store,
            alerts,
            db_timeout,
        }
    }

    /// Appends a balanced batch. An imbalanced batch halts the write and
    /// raises an operator alert.
    pub async fn append(&self, entries: Vec<LedgerEntry>) -> Result<Vec<LedgerEntry>, AppError> {
        if let Err(err) = ensure_balanced(&entries) {
            return Err(self.reject(err));
        }
        bounded(
            self.db_timeout,
            "append_entries",
            self.store.append_entries(entries),
        )
        .await
        .map_err(|err| match err {
            AppError::LedgerImbalance {
                transaction_id,
                currency,
            } => {
                self.alerts.raise(Alert::new(
                    AlertKind::LedgerImbalance,
                    Some(transaction_id),
                    "ledger_imbalance",
                ));
                AppError::LedgerImbalance {
                    transaction_id,
                    currency,
                }
            }
            other => other,
        })
    }

    fn reject(&self, err: DomainError) -> AppError {
        if let DomainError::LedgerImbalance {
            transaction_id,
            currency,
            ..
        } = &err
        {
            tracing::error!(%transaction_id, %currency, "Rejected imbalanced ledger batch");
            self.alerts.raise(Alert::new(
                AlertKind::LedgerImbalance,
                Some(*transaction_id),
                "ledger_imbalance",
            ));
        }
        err.into()
    }

    /// Running balance (credits minus debits).
    pub async fn balance(&self, account: &AccountId, currency: Currency) -> Result<i64, AppError> {
        bounded(
            self.db_timeout,
            "account_balance",
            self.store.account_balance(account, currency),
        )
        .await
    }

    /// Balance recomputed from every entry of the account.
    pub async fn replay_balance(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<i64, AppError> {
        let entries = bounded(
            self.db_timeout,
            "entries_for_account",
            self.store.entries_for_account(account, currency),
        )
        .await?;
        Ok(fold_balance(&entries, account, currency))
    }

    pub async fn verify(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<BalanceCheck, AppError> {
        let running = self.balance(account, currency).await?;
        let replayed = self.replay_balance(account, currency).await?;
        Ok(BalanceCheck { running, replayed })
    }

    pub async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        bounded(
            self.db_timeout,
            "entries_for_transaction",
            self.store.entries_for_transaction(id),
        )
        .await
    }

    /// Posts an operator correction: a balanced batch tied to an existing
    /// transaction. Entries are never edited; corrections only add.
    #[tracing::instrument(skip(self, entries), fields(transaction_id = %transaction_id))]
    pub async fn post_correction(
        &self,
        transaction_id: TransactionId,
        entries: Vec<LedgerEntry>,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        if entries.iter().any(|e| e.transaction_id != transaction_id) {
            return Err(AppError::Validation(
                "Correction entries must belong to the corrected transaction".into(),
            ));
        }
        let exists = bounded(
            self.db_timeout,
            "get_transaction",
            self.store.get_transaction(transaction_id),
        )
        .await?
        .is_some();
        if !exists {
            return Err(AppError::NotFound(format!("Transaction {}", transaction_id)));
        }

        let stored = self.append(entries).await?;
        tracing::info!(
            target: "gateway::audit",
            %transaction_id,
            entries = stored.len(),
            "Ledger correction posted"
        );
        Ok(stored)
    }

    /// Posts a correction that moves `amount` from `debit` to `credit`.
    pub async fn post_transfer_correction(
        &self,
        transaction_id: TransactionId,
        debit: AccountId,
        credit: AccountId,
        amount: Money,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        if debit == credit {
            return Err(AppError::Validation(
                "Correction accounts must differ".into(),
            ));
        }
        self.post_correction(
            transaction_id,
            vec![
                LedgerEntry::new(transaction_id, debit, Direction::Debit, amount),
                LedgerEntry::new(transaction_id, credit, Direction::Credit, amount),
            ],
        )
        .await
    }
}
