//! Transaction state machine.
//!
//! Owns every write to a transaction. A transition is planned on the
//! current snapshot, then committed as one unit of work together with its
//! ledger entries and follow-up outbox message. The unit only applies if the
//! stored version still matches the snapshot's.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use gateway_types::domain::entries_for_effect;
use gateway_types::{
    Alert, AlertKind, AlertSink, AppError, OutboxMessage, OutboxMessageId, Transaction,
    TransactionId, TransactionStatus, TransactionStore, TransitionIntent, UnitOfWork,
};

use crate::retry::bounded;

/// Re-reads allowed after a version conflict before giving up.
const MAX_VERSION_RETRIES: usize = 3;

/// Extra inputs for a single transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Outbox message acknowledged in the same unit.
    pub consumes: Option<OutboxMessageId>,
    /// Error kind recorded on the transaction when it fails.
    pub failure_reason: Option<String>,
}

impl TransitionContext {
    pub fn consuming(message_id: OutboxMessageId) -> Self {
        Self {
            consumes: Some(message_id),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn and_consuming(mut self, message_id: Option<OutboxMessageId>) -> Self {
        self.consumes = message_id;
        self
    }
}

pub struct TransactionStateMachine<S: TransactionStore> {
    store: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    db_timeout: Duration,
    auto_capture: bool,
}

impl<S: TransactionStore> Clone for TransactionStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            alerts: Arc::clone(&self.alerts),
            db_timeout: self.db_timeout,
            auto_capture: self.auto_capture,
        }
    }
}

impl<S: TransactionStore> TransactionStateMachine<S> {
    pub fn new(
        store: Arc<S>,
        alerts: Arc<dyn AlertSink>,
        db_timeout: Duration,
        auto_capture: bool,
    ) -> Self {
        Self {
            store,
            alerts,
            db_timeout,
            auto_capture,
        }
    }

    /// Persists a new pending transaction and resolves its idempotency key
    /// in the same unit.
    #[tracing::instrument(skip(self, tx), fields(transaction_id = %tx.id))]
    pub async fn create(&self, tx: Transaction) -> Result<Transaction, AppError> {
        let key = tx.idempotency_key.clone();
        let unit = UnitOfWork::insert(tx).resolving_idempotency(key);
        let stored = bounded(self.db_timeout, "commit", self.store.commit(unit)).await?;
        tracing::info!(status = %stored.status, "Transaction created");
        Ok(stored)
    }

    pub async fn get(&self, id: TransactionId) -> Result<Transaction, AppError> {
        bounded(self.db_timeout, "get_transaction", self.store.get_transaction(id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transaction {}", id)))
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>, AppError> {
        bounded(
            self.db_timeout,
            "find_by_idempotency_key",
            self.store.find_by_idempotency_key(key),
        )
        .await
    }

    /// Applies one transition to `current`. Fails with `VersionConflict`
    /// when the stored row moved on since `current` was read.
    #[tracing::instrument(
        skip(self, current, context),
        fields(transaction_id = %current.id, status = %to)
    )]
    pub async fn apply(
        &self,
        current: &Transaction,
        to: TransactionStatus,
        context: TransitionContext,
    ) -> Result<Transaction, AppError> {
        let planned = current.plan_transition(to, Utc::now())?;
        let mut next = planned.next;

        if to == TransactionStatus::Captured && next.external_reference.is_none() {
            next.external_reference = Some(format!("stl_{}", Uuid::new_v4().simple()));
        }
        if to == TransactionStatus::Failed {
            next.failure_reason = context.failure_reason;
        }

        let entries = entries_for_effect(planned.effect, &next);
        let outbox = self
            .follow_up(to)
            .map(|intent| OutboxMessage::for_transition(&next, intent));
        let intent = outbox.as_ref().map(|m| m.intent);

        let unit = UnitOfWork::update(next, current.version)
            .with_ledger_entries(entries)
            .with_outbox(outbox)
            .consuming(context.consumes);

        match bounded(self.db_timeout, "commit", self.store.commit(unit)).await {
            Ok(stored) => {
                tracing::info!(
                    from = %planned.from,
                    version = stored.version,
                    intent = intent.map(|i| i.as_str()),
                    "Transition applied"
                );
                Ok(stored)
            }
            Err(AppError::LedgerImbalance {
                transaction_id,
                currency,
            }) => {
                self.alerts.raise(Alert::new(
                    AlertKind::LedgerImbalance,
                    Some(transaction_id),
                    "ledger_imbalance",
                ));
                Err(AppError::LedgerImbalance {
                    transaction_id,
                    currency,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Applies a transition to the latest stored snapshot, re-reading after
    /// a version conflict a bounded number of times.
    pub async fn apply_with_retry(
        &self,
        id: TransactionId,
        to: TransactionStatus,
        context: TransitionContext,
    ) -> Result<Transaction, AppError> {
        let mut attempt = 0;
        loop {
            let current = self.get(id).await?;
            match self.apply(&current, to, context.clone()).await {
                Err(AppError::VersionConflict { transaction_id })
                    if attempt < MAX_VERSION_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(%transaction_id, attempt, "Version conflict, re-reading");
                }
                result => return result,
            }
        }
    }

    /// Asynchronous action a transition into `to` must trigger.
    fn follow_up(&self, to: TransactionStatus) -> Option<TransitionIntent> {
        match to {
            TransactionStatus::Authorized if self.auto_capture => Some(TransitionIntent::Capture),
            TransactionStatus::Captured => Some(TransitionIntent::Settle),
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Named transitions
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn authorize(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.apply_with_retry(id, TransactionStatus::Authorized, TransitionContext::default())
            .await
    }

    pub async fn capture(
        &self,
        id: TransactionId,
        consumes: Option<OutboxMessageId>,
    ) -> Result<Transaction, AppError> {
        self.apply_with_retry(
            id,
            TransactionStatus::Captured,
            TransitionContext::default().and_consuming(consumes),
        )
        .await
    }

    pub async fn void(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.apply_with_retry(id, TransactionStatus::Voided, TransitionContext::default())
            .await
    }

    pub async fn settle(
        &self,
        id: TransactionId,
        consumes: Option<OutboxMessageId>,
    ) -> Result<Transaction, AppError> {
        self.apply_with_retry(
            id,
            TransactionStatus::Settled,
            TransitionContext::default().and_consuming(consumes),
        )
        .await
    }

    /// Queues a refund of a settled transaction. Nothing is posted to the
    /// ledger and the status stays `settled` until the processor confirms.
    #[tracing::instrument(skip(self))]
    pub async fn request_refund(&self, id: TransactionId) -> Result<Transaction, AppError> {
        let mut attempt = 0;
        loop {
            let current = self.get(id).await?;
            let next = current.plan_refund_request(Utc::now())?;
            let message = OutboxMessage::for_transition(&next, TransitionIntent::Refund);
            let unit = UnitOfWork::update(next, current.version).with_outbox(Some(message));

            match bounded(self.db_timeout, "commit", self.store.commit(unit)).await {
                Ok(stored) => {
                    tracing::info!(version = stored.version, "Refund requested");
                    return Ok(stored);
                }
                Err(AppError::VersionConflict { transaction_id })
                    if attempt < MAX_VERSION_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(%transaction_id, attempt, "Version conflict, re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Applies `settled -> refunded` after the processor confirmed the refund.
    pub async fn refund(
        &self,
        id: TransactionId,
        consumes: Option<OutboxMessageId>,
    ) -> Result<Transaction, AppError> {
        self.apply_with_retry(
            id,
            TransactionStatus::Refunded,
            TransitionContext::default().and_consuming(consumes),
        )
        .await
    }

    pub async fn fail(
        &self,
        id: TransactionId,
        reason: &str,
        consumes: Option<OutboxMessageId>,
    ) -> Result<Transaction, AppError> {
        self.apply_with_retry(
            id,
            TransactionStatus::Failed,
            TransitionContext::failed(reason).and_consuming(consumes),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::test_support::InMemoryStore;
    use gateway_types::{
        AccountId, Currency, Direction, LedgerReader, Money, OutboxStatus, OutboxStore,
    };

    fn machine(store: Arc<InMemoryStore>, auto_capture: bool) -> TransactionStateMachine<InMemoryStore> {
        TransactionStateMachine::new(
            store,
            Arc::new(RecordingAlertSink::new()),
            Duration::from_secs(1),
            auto_capture,
        )
    }

    fn new_tx(key: &str) -> Transaction {
        Transaction::new(
            key.into(),
            Money::new(1000, Currency::USD).unwrap(),
            AccountId::new("A").unwrap(),
            AccountId::new("B").unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_authorize_posts_hold_and_queues_capture() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), true);
        let tx = sm.create(new_tx("k1")).await.unwrap();

        let authorized = sm.authorize(tx.id).await.unwrap();
        assert_eq!(authorized.status, TransactionStatus::Authorized);
        assert_eq!(authorized.version, 1);

        let entries = store.entries_for_transaction(tx.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].direction, Direction::Debit);
        assert_eq!(entries[0].account_id.expose(), "A");

        let outbox = store.list_outbox_for_transaction(tx.id).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].intent, TransitionIntent::Capture);
        assert_eq!(outbox[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_without_auto_capture_authorize_queues_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), false);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();
        assert!(store.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_capture_assigns_reference_and_queues_settle() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), false);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();

        let captured = sm.capture(tx.id, None).await.unwrap();
        let reference = captured.external_reference.clone().unwrap();
        assert!(reference.starts_with("stl_"));

        let outbox = store.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].intent, TransitionIntent::Settle);
        assert_eq!(outbox[0].payload["external_reference"], reference.as_str());
        // No new ledger rows: the hold already moved the funds.
        assert_eq!(store.ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected_without_writes() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), true);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        let commits = store.commit_count();

        let err = sm
            .apply(&tx, TransactionStatus::Settled, TransitionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: TransactionStatus::Pending,
                to: TransactionStatus::Settled
            }
        ));
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), true);
        let stale = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(stale.id).await.unwrap();

        let err = sm
            .apply(&stale, TransactionStatus::Failed, TransitionContext::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VersionConflict { .. }));
        assert_eq!(store.ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_retry_rereads_and_reports_illegal_edge() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), true);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();

        let err = sm.authorize(tx.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(store.ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_void_reverses_hold() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), true);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();

        let voided = sm.void(tx.id).await.unwrap();
        assert_eq!(voided.status, TransactionStatus::Voided);
        assert_eq!(store.ledger_len(), 4);
        let a = AccountId::new("A").unwrap();
        assert_eq!(store.account_balance(&a, Currency::USD).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fail_records_reason_and_consumes_message() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), false);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();
        sm.capture(tx.id, None).await.unwrap();
        let settle = store.outbox()[0].id;

        let failed = sm
            .fail(tx.id, "settlement_declined", Some(settle))
            .await
            .unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("settlement_declined"));
        assert_eq!(store.ledger_len(), 4);

        let message = store.get_outbox_message(settle).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Consumed);
    }

    #[tokio::test]
    async fn test_refund_request_queues_intent_without_ledger_change() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), false);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();
        sm.capture(tx.id, None).await.unwrap();
        sm.settle(tx.id, None).await.unwrap();
        let ledger_rows = store.ledger_len();

        let requested = sm.request_refund(tx.id).await.unwrap();
        assert_eq!(requested.status, TransactionStatus::Settled);
        assert_eq!(requested.version, 4);
        assert_eq!(store.ledger_len(), ledger_rows);
        let last = store.outbox().pop().unwrap();
        assert_eq!(last.intent, TransitionIntent::Refund);
        assert_eq!(last.sequence, 4);

        let refunded = sm.refund(tx.id, Some(last.id)).await.unwrap();
        assert_eq!(refunded.status, TransactionStatus::Refunded);
        assert_eq!(refunded.version, 5);
        assert_eq!(store.ledger_len(), ledger_rows + 2);
        let row = store.get_outbox_message(last.id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Consumed);
    }

    #[tokio::test]
    async fn test_refund_request_rejected_before_settlement() {
        let store = Arc::new(InMemoryStore::new());
        let sm = machine(Arc::clone(&store), false);
        let tx = sm.create(new_tx("k1")).await.unwrap();
        sm.authorize(tx.id).await.unwrap();

        let err = sm.request_refund(tx.id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: TransactionStatus::Authorized,
                to: TransactionStatus::Refunded
            }
        ));
        assert!(store.outbox().is_empty());
    }
}
