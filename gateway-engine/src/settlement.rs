//! Settlement consumer and worker pool.
//!
//! Each delivery is checked against the stored transaction before anything
//! happens: a message whose effect is already reflected (its outbox row is
//! consumed, or the transaction moved past its sequence) is discarded. The
//! remaining deliveries drive the processor call and apply the resulting
//! transition in the same unit that marks the message consumed, so a
//! redelivery can never post a second effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use gateway_types::{
    Alert, AlertKind, AlertSink, AppError, Delivery, DeliveryStream, MessageQueue, OutboxMessage,
    OutboxStatus, OutboxStore, SettlementError, SettlementInstruction, SettlementProcessor,
    Transaction, TransactionStore, TransitionIntent,
};

use crate::config::SettlementConfig;
use crate::retry::{Backoff, bounded};
use crate::state_machine::TransactionStateMachine;

/// What the worker must do with a delivery once handling returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue(Duration),
}

enum CallOutcome {
    Done,
    Declined,
    Retry,
}

pub struct SettlementConsumer<S: TransactionStore + OutboxStore> {
    store: Arc<S>,
    machine: TransactionStateMachine<S>,
    processor: Arc<dyn SettlementProcessor>,
    alerts: Arc<dyn AlertSink>,
    config: SettlementConfig,
    backoff: Backoff,
    db_timeout: Duration,
}

impl<S: TransactionStore + OutboxStore> SettlementConsumer<S> {
    pub fn new(
        store: Arc<S>,
        machine: TransactionStateMachine<S>,
        processor: Arc<dyn SettlementProcessor>,
        alerts: Arc<dyn AlertSink>,
        config: SettlementConfig,
        backoff: Backoff,
        db_timeout: Duration,
    ) -> Self {
        Self {
            store,
            machine,
            processor,
            alerts,
            config,
            backoff,
            db_timeout,
        }
    }

    /// Handles one delivery and decides its disposition. Never fails:
    /// retryable errors requeue, everything else is acknowledged.
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            message_id = %delivery.message.message_id,
            transaction_id = %delivery.message.transaction_id,
            intent = %delivery.message.intent,
            sequence = delivery.message.sequence,
            attempt = delivery.attempt
        )
    )]
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        match self.process(delivery).await {
            Ok(disposition) => disposition,
            Err(err) if err.is_retryable() => {
                tracing::warn!(kind = err.kind(), "Retryable failure, requeueing");
                Disposition::Requeue(self.backoff.delay(delivery.attempt))
            }
            Err(err) => {
                tracing::warn!(kind = err.kind(), "Permanent failure, dropping message");
                self.consume(delivery).await;
                Disposition::Ack
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<Disposition, AppError> {
        let message = &delivery.message;

        let Some(row) = bounded(
            self.db_timeout,
            "get_outbox_message",
            self.store.get_outbox_message(message.message_id),
        )
        .await?
        else {
            return Ok(self.poison(delivery, "unknown_message").await);
        };
        let Some(tx) = bounded(
            self.db_timeout,
            "get_transaction",
            self.store.get_transaction(message.transaction_id),
        )
        .await?
        else {
            return Ok(self.poison(delivery, "unknown_transaction").await);
        };

        if row.status == OutboxStatus::Consumed || tx.version > message.sequence {
            tracing::debug!(version = tx.version, "Discarding already applied message");
            if row.status != OutboxStatus::Consumed {
                self.consume(delivery).await;
            }
            return Ok(Disposition::Ack);
        }
        if tx.version < message.sequence {
            tracing::warn!(version = tx.version, "Message is ahead of the stored transaction");
            return Ok(Disposition::Requeue(self.backoff.delay(delivery.attempt)));
        }

        match message.intent {
            TransitionIntent::Capture => {
                self.machine.capture(tx.id, Some(row.id)).await?;
                Ok(Disposition::Ack)
            }
            TransitionIntent::Settle => self.settle(delivery, &tx, &row).await,
            TransitionIntent::Refund => self.refund(delivery, &tx, &row).await,
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        tx: &Transaction,
        row: &OutboxMessage,
    ) -> Result<Disposition, AppError> {
        let Ok(instruction) = delivery.message.instruction() else {
            return Ok(self.poison(delivery, "malformed_instruction").await);
        };

        match self.call(&instruction, TransitionIntent::Settle).await {
            CallOutcome::Done => {
                self.machine.settle(tx.id, Some(row.id)).await?;
                Ok(Disposition::Ack)
            }
            CallOutcome::Declined => {
                self.machine
                    .fail(tx.id, "settlement_declined", Some(row.id))
                    .await?;
                self.alert_failed(tx, "settlement_declined");
                Ok(Disposition::Ack)
            }
            CallOutcome::Retry if self.exhausted(delivery) => {
                self.machine
                    .fail(tx.id, "settlement_retries_exhausted", Some(row.id))
                    .await?;
                self.alert_failed(tx, "settlement_retries_exhausted");
                Ok(Disposition::Ack)
            }
            CallOutcome::Retry => Ok(Disposition::Requeue(self.backoff.delay(delivery.attempt))),
        }
    }

    async fn refund(
        &self,
        delivery: &Delivery,
        tx: &Transaction,
        row: &OutboxMessage,
    ) -> Result<Disposition, AppError> {
        let Ok(instruction) = delivery.message.instruction() else {
            return Ok(self.poison(delivery, "malformed_instruction").await);
        };

        match self.call(&instruction, TransitionIntent::Refund).await {
            CallOutcome::Done => {
                self.machine.refund(tx.id, Some(row.id)).await?;
                return Ok(Disposition::Ack);
            }
            CallOutcome::Declined => self.alert_failed(tx, "refund_declined"),
            CallOutcome::Retry if self.exhausted(delivery) => {
                self.alert_failed(tx, "refund_retries_exhausted")
            }
            CallOutcome::Retry => {
                return Ok(Disposition::Requeue(self.backoff.delay(delivery.attempt)));
            }
        }
        bounded(
            self.db_timeout,
            "mark_consumed",
            self.store.mark_consumed(row.id, Utc::now()),
        )
        .await?;
        Ok(Disposition::Ack)
    }

    /// Calls the processor under the settlement timeout.
    async fn call(&self, instruction: &SettlementInstruction, intent: TransitionIntent) -> CallOutcome {
        let call = async {
            match intent {
                TransitionIntent::Refund => self.processor.refund(instruction).await,
                _ => self.processor.settle(instruction).await,
            }
        };
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(receipt)) => {
                tracing::info!(
                    processor_reference = %receipt.processor_reference,
                    "Processor accepted instruction"
                );
                CallOutcome::Done
            }
            Ok(Err(SettlementError::Declined(_))) => {
                tracing::warn!(kind = "settlement_declined", "Processor declined instruction");
                CallOutcome::Declined
            }
            Ok(Err(SettlementError::Transient(_))) => {
                tracing::warn!(kind = "settlement_transient", "Processor call failed");
                CallOutcome::Retry
            }
            Err(_) => {
                tracing::warn!(kind = "settlement_timeout", "Processor call timed out");
                CallOutcome::Retry
            }
        }
    }

    fn exhausted(&self, delivery: &Delivery) -> bool {
        delivery.attempt >= self.config.max_attempts
    }

    fn alert_failed(&self, tx: &Transaction, detail: &str) {
        self.alerts
            .raise(Alert::new(AlertKind::SettlementFailed, Some(tx.id), detail));
    }

    /// Alerts and retires a message that can never be processed, so the
    /// outbox stops redelivering it.
    async fn poison(&self, delivery: &Delivery, detail: &str) -> Disposition {
        self.alerts.raise(Alert::new(
            AlertKind::PoisonMessage,
            Some(delivery.message.transaction_id),
            detail,
        ));
        self.consume(delivery).await;
        Disposition::Ack
    }

    /// Best-effort acknowledgement of a message that will not be processed.
    async fn consume(&self, delivery: &Delivery) {
        let result = bounded(
            self.db_timeout,
            "mark_consumed",
            self.store
                .mark_consumed(delivery.message.message_id, Utc::now()),
        )
        .await;
        if let Err(err) = result {
            tracing::warn!(kind = err.kind(), "Could not mark message consumed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker pool
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns one worker per stream. Workers stop when `shutdown` flips to true
/// or their stream closes.
pub fn spawn_workers<S, Q, D>(
    consumer: Arc<SettlementConsumer<S>>,
    queue: Arc<Q>,
    streams: Vec<D>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: TransactionStore + OutboxStore,
    Q: MessageQueue,
    D: DeliveryStream,
{
    streams
        .into_iter()
        .enumerate()
        .map(|(worker, stream)| {
            tokio::spawn(run_worker(
                worker,
                Arc::clone(&consumer),
                Arc::clone(&queue),
                stream,
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run_worker<S, Q, D>(
    worker: usize,
    consumer: Arc<SettlementConsumer<S>>,
    queue: Arc<Q>,
    mut stream: D,
    mut shutdown: watch::Receiver<bool>,
) where
    S: TransactionStore + OutboxStore,
    Q: MessageQueue,
    D: DeliveryStream,
{
    tracing::debug!(worker, "Settlement worker started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = stream.next_delivery() => {
                let Some(delivery) = next else { break };
                let result = match consumer.handle(&delivery).await {
                    Disposition::Ack => queue.ack(&delivery).await,
                    Disposition::Requeue(delay) => queue.nack(delivery, delay).await,
                };
                if let Err(err) = result {
                    tracing::warn!(worker, error = %err, "Broker rejected disposition");
                }
            }
        }
    }
    tracing::debug!(worker, "Settlement worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::broker::InMemoryBroker;
    use crate::test_support::{InMemoryStore, ScriptedProcessor};
    use gateway_types::{
        AccountId, Currency, LedgerReader, MessageBroker, Money, OutboxMessageId, TransactionId,
        TransactionStatus,
    };
    use uuid::Uuid;

    struct Harness {
        store: Arc<InMemoryStore>,
        machine: TransactionStateMachine<InMemoryStore>,
        processor: Arc<ScriptedProcessor>,
        alerts: Arc<RecordingAlertSink>,
        consumer: SettlementConsumer<InMemoryStore>,
    }

    fn harness(processor: ScriptedProcessor) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let machine = TransactionStateMachine::new(
            Arc::clone(&store),
            alerts.clone(),
            Duration::from_secs(1),
            false,
        );
        let processor = Arc::new(processor);
        let consumer = SettlementConsumer::new(
            Arc::clone(&store),
            machine.clone(),
            processor.clone(),
            alerts.clone(),
            SettlementConfig {
                max_attempts: 5,
                timeout: Duration::from_millis(200),
                workers: 1,
                auto_capture: false,
                processor_url: None,
            },
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            Duration::from_secs(1),
        );
        Harness {
            store,
            machine,
            processor,
            alerts,
            consumer,
        }
    }

    impl Harness {
        async fn captured(&self) -> Transaction {
            let tx = Transaction::new(
                format!("key-{}", Uuid::new_v4()),
                Money::new(1000, Currency::USD).unwrap(),
                AccountId::new("A").unwrap(),
                AccountId::new("B").unwrap(),
            )
            .unwrap();
            let tx = self.machine.create(tx).await.unwrap();
            self.machine.authorize(tx.id).await.unwrap();
            self.machine.capture(tx.id, None).await.unwrap()
        }

        fn last_message(&self, id: TransactionId) -> OutboxMessage {
            self.store
                .outbox()
                .into_iter()
                .filter(|m| m.transaction_id == id)
                .last()
                .unwrap()
        }

        async fn status(&self, id: TransactionId) -> TransactionStatus {
            self.machine.get(id).await.unwrap().status
        }
    }

    fn delivery(message: &OutboxMessage, attempt: u32) -> Delivery {
        Delivery {
            delivery_id: Uuid::new_v4(),
            message: message.to_broker_message(),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_settle_success_consumes_message() {
        let h = harness(ScriptedProcessor::new());
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        assert_eq!(h.consumer.handle(&delivery(&settle, 1)).await, Disposition::Ack);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Settled);
        assert_eq!(h.processor.settle_calls(), 1);
        assert_eq!(
            h.store.get_outbox_message(settle.id).await.unwrap().unwrap().status,
            OutboxStatus::Consumed
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_discarded() {
        let h = harness(ScriptedProcessor::new());
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        h.consumer.handle(&delivery(&settle, 1)).await;
        let ledger_rows = h.store.ledger_len();
        assert_eq!(h.consumer.handle(&delivery(&settle, 2)).await, Disposition::Ack);

        assert_eq!(h.processor.settle_calls(), 1);
        assert_eq!(h.store.ledger_len(), ledger_rows);
        assert_eq!(h.machine.get(tx.id).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_and_keeps_state() {
        let h = harness(ScriptedProcessor::failing(
            1,
            SettlementError::Transient("503".into()),
        ));
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        let disposition = h.consumer.handle(&delivery(&settle, 1)).await;
        assert!(matches!(disposition, Disposition::Requeue(_)));
        assert_eq!(h.status(tx.id).await, TransactionStatus::Captured);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_transaction_and_alert() {
        let h = harness(ScriptedProcessor::failing(
            5,
            SettlementError::Transient("503".into()),
        ));
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        for attempt in 1..5 {
            let disposition = h.consumer.handle(&delivery(&settle, attempt)).await;
            assert!(matches!(disposition, Disposition::Requeue(_)));
        }
        assert_eq!(h.consumer.handle(&delivery(&settle, 5)).await, Disposition::Ack);

        let failed = h.machine.get(tx.id).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(
            failed.failure_reason.as_deref(),
            Some("settlement_retries_exhausted")
        );
        // Hold plus its reversal, nothing else.
        assert_eq!(h.store.ledger_len(), 4);
        assert_eq!(h.alerts.count(AlertKind::SettlementFailed), 1);
    }

    #[tokio::test]
    async fn test_decline_fails_immediately() {
        let h = harness(ScriptedProcessor::failing(
            1,
            SettlementError::Declined("card_closed".into()),
        ));
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        assert_eq!(h.consumer.handle(&delivery(&settle, 1)).await, Disposition::Ack);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Failed);
        assert_eq!(h.alerts.count(AlertKind::SettlementFailed), 1);
    }

    #[tokio::test]
    async fn test_capture_intent_captures_and_queues_settle() {
        let h = harness(ScriptedProcessor::new());
        let tx = Transaction::new(
            "cap".into(),
            Money::new(500, Currency::EUR).unwrap(),
            AccountId::new("A").unwrap(),
            AccountId::new("B").unwrap(),
        )
        .unwrap();
        let auto_capture = TransactionStateMachine::new(
            Arc::clone(&h.store),
            h.alerts.clone(),
            Duration::from_secs(1),
            true,
        );
        let tx = auto_capture.create(tx).await.unwrap();
        auto_capture.authorize(tx.id).await.unwrap();
        let capture = h.last_message(tx.id);
        assert_eq!(capture.intent, TransitionIntent::Capture);

        assert_eq!(h.consumer.handle(&delivery(&capture, 1)).await, Disposition::Ack);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Captured);
        assert_eq!(h.last_message(tx.id).intent, TransitionIntent::Settle);
        assert_eq!(
            h.store.get_outbox_message(capture.id).await.unwrap().unwrap().status,
            OutboxStatus::Consumed
        );
    }

    #[tokio::test]
    async fn test_unknown_message_is_poison() {
        let h = harness(ScriptedProcessor::new());
        let tx = h.captured().await;
        let mut bogus = h.last_message(tx.id);
        bogus.id = OutboxMessageId::new();

        assert_eq!(h.consumer.handle(&delivery(&bogus, 1)).await, Disposition::Ack);
        assert_eq!(h.alerts.count(AlertKind::PoisonMessage), 1);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Captured);
    }

    #[tokio::test]
    async fn test_malformed_instruction_is_poison_and_retired() {
        let h = harness(ScriptedProcessor::new());
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);
        let mut broken = delivery(&settle, 1);
        broken.message.payload = serde_json::Value::Null;

        assert_eq!(h.consumer.handle(&broken).await, Disposition::Ack);
        assert_eq!(h.alerts.count(AlertKind::PoisonMessage), 1);
        assert_eq!(h.processor.settle_calls(), 0);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Captured);
        assert_eq!(
            h.store.get_outbox_message(settle.id).await.unwrap().unwrap().status,
            OutboxStatus::Consumed
        );
    }

    impl Harness {
        /// Settles a captured transaction and queues its refund.
        async fn refund_requested(&self) -> (Transaction, OutboxMessage) {
            let tx = self.captured().await;
            let settle = self.last_message(tx.id);
            self.consumer.handle(&delivery(&settle, 1)).await;
            let requested = self.machine.request_refund(tx.id).await.unwrap();
            (requested, self.last_message(tx.id))
        }

        async fn balance(&self, account: &str) -> i64 {
            self.store
                .account_balance(&AccountId::new(account).unwrap(), Currency::USD)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_confirmed_refund_reverses_hold_once() {
        let h = harness(ScriptedProcessor::new());
        let (tx, refund) = h.refund_requested().await;
        assert_eq!(refund.intent, TransitionIntent::Refund);
        assert_eq!(h.balance("B").await, 1000);

        assert_eq!(h.consumer.handle(&delivery(&refund, 1)).await, Disposition::Ack);
        assert_eq!(h.consumer.handle(&delivery(&refund, 2)).await, Disposition::Ack);

        assert_eq!(h.processor.refund_calls(), 1);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Refunded);
        assert_eq!(h.balance("A").await, 0);
        assert_eq!(h.balance("B").await, 0);
        assert_eq!(h.store.ledger_len(), 4);
    }

    #[tokio::test]
    async fn test_declined_refund_leaves_balances_and_status() {
        let h = harness(ScriptedProcessor::new());
        let (tx, refund) = h.refund_requested().await;
        h.processor
            .push(Err(SettlementError::Declined("refund_window_closed".into())));

        assert_eq!(h.consumer.handle(&delivery(&refund, 1)).await, Disposition::Ack);

        assert_eq!(h.status(tx.id).await, TransactionStatus::Settled);
        assert_eq!(h.balance("A").await, -1000);
        assert_eq!(h.balance("B").await, 1000);
        assert_eq!(h.store.ledger_len(), 2);
        assert_eq!(h.alerts.count(AlertKind::SettlementFailed), 1);
        assert_eq!(
            h.store.get_outbox_message(refund.id).await.unwrap().unwrap().status,
            OutboxStatus::Consumed
        );

        // The transaction is still settled, so the refund can be asked again.
        h.machine.request_refund(tx.id).await.unwrap();
        let retry = h.last_message(tx.id);
        assert_eq!(h.consumer.handle(&delivery(&retry, 1)).await, Disposition::Ack);
        assert_eq!(h.status(tx.id).await, TransactionStatus::Refunded);
        assert_eq!(h.balance("B").await, 0);
    }

    #[tokio::test]
    async fn test_workers_drain_broker() {
        let h = harness(ScriptedProcessor::new());
        let tx = h.captured().await;
        let settle = h.last_message(tx.id);

        let (broker, receivers) = InMemoryBroker::new(2, 8);
        let broker = Arc::new(broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_workers(
            Arc::new(h.consumer),
            Arc::clone(&broker),
            receivers,
            shutdown_rx,
        );

        broker.publish(settle.to_broker_message()).await.unwrap();
        for _ in 0..100 {
            if h.machine.get(tx.id).await.unwrap().status == TransactionStatus::Settled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.machine.get(tx.id).await.unwrap().status, TransactionStatus::Settled);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(broker.pending_count(), 0);
    }
}
