//! In-process partitioned broker.
//!
//! Each partition is a bounded channel. Messages are routed by transaction
//! id, so deliveries for one transaction always reach the same worker in
//! publish order. Every delivery stays in the unacknowledged set until it is
//! acked; a nack schedules a redelivery and [`InMemoryBroker::recover`]
//! resends whatever is still outstanding. Delivery is at least once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use gateway_types::{
    BrokerError, BrokerMessage, Delivery, DeliveryStream, MessageBroker, MessageQueue,
    TransactionId,
};

struct Inner {
    partitions: Vec<mpsc::Sender<Delivery>>,
    unacked: DashMap<Uuid, Delivery>,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

/// Receiving end of one partition.
pub struct PartitionReceiver {
    partition: usize,
    rx: mpsc::Receiver<Delivery>,
}

impl PartitionReceiver {
    pub fn partition(&self) -> usize {
        self.partition
    }
}

#[async_trait::async_trait]
impl DeliveryStream for PartitionReceiver {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl InMemoryBroker {
    /// Creates a broker with `partitions` channels of `capacity` each, plus
    /// one receiver per partition.
    pub fn new(partitions: usize, capacity: usize) -> (Self, Vec<PartitionReceiver>) {
        let partitions = partitions.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions)
            .map(|partition| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (tx, PartitionReceiver { partition, rx })
            })
            .unzip();

        let broker = Self {
            inner: Arc::new(Inner {
                partitions: senders,
                unacked: DashMap::new(),
            }),
        };
        (broker, receivers)
    }

    pub fn partition_for(&self, transaction_id: TransactionId) -> usize {
        (transaction_id.as_uuid().as_u128() % self.inner.partitions.len() as u128) as usize
    }

    /// Deliveries handed out or scheduled but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.inner.unacked.len()
    }

    /// Resends every unacknowledged delivery as a new attempt. Returns how
    /// many were resent.
    pub async fn recover(&self) -> Result<usize, BrokerError> {
        let outstanding: Vec<Uuid> = self.inner.unacked.iter().map(|e| *e.key()).collect();
        let mut resent = 0;
        for delivery_id in outstanding {
            if let Some((_, delivery)) = self.inner.unacked.remove(&delivery_id) {
                let next = self.track(delivery.message, delivery.attempt + 1);
                self.send(next).await?;
                resent += 1;
            }
        }
        if resent > 0 {
            tracing::info!(resent, "Redelivered unacknowledged messages");
        }
        Ok(resent)
    }

    fn track(&self, message: BrokerMessage, attempt: u32) -> Delivery {
        let delivery = Delivery {
            delivery_id: Uuid::new_v4(),
            message,
            attempt,
        };
        self.inner
            .unacked
            .insert(delivery.delivery_id, delivery.clone());
        delivery
    }

    async fn send(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let partition = self.partition_for(delivery.message.transaction_id);
        let delivery_id = delivery.delivery_id;
        if self.inner.partitions[partition].send(delivery).await.is_err() {
            self.inner.unacked.remove(&delivery_id);
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let delivery = self.track(message, 1);
        self.send(delivery).await
    }
}

#[async_trait::async_trait]
impl MessageQueue for InMemoryBroker {
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .unacked
            .remove(&delivery.delivery_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery.delivery_id))
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError> {
        if self.inner.unacked.remove(&delivery.delivery_id).is_none() {
            return Err(BrokerError::UnknownDelivery(delivery.delivery_id));
        }
        let next = self.track(delivery.message, delivery.attempt + 1);
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = broker.send(next).await {
                tracing::warn!(error = %err, "Dropped scheduled redelivery");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{OutboxMessageId, TransitionIntent};

    fn message(transaction_id: TransactionId, sequence: i64) -> BrokerMessage {
        BrokerMessage {
            message_id: OutboxMessageId::new(),
            transaction_id,
            intent: TransitionIntent::Settle,
            sequence,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_same_transaction_lands_on_one_partition_in_order() {
        let (broker, mut receivers) = InMemoryBroker::new(4, 16);
        let id = TransactionId::new();
        for sequence in 1..=3 {
            broker.publish(message(id, sequence)).await.unwrap();
        }

        let rx = &mut receivers[broker.partition_for(id)];
        for sequence in 1..=3 {
            let delivery = rx.next_delivery().await.unwrap();
            assert_eq!(delivery.message.sequence, sequence);
            assert_eq!(delivery.attempt, 1);
        }
        assert_eq!(broker.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_ack_settles_delivery_once() {
        let (broker, mut receivers) = InMemoryBroker::new(1, 4);
        broker.publish(message(TransactionId::new(), 1)).await.unwrap();
        let delivery = receivers[0].next_delivery().await.unwrap();

        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.pending_count(), 0);
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_next_attempt() {
        let (broker, mut receivers) = InMemoryBroker::new(1, 4);
        broker.publish(message(TransactionId::new(), 7)).await.unwrap();
        let first = receivers[0].next_delivery().await.unwrap();

        broker
            .nack(first.clone(), Duration::from_millis(5))
            .await
            .unwrap();
        let second = receivers[0].next_delivery().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.message.sequence, 7);
        assert_ne!(second.delivery_id, first.delivery_id);
        assert_eq!(broker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_resends_unacked() {
        let (broker, mut receivers) = InMemoryBroker::new(1, 4);
        broker.publish(message(TransactionId::new(), 1)).await.unwrap();
        let lost = receivers[0].next_delivery().await.unwrap();

        assert_eq!(broker.recover().await.unwrap(), 1);
        let again = receivers[0].next_delivery().await.unwrap();
        assert_eq!(again.message, lost.message);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_publish_after_receivers_dropped_fails() {
        let (broker, receivers) = InMemoryBroker::new(2, 4);
        drop(receivers);
        let err = broker.publish(message(TransactionId::new(), 1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
        assert_eq!(broker.pending_count(), 0);
    }
}
