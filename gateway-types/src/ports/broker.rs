//! Message broker ports.
//!
//! The broker is a durable hand-off channel only; it holds no authoritative
//! state. Consumption is pull-based: workers ask a [`DeliveryStream`] for the
//! next delivery and settle it explicitly through [`MessageQueue`].

use std::time::Duration;

use uuid::Uuid;

use crate::domain::BrokerMessage;

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker channel closed")]
    Closed,

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(Uuid),
}

/// One delivery of a message. Redeliveries of the same message carry a new
/// `delivery_id` and an incremented `attempt`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub message: BrokerMessage,
    /// 1 on first delivery.
    pub attempt: u32,
}

/// Publishing side of the broker.
#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Publishes a message. Returns once the broker acknowledged durable receipt.
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError>;
}

/// Settlement side of the broker.
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Confirms processing; the delivery will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Rejects the delivery and requeues it on the same partition after `delay`.
    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError>;
}

/// A stream of deliveries for one partition.
#[async_trait::async_trait]
pub trait DeliveryStream: Send + 'static {
    /// Waits for the next delivery. `None` once the broker is closed.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}
