//! Port traits (interfaces for adapters).
//!
//! These are the contracts that adapters must implement.
//! The engine depends on these traits, not concrete implementations.

mod alert;
mod broker;
mod repository;
mod settlement;

pub use alert::{Alert, AlertKind, AlertSink};
pub use broker::{BrokerError, Delivery, DeliveryStream, MessageBroker, MessageQueue};
pub use repository::{
    GatewayStore, IdempotencyStore, LedgerReader, LedgerStore, OutboxStore, ReserveOutcome,
    TransactionReader, TransactionStore, TransactionWrite, UnitOfWork,
};
pub use settlement::{
    ProcessorReportSource, ReportError, SettlementError, SettlementProcessor, SettlementReceipt,
};
