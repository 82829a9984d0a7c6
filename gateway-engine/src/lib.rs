//! # Gateway Engine
//!
//! Transaction processing core and its thin HTTP adapter.
//!
//! ## Architecture
//!
//! - `idempotency` - admits each idempotency key once
//! - `state_machine` - the only writer of transactions; one atomic unit per transition
//! - `ledger` - reads, replay and operator corrections of the double-entry ledger
//! - `outbox` - publishes persisted outbox messages to the broker
//! - `broker` - in-process partitioned broker with at-least-once delivery
//! - `settlement` - consumer and worker pool driving the external processor
//! - `reconciliation` - read-only comparison with processor reports
//! - `service` - payment engine façade used by the inbound adapter
//! - `inbound/` - HTTP adapter (Axum server)
//!
//! Every component is generic over the store ports from `gateway-types`,
//! so the same engine runs on PostgreSQL, SQLite or an in-memory store.

pub mod alert;
pub mod broker;
pub mod config;
pub mod idempotency;
pub mod inbound;
pub mod ledger;
pub mod outbox;
pub mod reconciliation;
pub mod retry;
pub mod service;
pub mod settlement;
pub mod state_machine;

#[cfg(test)]
mod test_support;

pub use alert::{RecordingAlertSink, TracingAlertSink};
pub use broker::{InMemoryBroker, PartitionReceiver};
pub use config::{ConfigError, ConfigSource, EnvConfigSource, FileConfigSource, GatewayConfig, MapConfigSource};
pub use idempotency::{Admission, IdempotencyGuard};
pub use ledger::{BalanceCheck, Ledger};
pub use outbox::{DispatchSummary, OutboxDispatcher};
pub use reconciliation::ReconciliationJob;
pub use retry::Backoff;
pub use service::{PaymentEngine, Submitted};
pub use settlement::{Disposition, SettlementConsumer, spawn_workers};
pub use state_machine::{TransactionStateMachine, TransitionContext};
