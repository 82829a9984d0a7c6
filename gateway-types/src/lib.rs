//! # Gateway Types
//!
//! Domain types and port traits for the payment gateway engine.
//! This crate has ZERO external IO dependencies - only data structures,
//! business rules, and trait definitions.
//!
//! ## Architecture
//!
//! This crate represents the **innermost core** of the hexagonal architecture:
//! - `domain/` - Pure domain types (Money, Transaction, LedgerEntry, OutboxMessage)
//! - `ports/` - Trait definitions that adapters must implement
//! - `dto/` - Data Transfer Objects for API boundaries and reports
//! - `error/` - Domain and application error types

pub mod domain;
pub mod dto;
pub mod error;
pub mod ports;

// Re-export commonly used types
pub use domain::{
    AccountBalance, AccountId, BrokerMessage, Currency, Direction, Fingerprint,
    IdempotencyRecord, LedgerEffect, LedgerEntry, LedgerEntryId, Money, OutboxMessage,
    OutboxMessageId, OutboxStatus, PlannedTransition, SettlementInstruction, Transaction,
    TransactionId, TransactionStatus, TransitionIntent,
};
pub use dto::*;
pub use error::{AppError, DomainError, RepoError};
pub use ports::{
    Alert, AlertKind, AlertSink, BrokerError, Delivery, DeliveryStream, GatewayStore,
    IdempotencyStore, LedgerReader, LedgerStore, MessageBroker, MessageQueue, OutboxStore,
    ProcessorReportSource, ReportError, ReserveOutcome, SettlementError, SettlementProcessor,
    SettlementReceipt, TransactionReader, TransactionStore, TransactionWrite, UnitOfWork,
};
