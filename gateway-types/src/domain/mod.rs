//! Domain models for the payment gateway.

pub mod account;
pub mod idempotency;
pub mod ledger;
pub mod money;
pub mod outbox;
pub mod transaction;

pub use account::AccountId;
pub use idempotency::{Fingerprint, IdempotencyRecord};
pub use ledger::{
    AccountBalance, Direction, LedgerEntry, LedgerEntryId, ensure_balanced, entries_for_effect,
    fold_balance,
};
pub use money::{Currency, Money};
pub use outbox::{
    BrokerMessage, OutboxMessage, OutboxMessageId, OutboxStatus, SettlementInstruction,
    TransitionIntent,
};
pub use transaction::{
    LedgerEffect, PlannedTransition, Transaction, TransactionId, TransactionStatus,
};
